//! Purpose: Provide the HTTP/JSON node server for tether.
//! Exports: `ServeConfig`, `AccessMode`, `BoundServer`, `bind`, `serve`.
//! Role: Axum server exposing one node's RPC channel, registry, and proxy endpoint.
//! Invariants: Error envelopes keep stable kinds; raised exceptions ride inside RPC
//! responses and only become HTTP errors on the proxy endpoint.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: One server per workdir, enforced with an exclusive file lock.

use std::fs::{File, OpenOptions};
use std::future::{Future, IntoFuture};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{
    CallKind, Environment, Error, ErrorKind, Exception, FnPointer, FunctionTable, Node,
    NodeConfig, Secret,
};
use crate::core::paths::ensure_dir;
use crate::core::registry::FUNCTION_RESOURCE_TYPE;
use crate::report::{ReportConfig, run_reporter};

pub const DEFAULT_BIND: &str = "127.0.0.1:32300";
pub const LOCK_FILE: &str = ".tether.lock";
const DEFAULT_MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub node: NodeConfig,
    pub token: Option<String>,
    pub access_mode: AccessMode,
    pub allow_non_loopback: bool,
    pub token_file_used: bool,
    pub max_body_bytes: u64,
    pub report: Option<ReportConfig>,
}

impl ServeConfig {
    pub fn new(bind: SocketAddr, node: NodeConfig) -> Self {
        Self {
            bind,
            node,
            token: None,
            access_mode: AccessMode::ReadWrite,
            allow_non_loopback: false,
            token_file_used: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            report: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read_only",
            AccessMode::ReadWrite => "read_write",
        }
    }

    fn allows_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

struct AppState {
    node: Node,
    token: Option<String>,
    access_mode: AccessMode,
}

/// A node server with its listener bound and workdir locked, not yet serving.
pub struct BoundServer {
    listener: tokio::net::TcpListener,
    router: Router,
    node: Node,
    access_mode: AccessMode,
    report: Option<ReportConfig>,
    _lock: File,
}

pub async fn bind(config: ServeConfig, functions: FunctionTable) -> Result<BoundServer, Error> {
    validate_config(&config)?;
    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Config).with_message("--max-body-bytes is too large"))?;

    ensure_dir(&config.node.workdir)?;
    let lock = lock_workdir(&config.node)?;

    let node = Node::new(config.node, functions);
    let state = Arc::new(AppState {
        node: node.clone(),
        token: config.token,
        access_mode: config.access_mode,
    });

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/node", get(node_info))
        .route("/v0/status", get(status))
        .route("/v0/rpc", post(rpc))
        .route("/v0/resources", post(put_resource))
        .route("/v0/resources/:key/call/:method", post(call_resource))
        .route("/v0/secrets/:env", post(put_secret))
        .route("/v0/run", post(run_commands))
        .route("/v0/dirs/*path", post(make_dir))
        .route("/v0/files/*path", put(put_file))
        .route("/v0/keys", get(list_keys))
        .route(
            "/v0/objects/:key",
            get(get_object).put(put_object).delete(delete_object),
        )
        .route("/v0/proxy/:name", post(proxy_call))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;

    Ok(BoundServer {
        listener,
        router,
        node,
        access_mode: config.access_mode,
        report: config.report,
        _lock: lock,
    })
}

fn lock_workdir(node: &NodeConfig) -> Result<File, Error> {
    let path = node.workdir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to open workdir lock")
                .with_path(&path)
                .with_source(err)
        })?;
    file.try_lock_exclusive().map_err(|err| {
        Error::new(ErrorKind::AlreadyExists)
            .with_message("another node server is using this workdir")
            .with_path(&path)
            .with_hint("Stop the other server or pass a different --workdir.")
            .with_source(err)
    })?;
    Ok(file)
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read listener address")
                .with_source(err)
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Serve until `shutdown` resolves, then drain for up to ten seconds.
    pub async fn run<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let BoundServer {
            listener,
            router,
            node,
            access_mode,
            report,
            _lock,
        } = self;

        let (report_stop, report_rx) = tokio::sync::oneshot::channel::<()>();
        let reporter = report.map(|config| {
            tokio::spawn(run_reporter(
                node.clone(),
                config,
                access_mode.as_str().to_string(),
                report_rx,
            ))
        });

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .into_future();
        tokio::pin!(server);

        let outcome = tokio::select! {
            result = &mut server => result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            }),
            _ = shutdown => {
                info!("shutting down node server");
                let _ = shutdown_tx.send(());
                match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                    Ok(result) => result.map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message("server failed")
                            .with_source(err)
                    }),
                    Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
                }
            }
        };

        let _ = report_stop.send(());
        if let Some(handle) = reporter {
            let _ = handle.await;
        }
        outcome
    }
}

pub async fn serve(config: ServeConfig, functions: FunctionTable) -> Result<(), Error> {
    init_tracing();
    let server = bind(config, functions).await?;
    let addr = server.local_addr()?;
    info!(addr = %addr, node = %server.node().config().name, "node server listening");
    server.run(shutdown_signal()).await
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    let is_loopback_bind = is_loopback(config.bind.ip());
    if !is_loopback_bind && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Config)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Config)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 67108864."));
    }

    if config.node.default_env.trim().is_empty() {
        return Err(Error::new(ErrorKind::Config)
            .with_message("default environment key must not be empty"));
    }

    if !is_loopback_bind && config.access_mode.allows_write() && !config.token_file_used {
        return Err(Error::new(ErrorKind::Config)
            .with_message("non-loopback write requires --token-file")
            .with_hint("Use --token-file for safer deployments, or --access read-only."));
    }

    Ok(())
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    let expected = format!("Bearer {token}");
    if value != expected {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

fn ensure_write_access(state: &AppState) -> Result<(), Error> {
    if state.access_mode.allows_write() {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Permission)
            .with_message("forbidden: node is read-only")
            .with_hint("Restart the node with --access read-write to permit this operation."))
    }
}

/// Run node work off the async executor; installs and calls may block for minutes.
async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("node task failed")
            .with_source(err)
    })?
}

#[derive(Debug, Deserialize)]
struct PutResourceRequest {
    env: Environment,
    into: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallResourceRequest {
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    commands: Vec<String>,
    #[serde(default)]
    env_vars: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    stream_logs: bool,
}

#[derive(Debug, Deserialize)]
struct EnvQuery {
    env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutObjectRequest {
    value: Value,
    resource_type: Option<String>,
    env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyRequest {
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FunctionResource {
    pointer: FnPointer,
    env: String,
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn node_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    json_value_response(&state.node.summary(state.access_mode.as_str()))
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let node = state.node.clone();
    let access = state.access_mode.as_str();
    match blocking(move || Ok(node.status(access))).await {
        Ok(snapshot) => json_value_response(&snapshot),
        Err(err) => error_response(err),
    }
}

async fn rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(envelope): Json<crate::api::CallEnvelope>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let node = state.node.clone();
    match blocking(move || Ok(node.execute(envelope))).await {
        Ok(response) => json_value_response(&response),
        Err(err) => error_response(err),
    }
}

async fn put_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PutResourceRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    match state.node.put_resource(&payload.env, payload.into.as_deref()) {
        Ok(key) => json_response(json!({ "key": key })),
        Err(err) => error_response(err),
    }
}

async fn call_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((key, method)): AxumPath<(String, String)>,
    Json(payload): Json<CallResourceRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    let node = state.node.clone();
    match blocking(move || node.call_method(&key, &method, payload.args)).await {
        Ok(result) => json_response(json!({ "result": result })),
        Err(err) => error_response(err),
    }
}

async fn put_secret(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(env): AxumPath<String>,
    Json(secret): Json<Secret>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    state.node.put_secret(&secret, &env);
    json_response(json!({ "ok": true }))
}

async fn run_commands(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RunRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    let node = state.node.clone();
    let result = blocking(move || {
        node.run_commands(&payload.commands, &payload.env_vars, payload.stream_logs)
    })
    .await;
    match result {
        Ok(outputs) => json_response(json!({ "outputs": outputs })),
        Err(err) => error_response(err),
    }
}

async fn make_dir(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(path): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    let node = state.node.clone();
    match blocking(move || node.fresh_dir(&path)).await {
        Ok(dir) => json_response(json!({ "path": dir })),
        Err(err) => error_response(err),
    }
}

async fn put_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(path): AxumPath<String>,
    body: Bytes,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    let node = state.node.clone();
    match blocking(move || node.write_file(&path, &body)).await {
        Ok(file) => json_response(json!({ "path": file })),
        Err(err) => error_response(err),
    }
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EnvQuery>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    json_response(json!({ "keys": state.node.keys(query.env.as_deref()) }))
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<EnvQuery>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match state.node.get(&key, query.env.as_deref()) {
        Some(object) => json_response(json!({ "object": object })),
        None => error_response(
            Error::new(ErrorKind::NotFound).with_message(format!("no object named {key}")),
        ),
    }
}

async fn put_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(key): AxumPath<String>,
    Json(payload): Json<PutObjectRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    state.node.put(
        &key,
        payload.value,
        payload.resource_type.as_deref(),
        payload.env.as_deref(),
    );
    json_response(json!({ "ok": true }))
}

async fn delete_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(key): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if let Err(err) = ensure_write_access(&state) {
        return error_response(err);
    }
    if state.node.delete(&key) {
        json_response(json!({ "deleted": true }))
    } else {
        error_response(Error::new(ErrorKind::NotFound).with_message(format!("no object named {key}")))
    }
}

async fn proxy_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<ProxyRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let node = state.node.clone();
    let result = blocking(move || {
        let object = node
            .get(&name, None)
            .filter(|object| object.resource_type == FUNCTION_RESOURCE_TYPE)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound).with_message(format!("no function named {name}"))
            })?;
        let function: FunctionResource = serde_json::from_value(object.value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("function {name} is stored in an unreadable form"))
                .with_source(err)
        })?;
        let mut envelope = function
            .pointer
            .envelope(CallKind::Call)?
            .with_args(payload.args, payload.kwargs);
        envelope.env = Some(function.env);
        envelope.name = Some(name);
        let response = node.execute(envelope);
        match response.exception {
            Some(exception) => Err(raised_error(exception, response.traceback)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    })
    .await;
    match result {
        Ok(value) => json_response(value),
        Err(err) => error_response(err),
    }
}

fn raised_error(exception: Exception, traceback: Option<String>) -> Error {
    let err = Error::raised(exception);
    match traceback {
        Some(traceback) => err.with_traceback(traceback),
        None => err,
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<Exception>,
    #[serde(skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
}

fn json_value_response<T: Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(payload) => json_response(payload),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode response")
                .with_source(err),
        ),
    }
}

fn json_response(payload: Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("tether-protocol", HeaderValue::from_static("0"));
    response
}

fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::Config | ErrorKind::Capability => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Permission => {
            if is_access_forbidden(err) {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::UNAUTHORIZED
            }
        }
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Install | ErrorKind::Raised | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str().to_string(),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            exception: err.exception().cloned(),
            traceback: err.traceback().map(str::to_string),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("tether-protocol", HeaderValue::from_static("0"));
    response
}

fn is_access_forbidden(err: &Error) -> bool {
    err.message()
        .is_some_and(|message| message.starts_with("forbidden:"))
}

#[cfg(test)]
mod tests {
    use super::{
        AccessMode, ErrorKind, ServeConfig, bind, ensure_write_access, status_for,
        validate_config,
    };
    use crate::api::{Error, Exception, FunctionTable, NodeConfig};
    use axum::http::StatusCode;

    fn config(bind: &str, workdir: &std::path::Path) -> ServeConfig {
        ServeConfig::new(
            bind.parse().expect("bind"),
            NodeConfig {
                workdir: workdir.to_path_buf(),
                ..NodeConfig::default()
            },
        )
    }

    #[test]
    fn non_loopback_requires_allow_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config("0.0.0.0:0", temp.path());
        let err = validate_config(&config).expect_err("expected config error");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn non_loopback_read_only_allows_unauthenticated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("0.0.0.0:0", temp.path());
        config.allow_non_loopback = true;
        config.access_mode = AccessMode::ReadOnly;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn non_loopback_write_requires_token_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("0.0.0.0:0", temp.path());
        config.allow_non_loopback = true;
        config.token = Some("dev".to_string());
        let err = validate_config(&config).expect_err("expected config error");
        assert_eq!(err.kind(), ErrorKind::Config);
        config.token_file_used = true;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn safety_limits_require_positive_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0", temp.path());
        config.max_body_bytes = 0;
        let err = validate_config(&config).expect_err("expected config error");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn error_kinds_map_to_stable_statuses() {
        let raised = Error::raised(Exception::value_error("bad"));
        assert_eq!(status_for(&raised), StatusCode::INTERNAL_SERVER_ERROR);
        let capability = Error::new(ErrorKind::Capability);
        assert_eq!(status_for(&capability), StatusCode::BAD_REQUEST);
        let missing_token = Error::new(ErrorKind::Permission).with_message("missing bearer token");
        assert_eq!(status_for(&missing_token), StatusCode::UNAUTHORIZED);
        let state = super::AppState {
            node: crate::api::Node::new(NodeConfig::default(), FunctionTable::new()),
            token: None,
            access_mode: AccessMode::ReadOnly,
        };
        let forbidden = ensure_write_access(&state).expect_err("read-only");
        assert_eq!(status_for(&forbidden), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn second_server_on_same_workdir_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = bind(config("127.0.0.1:0", temp.path()), FunctionTable::new())
            .await
            .expect("first bind");
        let err = match bind(config("127.0.0.1:0", temp.path()), FunctionTable::new()).await {
            Ok(_) => panic!("second bind should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        drop(first);
        bind(config("127.0.0.1:0", temp.path()), FunctionTable::new())
            .await
            .expect("bind after release");
    }
}
