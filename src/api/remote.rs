//! Purpose: HTTP execution target speaking the node's v0 protocol.
//! Exports: `HttpTarget`.
//! Role: Client side of the remote invocation protocol and of environment migration.
//! Invariants: Error responses decode into the server's `Error` kind; raised exceptions
//! travel inside response envelopes, not as HTTP errors.
//! Invariants: Only transport failures are retried; a status response is final.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::core::envelope::{CallEnvelope, ResponseEnvelope};
use crate::core::environment::{Environment, Secret};
use crate::core::error::{Error, ErrorKind, Exception, map_io_error_kind};
use crate::core::paths::list_files;
use crate::core::registry::StoredObject;
use crate::core::shell::CommandOutput;
use crate::core::status::{NodeSummary, StatusSnapshot};
use crate::core::target::ExecutionTarget;

use super::node::DEFAULT_ENV_KEY;

type ApiResult<T> = Result<T, Error>;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct HttpTarget {
    name: String,
    ips: Vec<String>,
    base_url: Url,
    token: Option<String>,
    agent: ureq::Agent,
    retries: u32,
    default_env: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    path: Option<String>,
    exception: Option<Exception>,
    traceback: Option<String>,
}

#[derive(Deserialize)]
struct KeyEnvelope {
    key: String,
}

#[derive(Deserialize)]
struct KeysEnvelope {
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct PathEnvelope {
    path: PathBuf,
}

#[derive(Deserialize)]
struct OutputsEnvelope {
    outputs: Vec<CommandOutput>,
}

#[derive(Deserialize)]
struct ObjectEnvelope {
    object: StoredObject,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    commands: &'a [String],
    env_vars: &'a BTreeMap<String, String>,
    stream_logs: bool,
}

#[derive(Serialize)]
struct PutResourceRequest<'a> {
    env: &'a Environment,
    into: Option<&'a str>,
}

#[derive(Serialize)]
struct PutObjectRequest<'a> {
    value: &'a Value,
    resource_type: Option<&'a str>,
    env: Option<&'a str>,
}

impl HttpTarget {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let host = base_url.host_str().unwrap_or("localhost").to_string();
        Ok(Self {
            name: host.clone(),
            ips: vec![host],
            base_url,
            token: None,
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .build(),
            retries: 0,
            default_env: DEFAULT_ENV_KEY.to_string(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ips(mut self, ips: Vec<String>) -> Self {
        self.ips = ips;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_default_env(mut self, key: impl Into<String>) -> Self {
        self.default_env = key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(timeout)
            .build();
        self
    }

    /// Adopt the node's own name and default environment.
    pub fn connect(self) -> ApiResult<Self> {
        let summary = self.node_summary()?;
        let ips = if summary.ips.is_empty() {
            self.ips.clone()
        } else {
            summary.ips
        };
        Ok(self
            .with_name(summary.name)
            .with_ips(ips)
            .with_default_env(summary.default_env))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn node_summary(&self) -> ApiResult<NodeSummary> {
        let url = build_url(&self.base_url, &["v0", "node"])?;
        self.request_json("GET", &url, &Value::Null)
    }

    pub fn status(&self) -> ApiResult<StatusSnapshot> {
        let url = build_url(&self.base_url, &["v0", "status"])?;
        self.request_json("GET", &url, &Value::Null)
    }

    pub fn keys(&self, env: Option<&str>) -> ApiResult<Vec<String>> {
        let mut url = build_url(&self.base_url, &["v0", "keys"])?;
        if let Some(env) = env {
            url.query_pairs_mut().append_pair("env", env);
        }
        let envelope: KeysEnvelope = self.request_json("GET", &url, &Value::Null)?;
        Ok(envelope.keys)
    }

    /// Fetch one object; `None` when the node has no such key.
    pub fn get(&self, key: &str, env: Option<&str>) -> ApiResult<Option<StoredObject>> {
        let mut url = build_url(&self.base_url, &["v0", "objects", key])?;
        if let Some(env) = env {
            url.query_pairs_mut().append_pair("env", env);
        }
        match self.request_json::<_, ObjectEnvelope>("GET", &url, &Value::Null) {
            Ok(envelope) => Ok(Some(envelope.object)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &str) -> ApiResult<()> {
        let url = build_url(&self.base_url, &["v0", "objects", key])?;
        let _: Value = self.request_json("DELETE", &url, &Value::Null)?;
        Ok(())
    }

    pub fn proxy_url(&self, name: &str) -> ApiResult<Url> {
        build_url(&self.base_url, &["v0", "proxy", name])
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = if method == "GET" || method == "DELETE" {
            None
        } else {
            Some(serde_json::to_string(body).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode request json")
                    .with_source(err)
            })?)
        };
        self.send_with_retries(url, || {
            let request = self.request(method, url).set("Accept", "application/json");
            match &payload {
                None => request.call(),
                Some(payload) => request
                    .set("Content-Type", "application/json")
                    .send_string(payload),
            }
        })
        .and_then(read_json_response)
    }

    fn request_bytes<R>(&self, method: &str, url: &Url, bytes: &[u8]) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        self.send_with_retries(url, || {
            self.request(method, url)
                .set("Accept", "application/json")
                .set("Content-Type", "application/octet-stream")
                .send_bytes(bytes)
        })
        .and_then(read_json_response)
    }

    fn send_with_retries<F>(&self, url: &Url, send: F) -> ApiResult<ureq::Response>
    where
        F: Fn() -> Result<ureq::Response, ureq::Error>,
    {
        let mut attempt = 0;
        loop {
            match send() {
                Ok(response) => return Ok(response),
                Err(ureq::Error::Status(code, response)) => {
                    return Err(parse_error_response(code, response));
                }
                Err(ureq::Error::Transport(err)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(url = %url, attempt, error = %err, "request failed, retrying");
                    thread::sleep(RETRY_BACKOFF * attempt);
                }
                Err(ureq::Error::Transport(err)) => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message(format!("request to {} failed", self.name))
                        .with_hint("Check that the node is running and the URL is reachable.")
                        .with_source(err));
                }
            }
        }
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut request = self.agent.request(method, url.as_str());
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }
}

impl ExecutionTarget for HttpTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn ips(&self) -> &[String] {
        &self.ips
    }

    fn is_local(&self) -> bool {
        false
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.base_url.as_str().trim_end_matches('/').to_string())
    }

    fn default_env_key(&self) -> &str {
        &self.default_env
    }

    fn run(
        &self,
        commands: &[String],
        env_vars: &BTreeMap<String, String>,
        stream_logs: bool,
    ) -> Result<Vec<CommandOutput>, Error> {
        let url = build_url(&self.base_url, &["v0", "run"])?;
        let body = RunRequest {
            commands,
            env_vars,
            stream_logs,
        };
        let envelope: OutputsEnvelope = self.request_json("POST", &url, &body)?;
        Ok(envelope.outputs)
    }

    fn call(&self, resource_key: &str, method: &str, args: Value) -> Result<Value, Error> {
        let url = build_url(
            &self.base_url,
            &["v0", "resources", resource_key, "call", method],
        )?;
        let envelope: ResultEnvelope =
            self.request_json("POST", &url, &json!({ "args": args }))?;
        Ok(envelope.result)
    }

    fn put_resource(&self, env: &Environment, into: Option<&str>) -> Result<String, Error> {
        let url = build_url(&self.base_url, &["v0", "resources"])?;
        let envelope: KeyEnvelope =
            self.request_json("POST", &url, &PutResourceRequest { env, into })?;
        Ok(envelope.key)
    }

    fn put_secret(&self, secret: &Secret, env_key: &str) -> Result<(), Error> {
        let url = build_url(&self.base_url, &["v0", "secrets", env_key])?;
        let _: Value = self.request_json("POST", &url, secret)?;
        Ok(())
    }

    fn sync_folder(
        &self,
        source: &Path,
        dest: Option<&str>,
        mount: bool,
    ) -> Result<PathBuf, Error> {
        if mount {
            return Ok(source.to_path_buf());
        }
        let dest = match dest {
            Some(dest) => dest.to_string(),
            None => source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Config)
                        .with_message("folder has no name to place it under")
                        .with_path(source)
                })?,
        };
        let dest_segments: Vec<&str> = dest.split('/').filter(|s| !s.is_empty()).collect();

        let mut segments = vec!["v0", "dirs"];
        segments.extend(&dest_segments);
        let url = build_url(&self.base_url, &segments)?;
        let placed: PathEnvelope = self.request_json("POST", &url, &Value::Null)?;

        let files = list_files(source)?;
        debug!(source = %source.display(), dest = %dest, files = files.len(), "syncing folder");
        for rel in files {
            let local = source.join(&rel);
            let bytes = std::fs::read(&local).map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to read file for sync")
                    .with_path(&local)
                    .with_source(err)
            })?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            let mut segments = vec!["v0", "files"];
            segments.extend(&dest_segments);
            segments.extend(rel.split('/'));
            let url = build_url(&self.base_url, &segments)?;
            let _: PathEnvelope = self.request_bytes("PUT", &url, &bytes)?;
        }
        Ok(placed.path)
    }

    fn put(
        &self,
        key: &str,
        value: Value,
        resource_type: Option<&str>,
        env: Option<&str>,
    ) -> Result<(), Error> {
        let url = build_url(&self.base_url, &["v0", "objects", key])?;
        let body = PutObjectRequest {
            value: &value,
            resource_type,
            env,
        };
        let _: Value = self.request_json("PUT", &url, &body)?;
        Ok(())
    }

    fn dispatch(&self, envelope: &CallEnvelope) -> Result<ResponseEnvelope, Error> {
        let url = build_url(&self.base_url, &["v0", "rpc"])?;
        self.request_json("POST", &url, envelope)
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message("invalid node url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Config).with_message("node url must use http or https"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Config).with_message("node url must not include a path"));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Config).with_message("node url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    error_from_body(status, &body)
}

fn error_from_body(status: u16, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return error_from_remote(envelope.error);
    }
    Error::new(error_kind_from_status(status)).with_message(format!("node error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(ErrorKind::parse(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(path) = remote.path {
        err = err.with_path(path);
    }
    if let Some(exception) = remote.exception {
        err = err.with_exception(exception);
    }
    if let Some(traceback) = remote.traceback {
        err = err.with_traceback(traceback);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::Config,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        502..=504 => ErrorKind::Transport,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Transport,
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpTarget, build_url, error_from_body, normalize_base_url};
    use crate::core::error::ErrorKind;
    use crate::core::target::ExecutionTarget;

    #[test]
    fn normalize_base_url_rejects_paths_and_schemes() {
        let url = normalize_base_url("http://localhost:32300".to_string()).expect("url");
        assert_eq!(url.as_str(), "http://localhost:32300/");
        let err = normalize_base_url("http://localhost:32300/v0".to_string()).expect_err("path");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = normalize_base_url("ftp://localhost".to_string()).expect_err("scheme");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn build_url_escapes_each_segment() {
        let base = normalize_base_url("http://node:1".to_string()).expect("url");
        let url = build_url(&base, &["v0", "objects", "a b/c"]).expect("url");
        assert_eq!(url.as_str(), "http://node:1/v0/objects/a%20b%2Fc");
    }

    #[test]
    fn error_envelope_keeps_kind_and_exception() {
        let body = r#"{"error":{"kind":"Raised","message":"ValueError: bad","exception":{"type_name":"ValueError","message":"bad"},"traceback":"tb"}}"#;
        let err = error_from_body(500, body);
        assert_eq!(err.kind(), ErrorKind::Raised);
        assert_eq!(err.exception().map(|e| e.type_name.as_str()), Some("ValueError"));
        assert_eq!(err.traceback(), Some("tb"));

        let err = error_from_body(404, "not json");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unreachable_node_is_transport_error() {
        let target = HttpTarget::new("http://127.0.0.1:9")
            .expect("target")
            .with_retries(0);
        let err = target.status().expect_err("unreachable");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(target.endpoint().as_deref(), Some("http://127.0.0.1:9"));
        assert!(!target.is_local());
    }
}
