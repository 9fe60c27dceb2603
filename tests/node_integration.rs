//! Purpose: End-to-end tests for a node server driven through `HttpTarget`.
//! Exports: None (integration test module).
//! Role: Validate environment migration, invocation, registry, and error fidelity over TCP.
//! Invariants: Servers bind loopback port 0 with a temp workdir and stop on drop.
//! Invariants: Bounded waits avoid test flakiness.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tether::api::{
    Access, CallEnvelope, CallKind, Environment, ErrorKind, ExecutionTarget, FnPointer, Function,
    FunctionTable, HttpTarget, Node, NodeConfig, ToOptions, builtins,
};
use tether::report::ReportConfig;
use tether::serve::{AccessMode, ServeConfig, bind};

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

struct TestServer {
    base_url: String,
    node: Node,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(workdir: &Path) -> TestResult<Self> {
        Self::start_with(workdir, |_| {})
    }

    fn start_with(workdir: &Path, configure: impl FnOnce(&mut ServeConfig)) -> TestResult<Self> {
        let node = NodeConfig {
            name: "test-node".to_string(),
            workdir: workdir.to_path_buf(),
            installer: "true".to_string(),
            ..NodeConfig::default()
        };
        let mut config = ServeConfig::new("127.0.0.1:0".parse()?, node);
        configure(&mut config);
        let functions = test_functions();

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
            };
            runtime.block_on(async move {
                let server = match bind(config, functions).await {
                    Ok(server) => server,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let ready = server
                    .local_addr()
                    .map(|addr| (addr, server.node().clone()))
                    .map_err(|err| err.to_string());
                let _ = ready_tx.send(ready);
                let _ = server
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await;
            });
        });

        let (addr, node) = ready_rx.recv_timeout(Duration::from_secs(10))??;
        Ok(Self {
            base_url: format!("http://{addr}"),
            node,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn target(&self) -> TestResult<HttpTarget> {
        Ok(HttpTarget::new(&self.base_url)?.with_name("test-node"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn test_functions() -> FunctionTable {
    builtins()
        .with("math", "double", |_, args, _| {
            Ok(json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
        })
        .with("math", "add", |_, args, kwargs| {
            let base = args.iter().filter_map(Value::as_i64).sum::<i64>();
            let extra = kwargs.get("extra").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(base + extra))
        })
}

fn opts(root: &Path) -> ToOptions {
    ToOptions {
        root: Some(root.to_path_buf()),
        ..ToOptions::default()
    }
}

fn install_log_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().filter(|line| !line.trim().is_empty()).count())
        .unwrap_or(0)
}

#[test]
fn named_environment_installs_once_and_is_listed() -> TestResult {
    let temp = tempfile::tempdir()?;
    let log = temp.path().join("installs.log");
    let installer = format!("echo >> {}", log.display());
    let server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.node.installer = installer;
    })?;
    let target = server.target()?.connect()?;

    let env = Environment::new().named("numpy_env").with_reqs(["numpy"]);
    env.to(&target, opts(temp.path()))?;
    assert!(target.keys(None)?.contains(&"numpy_env".to_string()));
    assert_eq!(install_log_lines(&log), 1);

    env.to(&target, opts(temp.path()))?;
    assert_eq!(install_log_lines(&log), 1, "cached install must not rerun");

    let forced = ToOptions {
        force_install: true,
        ..opts(temp.path())
    };
    env.to(&target, forced)?;
    assert_eq!(install_log_lines(&log), 2);
    Ok(())
}

#[test]
fn call_kinds_round_trip_over_http() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?);
    let func = Function::new(FnPointer::handler("math", "double"))
        .named("double")
        .to(target, Some(Environment::new().named("calc")), opts(temp.path()))?;

    assert_eq!(func.call(vec![json!(21)], Map::new())?, json!(42));
    assert_eq!(
        func.map(vec![json!(1), json!(2), json!(3)], Map::new())?,
        vec![json!(2), json!(4), json!(6)]
    );
    assert_eq!(
        func.repeat(3, vec![json!(5)], Map::new())?,
        vec![json!(10), json!(10), json!(10)]
    );

    let handles = (1..=3)
        .map(|n| func.remote(vec![json!(n)], Map::new()))
        .collect::<Result<Vec<_>, _>>()?;
    let results = func.get_many(&handles)?;
    assert_eq!(results, vec![json!(2), json!(4), json!(6)]);

    let stored = server.node.get("double", None).ok_or("function not registered")?;
    assert_eq!(stored.resource_type, "function");
    Ok(())
}

#[test]
fn kwargs_and_starmap_reach_handlers() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?);
    let func = Function::new(FnPointer::handler("math", "add")).to(target, None, opts(temp.path()))?;

    let mut kwargs = Map::new();
    kwargs.insert("extra".to_string(), json!(100));
    assert_eq!(func.call(vec![json!(1), json!(2)], kwargs.clone())?, json!(103));
    assert_eq!(
        func.starmap(vec![vec![json!(1), json!(1)], vec![json!(2), json!(3)]], kwargs)?,
        vec![json!(102), json!(105)]
    );
    Ok(())
}

#[test]
fn remote_exceptions_keep_type_message_and_traceback() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target = server.target()?;

    let envelope = CallEnvelope::new("tether", "raise", CallKind::Call)
        .with_args(vec![json!("ValueError"), json!("bad input")], Map::new());
    let response = target.dispatch(&envelope)?;
    let exception = response.exception.clone().ok_or("expected exception")?;
    assert_eq!(exception.type_name, "ValueError");
    assert_eq!(exception.message, "bad input");
    assert!(response.result.is_none());
    let traceback = response.traceback.clone().unwrap_or_default();
    assert!(traceback.contains("test-node"), "traceback: {traceback}");

    let err = response.into_result().expect_err("raised");
    assert_eq!(err.kind(), ErrorKind::Raised);
    assert_eq!(err.exception().map(|e| e.type_name.as_str()), Some("ValueError"));

    let missing = target.dispatch(&CallEnvelope::new("nope", "f", CallKind::Call))?;
    assert_eq!(
        missing.exception.map(|e| e.type_name),
        Some("ModuleNotFoundError".to_string())
    );
    let missing = target.dispatch(&CallEnvelope::new("math", "nope", CallKind::Call))?;
    assert_eq!(
        missing.exception.map(|e| e.type_name),
        Some("AttributeError".to_string())
    );
    Ok(())
}

#[test]
fn deleting_an_environment_drops_its_objects_only() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target = server.target()?;

    Environment::new().named("env1").to(&target, opts(temp.path()))?;
    Environment::new().named("env2").to(&target, opts(temp.path()))?;
    target.put("k1", json!("one"), None, Some("env1"))?;
    target.put("k2", json!("two"), None, Some("env2"))?;
    assert_eq!(target.keys(Some("env2"))?, vec!["env2".to_string(), "k2".to_string()]);

    target.delete("env2")?;
    assert!(target.get("env2", None)?.is_none());
    assert!(target.get("k2", None)?.is_none());
    assert!(target.get("env1", None)?.is_some());
    assert_eq!(target.get("k1", None)?.map(|object| object.value), Some(json!("one")));

    let err = target.delete("env2").expect_err("already gone");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn env_vars_and_secrets_follow_the_environment() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?);

    let mut vars = std::collections::BTreeMap::new();
    vars.insert("GREETING".to_string(), "hi".to_string());
    let env = Environment::new()
        .named("vars_env")
        .with_env_vars(tether::api::EnvVars::Map(vars));
    let func = Function::new(FnPointer::handler("tether", "getenv")).to(
        target,
        Some(env),
        opts(temp.path()),
    )?;
    assert_eq!(func.call(vec![json!("GREETING")], Map::new())?, json!("hi"));
    assert_eq!(func.call(vec![json!("ABSENT")], Map::new())?, Value::Null);
    Ok(())
}

#[test]
fn inline_source_is_shipped_over_http() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?);
    let func = Function::new(FnPointer::inline(
        "shout",
        "shout() {\n  printf '%s!' \"$1\"\n}\n",
    ))
    .to(target, None, opts(temp.path()))?;
    assert_eq!(func.call(vec![json!("hey")], Map::new())?, json!("hey!"));
    Ok(())
}

#[test]
fn read_only_nodes_refuse_writes_but_answer_calls() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.access_mode = AccessMode::ReadOnly;
    })?;
    let target = server.target()?;

    let err = target.put("k", json!(1), None, None).expect_err("read-only");
    assert_eq!(err.kind(), ErrorKind::Permission);
    let err = target
        .run(&["true".to_string()], &Default::default(), false)
        .expect_err("read-only");
    assert_eq!(err.kind(), ErrorKind::Permission);

    let envelope =
        CallEnvelope::new("math", "double", CallKind::Call).with_args(vec![json!(2)], Map::new());
    assert_eq!(target.dispatch(&envelope)?.into_result()?, json!(4));
    assert_eq!(target.status()?.node_config.access, "read_only");
    Ok(())
}

#[test]
fn bearer_token_is_required_when_configured() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.token = Some("s3cret".to_string());
    })?;

    let err = server.target()?.keys(None).expect_err("no token");
    assert_eq!(err.kind(), ErrorKind::Permission);
    let err = server
        .target()?
        .with_token("wrong")
        .keys(None)
        .expect_err("bad token");
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert!(server.target()?.with_token("s3cret").keys(None).is_ok());
    Ok(())
}

#[test]
fn proxy_functions_are_reachable_with_a_token() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.token = Some("s3cret".to_string());
    })?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?.with_token("s3cret"));

    let func = Function::new(FnPointer::handler("math", "double"))
        .named("dbl")
        .with_access(Access::Proxy)
        .with_proxy_token("s3cret")
        .to(Arc::clone(&target), None, opts(temp.path()))?;
    assert_eq!(func.http_url()?, format!("{}/v0/proxy/dbl", server.base_url));
    assert_eq!(func.call(vec![json!(8)], Map::new())?, json!(16));

    let denied = Function::new(FnPointer::handler("math", "double"))
        .named("dbl")
        .with_access(Access::Proxy)
        .with_proxy_token("wrong")
        .to(target, None, opts(temp.path()))?;
    let err = denied.call(vec![json!(8)], Map::new()).expect_err("denied");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let curl = func.curl_command(&[json!(1)], &Map::new())?;
    assert!(curl.contains("$TETHER_TOKEN"));
    assert!(!curl.contains("s3cret"));
    Ok(())
}

#[test]
fn proxy_call_without_a_token_is_a_config_error() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.token = Some("s3cret".to_string());
    })?;
    let target: Arc<dyn ExecutionTarget> = Arc::new(server.target()?.with_token("s3cret"));

    let func = Function::new(FnPointer::handler("math", "double"))
        .named("dbl")
        .with_access(Access::Proxy)
        .without_proxy_env_token()
        .to(target, None, opts(temp.path()))?;
    let err = func.call(vec![json!(8)], Map::new()).expect_err("no token");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.hint().is_some_and(|hint| hint.contains("TETHER_TOKEN")));
    Ok(())
}

#[test]
fn status_snapshot_lists_environments() -> TestResult {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("workdir"))?;
    let target = server.target()?;
    Environment::new().named("listed").to(&target, opts(temp.path()))?;

    let summary = target.node_summary()?;
    assert_eq!(summary.name, "test-node");
    let status = target.status()?;
    assert!(status.env_resource_mapping.contains_key("listed"));
    Ok(())
}

#[test]
fn second_server_on_same_workdir_is_refused() -> TestResult {
    let temp = tempfile::tempdir()?;
    let workdir = temp.path().join("workdir");
    let _first = TestServer::start(&workdir)?;
    let second = TestServer::start(&workdir);
    assert!(second.is_err());
    Ok(())
}

/// Accept one HTTP request and return its body.
fn accept_report(listener: TcpListener) -> JoinHandle<Option<String>> {
    thread::spawn(move || {
        let (stream, _) = listener.accept().ok()?;
        stream.set_read_timeout(Some(Duration::from_secs(10))).ok()?;
        let mut reader = BufReader::new(stream);
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).ok()?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok()?;
                }
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).ok()?;
        let mut stream = reader.into_inner();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .ok()?;
        String::from_utf8(body).ok()
    })
}

#[test]
fn status_reports_reach_the_collector() -> TestResult {
    let temp = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr: SocketAddr = listener.local_addr()?;
    let collector = accept_report(listener);

    let mut report = ReportConfig::new(url::Url::parse(&format!("http://{addr}/report"))?);
    report.interval = Duration::from_millis(50);
    let _server = TestServer::start_with(&temp.path().join("workdir"), |config| {
        config.report = Some(report);
    })?;

    let body = collector.join().map_err(|_| "collector panicked")?;
    let body = body.ok_or("no report received")?;
    let snapshot: Value = serde_json::from_str(&body)?;
    assert_eq!(snapshot["node_config"]["name"], "test-node");
    Ok(())
}
