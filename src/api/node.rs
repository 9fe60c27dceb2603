//! Purpose: The in-process node: executes call envelopes, runs resource methods, and
//! owns the registry for one node process.
//! Exports: `Node`, `NodeConfig`, `LocalTarget`, `DEFAULT_ENV_KEY`.
//! Role: Shared by the HTTP server and by clients already running on the node.
//! Invariants: Queued calls run FIFO per environment partition.
//! Invariants: Remote exceptions are values in the response, never transport errors.
//! Invariants: `get` returns results in the order handles were supplied.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::api::functions::{
    CallContext, FunctionTable, Lookup, attribute_error, module_not_found, run_script,
};
use crate::core::envelope::{CallEnvelope, CallKind, ResponseEnvelope};
use crate::core::environment::{DEFAULT_INSTALLER, Environment, InstallContext, Secret};
use crate::core::error::{Error, ErrorKind, Exception, map_io_error_kind};
use crate::core::paths::{copy_dir, default_workdir, ensure_dir, safe_relative};
use crate::core::registry::{
    ENV_RESOURCE_TYPE, OBJECT_RESOURCE_TYPE, Registry, StoredObject, new_call_id,
};
use crate::core::shell::{CommandOutput, run_with_logs};
use crate::core::status::{NodeSummary, ProcProbe, StatusSnapshot, SystemProbe, snapshot};
use crate::core::target::ExecutionTarget;

pub const DEFAULT_ENV_KEY: &str = "base";

/// Finished `remote` results nobody collected are dropped after this long.
const FINISHED_HANDLE_TTL: Duration = Duration::from_secs(600);
const MAX_FINISHED_HANDLES: usize = 1024;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub name: String,
    pub ips: Vec<String>,
    pub workdir: PathBuf,
    pub default_env: String,
    pub installer: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            ips: vec!["127.0.0.1".to_string()],
            workdir: default_workdir(),
            default_env: DEFAULT_ENV_KEY.to_string(),
            installer: DEFAULT_INSTALLER.to_string(),
        }
    }
}

struct PendingCall {
    slot: Mutex<Option<(ResponseEnvelope, Instant)>>,
    ready: Condvar,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, response: ResponseEnvelope) {
        *lock(&self.slot) = Some((response, Instant::now()));
        self.ready.notify_all();
    }

    fn finished_at(&self) -> Option<Instant> {
        lock(&self.slot).as_ref().map(|(_, at)| *at)
    }

    fn wait(&self) -> ResponseEnvelope {
        let mut slot = lock(&self.slot);
        loop {
            if let Some((response, _)) = slot.as_ref() {
                return response.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct NodeInner {
    config: NodeConfig,
    registry: Registry,
    functions: FunctionTable,
    probe: Box<dyn SystemProbe>,
    queues: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    handles: Mutex<HashMap<String, Arc<PendingCall>>>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig, functions: FunctionTable) -> Self {
        Self::with_probe(config, functions, Box::new(ProcProbe))
    }

    pub fn with_probe(
        config: NodeConfig,
        functions: FunctionTable,
        probe: Box<dyn SystemProbe>,
    ) -> Self {
        let registry = Registry::new();
        registry.partition(&config.default_env);
        Self {
            inner: Arc::new(NodeInner {
                config,
                registry,
                functions,
                probe,
                queues: Mutex::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn execute(&self, envelope: CallEnvelope) -> ResponseEnvelope {
        let env = envelope
            .env
            .clone()
            .unwrap_or_else(|| self.inner.config.default_env.clone());
        debug!(
            call = %envelope.qualified_name(),
            kind = envelope.kind.as_str(),
            env = %env,
            "executing call"
        );
        let result = match envelope.kind {
            CallKind::Call => self.invoke_tracked(&env, &envelope, &envelope.args),
            CallKind::Repeat => self.repeat(&env, &envelope),
            CallKind::Map => self.map(&env, &envelope, false),
            CallKind::Starmap => self.map(&env, &envelope, true),
            CallKind::Queue => self.enqueue(env.clone(), envelope.clone()).map(|()| Value::Null),
            CallKind::Remote => self
                .spawn_remote(env.clone(), envelope.clone())
                .map(Value::String),
            CallKind::Get => return self.get_handles(&envelope.args),
        };
        match result {
            Ok(value) => ResponseEnvelope::ok(value),
            Err(exception) => {
                let traceback = self.traceback(&env, &envelope, &exception);
                ResponseEnvelope::raised(exception, traceback)
            }
        }
    }

    fn traceback(&self, env: &str, envelope: &CallEnvelope, exception: &Exception) -> String {
        format!(
            "Traceback (most recent call last):\n  node \"{}\", env \"{env}\", in {}\n{exception}",
            self.inner.config.name,
            envelope.qualified_name()
        )
    }

    fn invoke(&self, env: &str, envelope: &CallEnvelope, args: &[Value]) -> Result<Value, Exception> {
        let env_vars = self
            .inner
            .registry
            .existing_partition(env)
            .map(|partition| partition.process_env())
            .unwrap_or_default();
        let workdir = &self.inner.config.workdir;

        if let Some(relative) = envelope
            .relative_path
            .as_deref()
            .filter(|path| !path.is_empty())
        {
            let relative = safe_relative(relative).map_err(|_| module_not_found(&envelope.module))?;
            let script = workdir
                .join(relative)
                .join(format!("{}.sh", envelope.module));
            if script.is_file() {
                return run_script(
                    &script,
                    &envelope.function,
                    args,
                    &envelope.kwargs,
                    &env_vars,
                    workdir,
                );
            }
        }

        match self
            .inner
            .functions
            .lookup(&envelope.module, &envelope.function)
        {
            Lookup::Found(handler) => {
                let ctx = CallContext {
                    env,
                    env_vars: &env_vars,
                    node_name: &self.inner.config.name,
                    workdir,
                    registry: &self.inner.registry,
                };
                catch_unwind(AssertUnwindSafe(|| handler(&ctx, args, &envelope.kwargs)))
                    .unwrap_or_else(|payload| Err(panic_exception(payload)))
            }
            Lookup::MissingFunction => Err(attribute_error(&envelope.module, &envelope.function)),
            Lookup::MissingModule => Err(module_not_found(&envelope.module)),
        }
    }

    fn invoke_tracked(
        &self,
        env: &str,
        envelope: &CallEnvelope,
        args: &[Value],
    ) -> Result<Value, Exception> {
        let key = envelope.name.as_deref().unwrap_or(&envelope.function);
        let _active = self
            .inner
            .registry
            .begin_call(env, key, envelope.kind)
            .map_err(runtime_error)?;
        self.invoke(env, envelope, args)
    }

    fn repeat(&self, env: &str, envelope: &CallEnvelope) -> Result<Value, Exception> {
        let Some(count) = envelope.args.first().and_then(Value::as_u64) else {
            return Err(Exception::type_error(
                "repeat expects a non-negative integer count as its first argument",
            ));
        };
        let rest = &envelope.args[1..];
        let mut results = Vec::new();
        for _ in 0..count {
            results.push(self.invoke_tracked(env, envelope, rest)?);
        }
        Ok(Value::Array(results))
    }

    fn map(&self, env: &str, envelope: &CallEnvelope, star: bool) -> Result<Value, Exception> {
        let mut results = Vec::with_capacity(envelope.args.len());
        for item in &envelope.args {
            let args = if star {
                item.as_array().cloned().ok_or_else(|| {
                    Exception::type_error("starmap expects each element to be a list of arguments")
                })?
            } else {
                vec![item.clone()]
            };
            results.push(self.invoke_tracked(env, envelope, &args)?);
        }
        Ok(Value::Array(results))
    }

    fn enqueue(&self, env: String, envelope: CallEnvelope) -> Result<(), Exception> {
        let node = self.clone();
        let job_env = env.clone();
        let job: Job = Box::new(move || {
            if let Err(exception) = node.invoke_tracked(&job_env, &envelope, &envelope.args) {
                warn!(
                    call = %envelope.qualified_name(),
                    env = %job_env,
                    exception = %exception,
                    "queued call raised"
                );
            }
        });

        let mut queues = lock(&self.inner.queues);
        let job = match queues.get(&env) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };
        let sender = spawn_queue_worker(&env).map_err(runtime_error)?;
        sender
            .send(job)
            .map_err(|_| Exception::new("RuntimeError", "queue worker stopped"))?;
        queues.insert(env, sender);
        Ok(())
    }

    fn spawn_remote(&self, env: String, envelope: CallEnvelope) -> Result<String, Exception> {
        let id = new_call_id().map_err(runtime_error)?;
        let pending = Arc::new(PendingCall::new());
        {
            let mut handles = lock(&self.inner.handles);
            prune_finished(
                &mut handles,
                Instant::now(),
                FINISHED_HANDLE_TTL,
                MAX_FINISHED_HANDLES,
            );
            handles.insert(id.clone(), Arc::clone(&pending));
        }

        let node = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("tether-remote-{id}"))
            .spawn(move || {
                let response = match node.invoke_tracked(&env, &envelope, &envelope.args) {
                    Ok(value) => ResponseEnvelope::ok(value),
                    Err(exception) => {
                        let traceback = node.traceback(&env, &envelope, &exception);
                        ResponseEnvelope::raised(exception, traceback)
                    }
                };
                pending.complete(response);
            });
        if let Err(err) = spawned {
            lock(&self.inner.handles).remove(&id);
            return Err(Exception::new("RuntimeError", err.to_string()));
        }
        Ok(id)
    }

    fn get_handles(&self, args: &[Value]) -> ResponseEnvelope {
        let single = matches!(args, [Value::String(_)]);
        let mut wanted = Vec::new();
        for arg in args {
            match arg {
                Value::String(handle) => wanted.push(handle.clone()),
                Value::Array(items) => {
                    for item in items {
                        match item.as_str() {
                            Some(handle) => wanted.push(handle.to_string()),
                            None => return handle_type_error(),
                        }
                    }
                }
                _ => return handle_type_error(),
            }
        }

        // Handles are consumed by `get` whether their calls returned or raised.
        let pending = {
            let mut handles = lock(&self.inner.handles);
            if let Some(missing) = wanted.iter().find(|handle| !handles.contains_key(*handle)) {
                return ResponseEnvelope::raised(
                    Exception::key_error(format!("'{missing}'")),
                    format!("node \"{}\": unknown call handle", self.inner.config.name),
                );
            }
            let pending: Vec<_> = wanted
                .iter()
                .filter_map(|handle| handles.get(handle).cloned())
                .collect();
            for handle in &wanted {
                handles.remove(handle);
            }
            pending
        };

        let mut results = Vec::with_capacity(pending.len());
        for call in &pending {
            let response = call.wait();
            if response.exception.is_some() {
                return response;
            }
            results.push(response.result.unwrap_or(Value::Null));
        }
        if single {
            ResponseEnvelope::ok(results.pop().unwrap_or(Value::Null))
        } else {
            ResponseEnvelope::ok(Value::Array(results))
        }
    }

    /// Invoke a registry method on the resource stored under `key`.
    pub fn call_method(&self, key: &str, method: &str, args: Value) -> Result<Value, Error> {
        let args = match args {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let env_key = self
            .inner
            .registry
            .owner_of(key)
            .unwrap_or_else(|| key.to_string());
        let ctx = self.install_context(&env_key);
        match method {
            "install" => {
                let env = self.stored_env(key)?;
                let force = args.first().and_then(Value::as_bool).unwrap_or(false);
                let installed = env.install(&self.inner.registry, &ctx, force)?;
                Ok(json!({ "installed": installed }))
            }
            "_set_env_vars" => {
                let vars = env_vars_from_value(args.first())?;
                self.inner.registry.set_env_vars(&env_key, vars);
                Ok(Value::Null)
            }
            "_install_reqs" => {
                let env = self.env_from_args(key, &args)?;
                env.install_reqs(&ctx)?;
                Ok(Value::Null)
            }
            "_run_setup_cmds" => {
                let env = self.env_from_args(key, &args)?;
                env.run_setup_cmds(&ctx)?;
                Ok(Value::Null)
            }
            other => Err(Error::new(ErrorKind::Config)
                .with_message(format!("unknown resource method: {other}"))
                .with_hint("Use install, _set_env_vars, _install_reqs, or _run_setup_cmds.")),
        }
    }

    fn install_context(&self, env_key: &str) -> InstallContext {
        let env_vars = self
            .inner
            .registry
            .existing_partition(env_key)
            .map(|partition| partition.process_env())
            .unwrap_or_default();
        InstallContext::new(&self.inner.config.installer, &self.inner.config.workdir)
            .with_env_vars(env_vars)
    }

    fn stored_env(&self, key: &str) -> Result<Environment, Error> {
        let object = self.inner.registry.get(key, None).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("no resource named {key}"))
        })?;
        if object.resource_type != ENV_RESOURCE_TYPE {
            return Err(Error::new(ErrorKind::Config).with_message(format!(
                "resource {key} is a {}, not an environment",
                object.resource_type
            )));
        }
        Environment::from_value(object.value)
    }

    fn env_from_args(&self, key: &str, args: &[Value]) -> Result<Environment, Error> {
        match args.first() {
            Some(config @ Value::Object(_)) => Environment::from_value(config.clone()),
            _ => self.stored_env(key),
        }
    }

    /// Register `env` under its key, in its own partition unless `into` names another.
    pub fn put_resource(&self, env: &Environment, into: Option<&str>) -> Result<String, Error> {
        let key = env
            .name
            .clone()
            .unwrap_or_else(|| self.inner.config.default_env.clone());
        let value = serde_json::to_value(env).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode environment")
                .with_source(err)
        })?;
        let partition = into.unwrap_or(&key).to_string();
        self.inner
            .registry
            .put(&key, value, ENV_RESOURCE_TYPE, &partition);
        debug!(key = %key, partition = %partition, "environment registered");
        Ok(key)
    }

    pub fn put_secret(&self, secret: &Secret, env_key: &str) {
        self.inner.registry.put_secret(env_key, secret.clone());
    }

    pub fn put(&self, key: &str, value: Value, resource_type: Option<&str>, env: Option<&str>) {
        let env = env.unwrap_or(&self.inner.config.default_env);
        self.inner.registry.put(
            key,
            value,
            resource_type.unwrap_or(OBJECT_RESOURCE_TYPE),
            env,
        );
    }

    pub fn get(&self, key: &str, env: Option<&str>) -> Option<StoredObject> {
        self.inner.registry.get(key, env)
    }

    pub fn keys(&self, env: Option<&str>) -> Vec<String> {
        self.inner.registry.keys(env)
    }

    /// Delete an environment partition (and stop its queue) or a single object.
    pub fn delete(&self, key: &str) -> bool {
        let deleted = self.inner.registry.delete(key);
        if deleted {
            lock(&self.inner.queues).remove(key);
        }
        deleted
    }

    pub fn run_commands(
        &self,
        commands: &[String],
        env_vars: &BTreeMap<String, String>,
        stream_logs: bool,
    ) -> Result<Vec<CommandOutput>, Error> {
        let workdir = &self.inner.config.workdir;
        let cwd = workdir.is_dir().then_some(workdir.as_path());
        commands
            .iter()
            .map(|cmd| run_with_logs(cmd, env_vars, cwd, stream_logs))
            .collect()
    }

    /// Copy `source` into the workdir (or use it in place when mounting).
    pub fn place_folder(
        &self,
        source: &Path,
        dest: Option<&str>,
        mount: bool,
    ) -> Result<PathBuf, Error> {
        if mount {
            return Ok(source.to_path_buf());
        }
        let name = match dest {
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
        if self.inner.config.workdir.join(safe_relative(&name)?) == source {
            return Ok(source.to_path_buf());
        }
        let placed = self.fresh_dir(&name)?;
        copy_dir(source, &placed)?;
        Ok(placed)
    }

    /// Create an empty directory under the workdir, replacing any previous contents.
    pub fn fresh_dir(&self, relative: &str) -> Result<PathBuf, Error> {
        let dir = self.inner.config.workdir.join(safe_relative(relative)?);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to clear directory")
                    .with_path(&dir)
                    .with_source(err)
            })?;
        }
        ensure_dir(&dir)?;
        Ok(dir)
    }

    pub fn write_file(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
        let path = self.inner.config.workdir.join(safe_relative(relative)?);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(&path, bytes).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to write file")
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(path)
    }

    pub fn summary(&self, access: &str) -> NodeSummary {
        let config = &self.inner.config;
        NodeSummary {
            name: config.name.clone(),
            ips: config.ips.clone(),
            default_env: config.default_env.clone(),
            access: access.to_string(),
            workdir: config.workdir.display().to_string(),
        }
    }

    pub fn status(&self, access: &str) -> StatusSnapshot {
        snapshot(
            &self.inner.registry,
            &self.summary(access),
            self.inner.probe.as_ref(),
        )
    }
}

fn spawn_queue_worker(env: &str) -> Result<mpsc::Sender<Job>, Error> {
    let (sender, receiver) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name(format!("tether-queue-{env}"))
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start queue worker")
                .with_source(err)
        })?;
    Ok(sender)
}

fn env_vars_from_value(value: Option<&Value>) -> Result<BTreeMap<String, String>, Error> {
    let Some(Value::Object(map)) = value else {
        return Err(Error::new(ErrorKind::Config)
            .with_message("_set_env_vars expects a mapping of variable names to values"));
    };
    Ok(map
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect())
}

/// Drop finished handles older than `ttl`, then the oldest finished ones beyond `cap`.
/// Calls still running are never dropped.
fn prune_finished(
    handles: &mut HashMap<String, Arc<PendingCall>>,
    now: Instant,
    ttl: Duration,
    cap: usize,
) {
    handles.retain(|_, call| {
        call.finished_at()
            .is_none_or(|at| now.saturating_duration_since(at) <= ttl)
    });
    let mut finished: Vec<(Instant, String)> = handles
        .iter()
        .filter_map(|(id, call)| call.finished_at().map(|at| (at, id.clone())))
        .collect();
    if finished.len() <= cap {
        return;
    }
    finished.sort();
    let excess = finished.len() - cap;
    for (_, id) in finished.into_iter().take(excess) {
        handles.remove(&id);
    }
}

fn handle_type_error() -> ResponseEnvelope {
    ResponseEnvelope::raised(
        Exception::type_error("get expects a call handle or a list of call handles"),
        "get",
    )
}

fn panic_exception(payload: Box<dyn Any + Send>) -> Exception {
    let message = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    Exception::new("Panic", message)
}

fn runtime_error(err: Error) -> Exception {
    Exception::new("RuntimeError", err.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// A node reached without the network, for code already running on it.
#[derive(Clone)]
pub struct LocalTarget {
    node: Node,
}

impl LocalTarget {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl ExecutionTarget for LocalTarget {
    fn name(&self) -> &str {
        &self.node.config().name
    }

    fn ips(&self) -> &[String] {
        &self.node.config().ips
    }

    fn is_local(&self) -> bool {
        true
    }

    fn default_env_key(&self) -> &str {
        &self.node.config().default_env
    }

    fn run(
        &self,
        commands: &[String],
        env_vars: &BTreeMap<String, String>,
        stream_logs: bool,
    ) -> Result<Vec<CommandOutput>, Error> {
        self.node.run_commands(commands, env_vars, stream_logs)
    }

    fn call(&self, resource_key: &str, method: &str, args: Value) -> Result<Value, Error> {
        self.node.call_method(resource_key, method, args)
    }

    fn put_resource(&self, env: &Environment, into: Option<&str>) -> Result<String, Error> {
        self.node.put_resource(env, into)
    }

    fn put_secret(&self, secret: &Secret, env_key: &str) -> Result<(), Error> {
        self.node.put_secret(secret, env_key);
        Ok(())
    }

    fn sync_folder(
        &self,
        source: &Path,
        dest: Option<&str>,
        mount: bool,
    ) -> Result<PathBuf, Error> {
        self.node.place_folder(source, dest, mount)
    }

    fn put(
        &self,
        key: &str,
        value: Value,
        resource_type: Option<&str>,
        env: Option<&str>,
    ) -> Result<(), Error> {
        self.node.put(key, value, resource_type, env);
        Ok(())
    }

    fn dispatch(&self, envelope: &CallEnvelope) -> Result<ResponseEnvelope, Error> {
        Ok(self.node.execute(envelope.clone()))
    }
}
