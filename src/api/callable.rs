//! Purpose: Client-side handle for a function living in a node environment.
//! Exports: `Function`.
//! Role: Ties a function pointer to a target, an environment key, and an access level.
//! Invariants: Every operation checks the access table before touching the network.
//! Invariants: Proxy-level handles call through the HTTP endpoint, never the RPC channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::api::proxy::{ProxyClient, TOKEN_ENV};
use crate::core::callable::{Access, FnPointer, INLINE_DIR, Operation, check_access};
use crate::core::envelope::CallEnvelope;
use crate::core::environment::{Environment, ToOptions};
use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::package::{InstallMethod, Package};
use crate::core::paths::{current_working_root, ensure_dir};
use crate::core::registry::FUNCTION_RESOURCE_TYPE;
use crate::core::shell::quote;
use crate::core::target::ExecutionTarget;

#[derive(Clone)]
pub struct Function {
    name: Option<String>,
    pointer: FnPointer,
    target: Option<Arc<dyn ExecutionTarget>>,
    env_key: Option<String>,
    access: Access,
    proxy_token: Option<String>,
    proxy_token_from_env: bool,
}

impl Function {
    pub fn new(pointer: FnPointer) -> Self {
        Self {
            name: None,
            pointer,
            target: None,
            env_key: None,
            access: Access::Write,
            proxy_token: None,
            proxy_token_from_env: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Token for proxy calls; `TETHER_TOKEN` is read when none is set.
    pub fn with_proxy_token(mut self, token: impl Into<String>) -> Self {
        self.proxy_token = Some(token.into());
        self
    }

    /// Proxy calls use only the token given to `with_proxy_token`.
    pub fn without_proxy_env_token(mut self) -> Self {
        self.proxy_token_from_env = false;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn pointer(&self) -> &FnPointer {
        &self.pointer
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn env_key(&self) -> Option<&str> {
        self.env_key.as_deref()
    }

    /// Bring `env` up on `target`, ship inline source if needed, and return a handle
    /// bound to both. Named functions are registered on the node under their name.
    pub fn to(
        &self,
        target: Arc<dyn ExecutionTarget>,
        env: Option<Environment>,
        opts: ToOptions,
    ) -> Result<Function, Error> {
        let env = env.unwrap_or_default();
        let root = opts.root.clone().unwrap_or_else(current_working_root);

        let pointer = match &self.pointer {
            FnPointer::InlineSource {
                module, source, ..
            } => {
                let dir = write_inline_module(module, source)?;
                Package::folder(&dir, InstallMethod::Deserialize).to(
                    target.as_ref(),
                    &root,
                    Some(INLINE_DIR),
                    opts.mount,
                )?;
                debug!(module = %module, target = target.name(), "inline module synced");
                self.pointer.materialized()
            }
            resolved => resolved.clone(),
        };

        let placed = env.to(target.as_ref(), opts)?;
        let env_key = placed.key(target.as_ref());

        if let Some(name) = &self.name {
            target.put(
                name,
                json!({ "pointer": pointer, "env": env_key }),
                Some(FUNCTION_RESOURCE_TYPE),
                Some(&env_key),
            )?;
        }
        info!(
            function = %pointer.function(),
            env = %env_key,
            target = target.name(),
            "function bound to target"
        );

        Ok(Function {
            name: self.name.clone(),
            pointer,
            target: Some(target),
            env_key: Some(env_key),
            access: self.access,
            proxy_token: self.proxy_token.clone(),
            proxy_token_from_env: self.proxy_token_from_env,
        })
    }

    fn bound_target(&self) -> Result<&Arc<dyn ExecutionTarget>, Error> {
        self.target.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message("function is not bound to a target")
                .with_hint("Send it to a target with `to` before calling it.")
        })
    }

    fn dispatch(
        &self,
        operation: Operation,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, Error> {
        check_access(self.access, operation)?;
        let target = self.bound_target()?;
        let mut envelope: CallEnvelope = self
            .pointer
            .envelope(operation.call_kind())?
            .with_args(args, kwargs);
        envelope.env = self.env_key.clone();
        envelope.name = self.name.clone();
        target.dispatch(&envelope)?.into_result()
    }

    pub fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, Error> {
        check_access(self.access, Operation::Call)?;
        if self.access == Access::Proxy {
            let url = self.http_url()?;
            let url = url::Url::parse(&url).map_err(|err| {
                Error::new(ErrorKind::Config)
                    .with_message("invalid proxy url")
                    .with_source(err)
            })?;
            let mut client = ProxyClient::new();
            if let Some(token) = &self.proxy_token {
                client = client.with_token(token);
            }
            if !self.proxy_token_from_env {
                client = client.without_env_fallback();
            }
            return client.call(&url, &args, &kwargs);
        }
        self.dispatch(Operation::Call, args, kwargs)
    }

    /// Call `count` times with the same arguments; results in call order.
    pub fn repeat(
        &self,
        count: u64,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Vec<Value>, Error> {
        let mut all = vec![json!(count)];
        all.extend(args);
        into_list(self.dispatch(Operation::Repeat, all, kwargs)?)
    }

    pub fn map(&self, items: Vec<Value>, kwargs: Map<String, Value>) -> Result<Vec<Value>, Error> {
        into_list(self.dispatch(Operation::Map, items, kwargs)?)
    }

    pub fn starmap(
        &self,
        items: Vec<Vec<Value>>,
        kwargs: Map<String, Value>,
    ) -> Result<Vec<Value>, Error> {
        let items = items.into_iter().map(Value::Array).collect();
        into_list(self.dispatch(Operation::Starmap, items, kwargs)?)
    }

    /// Queue a call in the environment's FIFO and return without its result.
    pub fn enqueue(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<(), Error> {
        self.dispatch(Operation::Enqueue, args, kwargs)?;
        Ok(())
    }

    /// Start a call and return a handle for `get`.
    pub fn remote(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<String, Error> {
        match self.dispatch(Operation::Remote, args, kwargs)? {
            Value::String(handle) => Ok(handle),
            other => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("node returned a non-string call handle: {other}"))),
        }
    }

    /// Wait for one handle and return its result.
    pub fn get(&self, handle: &str) -> Result<Value, Error> {
        self.dispatch(Operation::Get, vec![json!(handle)], Map::new())
    }

    /// Wait for several handles; results follow the order of `handles`.
    pub fn get_many(&self, handles: &[String]) -> Result<Vec<Value>, Error> {
        into_list(self.dispatch(Operation::Get, vec![json!(handles)], Map::new())?)
    }

    pub fn http_url(&self) -> Result<String, Error> {
        let target = self.bound_target()?;
        let name = self.name.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message("only named functions have an HTTP endpoint")
                .with_hint("Give the function a name before sending it to the target.")
        })?;
        let endpoint = target.endpoint().ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message(format!("target {} has no HTTP endpoint", target.name()))
        })?;
        Ok(format!("{endpoint}/v0/proxy/{name}"))
    }

    /// A curl invocation of the proxy endpoint. The token is read from the shell
    /// environment, never embedded.
    pub fn curl_command(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<String, Error> {
        let url = self.http_url()?;
        let body = json!({ "args": args, "kwargs": kwargs }).to_string();
        Ok(format!(
            "curl -X POST {} -H \"Authorization: Bearer ${TOKEN_ENV}\" -H 'Content-Type: application/json' -d {}",
            quote(&url),
            quote(&body)
        ))
    }
}

fn into_list(value: Value) -> Result<Vec<Value>, Error> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::new(ErrorKind::Internal)
            .with_message(format!("node returned a non-list result: {other}"))),
    }
}

/// Write inline source to `<tmp>/tether-inline-<module>/<module>/<module>.sh` and
/// return the folder holding it.
fn write_inline_module(module: &str, source: &str) -> Result<PathBuf, Error> {
    let dir = std::env::temp_dir()
        .join(format!("tether-inline-{module}"))
        .join(module);
    ensure_dir(&dir)?;
    let file = dir.join(format!("{module}.sh"));
    write_file(&file, source)?;
    Ok(dir)
}

fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    std::fs::write(path, contents).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to write inline module")
            .with_path(path)
            .with_source(err)
    })
}
