//! Purpose: Environment values: identity, idempotent install, and migration to targets.
//! Exports: `Environment`, `EnvVars`, `Secret`, `Compute`, `InstallContext`, `ToOptions`.
//! Role: Environment manager half of the core; nodes install, clients migrate.
//! Invariants: `content_hash` ignores `name` and secrets, so equal content shares one install.
//! Invariants: `to` never mutates `self`; it returns a target-bound copy.
//! Invariants: `reqs()` lists declared requirements first and the working dir last.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind};
use crate::core::hex::hex_encode;
use crate::core::package::Package;
use crate::core::paths::{current_working_root, resolve_under_root};
use crate::core::registry::Registry;
use crate::core::shell::{CommandOutput, prefixed, run_with_logs, tail_line};
use crate::core::target::ExecutionTarget;

pub const DEFAULT_INSTALLER: &str = "python3 -m pip install";

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Compute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Pins execution to one node of a multi-node target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_index: Option<usize>,
}

/// Variables for an environment: inline, or a dotenv file read at resolve time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvVars {
    Map(BTreeMap<String, String>),
    File(PathBuf),
}

impl Default for EnvVars {
    fn default() -> Self {
        EnvVars::Map(BTreeMap::new())
    }
}

impl EnvVars {
    pub fn resolve(&self, root: &Path) -> Result<BTreeMap<String, String>, Error> {
        match self {
            EnvVars::Map(map) => Ok(map.clone()),
            EnvVars::File(path) => {
                let path = resolve_under_root(path, root);
                let iter = dotenv::from_path_iter(&path).map_err(|err| {
                    Error::new(ErrorKind::Config)
                        .with_message("failed to open env file")
                        .with_path(&path)
                        .with_source(err)
                })?;
                let mut out = BTreeMap::new();
                for item in iter {
                    let (key, value) = item.map_err(|err| {
                        Error::new(ErrorKind::Config)
                            .with_message("failed to parse env file")
                            .with_path(&path)
                            .with_source(err)
                    })?;
                    out.insert(key, value);
                }
                Ok(out)
            }
        }
    }
}

/// A named bundle of credentials, optionally bound to one environment.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub env: Option<String>,
}

impl Secret {
    pub fn new(name: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            values,
            env: None,
        }
    }

    pub fn bound_to(&self, env_key: &str) -> Secret {
        Secret {
            env: Some(env_key.to_string()),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("env", &self.env)
            .finish()
    }
}

/// Node-side facts an install needs: installer command, root for relative paths,
/// and the partition's propagated variables.
#[derive(Clone, Debug)]
pub struct InstallContext {
    pub installer: String,
    pub root: PathBuf,
    pub env_vars: BTreeMap<String, String>,
    pub stream_logs: bool,
}

impl InstallContext {
    pub fn new(installer: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            installer: installer.into(),
            root: root.into(),
            env_vars: BTreeMap::new(),
            stream_logs: true,
        }
    }

    pub fn with_env_vars(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ToOptions {
    pub node_index: Option<usize>,
    /// Destination directory on the target for uploaded folders.
    pub path: Option<String>,
    pub mount: bool,
    pub force_install: bool,
    /// Root for relative package paths; the discovered project root when absent.
    pub root: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "reqs")]
    pub declared_reqs: Vec<Package>,
    #[serde(default)]
    pub working_dir: Option<Package>,
    #[serde(default)]
    pub setup_cmds: Vec<String>,
    #[serde(default)]
    pub env_vars: EnvVars,
    #[serde(skip)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub compute: Compute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_cmd: Option<String>,
}

#[derive(Serialize)]
struct HashView<'a> {
    reqs: Vec<&'a Package>,
    setup_cmds: &'a [String],
    env_vars: &'a EnvVars,
    compute: &'a Compute,
    activation_cmd: &'a Option<String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_req(mut self, package: Package) -> Self {
        self.declared_reqs.push(package);
        self
    }

    /// Add shorthand requirements, resolving folder paths against the project root.
    pub fn with_reqs<I, S>(mut self, reqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root = current_working_root();
        self.declared_reqs.extend(
            reqs.into_iter()
                .map(|spec| Package::from_string(spec.as_ref(), &root)),
        );
        self
    }

    pub fn with_working_dir(mut self, package: Package) -> Self {
        self.working_dir = Some(package);
        self
    }

    pub fn with_setup_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.setup_cmds.push(cmd.into());
        self
    }

    pub fn with_env_vars(mut self, env_vars: EnvVars) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secrets.push(secret);
        self
    }

    pub fn with_compute(mut self, compute: Compute) -> Self {
        self.compute = compute;
        self
    }

    pub fn with_activation(mut self, cmd: impl Into<String>) -> Self {
        self.activation_cmd = Some(cmd.into());
        self
    }

    /// Declared requirements followed by the working dir.
    pub fn reqs(&self) -> Vec<&Package> {
        self.declared_reqs
            .iter()
            .chain(self.working_dir.as_ref())
            .collect()
    }

    /// The key this environment is addressable by on `target`.
    pub fn key(&self, target: &dyn ExecutionTarget) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| target.default_env_key().to_string())
    }

    /// Hex sha256 of the installable configuration.
    pub fn content_hash(&self) -> Result<String, Error> {
        let view = HashView {
            reqs: self.reqs(),
            setup_cmds: &self.setup_cmds,
            env_vars: &self.env_vars,
            compute: &self.compute,
            activation_cmd: &self.activation_cmd,
        };
        let bytes = serde_json::to_vec(&view).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode environment")
                .with_source(err)
        })?;
        Ok(hex_encode(&Sha256::digest(&bytes)))
    }

    /// Install on this node unless the same content is already installed. Returns
    /// whether real work happened.
    pub fn install(
        &self,
        registry: &Registry,
        ctx: &InstallContext,
        force: bool,
    ) -> Result<bool, Error> {
        let hash = self.content_hash()?;
        let label = self.name.as_deref().unwrap_or("<anonymous>");
        registry.install_once(&hash, label, force, || {
            info!(env = label, hash = %hash, "installing environment");
            self.install_reqs(ctx)?;
            self.run_setup_cmds(ctx)
        })
    }

    /// Install every requirement in order, stopping at the first failure.
    pub fn install_reqs(&self, ctx: &InstallContext) -> Result<(), Error> {
        for package in self.reqs() {
            debug!(package = %package, "installing package");
            package.install(self, ctx)?;
        }
        Ok(())
    }

    pub fn run_setup_cmds(&self, ctx: &InstallContext) -> Result<(), Error> {
        for cmd in &self.setup_cmds {
            let output = self.run_command_in(cmd, ctx)?;
            if !output.success() {
                return Err(Error::new(ErrorKind::Install)
                    .with_message(format!(
                        "setup command failed (exit {}): {}",
                        output.code,
                        tail_line(&output.stderr)
                    ))
                    .with_hint(format!("command: {cmd}")));
            }
        }
        Ok(())
    }

    /// Run one command in this environment's activation context on the node.
    pub fn run_command_in(&self, cmd: &str, ctx: &InstallContext) -> Result<CommandOutput, Error> {
        let mut vars = ctx.env_vars.clone();
        if let EnvVars::Map(own) = &self.env_vars {
            vars.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let full = prefixed(self.activation_cmd.as_deref(), cmd);
        let cwd = ctx.root.is_dir().then_some(ctx.root.as_path());
        run_with_logs(&full, &vars, cwd, ctx.stream_logs)
    }

    /// Run one command locally with output streamed to the log; returns the exit code.
    pub fn run_command(&self, cmd: &str) -> Result<i32, Error> {
        let root = current_working_root();
        let vars = self.env_vars.resolve(&root)?;
        let full = prefixed(self.activation_cmd.as_deref(), cmd);
        Ok(run_with_logs(&full, &vars, None, true)?.code)
    }

    /// Migrate to `target`: rebase folders, register, set variables, install, and send
    /// secrets. Returns the target-bound copy.
    pub fn to(&self, target: &dyn ExecutionTarget, opts: ToOptions) -> Result<Environment, Error> {
        if let Some(index) = opts.node_index {
            let count = target.node_count();
            if index >= count {
                return Err(Error::new(ErrorKind::Config)
                    .with_message(format!(
                        "node index {index} is out of range for target {} with {count} node(s)",
                        target.name()
                    ))
                    .with_hint("Pick a node index below the target's node count."));
            }
        }

        let root = opts.root.clone().unwrap_or_else(current_working_root);
        let path = opts.path.as_deref();
        let mut copy = self.clone();
        copy.declared_reqs = self
            .declared_reqs
            .iter()
            .map(|package| package.to(target, &root, path, opts.mount))
            .collect::<Result<_, _>>()?;
        copy.working_dir = self
            .working_dir
            .as_ref()
            .map(|package| package.to(target, &root, path, opts.mount))
            .transpose()?;
        if let Some(index) = opts.node_index {
            copy.compute.node_index = Some(index);
        }
        let vars = self.env_vars.resolve(&root)?;
        copy.env_vars = EnvVars::Map(vars.clone());

        let key = copy.key(target);
        if copy.name.is_some() {
            target.put_resource(&copy, None)?;
            if !vars.is_empty() {
                target.call(&key, "_set_env_vars", json!([vars]))?;
            }
            target.call(&key, "install", json!([opts.force_install]))?;
        } else {
            if !vars.is_empty() {
                target.call(&key, "_set_env_vars", json!([vars]))?;
            }
            let config = serde_json::to_value(&copy).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode environment")
                    .with_source(err)
            })?;
            target.call(&key, "_install_reqs", json!([config.clone()]))?;
            target.call(&key, "_run_setup_cmds", json!([config]))?;
        }

        copy.secrets = self.secrets_to(target, &key)?;
        info!(env = %key, target = target.name(), "environment ready on target");
        Ok(copy)
    }

    /// Ship every secret to `env_key` on `target` and return the bound copies.
    pub fn secrets_to(
        &self,
        target: &dyn ExecutionTarget,
        env_key: &str,
    ) -> Result<Vec<Secret>, Error> {
        let mut bound = Vec::with_capacity(self.secrets.len());
        for secret in &self.secrets {
            let secret = secret.bound_to(env_key);
            target.put_secret(&secret, env_key)?;
            bound.push(secret);
        }
        Ok(bound)
    }

    pub fn from_value(value: Value) -> Result<Environment, Error> {
        serde_json::from_value(value).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("invalid environment config")
                .with_source(err)
        })
    }
}
