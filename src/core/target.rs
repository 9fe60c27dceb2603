//! Purpose: Define the execution-target contract the environment manager and the
//! invocation protocol send their operations to.
//! Exports: `ExecutionTarget`.
//! Role: Seam between client-side logic and a node, whether in-process or over HTTP.
//! Invariants: `is_local` targets never touch the network.
//! Invariants: Every registered environment is addressable by its name, or by
//! `default_env_key` when anonymous.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::core::environment::{Environment, Secret};
use crate::core::envelope::{CallEnvelope, ResponseEnvelope};
use crate::core::error::Error;
use crate::core::shell::CommandOutput;

pub trait ExecutionTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Reachable addresses, one per node.
    fn ips(&self) -> &[String];

    fn node_count(&self) -> usize {
        self.ips().len()
    }

    fn is_local(&self) -> bool;

    /// Base URL of the node's HTTP server, when it is reachable over HTTP.
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Key of the distinguished environment used when none is named.
    fn default_env_key(&self) -> &str;

    fn run(
        &self,
        commands: &[String],
        env_vars: &BTreeMap<String, String>,
        stream_logs: bool,
    ) -> Result<Vec<CommandOutput>, Error>;

    /// Invoke a registry method on the resource stored under `resource_key`.
    fn call(&self, resource_key: &str, method: &str, args: Value) -> Result<Value, Error>;

    /// Register an environment (its own partition unless `into` names another) and
    /// return the key it is addressable by.
    fn put_resource(&self, env: &Environment, into: Option<&str>) -> Result<String, Error>;

    fn put_secret(&self, secret: &Secret, env_key: &str) -> Result<(), Error>;

    /// Place a local folder on the target and return its path there.
    fn sync_folder(&self, source: &Path, dest: Option<&str>, mount: bool)
    -> Result<PathBuf, Error>;

    /// Store an arbitrary value in an environment partition.
    fn put(
        &self,
        key: &str,
        value: Value,
        resource_type: Option<&str>,
        env: Option<&str>,
    ) -> Result<(), Error>;

    /// Ship one call envelope over the RPC channel and wait for its response.
    fn dispatch(&self, envelope: &CallEnvelope) -> Result<ResponseEnvelope, Error>;
}
