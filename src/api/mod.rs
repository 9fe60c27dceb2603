//! Purpose: Define the public Rust API boundary for tether.
//! Exports: Targets, function handles, the node, and the core types they exchange.
//! Role: Public, additive-only surface used by the CLI, the server, and tests.
//! Invariants: Callers reach nodes only through `ExecutionTarget` implementations.

mod callable;
mod functions;
mod node;
mod proxy;
mod remote;

pub use crate::core::callable::{Access, FnPointer, Operation};
pub use crate::core::envelope::{CallEnvelope, CallKind, ResponseEnvelope};
pub use crate::core::environment::{Compute, EnvVars, Environment, Secret, ToOptions};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Exception};
pub use crate::core::package::{InstallMethod, Package};
pub use crate::core::registry::StoredObject;
pub use crate::core::status::{NodeSummary, StatusSnapshot};
pub use crate::core::target::ExecutionTarget;
pub use callable::Function;
pub use functions::{CallContext, FunctionTable, Handler, builtins};
pub use node::{DEFAULT_ENV_KEY, LocalTarget, Node, NodeConfig};
pub use proxy::{ProxyClient, TOKEN_ENV};
pub use remote::HttpTarget;
