// Core modules: environments, packages, the registry, and the wire envelopes.
pub mod callable;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod hex;
pub mod package;
pub mod paths;
pub mod registry;
pub mod shell;
pub mod status;
pub mod target;
