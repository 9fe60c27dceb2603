//! Purpose: Shared library crate behind the `tether` CLI and node server.
//! Exports: `core` (environments, registry, envelopes, errors), `api` (targets and
//! function handles), `serve` (HTTP node server), `report` (status reporting).
//! Role: Library used by the binary and integration tests.
//! Invariants: Clients reach nodes only through `api::ExecutionTarget`.
pub mod api;
pub mod core;
pub mod report;
pub mod serve;
