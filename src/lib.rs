//! Callflow – invoke packaged workflows from a calling workflow, row by row
//!
//! This crate provides:
//! - Resolution of workflow references (absolute, workspace-relative,
//!   caller-relative, `file:` and `callflow://` URIs) to canonical locations
//! - A bounded, idle-expiring registry of loaded callees with exclusive,
//!   cancellable locking and deferred disposal of evicted handles
//! - A row invoker that binds static and per-row values to callee
//!   parameters, runs the callee once per row and isolates row failures
//! - Persistence of parameter bindings in a nested configuration tree
//! - A process-backed callee driven by a `workflow.json` manifest

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Handle registry, backends and the runtime service
pub mod runtime;

/// Per-row invocation, tables and parameter bindings
pub mod invoker;

// Re-export key types for convenience
pub use invoker::{BatchResult, CallSettings, DataTable, ParameterBinding, RowInvoker};
pub use runtime::error::{CallError, Result};
pub use runtime::{CallRuntime, RuntimeConfig};

/// Current version of the callflow runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
