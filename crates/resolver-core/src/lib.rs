//! Sandboxed execution runtime for untrusted resolver scripts.
//!
//! A resolver is a user-authored script that inspects chain state and decides
//! whether an automated task should run. This crate launches such scripts in an
//! isolation backend, hands them their execution context over a local control
//! channel, bounds their wall time and memory, and folds whatever happens into a
//! single structured outcome.
//!
//! # Architecture Overview
//!
//! - **Sandboxes**: a container backend with hard resource limits and an in-process worker thread backend, behind one trait
//! - **Control channel**: HTTP/JSON over loopback with a polled liveness probe and a one-shot start/result exchange
//! - **Runner**: the execution state machine racing result, exit, deadline and cancellation
//! - **Resource monitor**: periodic peak-memory sampling per execution
//! - **Execution pool**: bounded concurrent execution with first-come admission
//! - **User arguments**: typed coercion of raw arguments against the resolver schema
//! - **Configuration**: YAML runtime settings with environment overrides

pub mod channel;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod monitor;
pub mod pool;
pub mod ports;
pub mod runner;
pub mod sandbox;
pub mod schema;
pub mod shutdown;
pub mod types;
pub mod user_args;

pub use config::{ConfigLoader, ContainerConfig, RuntimeConfig};
pub use errors::{ChannelError, ConfigError, ExecutionError, SandboxError, SchemaError};
pub use ipc::IpcEvent;
pub use pool::ExecutionPool;
pub use runner::Runner;
pub use sandbox::{
    Resolver, ResolverOutcome, Sandbox, SandboxFactory, SandboxState, ScriptConsole, ScriptHost,
    ScriptRegistry,
};
pub use schema::ResolverSchema;
pub use types::*;
pub use user_args::{parse_user_arg_pairs, validate_user_args};

#[cfg(test)]
pub mod test_utils;
