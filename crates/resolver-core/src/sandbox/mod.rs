//! Isolation backends for running untrusted resolver scripts.
//!
//! A [`Sandbox`] starts a script with the address of its control port, reports
//! when the script's process (or worker) ends, and exposes its memory usage.
//! Two backends share the contract: a Docker container with hard resource
//! limits, and a worker thread inside the host process that starts instantly
//! but offers no OS-level isolation. The Runner never knows which one it drives.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::errors::SandboxError;
use crate::types::{ExecutionOptions, RuntimeKind};

pub mod container;
pub mod host;
pub mod thread;

pub use container::ContainerSandbox;
pub use host::{Resolver, ResolverOutcome, ScriptConsole, ScriptHost, ScriptRegistry};
pub use thread::ThreadSandbox;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Launches `script`, which must serve the control protocol on `port`.
    async fn start(&self, script: &str, port: u16) -> Result<(), SandboxError>;

    /// Releases every backend resource. Safe to call repeatedly and before `start`.
    async fn stop(&self) -> Result<(), SandboxError>;

    /// Resolves with the exit code once the script has terminated.
    async fn wait_for_exit(&self) -> i64;

    /// Current resident memory in bytes.
    async fn memory_usage(&self) -> Result<u64, SandboxError>;

    /// Output lines captured from the script so far.
    fn logs(&self) -> Vec<String>;

    fn name(&self) -> &str;
}

/// Lifecycle of the sandbox driven by one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Starting,
    Connected,
    Running,
    Completed,
    Crashed,
    TimedOut,
    Stopped,
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxState::Completed
                | SandboxState::Crashed
                | SandboxState::TimedOut
                | SandboxState::Stopped
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Created => "created",
            SandboxState::Starting => "starting",
            SandboxState::Connected => "connected",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::Crashed => "crashed",
            SandboxState::TimedOut => "timed-out",
            SandboxState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Constructor for a backend other than the built-in ones.
pub type SandboxBuilder = Arc<dyn Fn(&ExecutionOptions) -> Arc<dyn Sandbox> + Send + Sync>;

/// Builds the backend selected by `ExecutionOptions::runtime`.
#[derive(Clone, Default)]
pub struct SandboxFactory {
    config: RuntimeConfig,
    scripts: ScriptRegistry,
    builder: Option<SandboxBuilder>,
}

impl SandboxFactory {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            scripts: ScriptRegistry::new(),
            builder: None,
        }
    }

    /// Replaces the built-in backends for every runtime kind.
    pub fn with_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&ExecutionOptions) -> Arc<dyn Sandbox> + Send + Sync + 'static,
    {
        self.builder = Some(Arc::new(builder));
        self
    }

    /// Scripts available to the thread backend.
    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    pub fn create(&self, options: &ExecutionOptions) -> Arc<dyn Sandbox> {
        if let Some(builder) = &self.builder {
            return builder(options);
        }
        match options.runtime {
            RuntimeKind::Container => Arc::new(ContainerSandbox::new(
                self.config.container.clone(),
                options.memory,
                options.show_logs,
                self.config.stop_timeout(),
            )),
            RuntimeKind::Thread => Arc::new(ThreadSandbox::new(
                self.scripts.clone(),
                options.memory,
                options.show_logs,
                self.config.stop_timeout(),
            )),
        }
    }

    /// Host the control channel must dial for sandboxes of this kind.
    pub fn control_host(&self, runtime: RuntimeKind) -> &str {
        match runtime {
            RuntimeKind::Container => &self.config.container.host,
            RuntimeKind::Thread => "127.0.0.1",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_factory_selects_backend_by_runtime() {
        let factory = SandboxFactory::new(RuntimeConfig::default());
        let thread = factory.create(&ExecutionOptions::new(
            RuntimeKind::Thread,
            0,
            Duration::from_secs(1),
        ));
        assert_eq!(thread.name(), "thread");

        let container = factory.create(&ExecutionOptions::new(
            RuntimeKind::Container,
            0,
            Duration::from_secs(1),
        ));
        assert_eq!(container.name(), "container");
    }

    #[test]
    fn test_terminal_states() {
        assert!(SandboxState::TimedOut.is_terminal());
        assert!(SandboxState::Stopped.is_terminal());
        assert!(!SandboxState::Connected.is_terminal());
        assert_eq!(SandboxState::TimedOut.to_string(), "timed-out");
    }
}
