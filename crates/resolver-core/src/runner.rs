//! Execution state machine
//!
//! A [`Runner`] drives one execution at a time: it starts a sandbox, performs
//! the control channel handshake, sends the `start` event and then races the
//! script's reply against the sandbox exiting, the execution deadline and
//! cancellation. Whatever settles first decides the outcome; teardown runs
//! exactly once afterwards. `run` never fails: every error is folded into the
//! returned [`ExecutionOutcome`].

use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, ControlChannel, EventStream};
use crate::errors::{ExecutionError, SchemaError};
use crate::ipc::IpcEvent;
use crate::monitor::ResourceMonitor;
use crate::ports::{PortAllocator, PortLease};
use crate::sandbox::{Sandbox, SandboxFactory, SandboxState};
use crate::schema::UserArgsSchema;
use crate::types::{
    ExecutionContext, ExecutionOptions, ExecutionOutcome, RpcCallStats, RunnerPayload,
    StorageUpdate, UserArgs,
};
use crate::user_args;

/// Resources acquired by the current execution, released by `stop`.
#[derive(Default)]
struct Resources {
    cancel: Option<CancellationToken>,
    sandbox: Option<Arc<dyn Sandbox>>,
    channel: Option<Arc<ControlChannel>>,
    monitor: Option<ResourceMonitor>,
    lease: Option<PortLease>,
}

/// Successful settlement of the race.
struct Settled {
    result: serde_json::Value,
    storage: Option<StorageUpdate>,
    rpc_calls: Option<RpcCallStats>,
}

pub struct Runner {
    factory: SandboxFactory,
    ports: PortAllocator,
    cancel: CancellationToken,
    resources: tokio::sync::Mutex<Resources>,
    state: Mutex<SandboxState>,
    peak_memory: AtomicU64,
    logs: Mutex<Vec<String>>,
}

impl Runner {
    pub fn new(factory: SandboxFactory) -> Self {
        Self {
            factory,
            ports: PortAllocator::global().clone(),
            cancel: CancellationToken::new(),
            resources: tokio::sync::Mutex::new(Resources::default()),
            state: Mutex::new(SandboxState::Created),
            peak_memory: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Executions started by this runner are cancelled together with `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SandboxState) {
        log::debug!("Sandbox state: {}", state);
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Coerces raw user arguments against a resolver's declared types.
    pub fn validate_user_args(
        schema: &UserArgsSchema,
        raw_args: &HashMap<String, String>,
    ) -> Result<UserArgs, SchemaError> {
        user_args::validate_user_args(schema, raw_args)
    }

    pub async fn run(&self, payload: RunnerPayload) -> ExecutionOutcome {
        let started = Instant::now();
        let RunnerPayload {
            script,
            context,
            options,
        } = payload;
        let initial_storage = context.storage.clone();

        let token = self.cancel.child_token();
        self.resources.lock().await.cancel = Some(token.clone());
        self.peak_memory.store(0, Ordering::SeqCst);
        self.set_state(SandboxState::Created);

        let settled = self.execute(&script, context, &options, &token).await;
        self.set_state(match &settled {
            Ok(_) | Err(ExecutionError::Script { .. }) => SandboxState::Completed,
            Err(ExecutionError::ExecutionTimeout { .. }) => SandboxState::TimedOut,
            Err(ExecutionError::Cancelled) => SandboxState::Stopped,
            Err(_) => SandboxState::Crashed,
        });

        self.stop().await;

        let duration = started.elapsed();
        let peak = self.peak_memory.load(Ordering::SeqCst);
        let logs = std::mem::take(&mut *self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        let outcome = match settled {
            Ok(settled) => ExecutionOutcome::success(settled.result, duration, peak)
                .with_storage(
                    settled
                        .storage
                        .unwrap_or_else(|| StorageUpdate::unchanged(initial_storage)),
                )
                .with_rpc_calls(settled.rpc_calls.unwrap_or_default()),
            Err(e) => {
                log::debug!("Execution failed: {}", e);
                ExecutionOutcome::failure(e, duration, peak)
                    .with_storage(StorageUpdate::unchanged(initial_storage))
            }
        }
        .with_logs(logs);

        log::info!("Duration: {:.2}s", outcome.duration);
        log::info!("Memory: {:.2}mb", outcome.memory);
        outcome
    }

    async fn execute(
        &self,
        script: &str,
        context: ExecutionContext,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Result<Settled, ExecutionError> {
        let config = self.factory.config();

        self.set_state(SandboxState::Starting);
        let sandbox = self.factory.create(options);
        let lease = match options.server_port {
            Some(port) => PortAllocator::fixed(port),
            None => self.ports.allocate().map_err(|e| ExecutionError::Startup {
                message: format!("Failed to allocate control port: {}", e),
            })?,
        };
        let port = lease.port();
        {
            let mut resources = self.resources.lock().await;
            resources.sandbox = Some(sandbox.clone());
            resources.lease = Some(lease);
        }

        log::debug!("Starting {} sandbox for {} on port {}", sandbox.name(), script, port);
        let launch_timeout = config.launch_timeout();
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExecutionError::Cancelled),
            started = tokio::time::timeout(launch_timeout, sandbox.start(script, port)) => match started {
                Ok(started) => started.map_err(|e| ExecutionError::Startup {
                    message: e.to_string(),
                })?,
                Err(_) => {
                    return Err(ExecutionError::Startup {
                        message: format!(
                            "{} sandbox did not start within {}ms",
                            sandbox.name(),
                            launch_timeout.as_millis()
                        ),
                    })
                }
            },
        }

        let monitor = ResourceMonitor::start(sandbox.clone(), config.monitor_interval());
        let channel = Arc::new(ControlChannel::new(
            self.factory.control_host(options.runtime),
            port,
            config.connect_poll_interval(),
            config.connect_probe_timeout(),
        ));
        let mut events = channel.events();
        {
            let mut resources = self.resources.lock().await;
            resources.monitor = Some(monitor);
            resources.channel = Some(channel.clone());
        }

        let start_timeout = config.start_timeout();
        let connect_error = |reason: String| ExecutionError::Connect {
            timeout_ms: start_timeout.as_millis() as u64,
            reason,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExecutionError::Cancelled),
            code = sandbox.wait_for_exit() => {
                return Err(connect_error(format!(
                    "sandbox exited with code {} before accepting connections",
                    code
                )));
            }
            connected = channel.connect(start_timeout) => {
                connected.map_err(|e| connect_error(e.to_string()))?;
            }
        }
        self.set_state(SandboxState::Connected);

        channel.send(IpcEvent::start(context));
        self.set_state(SandboxState::Running);

        let deadline = tokio::time::sleep(options.timeout_duration());
        let exit = sandbox.wait_for_exit();
        tokio::pin!(deadline);
        tokio::pin!(exit);
        let mut stream_open = true;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ExecutionError::Cancelled),
                item = events.next(), if stream_open => match item {
                    Some(item) => {
                        if let Some(settled) = settle(item) {
                            return settled;
                        }
                    }
                    None => stream_open = false,
                },
                code = &mut exit => {
                    return self.settle_exit(code, &channel, &mut events).await;
                }
                _ = &mut deadline => {
                    log::warn!("Resolver exceeded execution timeout ({}ms)", options.timeout);
                    return Err(ExecutionError::ExecutionTimeout {
                        timeout_ms: options.timeout,
                    });
                }
            }
        }
    }

    /// The sandbox exited first. A reply still in flight may carry the real
    /// result, so wait up to the exit grace period for it.
    async fn settle_exit(
        &self,
        code: i64,
        channel: &ControlChannel,
        events: &mut EventStream,
    ) -> Result<Settled, ExecutionError> {
        log::debug!("Sandbox exited with code {}", code);
        let grace_deadline = Instant::now() + self.factory.config().exit_grace();
        loop {
            while let Some(item) = events.try_next() {
                if let Some(settled) = settle(item) {
                    return settled;
                }
            }
            if channel.in_flight() == 0 {
                break;
            }
            match tokio::time::timeout_at(grace_deadline, events.next()).await {
                Ok(Some(item)) => {
                    if let Some(settled) = settle(item) {
                        return settled;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if code == 0 {
            Err(ExecutionError::ExitedWithoutResult)
        } else {
            Err(ExecutionError::AbnormalExit { code })
        }
    }

    /// Releases everything the current execution acquired. Safe to call at
    /// any point and any number of times.
    pub async fn stop(&self) {
        let mut resources = self.resources.lock().await;
        if let Some(token) = resources.cancel.take() {
            token.cancel();
        }
        if let Some(channel) = resources.channel.take() {
            channel.close();
        }
        if let Some(monitor) = resources.monitor.take() {
            self.peak_memory.fetch_max(monitor.stop().await, Ordering::SeqCst);
        }
        if let Some(sandbox) = resources.sandbox.take() {
            if let Err(e) = sandbox.stop().await {
                log::warn!("Failed to stop {} sandbox: {}", sandbox.name(), e);
            }
            *self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = sandbox.logs();
            if !self.state().is_terminal() {
                self.set_state(SandboxState::Stopped);
            }
        }
        resources.lease.take();
    }
}

/// Maps one inbound item to a race settlement, if it is terminal.
fn settle(item: ChannelEvent) -> Option<Result<Settled, ExecutionError>> {
    match item {
        ChannelEvent::Event(IpcEvent::Result {
            result,
            storage,
            rpc_calls,
        }) => Some(Ok(Settled {
            result,
            storage,
            rpc_calls,
        })),
        ChannelEvent::Event(IpcEvent::Error { error }) => {
            Some(Err(ExecutionError::Script { error }))
        }
        ChannelEvent::Event(IpcEvent::Start { .. }) => {
            log::warn!("Ignoring start event sent by sandbox");
            None
        }
        ChannelEvent::Unknown(action) => {
            log::warn!("Unknown action: {}", action);
            None
        }
        // The exit or deadline that follows carries the precise cause
        ChannelEvent::Error(e) => {
            log::debug!("Control channel error: {}", e);
            None
        }
    }
}
