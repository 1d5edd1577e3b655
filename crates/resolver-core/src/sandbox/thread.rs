//! In-process sandbox backend
//!
//! Runs a registered script on a dedicated OS thread with its own
//! current-thread runtime. Dropping that runtime on stop tears down every task
//! the script spawned. Memory is reported as the host process RSS, so the limit
//! is advisory for this backend.

use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::host::{ScriptConsole, ScriptHost, ScriptRegistry};
use super::Sandbox;
use crate::errors::SandboxError;

/// Exit code reported when a script is terminated by `stop`.
pub const STOPPED_EXIT_CODE: i64 = 143;
/// Exit code reported when a script panics.
pub const PANIC_EXIT_CODE: i64 = 101;

pub struct ThreadSandbox {
    scripts: ScriptRegistry,
    memory_limit: u64,
    stop_timeout: Duration,
    console: ScriptConsole,
    cancel: CancellationToken,
    exit: Arc<watch::Sender<Option<i64>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    system: Mutex<System>,
}

impl ThreadSandbox {
    pub fn new(
        scripts: ScriptRegistry,
        memory_limit: u64,
        show_logs: bool,
        stop_timeout: Duration,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            scripts,
            memory_limit,
            stop_timeout,
            console: ScriptConsole::new(show_logs),
            cancel: CancellationToken::new(),
            exit: Arc::new(exit),
            worker: Mutex::new(None),
            system: Mutex::new(System::new()),
        }
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_script(
    main: super::host::ScriptMain,
    host: ScriptHost,
    cancel: CancellationToken,
) -> i64 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build script runtime: {}", e);
            return 1;
        }
    };
    let code = runtime.block_on(async move {
        tokio::select! {
            code = main(host) => code as i64,
            _ = cancel.cancelled() => STOPPED_EXIT_CODE,
        }
    });
    // Tasks spawned by the script die with the runtime.
    drop(runtime);
    code
}

#[async_trait]
impl Sandbox for ThreadSandbox {
    async fn start(&self, script: &str, port: u16) -> Result<(), SandboxError> {
        let mut worker = self.worker();
        if worker.is_some() {
            return Err(SandboxError::Startup("Sandbox already started".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(SandboxError::Startup("Sandbox already stopped".to_string()));
        }

        let main = self.scripts.get(script).ok_or_else(|| {
            SandboxError::Startup(format!("Script '{}' is not registered", script))
        })?;
        let host = ScriptHost::new(port, self.console.clone());
        let cancel = self.cancel.clone();
        let exit = self.exit.clone();

        log::debug!("Starting script '{}' on worker thread (port {})", script, port);
        let handle = std::thread::Builder::new()
            .name(format!("resolver-{}", port))
            .spawn(move || {
                let code = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    run_script(main, host, cancel)
                }))
                .unwrap_or(PANIC_EXIT_CODE);
                exit.send_replace(Some(code));
            })?;
        *worker = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.cancel.cancel();
        let handle = self.worker().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        if tokio::time::timeout(self.stop_timeout, self.wait_for_exit())
            .await
            .is_err()
        {
            log::warn!(
                "Worker thread did not stop within {}ms",
                self.stop_timeout.as_millis()
            );
            return Err(SandboxError::Teardown(
                "worker thread did not acknowledge stop".to_string(),
            ));
        }
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        Ok(())
    }

    async fn wait_for_exit(&self) -> i64 {
        let mut rx = self.exit.subscribe();
        let code = rx.wait_for(Option::is_some).await.ok().and_then(|code| *code);
        match code {
            Some(code) => code,
            // The sender lives as long as `self`
            None => std::future::pending().await,
        }
    }

    async fn memory_usage(&self) -> Result<u64, SandboxError> {
        if self.worker().is_none() {
            return Err(SandboxError::Monitor("sandbox is not running".to_string()));
        }
        let pid: Pid = sysinfo::get_current_pid().map_err(|e| SandboxError::Monitor(e.to_string()))?;
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| SandboxError::Monitor("host process not found".to_string()))
    }

    fn logs(&self) -> Vec<String> {
        self.console.lines()
    }

    fn name(&self) -> &str {
        "thread"
    }
}
