//! Docker sandbox backend
//!
//! Each execution gets a throwaway container built from the configured image.
//! The script's directory is mounted read-only, the control port is published
//! on the loopback interface and the memory ceiling is enforced by the
//! container's cgroup, so an out-of-memory kill surfaces as exit code 137.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery, RemoveContainerOptionsBuilder,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StatsOptions as BollardStatsOptionsQuery, StopContainerOptionsBuilder,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::Sandbox;
use crate::config::{ContainerConfig, SCRIPT_PLACEHOLDER};
use crate::errors::SandboxError;

/// A container this sandbox may own. Docker accepts the name wherever it
/// accepts the id, so a claimed name is enough to tear it down.
struct Running {
    docker: Docker,
    container_id: String,
    log_task: Option<JoinHandle<()>>,
}

pub struct ContainerSandbox {
    config: ContainerConfig,
    name: String,
    memory_limit: u64,
    show_logs: bool,
    stop_timeout: Duration,
    running: tokio::sync::Mutex<Option<Running>>,
    stopped: std::sync::atomic::AtomicBool,
    exit: Arc<watch::Sender<Option<i64>>>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl ContainerSandbox {
    pub fn new(
        config: ContainerConfig,
        memory_limit: u64,
        show_logs: bool,
        stop_timeout: Duration,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            config,
            name: format!("resolver-sandbox-{}", Uuid::new_v4()),
            memory_limit,
            show_logs,
            stop_timeout,
            running: tokio::sync::Mutex::new(None),
            stopped: std::sync::atomic::AtomicBool::new(false),
            exit: Arc::new(exit),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.name
    }

    async fn ensure_image(&self, docker: &Docker) -> Result<(), SandboxError> {
        if docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling sandbox image {}", self.config.image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(self.config.image.clone()),
            ..Default::default()
        });
        let mut pull_stream = docker.create_image(pull_options, None, None);
        while let Some(result) = pull_stream.next().await {
            if let Err(e) = result {
                return Err(SandboxError::Startup(format!(
                    "Failed to pull image {}: {}",
                    self.config.image, e
                )));
            }
        }
        Ok(())
    }

    fn container_body(&self, script: &Path, port: u16) -> Result<ContainerCreateBody, SandboxError> {
        let script_dir = script
            .parent()
            .ok_or_else(|| SandboxError::Startup(format!("Invalid script path {}", script.display())))?;
        let file_name = script
            .file_name()
            .ok_or_else(|| SandboxError::Startup(format!("Invalid script path {}", script.display())))?
            .to_string_lossy();
        let mounted_script = format!("{}/{}", self.config.script_mount_dir, file_name);

        let cmd = self
            .config
            .command
            .iter()
            .map(|part| part.replace(SCRIPT_PLACEHOLDER, &mounted_script))
            .collect();
        let port_key = format!("{}/tcp", port);

        Ok(ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(cmd),
            env: Some(vec![format!("{}={}", self.config.port_env, port)]),
            exposed_ports: Some(HashMap::from([(port_key.clone(), HashMap::new())])),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    script_dir.display(),
                    self.config.script_mount_dir
                )]),
                port_bindings: Some(HashMap::from([(
                    port_key,
                    Some(vec![PortBinding {
                        host_ip: Some(self.config.host.clone()),
                        host_port: Some(port.to_string()),
                    }]),
                )])),
                memory: (self.memory_limit > 0).then_some(self.memory_limit as i64),
                nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        })
    }

    fn spawn_exit_watcher(&self, docker: Docker, container_id: String) {
        let exit = self.exit.clone();
        tokio::spawn(async move {
            let mut wait_stream =
                docker.wait_container(&container_id, None::<BollardWaitContainerOptionsQuery>);
            let code = match wait_stream.next().await {
                Some(Ok(response)) => response.status_code,
                // Non-zero exits are reported as errors by the wait endpoint
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    log::debug!("Waiting on container {} failed: {}", container_id, e);
                    1
                }
                None => 1,
            };
            log::debug!("Container {} exited with code {}", container_id, code);
            exit.send_replace(Some(code));
        });
    }

    fn spawn_log_follower(&self, docker: Docker, container_id: String) -> JoinHandle<()> {
        let logs = self.logs.clone();
        let show_logs = self.show_logs;
        tokio::spawn(async move {
            let mut output_stream = docker.logs(
                &container_id,
                Some(BollardLogsOptionsQuery {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(Ok(output)) = output_stream.next().await {
                let text = match output {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => String::from_utf8_lossy(&message).into_owned(),
                    LogOutput::StdIn { .. } => continue,
                };
                let mut logs = logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                for line in text.lines() {
                    if show_logs {
                        println!("{}", line);
                    }
                    logs.push(line.to_string());
                }
            }
        })
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn start(&self, script: &str, port: u16) -> Result<(), SandboxError> {
        let mut running = self.running.lock().await;
        if running.is_some() || self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SandboxError::Startup("Sandbox already used".to_string()));
        }

        let script_path = tokio::fs::canonicalize(script)
            .await
            .map_err(|e| SandboxError::Startup(format!("Script not found {}: {}", script, e)))?;
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Startup(format!("Failed to connect to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Startup(format!("Docker daemon unavailable: {}", e)))?;

        self.ensure_image(&docker).await?;

        let body = self.container_body(&script_path, port)?;
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(self.name.clone()),
            ..Default::default()
        });

        // Claimed before the create request: if this future is dropped while
        // the daemon is still creating, `stop` removes the container by name.
        *running = Some(Running {
            docker: docker.clone(),
            container_id: self.name.clone(),
            log_task: None,
        });

        let container = docker.create_container(options, body).await?;
        docker
            .start_container(&self.name, None::<BollardStartContainerOptionsQuery>)
            .await?;
        log::debug!("Started container {} ({}) on port {}", self.name, container.id, port);

        self.spawn_exit_watcher(docker.clone(), self.name.clone());
        if let Some(running) = running.as_mut() {
            running.log_task = Some(self.spawn_log_follower(docker, self.name.clone()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let grace = self.stop_timeout.as_secs().max(1) as i32;
        let _ = running
            .docker
            .stop_container(
                &running.container_id,
                Some(StopContainerOptionsBuilder::new().t(grace).build()),
            )
            .await;
        if let Some(log_task) = &running.log_task {
            log_task.abort();
        }

        match running
            .docker
            .remove_container(
                &running.container_id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(SandboxError::Teardown(format!(
                "Failed to remove container {}: {}",
                running.container_id, e
            ))),
        }
    }

    async fn wait_for_exit(&self) -> i64 {
        let mut rx = self.exit.subscribe();
        let code = rx.wait_for(Option::is_some).await.ok().and_then(|code| *code);
        match code {
            Some(code) => code,
            None => std::future::pending().await,
        }
    }

    async fn memory_usage(&self) -> Result<u64, SandboxError> {
        let (docker, container_id) = match self.running.lock().await.as_ref() {
            Some(running) => (running.docker.clone(), running.container_id.clone()),
            None => return Err(SandboxError::Monitor("sandbox is not running".to_string())),
        };

        let mut stats = docker.stats(
            &container_id,
            Some(BollardStatsOptionsQuery {
                stream: false,
                one_shot: true,
            }),
        );
        match stats.next().await {
            Some(Ok(stats)) => stats
                .memory_stats
                .and_then(|memory| memory.usage)
                .ok_or_else(|| SandboxError::Monitor("no memory statistics reported".to_string())),
            Some(Err(e)) => Err(SandboxError::Monitor(e.to_string())),
            None => Err(SandboxError::Monitor("stats stream ended".to_string())),
        }
    }

    fn logs(&self) -> Vec<String> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn name(&self) -> &str {
        "container"
    }
}
