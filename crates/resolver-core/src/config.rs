//! Runtime configuration for YAML files and environment resolution
//!
//! All fields have defaults, so an absent file yields a working configuration.
//! Environment overrides are applied after the file is parsed and before
//! validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::errors::ConfigError;

pub const ENV_CONTAINER_IMAGE: &str = "RESOLVER_CONTAINER_IMAGE";
pub const ENV_START_TIMEOUT_MS: &str = "RESOLVER_START_TIMEOUT_MS";

/// Placeholder substituted with the in-container script path.
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound for a backend to come up, image pulls included.
    pub launch_timeout_ms: u64,
    /// Upper bound for the control channel handshake.
    pub start_timeout_ms: u64,
    pub connect_poll_interval_ms: u64,
    /// Per-attempt timeout of the liveness probe.
    pub connect_probe_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    /// How long `stop` waits for a backend to acknowledge termination.
    pub stop_timeout_ms: u64,
    /// How long a sandbox exit waits for a result that is still in flight.
    pub exit_grace_ms: u64,
    pub container: ContainerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 120_000,
            start_timeout_ms: 10_000,
            connect_poll_interval_ms: 50,
            connect_probe_timeout_ms: 100,
            monitor_interval_ms: 100,
            stop_timeout_ms: 5_000,
            exit_grace_ms: 250,
            container: ContainerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    /// Container command; `{script}` is replaced by the mounted script path.
    pub command: Vec<String>,
    /// Directory the script's host directory is mounted on, read-only.
    pub script_mount_dir: String,
    /// Environment variable carrying the control port into the container.
    pub port_env: String,
    pub cpus: f64,
    /// Host address the control port is published on.
    pub host: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "denoland/deno:alpine-1.46.3".to_string(),
            command: vec![
                "deno".to_string(),
                "run".to_string(),
                "--allow-net".to_string(),
                "--allow-env".to_string(),
                SCRIPT_PLACEHOLDER.to_string(),
            ],
            script_mount_dir: "/resolver".to_string(),
            port_env: "RESOLVER_SERVER_PORT".to_string(),
            cpus: 1.0,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    pub fn connect_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_probe_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("launch_timeout_ms", self.launch_timeout_ms),
            ("start_timeout_ms", self.start_timeout_ms),
            ("connect_poll_interval_ms", self.connect_poll_interval_ms),
            ("connect_probe_timeout_ms", self.connect_probe_timeout_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }
        if self.container.command.is_empty() {
            return Err(ConfigError::Invalid(
                "container.command must not be empty".to_string(),
            ));
        }
        if self.container.image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "container.image must not be empty".to_string(),
            ));
        }
        if self.container.cpus <= 0.0 {
            return Err(ConfigError::Invalid(
                "container.cpus must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from an explicit path, else the default location, else defaults.
    pub async fn load(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => match Self::default_path() {
                Some(default_path) if default_path.exists() => {
                    log::debug!("Loading runtime config from {}", default_path.display());
                    Self::from_file(&default_path).await
                }
                _ => Self::finalize(RuntimeConfig::default()),
            },
        }
    }

    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<RuntimeConfig, ConfigError> {
        let config: RuntimeConfig = if content.trim().is_empty() {
            RuntimeConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        Self::finalize(config)
    }

    /// `~/.resolver/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".resolver").join("config.yaml"))
    }

    fn finalize(mut config: RuntimeConfig) -> Result<RuntimeConfig, ConfigError> {
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
        if let Ok(image) = env::var(ENV_CONTAINER_IMAGE) {
            if !image.trim().is_empty() {
                config.container.image = image;
            }
        }
        if let Ok(timeout) = env::var(ENV_START_TIMEOUT_MS) {
            config.start_timeout_ms = timeout.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "{} must be a number of milliseconds, got '{}'",
                    ENV_START_TIMEOUT_MS, timeout
                ))
            })?;
        }
        Ok(())
    }
}
