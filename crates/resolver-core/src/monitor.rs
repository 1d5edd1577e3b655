//! Peak-memory sampling for one execution

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::sandbox::Sandbox;

/// Samples `Sandbox::memory_usage` on a fixed interval and keeps the maximum.
pub struct ResourceMonitor {
    peak: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn start(sandbox: Arc<dyn Sandbox>, interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let task = {
            let peak = peak.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match sandbox.memory_usage().await {
                        Ok(bytes) => {
                            peak.fetch_max(bytes, Ordering::SeqCst);
                        }
                        Err(e) => log::trace!("Memory sample skipped: {}", e),
                    }
                }
            })
        };
        Self { peak, task }
    }

    /// Highest sample so far, in bytes.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Stops sampling and returns the final peak. A sample already past its
    /// last await point still lands before the peak is read.
    pub async fn stop(mut self) -> u64 {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.peak()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SandboxError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a fixed series of samples, failing on `None`.
    struct ScriptedSamples {
        samples: Mutex<Vec<Option<u64>>>,
    }

    #[async_trait]
    impl Sandbox for ScriptedSamples {
        async fn start(&self, _script: &str, _port: u16) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn wait_for_exit(&self) -> i64 {
            std::future::pending().await
        }

        async fn memory_usage(&self) -> Result<u64, SandboxError> {
            let mut samples = self.samples.lock().unwrap();
            if samples.is_empty() {
                return Ok(0);
            }
            samples
                .remove(0)
                .ok_or_else(|| SandboxError::Monitor("unavailable".to_string()))
        }

        fn logs(&self) -> Vec<String> {
            Vec::new()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_peak_survives_failed_samples() {
        let sandbox = Arc::new(ScriptedSamples {
            samples: Mutex::new(vec![None, Some(10), Some(40), None, Some(25)]),
        });
        let monitor = ResourceMonitor::start(sandbox, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.stop().await, 40);
    }

    #[tokio::test]
    async fn test_stop_freezes_peak() {
        let sandbox = Arc::new(ScriptedSamples {
            samples: Mutex::new(vec![Some(5)]),
        });
        let monitor = ResourceMonitor::start(sandbox, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let peak = monitor.peak();
        assert_eq!(monitor.stop().await, peak);
    }

    /// Sampler whose first reading blocks its worker until it completes.
    struct SlowSample {
        sampling: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Sandbox for SlowSample {
        async fn start(&self, _script: &str, _port: u16) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn wait_for_exit(&self) -> i64 {
            std::future::pending().await
        }

        async fn memory_usage(&self) -> Result<u64, SandboxError> {
            if self.sampling.swap(true, Ordering::SeqCst) {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(100));
            Ok(77)
        }

        fn logs(&self) -> Vec<String> {
            Vec::new()
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_sample_in_progress() {
        let sampling = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let monitor = ResourceMonitor::start(
            Arc::new(SlowSample {
                sampling: sampling.clone(),
            }),
            Duration::from_millis(5),
        );
        while !sampling.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(monitor.stop().await, 77);
    }
}
