//! Bounded-concurrency execution of many resolver runs
//!
//! Each admitted execution gets its own [`Runner`]; only the sandbox factory,
//! the port allocator and the cancellation token are shared. Admission is
//! first-come first-served: tokio's semaphore queues waiters fairly.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecutionError;
use crate::ports::PortAllocator;
use crate::runner::Runner;
use crate::sandbox::SandboxFactory;
use crate::types::{ExecutionOutcome, RunnerPayload};

pub struct ExecutionPool {
    size: usize,
    factory: SandboxFactory,
    ports: PortAllocator,
    cancel: CancellationToken,
    slots: OnceLock<Arc<Semaphore>>,
}

impl ExecutionPool {
    pub fn new(size: usize, factory: SandboxFactory) -> Self {
        Self {
            size: size.max(1),
            factory,
            ports: PortAllocator::global().clone(),
            cancel: CancellationToken::new(),
            slots: OnceLock::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Prepares the slot budget. `run` initialises it on first use otherwise.
    pub fn init(&self) {
        self.slots();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Executions currently holding a slot.
    pub fn active(&self) -> usize {
        match self.slots.get() {
            Some(slots) => self.size - slots.available_permits(),
            None => 0,
        }
    }

    fn slots(&self) -> &Arc<Semaphore> {
        self.slots.get_or_init(|| {
            log::debug!("Execution pool initialised with {} slots", self.size);
            Arc::new(Semaphore::new(self.size))
        })
    }

    pub async fn run(&self, payload: RunnerPayload) -> ExecutionOutcome {
        let runner = Runner::new(self.factory.clone())
            .with_cancellation(self.cancel.child_token())
            .with_port_allocator(self.ports.clone());
        let _permit = match self.slots().clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionOutcome::failure(ExecutionError::Cancelled, Duration::ZERO, 0)
            }
        };
        runner.run(payload).await
    }

    /// Submits every payload in order and waits for all outcomes, returned in
    /// submission order.
    pub async fn run_all(&self, payloads: Vec<RunnerPayload>) -> Vec<ExecutionOutcome> {
        let runs = payloads.into_iter().map(|payload| self.run(payload));
        futures_util::future::join_all(runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::host::{resolver_fn, ResolverOutcome};
    use crate::test_utils;
    use crate::types::{ExecutionOptions, RuntimeKind, UserArgs};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks live and peak concurrent invocations.
    #[derive(Clone, Default)]
    struct Concurrency {
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    fn payload(script: &str) -> RunnerPayload {
        RunnerPayload::new(
            script,
            test_utils::context(),
            ExecutionOptions::new(RuntimeKind::Thread, 64 * 1024 * 1024, Duration::from_secs(10)),
        )
    }

    fn tracked_factory(concurrency: Concurrency) -> SandboxFactory {
        let factory = test_utils::factory();
        factory.scripts().register_resolver(
            "tracked",
            resolver_fn(move |_, _| {
                let concurrency = concurrency.clone();
                async move {
                    let live = concurrency.live.fetch_add(1, Ordering::SeqCst) + 1;
                    concurrency.peak.fetch_max(live, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    concurrency.live.fetch_sub(1, Ordering::SeqCst);
                    ResolverOutcome::value(json!({"canExec": true}))
                }
            }),
        );
        factory
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let concurrency = Concurrency::default();
        let pool = ExecutionPool::new(3, tracked_factory(concurrency.clone()));
        pool.init();

        let payloads = (0..10).map(|_| payload("tracked")).collect();
        let outcomes = pool.run_all(payloads).await;

        assert_eq!(outcomes.len(), 10);
        assert!(outcomes.iter().all(ExecutionOutcome::is_success));
        assert!(concurrency.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failures_do_not_affect_siblings() {
        let pool = ExecutionPool::new(2, test_utils::factory());
        pool.init();

        let scripts = [
            test_utils::RESULT,
            test_utils::ERROR,
            test_utils::EXIT_7,
            test_utils::RESULT,
            "not-registered",
        ];
        let outcomes = pool
            .run_all(scripts.iter().map(|script| payload(script)).collect())
            .await;

        let successes: Vec<bool> = outcomes.iter().map(ExecutionOutcome::is_success).collect();
        assert_eq!(successes, vec![true, false, false, true, false]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_follows_submission_order() {
        let admitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let factory = test_utils::factory();
        {
            let admitted = admitted.clone();
            factory.scripts().register_resolver(
                "ordered",
                resolver_fn(move |context, _| {
                    let admitted = admitted.clone();
                    async move {
                        let index = context.user_args["index"].as_u64();
                        admitted.lock().unwrap().extend(index);
                        ResolverOutcome::value(json!({"canExec": true}))
                    }
                }),
            );
        }
        let pool = ExecutionPool::new(1, factory);
        pool.init();

        let payloads = (0..6u64)
            .map(|index| {
                let mut payload = payload("ordered");
                payload.context = payload
                    .context
                    .with_user_args(UserArgs::from([("index".to_string(), json!(index))]));
                payload
            })
            .collect();
        let outcomes = pool.run_all(payloads).await;

        assert!(outcomes.iter().all(ExecutionOutcome::is_success));
        assert_eq!(*admitted.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_active_tracks_held_slots() {
        let pool = ExecutionPool::new(2, test_utils::factory());
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.active(), 0);
        pool.init();
        assert_eq!(pool.active(), 0);
        assert!(pool.run(payload(test_utils::RESULT)).await.is_success());
        assert_eq!(pool.active(), 0);
    }
}
