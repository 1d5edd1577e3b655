//! In-process scripts and fixtures shared by the crate's tests.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::sandbox::host::{resolver_fn, Resolver, ResolverOutcome, ScriptRegistry};
use crate::sandbox::SandboxFactory;
use crate::types::{ChainArgs, ExecutionContext, OptionalStringMap, StorageUpdate};

pub const RESULT: &str = "result";
pub const STORAGE: &str = "storage";
pub const ERROR: &str = "error";
pub const EXIT_0: &str = "exit-0";
pub const EXIT_7: &str = "exit-7";
pub const HANG: &str = "hang";
pub const NEVER_REGISTER: &str = "never-register";

pub fn context() -> ExecutionContext {
    ExecutionContext::new(ChainArgs {
        chain_id: 5,
        block_time: 1_700_000_000,
        gas_price: "10".to_string(),
        task_id: None,
    })
    .with_secret("API_KEY", Some("secret".to_string()))
}

pub fn scripts() -> ScriptRegistry {
    let scripts = ScriptRegistry::new();
    scripts.register_resolver(
        RESULT,
        resolver_fn(|ctx: ExecutionContext, console| async move {
            console.log("resolver invoked");
            ResolverOutcome::value(json!({
                "canExec": true,
                "chainId": ctx.chain_args.chain_id,
            }))
        }),
    );
    scripts.register_resolver(
        STORAGE,
        resolver_fn(|_, console| async move {
            console.record_rpc_call(false);
            console.record_rpc_call(false);
            console.record_rpc_call(true);
            let storage = OptionalStringMap::from([("lastRun".to_string(), Some("1".to_string()))]);
            ResolverOutcome::with_storage(json!({"canExec": false}), StorageUpdate::updated(storage))
        }),
    );
    scripts.register_resolver(
        ERROR,
        resolver_fn(|_, _| async { ResolverOutcome::throw("boom") }),
    );
    scripts.register_resolver(EXIT_0, resolver_fn(|_, _| async { ResolverOutcome::Exit(0) }));
    scripts.register_resolver(EXIT_7, resolver_fn(|_, _| async { ResolverOutcome::Exit(7) }));
    scripts.register_resolver(HANG, hang_resolver(DropFlag::new()));
    scripts.register(NEVER_REGISTER, |_host| std::future::pending::<i32>());
    scripts
}

pub fn factory() -> SandboxFactory {
    factory_with_config(RuntimeConfig::default())
}

pub fn factory_with_config(config: RuntimeConfig) -> SandboxFactory {
    SandboxFactory::new(config).with_scripts(scripts())
}

/// Set once the value holding it has been dropped.
#[derive(Clone, Default)]
pub struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dropped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn guard(&self) -> DropGuard {
        DropGuard(self.0.clone())
    }
}

pub struct DropGuard(Arc<AtomicBool>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Never replies; `flag` flips once the pending invocation is torn down.
pub fn hang_resolver(flag: DropFlag) -> impl Resolver {
    resolver_fn(move |_, _| {
        let guard = flag.guard();
        async move {
            let _guard = guard;
            std::future::pending::<ResolverOutcome>().await
        }
    })
}
