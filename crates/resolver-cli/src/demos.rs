//! Built-in resolvers runnable with `--runtime thread`.

use resolver_core::sandbox::host::resolver_fn;
use resolver_core::{ExecutionContext, ResolverOutcome, ScriptConsole, ScriptRegistry};
use serde_json::json;
use std::time::Duration;

pub fn registry() -> ScriptRegistry {
    let scripts = ScriptRegistry::new();
    scripts.register_resolver(
        "wait",
        resolver_fn(|_: ExecutionContext, console: ScriptConsole| async move {
            console.log("Waiting 5s before answering");
            tokio::time::sleep(Duration::from_secs(5)).await;
            ResolverOutcome::value(json!({"canExec": false, "message": "Waiting..."}))
        }),
    );
    scripts.register_resolver(
        "escape-timeout",
        resolver_fn(|_: ExecutionContext, _: ScriptConsole| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ResolverOutcome::value(json!({"canExec": false, "message": "Sandbox escaped timeout"}))
        }),
    );
    scripts.register_resolver(
        "echo",
        resolver_fn(|context: ExecutionContext, console: ScriptConsole| async move {
            console.log(format!("Running on chain {}", context.chain_args.chain_id));
            ResolverOutcome::value(json!({
                "canExec": true,
                "userArgs": context.user_args,
            }))
        }),
    );
    scripts
}
