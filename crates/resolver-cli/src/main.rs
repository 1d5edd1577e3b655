use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::style::Stylize;
use log::LevelFilter;
use resolver_core::shutdown::interrupt_token;
use resolver_core::{
    parse_user_arg_pairs, ChainArgs, ConfigLoader, ExecutionContext, ExecutionOptions,
    ExecutionOutcome, ExecutionPool, ResolverSchema, Runner, RunnerPayload, RuntimeKind,
    SandboxFactory, StorageState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod demos;

const SECRETS_PREFIX: &str = "SECRETS_";

#[derive(Parser, Debug)]
#[clap(name = "resolver", author, version = "0.1.0", about = "Resolver sandbox runtime")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "Runtime configuration file (defaults to ~/.resolver/config.yaml)")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Enable debug logging")]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a resolver once and report its result and runtime stats
    Test {
        #[clap(flatten)]
        run: RunArgs,
    },
    /// Run a resolver repeatedly through a bounded execution pool
    Benchmark {
        #[clap(flatten)]
        run: RunArgs,

        #[clap(long, default_value_t = 10, help = "Number of executions to queue")]
        load: usize,

        #[clap(long, default_value_t = 10, help = "Maximum concurrent executions")]
        pool: usize,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Built script path (container runtime) or built-in script name (thread runtime)
    script: String,

    #[clap(long, help = "Resolver schema (defaults to schema.json next to the script)")]
    schema: Option<PathBuf>,

    #[clap(long, default_value = "thread", help = "Sandbox runtime: thread or container")]
    runtime: RuntimeKind,

    #[clap(long, help = "Print the resolver's output while it runs")]
    show_logs: bool,

    #[clap(long, default_value_t = 5)]
    chain_id: u64,

    #[clap(long = "user-args", help = "Resolver argument as key:value, repeatable")]
    user_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = if cli.debug {
        LevelFilter::Debug
    } else {
        cli.log_level.parse().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = ConfigLoader::load(cli.config.as_deref())
        .await
        .context("Failed to load runtime configuration")?;
    let factory = SandboxFactory::new(config).with_scripts(demos::registry());

    match cli.command {
        Commands::Test { run } => test(factory, run).await,
        Commands::Benchmark { run, load, pool } => benchmark(factory, run, load, pool).await,
    }
}

fn ok() -> String {
    "✓".green().to_string()
}

fn ko() -> String {
    "✗".red().to_string()
}

/// Schema file, else a `schema.json` next to the script, else defaults.
async fn load_schema(run: &RunArgs) -> Result<ResolverSchema> {
    let sibling = Path::new(&run.script)
        .parent()
        .map(|dir| dir.join("schema.json"))
        .filter(|path| path.exists());
    match run.schema.clone().or(sibling) {
        Some(path) => ResolverSchema::from_file(&path)
            .await
            .with_context(|| format!("Failed to read schema {}", path.display())),
        None => Ok(ResolverSchema {
            memory: 128,
            timeout: 30,
            user_args: Default::default(),
            rpc_limit: None,
        }),
    }
}

fn base_context(chain_id: u64) -> ExecutionContext {
    let block_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let mut context = ExecutionContext::new(ChainArgs {
        chain_id,
        block_time,
        gas_price: "10".to_string(),
        task_id: None,
    });

    // Test secrets come from `SECRETS_*` variables
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(SECRETS_PREFIX) {
            context = context.with_secret(name, Some(value));
        }
    }
    context
}

/// Builds the execution payload, printing the user argument validation report.
/// Returns `None` when validation failed.
async fn prepare(run: &RunArgs) -> Result<Option<(ResolverSchema, RunnerPayload)>> {
    let schema = load_schema(run).await?;
    let mut context = base_context(run.chain_id);

    if !run.user_args.is_empty() {
        println!("\nResolver user args validation:");
        let typed = parse_user_arg_pairs(&run.user_args)
            .and_then(|raw| Runner::validate_user_args(&schema.user_args, &raw));
        match typed {
            Ok(typed) => {
                for (key, value) in &typed {
                    println!(" {} {}: {}", ok(), key, value);
                }
                context = context.with_user_args(typed);
            }
            Err(e) => {
                println!(" {} {}", ko(), e);
                return Ok(None);
            }
        }
    }

    let options = ExecutionOptions::from_schema(&schema, run.runtime).with_show_logs(run.show_logs);
    let payload = RunnerPayload::new(run.script.clone(), context, options);
    Ok(Some((schema, payload)))
}

async fn test(factory: SandboxFactory, run: RunArgs) -> Result<()> {
    let Some((schema, payload)) = prepare(&run).await? else {
        return Ok(());
    };

    println!(
        "\nResolver running{}",
        if run.show_logs { " logs:" } else { "..." }
    );
    let runner = Runner::new(factory).with_cancellation(interrupt_token());
    let outcome = runner.run(payload).await;

    if outcome.storage.state == StorageState::Updated {
        println!("\nResolver Storage updated:");
        for (key, value) in &outcome.storage.storage {
            let value = value.as_deref().unwrap_or("undefined");
            println!(" {} {}: {}", ok(), key, format!("'{}'", value).green());
        }
    }

    println!("\nResolver Result:");
    match (outcome.result(), outcome.error()) {
        (Some(result), _) => println!(" {} Return value: {}", ok(), result),
        (_, Some(error)) => println!(" {} Error: {}", ko(), error),
        _ => {}
    }

    print_stats(&outcome, &schema);
    Ok(())
}

fn print_stats(outcome: &ExecutionOutcome, schema: &ResolverSchema) {
    println!("\nResolver Runtime stats:");
    let status = |within: bool| if within { ok() } else { ko() };

    let duration_ok = outcome.duration < 0.9 * schema.timeout as f64;
    println!(" {} Duration: {:.2}s", status(duration_ok), outcome.duration);

    let memory_ok = outcome.memory < 0.9 * schema.memory as f64;
    println!(" {} Memory: {:.2}mb", status(memory_ok), outcome.memory);

    let rpc_calls = &outcome.rpc_calls;
    let throttled_ok = rpc_calls.throttled as f64 <= 0.1 * rpc_calls.total as f64;
    let throttled = if rpc_calls.throttled > 0 {
        format!(" ({} throttled)", rpc_calls.throttled)
    } else {
        String::new()
    };
    println!(
        " {} Rpc calls: {}{}",
        status(throttled_ok),
        rpc_calls.total,
        throttled
    );
}

async fn benchmark(factory: SandboxFactory, run: RunArgs, load: usize, pool: usize) -> Result<()> {
    let Some((_, payload)) = prepare(&run).await? else {
        return Ok(());
    };

    let started = Instant::now();
    let pool = Arc::new(
        ExecutionPool::new(pool, factory).with_cancellation(interrupt_token()),
    );
    pool.init();

    let mut executions = Vec::with_capacity(load);
    for i in 0..load {
        println!("#{} Queuing Resolver", i);
        let pool = pool.clone();
        let payload = payload.clone();
        executions.push(tokio::spawn(async move { pool.run(payload).await }));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut successes = 0;
    println!("\nResolver results:");
    for (i, execution) in executions.into_iter().enumerate() {
        let outcome = execution.await.context("Execution task failed")?;
        match outcome.error() {
            None => {
                successes += 1;
                println!(" {} #{} Success", ok(), i);
            }
            Some(error) => println!(" {} #{} Error: {}", ko(), i, error),
        }
    }

    println!("\nBenchmark result:");
    println!("- nb success: {}/{}", successes, load);
    println!("- duration: {:.0}s", started.elapsed().as_secs_f64());
    Ok(())
}
