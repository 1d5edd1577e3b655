//! Sandbox side of the control protocol.
//!
//! A script registers its resolver with [`ScriptHost::serve`], which binds the
//! control port, answers the liveness probe and turns the `start` event into a
//! call to [`Resolver::run`]. The reply to the `start` request is the script's
//! `result` or `error` event, after which the host shuts down and the script
//! exits with code 0. Scripts for the thread backend are looked up by name in a
//! [`ScriptRegistry`].

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{body::Bytes, Json, Router};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipc::{decode_event, Decoded, IpcEvent};
use crate::types::{ExecutionContext, RpcCallStats, ScriptError, StorageUpdate};

/// What a resolver invocation ended with.
#[derive(Debug, Clone)]
pub enum ResolverOutcome {
    Return {
        result: serde_json::Value,
        storage: Option<StorageUpdate>,
    },
    Throw(ScriptError),
    /// The script terminated its process without replying.
    Exit(i32),
}

impl ResolverOutcome {
    pub fn value(result: serde_json::Value) -> Self {
        ResolverOutcome::Return {
            result,
            storage: None,
        }
    }

    pub fn with_storage(result: serde_json::Value, storage: StorageUpdate) -> Self {
        ResolverOutcome::Return {
            result,
            storage: Some(storage),
        }
    }

    pub fn throw(message: impl Into<String>) -> Self {
        ResolverOutcome::Throw(ScriptError::new(message))
    }
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn run(&self, context: ExecutionContext, console: ScriptConsole) -> ResolverOutcome;
}

/// Adapts an async closure into a [`Resolver`].
pub struct FnResolver<F>(F);

pub fn resolver_fn<F, Fut>(f: F) -> FnResolver<F>
where
    F: Fn(ExecutionContext, ScriptConsole) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResolverOutcome> + Send + 'static,
{
    FnResolver(f)
}

#[async_trait]
impl<F, Fut> Resolver for FnResolver<F>
where
    F: Fn(ExecutionContext, ScriptConsole) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResolverOutcome> + Send + 'static,
{
    async fn run(&self, context: ExecutionContext, console: ScriptConsole) -> ResolverOutcome {
        (self.0)(context, console).await
    }
}

/// Output and telemetry sink handed to a running script.
#[derive(Clone, Default)]
pub struct ScriptConsole {
    lines: Arc<Mutex<Vec<String>>>,
    echo: bool,
    rpc_total: Arc<AtomicU64>,
    rpc_throttled: Arc<AtomicU64>,
}

impl ScriptConsole {
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            ..Default::default()
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        if self.echo {
            println!("{}", line);
        }
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn record_rpc_call(&self, throttled: bool) {
        self.rpc_total.fetch_add(1, Ordering::SeqCst);
        if throttled {
            self.rpc_throttled.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn rpc_calls(&self) -> RpcCallStats {
        RpcCallStats {
            total: self.rpc_total.load(Ordering::SeqCst),
            throttled: self.rpc_throttled.load(Ordering::SeqCst),
        }
    }
}

/// Entry point of a script: receives its host, returns its exit code.
pub type ScriptMain = Arc<dyn Fn(ScriptHost) -> BoxFuture<'static, i32> + Send + Sync>;

/// Named scripts runnable by the thread backend.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: Arc<RwLock<HashMap<String, ScriptMain>>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, main: F)
    where
        F: Fn(ScriptHost) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        let main: ScriptMain = Arc::new(move |host| Box::pin(main(host)));
        self.scripts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), main);
    }

    /// Registers a script whose only job is to serve `resolver`.
    pub fn register_resolver<R: Resolver>(&self, name: impl Into<String>, resolver: R) {
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        self.register(name, move |host| {
            let resolver = resolver.clone();
            async move { host.serve(resolver).await }
        });
    }

    pub fn get(&self, name: &str) -> Option<ScriptMain> {
        self.scripts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scripts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Environment of one script run: its control port and console.
#[derive(Clone)]
pub struct ScriptHost {
    port: u16,
    console: ScriptConsole,
}

enum HostExit {
    /// A reply is being written; finish it, then exit with 0.
    AfterReply,
    /// Exit immediately, dropping any open exchange.
    Abort(i32),
}

struct HostState {
    resolver: Arc<dyn Resolver>,
    console: ScriptConsole,
    started: AtomicBool,
    exit_tx: mpsc::UnboundedSender<HostExit>,
}

impl ScriptHost {
    pub fn new(port: u16, console: ScriptConsole) -> Self {
        Self { port, console }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn console(&self) -> &ScriptConsole {
        &self.console
    }

    /// Serves the control protocol until the resolver has run once.
    pub async fn serve(self, resolver: Arc<dyn Resolver>) -> i32 {
        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.console
                    .log(format!("Failed to listen on port {}: {}", self.port, e));
                return 1;
            }
        };

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let state = Arc::new(HostState {
            resolver,
            console: self.console.clone(),
            started: AtomicBool::new(false),
            exit_tx,
        });
        let router = Router::new()
            .route("/", get(ready).post(handle_event))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let server = std::future::IntoFuture::into_future(server);
        tokio::pin!(server);

        tokio::select! {
            res = &mut server => {
                if let Err(e) = res {
                    self.console.log(format!("Control server error: {}", e));
                    return 1;
                }
                0
            }
            exit = exit_rx.recv() => match exit {
                Some(HostExit::AfterReply) | None => {
                    shutdown.cancel();
                    match server.await {
                        Ok(()) => 0,
                        Err(_) => 1,
                    }
                }
                Some(HostExit::Abort(code)) => code,
            }
        }
    }
}

async fn ready() -> StatusCode {
    StatusCode::OK
}

async fn handle_event(State(state): State<Arc<HostState>>, body: Bytes) -> Response {
    let context = match decode_event(&body) {
        Ok(Decoded::Event(IpcEvent::Start { context })) => context,
        Ok(Decoded::Event(other)) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Unexpected {} event", other.action()),
            )
                .into_response()
        }
        Ok(Decoded::Unknown(action)) => {
            return (StatusCode::BAD_REQUEST, format!("Unknown event: {}", action)).into_response()
        }
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    if state.started.swap(true, Ordering::SeqCst) {
        return (StatusCode::CONFLICT, "Resolver already started").into_response();
    }

    let event = match state.resolver.run(context, state.console.clone()).await {
        ResolverOutcome::Return { result, storage } => IpcEvent::Result {
            result,
            storage,
            rpc_calls: Some(state.console.rpc_calls()),
        },
        ResolverOutcome::Throw(error) => IpcEvent::Error { error },
        ResolverOutcome::Exit(code) => {
            let _ = state.exit_tx.send(HostExit::Abort(code));
            // The host is torn down before this exchange can complete.
            return std::future::pending::<Response>().await;
        }
    };
    let _ = state.exit_tx.send(HostExit::AfterReply);
    Json(event).into_response()
}
