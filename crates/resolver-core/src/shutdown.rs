//! Process-level interrupt handling
//!
//! Signal handlers are installed once per process. Runners never register
//! their own; they hold child tokens of [`interrupt_token`], which is cancelled
//! when the process receives Ctrl+C or SIGTERM.

use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// Resolves when the process receives Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Token cancelled on the first process interrupt.
///
/// The forwarding task is spawned on first use, so this must be called from
/// within a tokio runtime that outlives the runners using the token.
pub fn interrupt_token() -> CancellationToken {
    static ROOT: OnceLock<CancellationToken> = OnceLock::new();
    ROOT.get_or_init(|| {
        let token = CancellationToken::new();
        let forward = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("Interrupt received, stopping active executions");
            forward.cancel();
        });
        token
    })
    .clone()
}

