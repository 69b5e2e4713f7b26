//! Graceful shutdown utilities
//!
//! Services hand a [`CancellationToken`] to every long-running task; the
//! token is cancelled once a termination signal arrives.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (Ctrl+C, or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Spawn a signal listener and return the token it cancels.
///
/// Must be called from within a tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                trigger.cancel();
            },
            _ = trigger.cancelled() => {},
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_cancelled_externally_stops_listener() {
        let token = shutdown_token();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
