// src/sys/shutdown.rs
//
// Termination-signal plumbing. One sender, any number of tokens.

use tokio::sync::watch;
use tracing::{info, warn};

/// Observes the termination signal.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the sender is
    /// gone without having signalled.
    pub async fn wait(&mut self) {
        let sender_gone = self.rx.wait_for(|requested| *requested).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }
}

pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}

/// Waits for SIGINT or SIGTERM (CI cancellation sends the latter), then signals shutdown.
pub async fn listen_for_signals(sender: ShutdownSender) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
    sender.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_resolves_after_shutdown() {
        let (tx, mut token) = shutdown_channel();
        assert!(!token.is_shutdown());
        tx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), token.wait())
            .await
            .expect("token should resolve");
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let (tx, token) = shutdown_channel();
        let mut a = token.clone();
        let mut b = token;
        tx.shutdown();
        a.wait().await;
        b.wait().await;
    }

    #[tokio::test]
    async fn dropped_sender_does_not_fake_a_shutdown() {
        let (tx, mut token) = shutdown_channel();
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(100), token.wait()).await;
        assert!(waited.is_err());
    }
}
