//! Process-boundary adapter turning termination signals into cancellation.

use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kimi_common::{now_utc, RecordStore};

/// Cancel `token` on the first SIGINT, SIGTERM or SIGHUP.
pub fn spawn_signal_handlers(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = tokio::select! {
            name = wait_for_signal() => name,
            _ = token.cancelled() => return,
        };
        info!(signal = name, "Received termination signal; cancelling task");
        token.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            None
        }
    };
    let mut sighup = match unix_signal(SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!("Failed to install SIGHUP handler: {}", err);
            None
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to listen for SIGINT: {}", err);
                std::future::pending::<()>().await;
            }
            "SIGINT"
        }
        Some(_) = recv_or_pending(&mut sigterm) => "SIGTERM",
        Some(_) = recv_or_pending(&mut sighup) => "SIGHUP",
    }
}

#[cfg(unix)]
async fn recv_or_pending(stream: &mut Option<signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
    "CTRL_C"
}

/// Writes the run's interrupt marker. Writing twice is harmless.
#[derive(Clone)]
pub struct InterruptMarker {
    store: Arc<dyn RecordStore>,
    key: String,
}

impl InterruptMarker {
    pub fn new(store: Arc<dyn RecordStore>, key: String) -> Self {
        Self { store, key }
    }

    pub fn is_set(&self) -> bool {
        self.store.exists(&self.key)
    }

    pub fn mark(&self) {
        if self.is_set() {
            return;
        }
        let content = format!("interrupted at {}\n", now_utc().to_rfc3339());
        match self.store.write_atomic(&self.key, content.as_bytes()) {
            Ok(()) => debug!(key = %self.key, "Interrupt marker written"),
            Err(err) => warn!(key = %self.key, error = %format!("{err:#}"), "Failed to write interrupt marker"),
        }
    }

    /// Mark as soon as `token` is cancelled.
    pub fn watch(&self, token: CancellationToken) -> JoinHandle<()> {
        let marker = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            marker.mark();
        })
    }
}
