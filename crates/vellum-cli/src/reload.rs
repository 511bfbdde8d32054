use tokio::sync::watch;
use tracing::info;

/// A full reload was requested
#[derive(Debug, Clone)]
pub struct ReloadSignal;

/// Listen for SIGUSR2 and report each one through the returned channel
#[cfg(unix)]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "reload", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        while sigusr2.recv().await.is_some() {
            info!(target: "reload", "Received SIGUSR2 - reloading every script");
            if reload_tx.send(Some(ReloadSignal)).is_err() {
                info!(target: "reload", "Reload receiver dropped, stopping SIGUSR2 handler");
                break;
            }
        }
    });

    reload_rx
}

/// SIGUSR2 does not exist here; the channel never fires
#[cfg(not(unix))]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    tracing::warn!(target: "reload", "SIGUSR2 reload not supported on this platform");
    std::mem::forget(reload_tx);
    reload_rx
}
