use tokio::sync::watch;
#[cfg(unix)]
use tracing::{error, info};

/// A request to reinstall expansions from disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal;

/// Watch for SIGUSR2 and publish a [`ReloadSignal`] for each one.
///
/// Must be called from inside a tokio runtime. The handler task exits once
/// every receiver is dropped.
#[cfg(unix)]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                error!(target: "expansions", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = reload_tx.closed() => break,
                received = sigusr2.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            info!(target: "expansions", "Received SIGUSR2, reloading expansions");
            if reload_tx.send(Some(ReloadSignal)).is_err() {
                break;
            }
        }
    });

    reload_rx
}

/// Non-unix platforms have no SIGUSR2; the receiver never fires
#[cfg(not(unix))]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    tracing::warn!(target: "expansions", "SIGUSR2 reload not supported on this platform");
    std::mem::forget(reload_tx);
    reload_rx
}
