pub mod commands;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancels `stop` when the process receives SIGINT or SIGTERM.
pub fn cancel_on_signals(stop: CancellationToken) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => log::info!("Received SIGINT, stopping"),
            _ = terminate.recv() => log::info!("Received SIGTERM, stopping"),
        }
        stop.cancel();
    });
    Ok(())
}
