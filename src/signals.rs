use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartSignal {
    /// SIGHUP
    Reload,
    /// SIGTERM
    Terminate,
}

/// Registers for SIGHUP and SIGTERM and forwards the first one to arrive.
///
/// Dropping the receiver deregisters: the forwarding task exits and later
/// signals go unobserved instead of queueing.
pub fn subscribe() -> io::Result<mpsc::Receiver<RestartSignal>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = tx.closed() => return,
            Some(()) = hangup.recv() => RestartSignal::Reload,
            Some(()) = terminate.recv() => RestartSignal::Terminate,
        };

        info!(signal = ?received, "Signal received");
        let _ = tx.send(received).await;
    });

    Ok(rx)
}
