use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// The signal that ended a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Terminate => write!(f, "SIGTERM"),
            StopSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Cancel a fresh token on the first SIGTERM or SIGINT.
///
/// The controller loop, the agent loop and the API server all watch the
/// returned token; in-flight ticks finish before their loops exit.
pub fn install_shutdown_handler(role: &'static str) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => StopSignal::Terminate,
            _ = sigint.recv() => StopSignal::Interrupt,
            _ = trigger.cancelled() => return,
        };
        tracing::info!(role, signal = %received, "Stopping");
        trigger.cancel();
    });

    Ok(token)
}
