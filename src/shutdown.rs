//! Signals that stop the chat binary.

use std::fmt;
use std::io;

use tokio::signal;

/// Which signal asked us to go offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("couldn't listen for {signal}")]
pub struct SignalError {
    pub signal: StopSignal,
    #[source]
    pub source: io::Error,
}

/// Waits for Ctrl+C, or SIGTERM on unix, and reports which one arrived.
pub async fn stop_signal() -> Result<StopSignal, SignalError> {
    let interrupt = async {
        signal::ctrl_c().await.map_err(|source| SignalError {
            signal: StopSignal::Interrupt,
            source,
        })?;
        Ok(StopSignal::Interrupt)
    };

    #[cfg(unix)]
    let terminate = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(
            |source| SignalError {
                signal: StopSignal::Terminate,
                source,
            },
        )?;
        term.recv().await;
        Ok(StopSignal::Terminate)
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<StopSignal, SignalError>>();

    tokio::select! {
        stopped = interrupt => stopped,
        stopped = terminate => stopped,
    }
}
