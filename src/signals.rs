/// Signal handling for graceful shutdown.
///
/// SIGINT does not end the process directly. The relay hands it to the
/// supervisor as a `ShutdownRequested` message, waits until the supervisor
/// has killed and reaped the child's process group, and only then reports
/// the exit status. No child outlives the supervisor. A second SIGINT while
/// waiting gives up on the supervisor and exits anyway.
use crate::supervisor::ControlMessage;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};

/// Exit status once a forwarded shutdown has completed.
pub const SHUTDOWN_EXIT_CODE: u8 = 1;

/// Errors installing the signal handler.
#[derive(Debug)]
pub enum SignalError {
    Install { source: std::io::Error },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Install { source } => {
                write!(f, "failed to install SIGINT handler: {}", source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Install { source } => Some(source),
        }
    }
}

pub struct SignalRelay {
    interrupts: tokio::signal::unix::Signal,
    commands: mpsc::Sender<ControlMessage>,
}

impl SignalRelay {
    /// Register for SIGINT. From here on the default handler no longer
    /// terminates the process.
    pub fn install(commands: mpsc::Sender<ControlMessage>) -> Result<Self, SignalError> {
        let interrupts =
            signal(SignalKind::interrupt()).map_err(|e| SignalError::Install { source: e })?;
        Ok(Self {
            interrupts,
            commands,
        })
    }

    /// Wait for SIGINT, forward it, and return the exit status once the
    /// supervisor confirms the child is gone.
    pub async fn run(mut self) -> u8 {
        if self.interrupts.recv().await.is_none() {
            tracing::warn!("signal stream closed");
            return SHUTDOWN_EXIT_CODE;
        }
        let signal = Signal::SIGINT;
        tracing::info!(?signal, "got a signal to shut down");

        let (ack, acked) = oneshot::channel();
        if self
            .commands
            .send(ControlMessage::ShutdownRequested { signal, ack })
            .await
            .is_err()
        {
            tracing::warn!("supervisor is gone, exiting");
            return SHUTDOWN_EXIT_CODE;
        }
        tracing::debug!("redirected signal to supervisor");

        tokio::select! {
            result = acked => match result {
                Ok(()) => tracing::info!("child stopped, exiting"),
                Err(_) => tracing::warn!("supervisor dropped the shutdown request, exiting"),
            },
            _ = self.interrupts.recv() => {
                tracing::warn!("second interrupt while stopping the child, exiting now");
            }
        }
        SHUTDOWN_EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// SIGINT reaches every listener in the test binary, so tests that
    /// raise it take turns.
    static SIGINT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    #[tokio::test]
    async fn test_interrupt_round_trip() {
        let _serial = SIGINT_LOCK.lock().await;
        let (tx, mut rx) = mpsc::channel(1);
        let relay = SignalRelay::install(tx).unwrap();
        let task = tokio::spawn(relay.run());

        nix::sys::signal::raise(Signal::SIGINT).unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ControlMessage::ShutdownRequested { signal, ack } = message else {
            panic!("expected a shutdown request");
        };
        assert_eq!(signal, Signal::SIGINT);

        // The relay must not finish before the supervisor acknowledges.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        ack.send(()).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, SHUTDOWN_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_second_interrupt_skips_acknowledgement() {
        let _serial = SIGINT_LOCK.lock().await;
        let (tx, mut rx) = mpsc::channel(1);
        let relay = SignalRelay::install(tx).unwrap();
        let task = tokio::spawn(relay.run());

        nix::sys::signal::raise(Signal::SIGINT).unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Hold the ack as a supervisor stuck on the child would.
        let ControlMessage::ShutdownRequested { ack: _held, .. } = message else {
            panic!("expected a shutdown request");
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        nix::sys::signal::raise(Signal::SIGINT).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, SHUTDOWN_EXIT_CODE);
    }
}
