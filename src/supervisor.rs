/// The watch-notify-restart control loop.
///
/// Each iteration starts the command, then races the next control message
/// against the child exiting on its own. A control message kills the child's
/// whole process group; the reaped `Termination` says whether that kill is
/// what ended it. Iteration *i + 1* never starts before iteration *i* is reaped.
use crate::child::{ChildError, ChildProcess, Termination};
use crate::config::{CleanExitPolicy, ProcessConfig};
use nix::sys::signal::Signal;
use std::process::ExitStatus;
use tokio::sync::{mpsc, oneshot};

/// Messages on the supervisor's command channel.
#[derive(Debug)]
pub enum ControlMessage {
    /// The watched path was modified.
    ChangeDetected,
    /// A shutdown signal arrived. `ack` fires once the child group is reaped.
    ShutdownRequested {
        signal: Signal,
        ack: oneshot::Sender<()>,
    },
}

/// How the supervisor stopped when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// A shutdown request was honoured.
    Shutdown { restarts: u64 },
    /// The child exited cleanly under `CleanExitPolicy::Exit`.
    ChildFinished { restarts: u64 },
}

/// Errors that end supervision.
#[derive(Debug)]
pub enum SupervisorError {
    /// Starting or reaping the child failed.
    Child(ChildError),
    /// The child exited with a failure the supervisor did not cause.
    ChildFailed { status: ExitStatus },
    /// Every sender of the command channel is gone.
    CommandChannelClosed,
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Child(e) => write!(f, "{}", e),
            SupervisorError::ChildFailed { status } => write!(f, "child failed: {}", status),
            SupervisorError::CommandChannelClosed => write!(f, "command channel closed"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Child(e) => Some(e),
            SupervisorError::ChildFailed { .. } | SupervisorError::CommandChannelClosed => None,
        }
    }
}

impl From<ChildError> for SupervisorError {
    fn from(e: ChildError) -> Self {
        SupervisorError::Child(e)
    }
}

/// First thing to happen while a child runs.
enum Race {
    Message(Option<ControlMessage>),
    Exited(Result<Termination, ChildError>),
}

pub struct Supervisor {
    process: ProcessConfig,
    commands: mpsc::Receiver<ControlMessage>,
    restarts: u64,
}

impl Supervisor {
    pub fn new(process: ProcessConfig, commands: mpsc::Receiver<ControlMessage>) -> Self {
        Self {
            process,
            commands,
            restarts: 0,
        }
    }

    /// Run the loop until shutdown, a clean exit under the `exit` policy, or
    /// a fatal error.
    pub async fn run(mut self) -> Result<SupervisorExit, SupervisorError> {
        loop {
            let mut child = ChildProcess::spawn(&self.process.command, self.process.capture_stdout)?;
            tracing::info!(
                iteration = self.restarts + 1,
                pid = child.pid(),
                command = ?self.process.command,
                "child started"
            );

            let race = tokio::select! {
                message = self.commands.recv() => Race::Message(message),
                termination = child.wait() => Race::Exited(termination),
            };

            let (termination, message) = match race {
                Race::Message(message) => {
                    if let Err(e) = child.kill_group() {
                        tracing::warn!(pgid = child.pid(), error = %e, "kill failed");
                    } else {
                        tracing::debug!(pgid = child.pid(), "process group killed");
                    }
                    (child.wait().await?, message)
                }
                Race::Exited(termination) => (termination?, None),
            };
            tracing::debug!(pid = child.pid(), status = %termination.status(), "child reaped");
            log_output(&mut child).await;

            // A shutdown request wins however the child ended.
            let message = match message {
                Some(ControlMessage::ShutdownRequested { signal, ack }) => {
                    return Ok(self.shutdown(signal, ack));
                }
                other => other,
            };

            match termination {
                Termination::KilledBySupervisor(status) => match message {
                    Some(_) => {
                        tracing::info!(%status, "child killed after change, restarting");
                        self.restarts += 1;
                    }
                    None => return Err(SupervisorError::CommandChannelClosed),
                },
                Termination::Exited(status) if status.success() => {
                    match self.process.on_clean_exit {
                        CleanExitPolicy::Exit => {
                            tracing::warn!(%status, "child exited on its own, nothing left to supervise");
                            return Ok(SupervisorExit::ChildFinished {
                                restarts: self.restarts,
                            });
                        }
                        CleanExitPolicy::Restart => {
                            tracing::info!(%status, "child exited on its own, restarting");
                            self.restarts += 1;
                        }
                        // The change that raced the exit already counts.
                        CleanExitPolicy::Wait if message.is_some() => {
                            tracing::info!(%status, "child exited as a change arrived, restarting");
                            self.restarts += 1;
                        }
                        CleanExitPolicy::Wait => {
                            tracing::info!(%status, "child exited on its own, waiting for a change");
                            match self.commands.recv().await {
                                Some(ControlMessage::ChangeDetected) => self.restarts += 1,
                                Some(ControlMessage::ShutdownRequested { signal, ack }) => {
                                    return Ok(self.shutdown(signal, ack));
                                }
                                None => return Err(SupervisorError::CommandChannelClosed),
                            }
                        }
                    }
                }
                Termination::Exited(status) => {
                    return Err(SupervisorError::ChildFailed { status });
                }
            }
        }
    }

    fn shutdown(&self, signal: Signal, ack: oneshot::Sender<()>) -> SupervisorExit {
        tracing::info!(?signal, restarts = self.restarts, "child stopped for shutdown");
        if ack.send(()).is_err() {
            tracing::debug!("signal relay no longer waiting for acknowledgement");
        }
        SupervisorExit::Shutdown {
            restarts: self.restarts,
        }
    }
}

async fn log_output(child: &mut ChildProcess) {
    if let Some(output) = child.captured_output().await {
        tracing::info!(
            pid = child.pid(),
            out = %String::from_utf8_lossy(&output),
            "child output"
        );
    }
}
