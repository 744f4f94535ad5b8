/// One run of the supervised command: spawn it in its own process group,
/// buffer its stdout, kill the whole group on request, and reap it.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long to keep draining stdout once the group is gone. A process that
/// left the group (e.g. via `setsid`) can hold the pipe open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Background reader filling a shared buffer from the child's stdout.
struct OutputReader {
    task: JoinHandle<()>,
    buf: Arc<Mutex<Vec<u8>>>,
}

/// How a reaped child came to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The supervisor's SIGKILL is what ended the child.
    KilledBySupervisor(ExitStatus),
    /// The child exited without the supervisor asking it to.
    Exited(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match self {
            Termination::KilledBySupervisor(status) | Termination::Exited(status) => *status,
        }
    }
}

/// Errors that can occur while running the supervised command.
#[derive(Debug)]
pub enum ChildError {
    /// No program was given to run.
    EmptyCommand,
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The subprocess was reaped before its pid could be read.
    MissingPid,
    /// Failed while waiting on the subprocess.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for ChildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildError::EmptyCommand => write!(f, "no command to run"),
            ChildError::Spawn { program, source } => {
                write!(f, "failed to start {}: {}", program, source)
            }
            ChildError::MissingPid => write!(f, "child exited before its pid was known"),
            ChildError::Wait { source } => write!(f, "failed to wait on child: {}", source),
        }
    }
}

impl std::error::Error for ChildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChildError::Spawn { source, .. } => Some(source),
            ChildError::Wait { source } => Some(source),
            ChildError::EmptyCommand | ChildError::MissingPid => None,
        }
    }
}

/// A running (or just reaped) instance of the supervised command.
///
/// The child leads its own process group, so `pid` doubles as the group id.
/// Dropping an unreaped `ChildProcess` kills the whole group.
pub struct ChildProcess {
    child: Child,
    pid: u32,
    killed: bool,
    reaped: bool,
    stdout: Option<OutputReader>,
}

impl ChildProcess {
    /// Spawn `argv[0]` with the remaining arguments in a new process group.
    ///
    /// With `capture_stdout` the child's stdout is buffered in the background
    /// and handed back by [`ChildProcess::captured_output`] after reaping;
    /// otherwise it is inherited. Stderr is always inherited.
    pub fn spawn(argv: &[String], capture_stdout: bool) -> Result<Self, ChildError> {
        let (program, args) = argv.split_first().ok_or(ChildError::EmptyCommand)?;

        let mut command = Command::new(program);
        command.args(args).process_group(0); // pgid == pid, descendants inherit it
        if capture_stdout {
            command.stdout(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| ChildError::Spawn {
            program: program.clone(),
            source: e,
        })?;
        let pid = child.id().ok_or(ChildError::MissingPid)?;

        let stdout = child.stdout.take().map(|mut out| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&buf);
            let task = tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match out.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Ok(mut sink) = sink.lock() {
                                sink.extend_from_slice(&chunk[..n]);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(pid, error = %e, "failed to read child stdout");
                            break;
                        }
                    }
                }
            });
            OutputReader { task, buf }
        });

        Ok(Self {
            child,
            pid,
            killed: false,
            reaped: false,
            stdout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send SIGKILL to the child's entire process group.
    ///
    /// The reap is attributed to the supervisor only if the child actually
    /// died of SIGKILL; a child that had already exited keeps its own status.
    pub fn kill_group(&mut self) -> Result<(), nix::Error> {
        self.killed = true;
        killpg(self.pgid(), Signal::SIGKILL)
    }

    /// Wait for the child to exit, then sweep any descendants left in its group.
    pub async fn wait(&mut self) -> Result<Termination, ChildError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ChildError::Wait { source: e })?;
        self.reaped = true;
        self.sweep_group();

        if self.killed && status.signal() == Some(Signal::SIGKILL as i32) {
            Ok(Termination::KilledBySupervisor(status))
        } else {
            Ok(Termination::Exited(status))
        }
    }

    /// Stdout collected during this run. `None` when stdout was not captured.
    ///
    /// Call it after [`ChildProcess::wait`]. If something outside the group
    /// still holds the pipe, the reader is abandoned after
    /// `OUTPUT_DRAIN_TIMEOUT` and whatever arrived so far is returned.
    pub async fn captured_output(&mut self) -> Option<Vec<u8>> {
        let OutputReader { mut task, buf } = self.stdout.take()?;
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "stdout reader task failed"),
            Err(_) => {
                task.abort();
                tracing::warn!(
                    pid = self.pid,
                    "stdout still held open outside the process group, dropping the rest"
                );
            }
        }
        let output = buf.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default();
        Some(output)
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    fn sweep_group(&self) {
        match killpg(self.pgid(), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid = self.pid, "killed leftover processes in group"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid = self.pid, error = %e, "group sweep failed"),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = killpg(self.pgid(), Signal::SIGKILL) {
            tracing::debug!(pgid = self.pid, error = %e, "kill on drop failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use nix::sys::signal::kill;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let err = ChildProcess::spawn(&[], true).err().unwrap();
        assert!(matches!(err, ChildError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = ChildProcess::spawn(&argv(&["nonexistent-binary-xyz"]), true)
            .err()
            .unwrap();
        assert!(matches!(err, ChildError::Spawn { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_attributed_to_supervisor() {
        let mut child = ChildProcess::spawn(&argv(&["true"]), true).unwrap();
        let termination = child.wait().await.unwrap();
        assert!(matches!(termination, Termination::Exited(_)));
        assert!(termination.status().success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_status() {
        let mut child = ChildProcess::spawn(&argv(&["sh", "-c", "exit 42"]), true).unwrap();
        let termination = child.wait().await.unwrap();
        assert_eq!(termination, Termination::Exited(termination.status()));
        assert_eq!(termination.status().code(), Some(42));
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut child = ChildProcess::spawn(&argv(&["echo", "hello"]), true).unwrap();
        child.wait().await.unwrap();
        let output = child.captured_output().await.unwrap();
        assert_eq!(output, b"hello\n");
    }

    #[tokio::test]
    async fn test_uncaptured_stdout_yields_none() {
        let mut child = ChildProcess::spawn(&argv(&["true"]), false).unwrap();
        child.wait().await.unwrap();
        assert!(child.captured_output().await.is_none());
    }

    #[tokio::test]
    async fn test_kill_group_reports_supervisor_kill() {
        let mut child = ChildProcess::spawn(&argv(&["sleep", "100"]), true).unwrap();
        assert!(child.pid() > 0);
        child.kill_group().unwrap();
        let termination = child.wait().await.unwrap();
        assert!(matches!(termination, Termination::KilledBySupervisor(_)));
        assert_eq!(termination.status().signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_kill_after_own_failure_keeps_exit_status() {
        let mut child = ChildProcess::spawn(&argv(&["sh", "-c", "exit 3"]), true).unwrap();
        // Let it exit before the kill lands; it stays a zombie until reaped.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = child.kill_group();

        let termination = child.wait().await.unwrap();
        assert!(matches!(termination, Termination::Exited(_)));
        assert_eq!(termination.status().code(), Some(3));
    }

    #[tokio::test]
    async fn test_output_held_open_outside_group_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("detached.pid");
        let script = format!(
            "echo started; setsid sh -c 'echo $$ > {}; exec sleep 30' & wait",
            pid_file.display()
        );

        let mut child = ChildProcess::spawn(&argv(&["sh", "-c", &script]), true).unwrap();
        let detached = read_pid_file(&pid_file).await;
        child.kill_group().unwrap();
        child.wait().await.unwrap();

        let output = tokio::time::timeout(Duration::from_secs(5), child.captured_output())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output, b"started\n");

        kill(Pid::from_raw(detached), Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn test_kill_group_takes_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");

        let mut child = ChildProcess::spawn(&grandchild_script(&pid_file), true).unwrap();
        let grandchild = read_pid_file(&pid_file).await;
        assert!(is_running(grandchild));

        child.kill_group().unwrap();
        child.wait().await.unwrap();
        assert!(wait_until_gone(grandchild).await);
    }

    #[tokio::test]
    async fn test_clean_exit_sweeps_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 100 & echo $! > {}", pid_file.display());

        let mut child = ChildProcess::spawn(&argv(&["sh", "-c", &script]), true).unwrap();
        let termination = child.wait().await.unwrap();
        assert!(termination.status().success());

        let background = read_pid_file(&pid_file).await;
        assert!(wait_until_gone(background).await);
        // Pipe writers are all gone, so the reader finishes.
        assert!(child.captured_output().await.is_some());
    }

    #[tokio::test]
    async fn test_drop_kills_running_group() {
        let child = ChildProcess::spawn(&argv(&["sleep", "100"]), true).unwrap();
        let pid = child.pid() as i32;
        drop(child);
        assert!(wait_until_gone(pid).await);
    }
}
