//! Process spawning seam. The orchestrator owns each [`ProcessHandle`] until
//! the job's terminal transition.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const OUTPUT_BUFFER: usize = 256;

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when killed by a signal or never observed.
    pub code: Option<i32>,
    /// Diagnostic text for abnormal exits.
    pub detail: Option<String>,
}

impl ProcessExit {
    /// Normal exit with `code`.
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            detail: None,
        }
    }

    /// `true` only for exit code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable failure text.
    pub fn describe(&self) -> String {
        match (&self.detail, self.code) {
            (Some(detail), _) => detail.clone(),
            (None, Some(code)) => format!("process exited with code {code}"),
            (None, None) => "process terminated by signal".to_string(),
        }
    }
}

/// A running child process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Output lines (stdout and stderr, interleaved). Yields `Some` once.
    fn take_output(&mut self) -> Option<mpsc::Receiver<String>>;

    /// Wait for exit. Safe to call again after it returned.
    async fn wait(&mut self) -> ProcessExit;

    /// Ask the process to stop. Does not wait for exit.
    async fn kill(&mut self);
}

/// Starts job processes.
pub trait ProcessSpawner: Send + Sync {
    /// Start `command` with `args`.
    ///
    /// # Errors
    ///
    /// Any OS error from starting the process (missing executable, permissions).
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<Box<dyn ProcessHandle>>;
}

/// Spawner backed by `tokio::process`.
///
/// With a `program` the job runs as `program <command> <args..>` (the todo CLI
/// re-invoking itself); without one the command name is the executable.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessSpawner {
    program: Option<PathBuf>,
}

impl TokioProcessSpawner {
    /// Run every job through `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    /// Run the command name itself as the executable.
    pub fn direct() -> Self {
        Self { program: None }
    }
}

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<Box<dyn ProcessHandle>> {
        let mut cmd = match &self.program {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(command);
                cmd
            }
            None => Command::new(command),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        tracing::debug!(command, pid = ?child.id(), "spawned job process");
        Ok(Box::new(TokioProcessHandle {
            child,
            output: Some(rx),
        }))
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

struct TokioProcessHandle {
    child: Child,
    output: Option<mpsc::Receiver<String>>,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    async fn wait(&mut self) -> ProcessExit {
        match self.child.wait().await {
            Ok(status) => ProcessExit {
                code: status.code(),
                detail: (!status.success()).then(|| format!("process exited: {status}")),
            },
            Err(error) => ProcessExit {
                code: None,
                detail: Some(format!("failed to wait for process: {error}")),
            },
        }
    }

    async fn kill(&mut self) {
        if let Err(error) = self.child.start_kill() {
            tracing::debug!(%error, "kill on exited process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_description() {
        assert!(ProcessExit::with_code(0).success());
        assert!(!ProcessExit::with_code(3).success());
        assert_eq!(
            ProcessExit::with_code(3).describe(),
            "process exited with code 3"
        );
        let killed = ProcessExit {
            code: None,
            detail: None,
        };
        assert_eq!(killed.describe(), "process terminated by signal");
    }

    #[tokio::test]
    async fn missing_executable_fails_at_spawn() {
        let spawner = TokioProcessSpawner::direct();
        let result = spawner.spawn("definitely-not-a-real-binary-7c1e", &[]);
        assert!(result.is_err());
    }
}
