//! Subprocess execution behind a trait seam.
//!
//! The executor only talks to [`CommandRunner`], so tests can swap in a
//! scripted runner and drive the lifecycle under paused time.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directories commonly missing from a service manager's minimal `PATH`.
const COMMON_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];

/// How long to keep draining pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Longest chunk forwarded for a single line; longer lines are split.
const MAX_CHUNK_BYTES: u64 = 64 * 1024;

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// A piece of live output, newline included.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub command: String,
    pub timeout: Duration,
    pub path_env: String,
    pub working_dir: Option<PathBuf>,
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// `None` when killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Spawn or wait failure.
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && self.error.is_none()
    }

    /// Human-readable failure reason, `None` on success.
    pub fn failure_message(&self, timeout: Duration) -> Option<String> {
        if self.success() {
            return None;
        }
        if self.timed_out {
            return Some(format!("Timed out after {}s", timeout.as_secs()));
        }
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        Some(match self.exit_code {
            Some(code) => format!("Exited with code {code}"),
            None => "Terminated by signal".to_string(),
        })
    }
}

/// Runs a shell command, streaming output through `output` as it arrives.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: CommandSpec,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> ProcessOutcome;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> ProcessOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .env("PATH", &spec.path_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ProcessOutcome::failed(format!("Failed to spawn command: {e}")),
        };
        debug!(pid = ?child.id(), command = %spec.command, "Spawned command");

        let mut stdout =
            tokio::spawn(pump(child.stdout.take(), OutputStream::Stdout, output.clone()));
        let mut stderr = tokio::spawn(pump(child.stderr.take(), OutputStream::Stderr, output));

        let outcome = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => ProcessOutcome {
                exit_code: status.code(),
                ..Default::default()
            },
            Ok(Err(e)) => ProcessOutcome::failed(format!("Failed to wait for command: {e}")),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %spec.command, "Failed to kill timed-out command: {e}");
                }
                ProcessOutcome::timed_out()
            }
        };

        // Grandchildren can keep the pipes open; don't wait on them forever.
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            let _ = (&mut stdout).await;
            let _ = (&mut stderr).await;
        })
        .await;
        if drained.is_err() {
            debug!(command = %spec.command, "Output pipes still open after exit");
            stdout.abort();
            stderr.abort();
        }

        outcome
    }
}

async fn pump<R>(reader: Option<R>, stream: OutputStream, tx: mpsc::UnboundedSender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(MAX_CHUNK_BYTES).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = OutputChunk {
                    stream,
                    text: String::from_utf8_lossy(&buf).into_owned(),
                };
                if tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(stream = stream.as_str(), "Output read failed: {e}");
                break;
            }
        }
    }
}

/// Build the `PATH` for child processes: configured extras, then the
/// inherited entries, then common binary directories. Duplicates are dropped.
pub fn augmented_path(current: Option<&str>, extra: &[String]) -> String {
    let mut entries: Vec<String> = Vec::new();
    let mut push = |entry: &str| {
        let entry = entry.trim();
        if !entry.is_empty() && !entries.iter().any(|e| e == entry) {
            entries.push(entry.to_string());
        }
    };

    for dir in extra {
        push(dir);
    }
    for dir in current.unwrap_or_default().split(':') {
        push(dir);
    }
    for dir in COMMON_BIN_DIRS {
        push(dir);
    }
    if let Some(home) = dirs::home_dir() {
        push(&home.join(".local/bin").to_string_lossy());
    }

    entries.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: command.into(),
            timeout,
            path_env: augmented_path(std::env::var("PATH").ok().as_deref(), &[]),
            working_dir: None,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<OutputChunk>) -> (String, String) {
        let (mut out, mut err) = (String::new(), String::new());
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => out.push_str(&chunk.text),
                OutputStream::Stderr => err.push_str(&chunk.text),
            }
        }
        (out, err)
    }

    #[test]
    fn test_augmented_path_order_and_dedupe() {
        let path = augmented_path(
            Some("/usr/bin:/custom/bin:/usr/bin"),
            &["/opt/tools".to_string(), "/custom/bin".to_string()],
        );
        let entries: Vec<&str> = path.split(':').collect();
        assert_eq!(&entries[..3], &["/opt/tools", "/custom/bin", "/usr/bin"]);
        assert!(entries.contains(&"/opt/homebrew/bin"));
        assert_eq!(entries.iter().filter(|e| **e == "/usr/bin").count(), 1);
    }

    #[test]
    fn test_augmented_path_without_inherited() {
        let path = augmented_path(None, &[]);
        assert!(path.starts_with("/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin"));
    }

    #[test]
    fn test_failure_message() {
        let timeout = Duration::from_secs(5);
        assert_eq!(ProcessOutcome::exited(0).failure_message(timeout), None);
        assert_eq!(
            ProcessOutcome::exited(2).failure_message(timeout).as_deref(),
            Some("Exited with code 2")
        );
        assert_eq!(
            ProcessOutcome::timed_out().failure_message(timeout).as_deref(),
            Some("Timed out after 5s")
        );
    }

    #[tokio::test]
    async fn test_shell_runner_streams_both_pipes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = ShellRunner
            .run(spec("echo hello; echo oops >&2; exit 3", Duration::from_secs(10)), tx)
            .await;
        let (out, err) = collect(rx).await;

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn test_shell_runner_timeout_kills() {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = ShellRunner
            .run(spec("echo start; exec sleep 30", Duration::from_millis(200)), tx)
            .await;
        let (out, _) = collect(rx).await;

        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert_eq!(out, "start\n");
    }

    #[tokio::test]
    async fn test_unterminated_output_is_split() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = ShellRunner
            .run(
                spec("head -c 200000 /dev/zero | tr '\\0' a", Duration::from_secs(10)),
                tx,
            )
            .await;
        assert!(outcome.success());

        let mut sizes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            sizes.push(chunk.text.len());
        }
        assert!(sizes.len() >= 4);
        assert!(sizes.iter().all(|&n| n as u64 <= MAX_CHUNK_BYTES));
        assert_eq!(sizes.iter().sum::<usize>(), 200_000);
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = ShellRunner.run(spec("true", Duration::from_secs(10)), tx).await;
        assert!(outcome.success());
    }
}
