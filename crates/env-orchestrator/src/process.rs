//! External process execution.
//!
//! [`ProcessRunner`] runs one external command to completion and captures
//! its output. It never retries: retry policy belongs to callers (the
//! provisioner and the readiness poller). Every failure carries the full
//! captured stdout and stderr so it can be diagnosed without re-running.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long to keep draining output pipes after the process has exited or
/// been killed. Bounds the wait when a grandchild still holds a pipe open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Read buffer size for stdout/stderr capture.
const CAPTURE_CHUNK_SIZE: usize = 8192;

/// A fully described external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    /// Start describing an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the command in `dir` instead of the orchestrator's cwd.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override one environment variable. Overrides are merged over the
    /// ambient environment and win on key collision.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override several environment variables.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Feed `input` to the process on stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the process if it runs longer than `limit`.
    #[must_use]
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn stdin_payload(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }

    /// Shell-like rendering of the command line, for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Snapshot of a completed invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl ProcessResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process execution errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}{}", render_output(.stdout, .stderr))]
    Timeout {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` exited with code {code}{}", render_output(.stdout, .stderr))]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl ProcessError {
    /// Captured stdout, if the process got far enough to produce any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ProcessError::Timeout { stdout, .. } | ProcessError::NonZeroExit { stdout, .. } => {
                Some(stdout)
            }
            _ => None,
        }
    }

    /// Captured stderr, if the process got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::Timeout { stderr, .. } | ProcessError::NonZeroExit { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }

    /// Whether stdout or stderr mentions `needle` (case-insensitive).
    pub fn output_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [self.stdout(), self.stderr()]
            .into_iter()
            .flatten()
            .any(|s| s.to_lowercase().contains(&needle))
    }
}

fn render_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str("\n--- stdout ---\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        out.push_str("\n--- stderr ---\n");
        out.push_str(stderr.trim_end());
    }
    out
}

/// Executes commands (enables mocking of external tools).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion.
    ///
    /// Returns `Ok` only for a zero exit status.
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessResult, ProcessError>;
}

#[async_trait]
impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessResult, ProcessError> {
        (**self).run(spec).await
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessResult, ProcessError> {
        if spec.program.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let command = spec.command_line();
        debug!(target: "orchestrator.process", command = %command, "Running command");
        let started = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a timeout can kill the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (spec.stdin.clone(), child.stdin.take()) {
            let command = command.clone();
            tokio::spawn(async move {
                // Dropping the pipe afterwards closes the child's stdin.
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(target: "orchestrator.process", command = %command, error = %e, "stdin write ended early");
                }
            });
        }

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            capture(child.stdout.take(), Arc::clone(&stdout_buf)),
            capture(child.stderr.take(), Arc::clone(&stderr_buf)),
        ];

        let waited = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let Some(status) = waited else {
            terminate(&mut child).await;
            drain(readers).await;
            let limit = spec.timeout.unwrap_or_default();
            debug!(
                target: "orchestrator.process",
                command = %command,
                timeout_ms = limit.as_millis(),
                "Command timed out, process killed"
            );
            return Err(ProcessError::Timeout {
                command,
                timeout: limit,
                stdout: snapshot(&stdout_buf).await,
                stderr: snapshot(&stderr_buf).await,
            });
        };

        let status = status.map_err(|source| ProcessError::Io {
            command: command.clone(),
            source,
        })?;
        drain(readers).await;

        // Killed by a signal: no exit code.
        let code = status.code().unwrap_or(-1);
        let stdout = snapshot(&stdout_buf).await;
        let stderr = snapshot(&stderr_buf).await;

        debug!(
            target: "orchestrator.process",
            command = %command,
            exit_code = code,
            elapsed_ms = started.elapsed().as_millis(),
            "Command finished"
        );

        if status.success() {
            Ok(ProcessResult::new(code, stdout, stderr))
        } else {
            Err(ProcessError::NonZeroExit {
                command,
                code,
                stdout,
                stderr,
            })
        }
    }
}

/// Copy a pipe into a shared buffer chunk by chunk, so whatever arrived
/// before a kill is still available.
fn capture<R>(pipe: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = vec![0u8; CAPTURE_CHUNK_SIZE];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .await
                    .extend_from_slice(chunk.get(..n).unwrap_or_default()),
            }
        }
    })
}

async fn drain(readers: [JoinHandle<()>; 2]) {
    let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

async fn snapshot(buf: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&buf.lock().await).into_owned()
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) {
        // SAFETY: killpg only sends a signal; the group id is the child's
        // pid because the child was spawned with process_group(0).
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!(target: "orchestrator.process", error = %e, "kill after timeout failed (process already gone)");
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let result = ProcessRunner::new()
            .run(&sh("echo out; echo err >&2"))
            .await
            .expect("command should succeed");

        assert_eq!(result.stdout(), "out\n");
        assert_eq!(result.stderr(), "err\n");
        assert_eq!(result.exit_code(), 0);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_attaches_full_output() {
        let err = ProcessRunner::new()
            .run(&sh("echo progress; echo boom >&2; exit 3"))
            .await
            .unwrap_err();

        match &err {
            ProcessError::NonZeroExit {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(*code, 3);
                assert_eq!(stdout, "progress\n");
                assert_eq!(stderr, "boom\n");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }

        let rendered = err.to_string();
        assert!(rendered.contains("exited with code 3"));
        assert!(rendered.contains("--- stdout ---\nprogress"));
        assert!(rendered.contains("--- stderr ---\nboom"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(
                &sh("echo partial; echo half-done >&2; sleep 30")
                    .timeout(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();

        assert!(
            started.elapsed() < Duration::from_secs(10),
            "timed-out process must not be waited for"
        );
        match err {
            ProcessError::Timeout {
                timeout,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(timeout, Duration::from_millis(500));
                assert_eq!(stdout, "partial\n");
                assert_eq!(stderr, "half-done\n");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_env_overrides_win_over_ambient() {
        let result = ProcessRunner::new()
            .run(&sh("printf '%s|%s' \"$HOME\" \"$ORCH_TEST_VAR\"").envs([
                ("HOME", "/override-home"),
                ("ORCH_TEST_VAR", "set"),
            ]))
            .await
            .unwrap();

        // PATH is inherited (sh was found) while HOME is overridden.
        assert_eq!(result.stdout(), "/override-home|set");
    }

    #[tokio::test]
    async fn test_stdin_payload_is_fed() {
        let result = ProcessRunner::new()
            .run(&CommandSpec::new("cat").stdin("kind: Namespace\n"))
            .await
            .unwrap();

        assert_eq!(result.stdout(), "kind: Namespace\n");
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessRunner::new()
            .run(&CommandSpec::new("pwd").current_dir(dir.path()))
            .await
            .unwrap();

        let reported = PathBuf::from(result.stdout().trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ProcessRunner::new()
            .run(&CommandSpec::new("definitely-not-a-real-binary-4821"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_program_is_rejected() {
        let err = ProcessRunner::new()
            .run(&CommandSpec::new("  "))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::EmptyCommand));
    }

    #[test]
    fn test_command_line_quotes_whitespace() {
        let spec = CommandSpec::new("helm").args(["upgrade", "--set", "a=b c"]);
        assert_eq!(spec.command_line(), "helm upgrade --set 'a=b c'");
    }

    #[test]
    fn test_output_contains_is_case_insensitive() {
        let err = ProcessError::NonZeroExit {
            command: "kind create cluster".to_string(),
            code: 1,
            stdout: String::new(),
            stderr: "ERROR: node(s) Already Exist for a cluster".to_string(),
        };
        assert!(err.output_contains("already exist"));
        assert!(!err.output_contains("permission denied"));
    }
}
