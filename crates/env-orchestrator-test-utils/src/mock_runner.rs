//! Scripted command runner.
//!
//! Responses are chosen by substring match on the rendered command line
//! (`kind create cluster --name ...`). The most recently registered
//! matching rule wins, so tests can start from a preset and override single
//! commands. Unmatched commands succeed with empty output.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = MockRunner::healthy()
//!     .on("--name cluster-b", MockResponse::fail(1, "ERROR: failed to create cluster"));
//!
//! // ... provision ...
//!
//! assert_eq!(runner.count_matching("kind delete cluster"), 1);
//! ```

use async_trait::async_trait;
use env_orchestrator::process::{CommandRunner, CommandSpec, ProcessError, ProcessResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Success { stdout: String, stderr: String },
    Fail { code: i32, stdout: String, stderr: String },
    Timeout { stdout: String, stderr: String },
    SpawnError(String),
}

impl MockResponse {
    pub fn ok() -> Self {
        Self::stdout("")
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self::Success {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self::Fail {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn timeout(stdout: impl Into<String>) -> Self {
        Self::Timeout {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn into_result(self, spec: &CommandSpec) -> Result<ProcessResult, ProcessError> {
        let command = spec.command_line();
        match self {
            Self::Success { stdout, stderr } => Ok(ProcessResult::new(0, stdout, stderr)),
            Self::Fail {
                code,
                stdout,
                stderr,
            } => Err(ProcessError::NonZeroExit {
                command,
                code,
                stdout,
                stderr,
            }),
            Self::Timeout { stdout, stderr } => Err(ProcessError::Timeout {
                command,
                timeout: spec.timeout_limit().unwrap_or(Duration::ZERO),
                stdout,
                stderr,
            }),
            Self::SpawnError(message) => Err(ProcessError::Spawn {
                command,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message),
            }),
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    /// Played in order; the last one repeats.
    responses: VecDeque<MockResponse>,
}

impl Rule {
    fn next(&mut self) -> MockResponse {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap()
        } else {
            self.responses.front().cloned().unwrap_or_else(MockResponse::ok)
        }
    }
}

#[derive(Debug, Default)]
struct MockRunnerInner {
    rules: Vec<Rule>,
    calls: Vec<CommandSpec>,
}

/// Scripted [`CommandRunner`] that records every command it is given.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    inner: Arc<Mutex<MockRunnerInner>>,
}

impl MockRunner {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status queries report ready: rollouts are complete, jobs succeeded.
    pub fn healthy() -> Self {
        Self::new()
            .on(
                "rollout status",
                MockResponse::stdout("deployment successfully rolled out\n"),
            )
            .on("get job", MockResponse::stdout("1|"))
    }

    /// Respond to commands containing `pattern` with `response`.
    pub fn on(self, pattern: impl Into<String>, response: MockResponse) -> Self {
        self.on_sequence(pattern, vec![response])
    }

    /// Respond with `responses` in order; the last one repeats.
    pub fn on_sequence(self, pattern: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        self.inner.lock().unwrap().rules.push(Rule {
            pattern: pattern.into(),
            responses: responses.into(),
        });
        self
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Rendered command lines, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    /// Number of commands containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    /// Index of the first command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.contains(pattern))
    }

    /// Index of the first command containing `pattern`, panicking if none ran.
    pub fn expect_position(&self, pattern: &str) -> usize {
        self.position(pattern).unwrap_or_else(|| {
            panic!(
                "no command matching '{pattern}' ran; commands:\n{}",
                self.command_lines().join("\n")
            )
        })
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessResult, ProcessError> {
        let line = spec.command_line();
        let response = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(spec.clone());
            inner
                .rules
                .iter_mut()
                .rev()
                .find(|rule| line.contains(&rule.pattern))
                .map(Rule::next)
                .unwrap_or_else(MockResponse::ok)
        };
        response.into_result(spec)
    }
}
