//! Running the test suite against provisioned targets.
//!
//! The suite is an opaque command. It learns where to connect from
//! environment variables:
//!
//! - `ENV_ORCHESTRATOR_FLOW`: selected flow
//! - `ENV_ORCHESTRATOR_TARGETS`: comma-separated target keys
//! - `ENV_ORCHESTRATOR_<KEY>_CLUSTER` / `ENV_ORCHESTRATOR_<KEY>_CONTEXT`:
//!   cluster name and kube context per target (key upper-cased, `-` and `.`
//!   replaced by `_`)

use crate::process::{CommandRunner, CommandSpec, ProcessError};
use crate::provisioner::ProvisionedTarget;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const ENV_PREFIX: &str = "ENV_ORCHESTRATOR";

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("No test command: pass one after `--` or set suite.command in the descriptor")]
    NoCommand,

    #[error("Test suite could not be run: {0}")]
    Launch(#[source] ProcessError),

    #[error("Test suite did not finish: {0}")]
    TimedOut(#[source] ProcessError),
}

/// Result of a suite that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SuiteOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Environment overrides describing `targets` to the suite.
pub fn suite_env(flow: &str, targets: &[ProvisionedTarget]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(format!("{ENV_PREFIX}_FLOW"), flow.to_string());
    env.insert(
        format!("{ENV_PREFIX}_TARGETS"),
        targets
            .iter()
            .map(|t| t.key.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    for target in targets {
        let key = env_key(&target.key);
        env.insert(format!("{ENV_PREFIX}_{key}_CLUSTER"), target.name.clone());
        env.insert(
            format!("{ENV_PREFIX}_{key}_CONTEXT"),
            target.kube_context.clone(),
        );
    }
    env
}

/// Variable-name form of a target key.
pub fn env_key(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Run `command` in `workdir` with `env` overrides.
///
/// A non-zero exit is a completed run that failed, not an error.
///
/// # Errors
///
/// [`SuiteError`] when there is no command, it cannot start, or it
/// exceeds `timeout`.
pub async fn run_suite<R: CommandRunner + ?Sized>(
    runner: &R,
    command: &[String],
    workdir: &Path,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> Result<SuiteOutcome, SuiteError> {
    let (program, args) = command.split_first().ok_or(SuiteError::NoCommand)?;
    let mut spec = CommandSpec::new(program.as_str())
        .args(args.iter().map(String::as_str))
        .current_dir(workdir)
        .envs(env);
    if let Some(limit) = timeout {
        spec = spec.timeout(limit);
    }

    info!(target: "orchestrator.suite", command = %spec, "Running test suite");
    match runner.run(&spec).await {
        Ok(result) => Ok(SuiteOutcome {
            exit_code: result.exit_code(),
            stdout: result.stdout().to_string(),
            stderr: result.stderr().to_string(),
        }),
        Err(ProcessError::NonZeroExit {
            code,
            stdout,
            stderr,
            ..
        }) => Ok(SuiteOutcome {
            exit_code: code,
            stdout,
            stderr,
        }),
        Err(e @ ProcessError::Timeout { .. }) => Err(SuiteError::TimedOut(e)),
        Err(e) => Err(SuiteError::Launch(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_is_shell_safe() {
        assert_eq!(env_key("cluster-a"), "CLUSTER_A");
        assert_eq!(env_key("lab"), "LAB");
        assert_eq!(env_key("eu.west-1"), "EU_WEST_1");
    }
}
