//! Top-level orchestrator error and its process exit codes.

use crate::config::ConfigError;
use crate::plan::PlanError;
use crate::provisioner::ProvisionError;
use crate::suite::SuiteError;
use thiserror::Error;

/// Exit code when the suite ran and reported failures.
pub const EXIT_TESTS_FAILED: u8 = 1;

/// Orchestrator error type.
///
/// Maps to process exit codes:
/// - `Config`: 2
/// - `Plan`, `Render`: 3
/// - `Provision`: 4
/// - `Suite` (could not launch, or timed out): 5
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Failed to render plan: {0}")]
    Render(#[from] serde_json::Error),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Suite(#[from] SuiteError),
}

impl OrchestratorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            OrchestratorError::Config(_) => 2,
            OrchestratorError::Plan(_) | OrchestratorError::Render(_) => 3,
            OrchestratorError::Provision(_) => 4,
            OrchestratorError::Suite(_) => 5,
        }
    }
}

/// Render `error` and every source below it, one per line.
///
/// Sources whose message is already contained in the line above are
/// skipped.
pub fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut previous = out.clone();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !previous.contains(&text) {
            out.push_str("\n  caused by: ");
            out.push_str(&text);
        }
        previous = text;
        source = cause.source();
    }
    out
}
