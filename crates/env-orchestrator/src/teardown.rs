//! Best-effort destruction of everything a run created.
//!
//! [`TeardownCoordinator::teardown`] takes the provisioned targets by value,
//! so a set of targets can only be handed to teardown once. Every target
//! gets exactly one delete attempt; a failure is recorded and logged and
//! the remaining targets are still attempted.

use crate::process::{CommandRunner, ProcessError};
use crate::provisioner::ProvisionedTarget;
use crate::tools::Kind;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// One target whose delete command failed.
#[derive(Debug)]
pub struct TeardownFailure {
    pub target: String,
    pub cluster: String,
    pub error: ProcessError,
}

/// Outcome of a teardown pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Cluster names deleted, in attempt order.
    pub deleted: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of delete commands issued.
    pub fn attempted(&self) -> usize {
        self.deleted.len() + self.failures.len()
    }
}

pub struct TeardownCoordinator<'r, R: ?Sized> {
    runner: &'r R,
    timeout: Duration,
}

impl<'r, R: CommandRunner + ?Sized> TeardownCoordinator<'r, R> {
    /// `timeout` bounds each delete command.
    pub fn new(runner: &'r R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Delete every target's cluster. Never fails; see the report.
    #[instrument(skip_all, name = "orchestrator.teardown", fields(targets = targets.len()))]
    pub async fn teardown(&self, targets: Vec<ProvisionedTarget>) -> TeardownReport {
        let kind = Kind::new(self.runner);
        let mut report = TeardownReport::default();

        for target in targets {
            match kind.delete_cluster(&target.name, self.timeout).await {
                Ok(_) => {
                    info!(
                        target: "orchestrator.teardown",
                        target_key = %target.key,
                        cluster = %target.name,
                        "Cluster deleted"
                    );
                    report.deleted.push(target.name);
                }
                Err(error) => {
                    warn!(
                        target: "orchestrator.teardown",
                        target_key = %target.key,
                        cluster = %target.name,
                        error = %error,
                        "Failed to delete cluster, continuing"
                    );
                    report.failures.push(TeardownFailure {
                        target: target.key,
                        cluster: target.name,
                        error,
                    });
                }
            }
        }

        report
    }
}
