//! One orchestrator run: provision, run the suite, tear down.

use crate::config::EnvironmentDescriptor;
use crate::errors::OrchestratorError;
use crate::plan::{Plan, PlanError, PlanResolver};
use crate::process::CommandRunner;
use crate::provisioner::{ProvisionedTarget, Provisioner};
use crate::suite::{run_suite, suite_env, SuiteError, SuiteOutcome};
use crate::teardown::{TeardownCoordinator, TeardownReport};
use std::path::Path;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a completed run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub targets: Vec<ProvisionedTarget>,
    pub suite: SuiteOutcome,
    pub teardown: TeardownReport,
}

pub struct Orchestrator<'r, R: ?Sized> {
    runner: &'r R,
    descriptor: EnvironmentDescriptor,
}

impl<'r, R: CommandRunner + ?Sized> Orchestrator<'r, R> {
    pub fn new(runner: &'r R, descriptor: EnvironmentDescriptor) -> Self {
        Self { runner, descriptor }
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    /// Select and resolve a flow. See [`PlanResolver::select`].
    ///
    /// # Errors
    ///
    /// Any [`PlanError`].
    pub fn plan(&self, flow: Option<&str>, cwd: Option<&Path>) -> Result<Plan, PlanError> {
        PlanResolver::new(&self.descriptor).resolve_selected(flow, cwd)
    }

    /// Provision `plan`, run the suite, then tear down.
    ///
    /// `command` overrides `suite.command` when non-empty. Teardown runs
    /// exactly once whenever provisioning succeeded, whatever the suite did.
    /// A failing suite is reported through [`RunReport::suite`], not as an
    /// error.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Provision`] (already torn down) or
    /// [`OrchestratorError::Suite`] when the suite could not run to
    /// completion.
    pub async fn run(&self, plan: &Plan, command: &[String]) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("orchestrator.run", run_id = %run_id, flow = %plan.flow());
        self.run_inner(run_id, plan, command).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        plan: &Plan,
        command: &[String],
    ) -> Result<RunReport, OrchestratorError> {
        let command = if command.is_empty() {
            self.descriptor.suite.command.clone().unwrap_or_default()
        } else {
            command.to_vec()
        };
        if command.is_empty() {
            return Err(SuiteError::NoCommand.into());
        }

        info!(target: "orchestrator.run", targets = plan.len(), "Provisioning");
        let targets = Provisioner::new(self.runner)
            .provision(plan, &self.descriptor)
            .await?;

        let suite = run_suite(
            self.runner,
            &command,
            &self.descriptor.suite.workdir,
            suite_env(plan.flow(), &targets),
            self.descriptor.timeouts.test_suite,
        )
        .await;
        match &suite {
            Ok(outcome) => info!(
                target: "orchestrator.run",
                exit_code = outcome.exit_code,
                passed = outcome.passed(),
                "Test suite finished"
            ),
            Err(e) => warn!(target: "orchestrator.run", error = %e, "Test suite did not complete"),
        }

        let teardown = self.teardown(targets.clone()).await;
        Ok(RunReport {
            run_id,
            targets,
            suite: suite?,
            teardown,
        })
    }

    /// Best-effort delete of every cluster in `plan`, for cleaning up after
    /// an interrupted run.
    pub async fn down(&self, plan: &Plan) -> TeardownReport {
        let targets = plan
            .target_keys()
            .filter_map(|key| self.descriptor.cluster(key))
            .map(ProvisionedTarget::adopted)
            .collect();
        self.teardown(targets).await
    }

    async fn teardown(&self, targets: Vec<ProvisionedTarget>) -> TeardownReport {
        let report = TeardownCoordinator::new(self.runner, self.descriptor.timeouts.teardown)
            .teardown(targets)
            .await;
        if !report.is_clean() {
            warn!(
                target: "orchestrator.run",
                failed = report.failures.len(),
                "Some clusters could not be deleted; remove them with `kind delete cluster`"
            );
        }
        report
    }
}
