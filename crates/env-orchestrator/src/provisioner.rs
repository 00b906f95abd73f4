//! Sequential, all-or-nothing provisioning of a [`Plan`].
//!
//! Targets are provisioned in sorted key order. For each target the cluster
//! is created first, then each requested capability in [`Capability::ALL`]
//! order: its action runs and its readiness probe must pass before the next
//! capability starts.
//!
//! | Capability | Action | Ready when |
//! |---|---|---|
//! | objectStore | `helm upgrade --install` | deployment `<release>` rolled out |
//! | seedData | `kubectl apply -f <manifest>` | job `<job>` succeeded |
//! | messageBus | pull image, `kind load docker-image`, `kubectl apply -f` | deployment rolled out |
//! | cache | none | recorded as unsupported |
//! | deploymentController | none | recorded as unsupported |
//!
//! On the first failure nothing further is attempted: every target whose
//! cluster step succeeded (including the failing one) is torn down, then
//! the original error is returned. A `kind create` killed at its timeout may
//! already have started node containers, so that cluster is torn down too.

use crate::config::{ClusterTarget, EnvironmentDescriptor};
use crate::plan::Plan;
use crate::probes::{wait_for, RolloutReady};
use crate::process::{CommandRunner, ProcessError};
use crate::readiness::PollError;
use crate::teardown::TeardownCoordinator;
use crate::tools::{ClusterCreation, Docker, Helm, HelmRelease, JobSucceeded, Kind, Kubectl};
use chrono::{DateTime, Utc};
use common::types::{Capability, InfraCapabilitySet};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Target '{target}' is not declared under clusters")]
    UnknownTarget { target: String },

    #[error("Failed to create cluster '{cluster}' for target '{target}': {source}")]
    ClusterCreateFailed {
        target: String,
        cluster: String,
        #[source]
        source: ProcessError,
    },

    #[error("Failed to provision {capability} on target '{target}': {source}")]
    CapabilityFailed {
        target: String,
        capability: Capability,
        #[source]
        source: ProcessError,
    },

    #[error("{capability} on target '{target}' did not become ready: {source}")]
    NotReady {
        target: String,
        capability: Capability,
        #[source]
        source: PollError<String>,
    },
}

impl ProvisionError {
    /// Key of the target that failed.
    pub fn target(&self) -> &str {
        match self {
            Self::UnknownTarget { target }
            | Self::ClusterCreateFailed { target, .. }
            | Self::CapabilityFailed { target, .. }
            | Self::NotReady { target, .. } => target,
        }
    }
}

/// How a requested capability ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CapabilityStatus {
    /// Provisioned and passed its readiness probe.
    Ready,
    /// No provisioning action exists for this capability yet.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityRecord {
    pub capability: Capability,
    pub status: CapabilityStatus,
}

/// A target whose cluster exists. Capabilities are appended as they finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedTarget {
    pub key: String,
    pub name: String,
    pub kube_context: String,
    /// The cluster existed before this run.
    pub reused: bool,
    pub created_at: DateTime<Utc>,
    capabilities: Vec<CapabilityRecord>,
}

impl ProvisionedTarget {
    fn new(cluster: &ClusterTarget, reused: bool) -> Self {
        Self {
            key: cluster.key.clone(),
            name: cluster.name.clone(),
            kube_context: cluster.kube_context.clone(),
            reused,
            created_at: Utc::now(),
            capabilities: Vec::new(),
        }
    }

    /// Record for a cluster this run did not create, e.g. cleanup of an
    /// interrupted run.
    pub fn adopted(cluster: &ClusterTarget) -> Self {
        Self::new(cluster, true)
    }

    pub fn capabilities(&self) -> &[CapabilityRecord] {
        &self.capabilities
    }

    /// Capabilities that reached [`CapabilityStatus::Ready`].
    pub fn satisfied(&self) -> InfraCapabilitySet {
        self.capabilities
            .iter()
            .filter(|r| r.status == CapabilityStatus::Ready)
            .map(|r| r.capability)
            .collect()
    }

    pub fn status_of(&self, capability: Capability) -> Option<CapabilityStatus> {
        self.capabilities
            .iter()
            .find(|r| r.capability == capability)
            .map(|r| r.status)
    }

    fn record(&mut self, capability: Capability, status: CapabilityStatus) {
        self.capabilities.push(CapabilityRecord { capability, status });
    }
}

/// Drives provisioning through a [`CommandRunner`].
pub struct Provisioner<'r, R: ?Sized> {
    runner: &'r R,
}

impl<'r, R: CommandRunner + ?Sized> Provisioner<'r, R> {
    pub fn new(runner: &'r R) -> Self {
        Self { runner }
    }

    /// Provision every target of `plan`.
    ///
    /// # Errors
    ///
    /// The first [`ProvisionError`]. Before it is returned, every cluster
    /// created so far has been handed to teardown; teardown failures are
    /// logged and never replace this error.
    pub async fn provision(
        &self,
        plan: &Plan,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Vec<ProvisionedTarget>, ProvisionError> {
        let mut provisioned = Vec::with_capacity(plan.len());

        match self.provision_all(plan, descriptor, &mut provisioned).await {
            Ok(()) => {
                info!(
                    target: "orchestrator.provisioner",
                    flow = %plan.flow(),
                    targets = provisioned.len(),
                    "Provisioning complete"
                );
                Ok(provisioned)
            }
            Err(e) => {
                error!(
                    target: "orchestrator.provisioner",
                    error = %e,
                    created = provisioned.len(),
                    "Provisioning failed, tearing down"
                );
                let report = TeardownCoordinator::new(self.runner, descriptor.timeouts.teardown)
                    .teardown(provisioned)
                    .await;
                if !report.is_clean() {
                    warn!(
                        target: "orchestrator.provisioner",
                        failed = report.failures.len(),
                        "Teardown after provisioning failure was incomplete"
                    );
                }
                Err(e)
            }
        }
    }

    async fn provision_all(
        &self,
        plan: &Plan,
        descriptor: &EnvironmentDescriptor,
        provisioned: &mut Vec<ProvisionedTarget>,
    ) -> Result<(), ProvisionError> {
        for (key, capabilities) in plan.targets() {
            let cluster = descriptor
                .cluster(key)
                .ok_or_else(|| ProvisionError::UnknownTarget {
                    target: key.to_string(),
                })?;

            let mut target = match self.create_cluster(cluster, descriptor).await {
                Ok(target) => target,
                Err(
                    e @ ProvisionError::ClusterCreateFailed {
                        source: ProcessError::Timeout { .. },
                        ..
                    },
                ) => {
                    provisioned.push(ProvisionedTarget::new(cluster, false));
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let result = self
                .provision_capabilities(cluster, capabilities, descriptor, &mut target)
                .await;
            provisioned.push(target);
            result?;
        }
        Ok(())
    }

    async fn create_cluster(
        &self,
        cluster: &ClusterTarget,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<ProvisionedTarget, ProvisionError> {
        info!(
            target: "orchestrator.provisioner",
            target_key = %cluster.key,
            cluster = %cluster.name,
            "Creating cluster"
        );
        let creation = Kind::new(self.runner)
            .create_cluster(
                &cluster.name,
                &cluster.kind_config,
                descriptor.timeouts.create_cluster,
            )
            .await
            .map_err(|source| ProvisionError::ClusterCreateFailed {
                target: cluster.key.clone(),
                cluster: cluster.name.clone(),
                source,
            })?;

        Ok(ProvisionedTarget::new(
            cluster,
            creation == ClusterCreation::AlreadyExists,
        ))
    }

    #[instrument(skip_all, name = "orchestrator.provision_target", fields(target_key = %cluster.key))]
    async fn provision_capabilities(
        &self,
        cluster: &ClusterTarget,
        capabilities: InfraCapabilitySet,
        descriptor: &EnvironmentDescriptor,
        target: &mut ProvisionedTarget,
    ) -> Result<(), ProvisionError> {
        for capability in capabilities.iter() {
            info!(target: "orchestrator.provisioner", capability = %capability, "Provisioning capability");
            let status = match capability {
                Capability::ObjectStore => {
                    self.object_store(cluster, descriptor).await?;
                    CapabilityStatus::Ready
                }
                Capability::SeedData => {
                    self.seed_data(cluster, descriptor).await?;
                    CapabilityStatus::Ready
                }
                Capability::MessageBus => {
                    self.message_bus(cluster, descriptor).await?;
                    CapabilityStatus::Ready
                }
                Capability::Cache | Capability::DeploymentController => {
                    warn!(
                        target: "orchestrator.provisioner",
                        capability = %capability,
                        "No provisioning action for capability, recorded as unsupported"
                    );
                    CapabilityStatus::Unsupported
                }
            };
            target.record(capability, status);
        }
        Ok(())
    }

    async fn object_store(
        &self,
        cluster: &ClusterTarget,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<(), ProvisionError> {
        let step = Step::new(cluster, Capability::ObjectStore);
        let settings = &cluster.object_store;

        Helm::new(self.runner, cluster.kube_context.as_str())
            .upgrade_install(&HelmRelease::from(settings), descriptor.timeouts.apply)
            .await
            .map_err(|e| step.failed(e))?;

        let kubectl = self.kubectl(cluster, descriptor).in_namespace(settings.namespace.as_str());
        let probe = RolloutReady::new(&kubectl, settings.release.as_str());
        wait_for(&probe, descriptor.timeouts.readiness, descriptor.polling)
            .await
            .map_err(|e| step.not_ready(e))
    }

    async fn seed_data(
        &self,
        cluster: &ClusterTarget,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<(), ProvisionError> {
        let step = Step::new(cluster, Capability::SeedData);
        let settings = &cluster.seed_data;
        let kubectl = self.kubectl(cluster, descriptor);

        kubectl
            .ensure_namespace(&settings.namespace)
            .await
            .map_err(|e| step.failed(e))?;
        let kubectl = kubectl.in_namespace(settings.namespace.as_str());
        kubectl
            .apply_file(&settings.manifest)
            .await
            .map_err(|e| step.failed(e))?;

        let probe = JobSucceeded::new(&kubectl, settings.job.as_str());
        wait_for(&probe, descriptor.timeouts.readiness, descriptor.polling)
            .await
            .map_err(|e| step.not_ready(e))
    }

    async fn message_bus(
        &self,
        cluster: &ClusterTarget,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<(), ProvisionError> {
        let step = Step::new(cluster, Capability::MessageBus);
        let settings = &cluster.message_bus;
        let apply_timeout = descriptor.timeouts.apply;

        Docker::new(self.runner)
            .ensure_pulled(&settings.image, apply_timeout)
            .await
            .map_err(|e| step.failed(e))?;
        Kind::new(self.runner)
            .load_image(&cluster.name, &settings.image, apply_timeout)
            .await
            .map_err(|e| step.failed(e))?;

        let kubectl = self.kubectl(cluster, descriptor);
        kubectl
            .ensure_namespace(&settings.namespace)
            .await
            .map_err(|e| step.failed(e))?;
        let kubectl = kubectl.in_namespace(settings.namespace.as_str());
        kubectl
            .apply_file(&settings.manifest)
            .await
            .map_err(|e| step.failed(e))?;

        let probe = RolloutReady::new(&kubectl, settings.deployment.as_str());
        wait_for(&probe, descriptor.timeouts.readiness, descriptor.polling)
            .await
            .map_err(|e| step.not_ready(e))
    }

    fn kubectl(
        &self,
        cluster: &ClusterTarget,
        descriptor: &EnvironmentDescriptor,
    ) -> Kubectl<'r, R> {
        Kubectl::new(
            self.runner,
            cluster.kube_context.as_str(),
            descriptor.timeouts.apply,
        )
    }
}

/// Error context for one capability step.
struct Step<'a> {
    target: &'a str,
    capability: Capability,
}

impl<'a> Step<'a> {
    fn new(cluster: &'a ClusterTarget, capability: Capability) -> Self {
        Self {
            target: &cluster.key,
            capability,
        }
    }

    fn failed(&self, source: ProcessError) -> ProvisionError {
        ProvisionError::CapabilityFailed {
            target: self.target.to_string(),
            capability: self.capability,
            source,
        }
    }

    fn not_ready(&self, source: PollError<String>) -> ProvisionError {
        ProvisionError::NotReady {
            target: self.target.to_string(),
            capability: self.capability,
            source,
        }
    }
}
