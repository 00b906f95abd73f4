//! `kind` cluster lifecycle.

use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessResult};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const KIND: &str = "kind";

/// Marker kind prints when a cluster with the requested name is present.
const ALREADY_EXISTS_MARKER: &str = "already exist";

/// Outcome of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCreation {
    Created,
    /// A cluster with this name was left over from an earlier run.
    AlreadyExists,
}

pub struct Kind<'r, R: ?Sized> {
    runner: &'r R,
}

impl<'r, R: CommandRunner + ?Sized> Kind<'r, R> {
    pub fn new(runner: &'r R) -> Self {
        Self { runner }
    }

    /// `kind create cluster --name <name> --config <config>`.
    ///
    /// A non-zero exit whose output says the cluster already exists is
    /// reported as [`ClusterCreation::AlreadyExists`] rather than an error.
    ///
    /// # Errors
    ///
    /// Any other [`ProcessError`].
    pub async fn create_cluster(
        &self,
        name: &str,
        config: &Path,
        timeout: Duration,
    ) -> Result<ClusterCreation, ProcessError> {
        let spec = CommandSpec::new(KIND)
            .args(["create", "cluster", "--name", name, "--config"])
            .arg(config.to_string_lossy())
            .timeout(timeout);

        match self.runner.run(&spec).await {
            Ok(_) => {
                info!(target: "orchestrator.tools.kind", cluster = %name, "Cluster created");
                Ok(ClusterCreation::Created)
            }
            Err(e @ ProcessError::NonZeroExit { .. }) if e.output_contains(ALREADY_EXISTS_MARKER) => {
                info!(target: "orchestrator.tools.kind", cluster = %name, "Cluster already exists, reusing");
                Ok(ClusterCreation::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    /// `kind delete cluster --name <name>`.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn delete_cluster(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<ProcessResult, ProcessError> {
        let spec = CommandSpec::new(KIND)
            .args(["delete", "cluster", "--name", name])
            .timeout(timeout);
        self.runner.run(&spec).await
    }

    /// `kind load docker-image <image> --name <cluster>`.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn load_image(
        &self,
        cluster: &str,
        image: &str,
        timeout: Duration,
    ) -> Result<ProcessResult, ProcessError> {
        let spec = CommandSpec::new(KIND)
            .args(["load", "docker-image", image, "--name", cluster])
            .timeout(timeout);
        self.runner.run(&spec).await
    }
}
