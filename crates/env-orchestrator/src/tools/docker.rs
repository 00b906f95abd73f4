//! `docker` image handling for images side-loaded into kind clusters.

use crate::process::{CommandRunner, CommandSpec, ProcessError};
use std::time::Duration;
use tracing::info;

const DOCKER: &str = "docker";

pub struct Docker<'r, R: ?Sized> {
    runner: &'r R,
}

impl<'r, R: CommandRunner + ?Sized> Docker<'r, R> {
    pub fn new(runner: &'r R) -> Self {
        Self { runner }
    }

    /// Whether `image` is present locally (`docker image inspect`).
    ///
    /// # Errors
    ///
    /// Failures other than a non-zero exit, e.g. docker not installed.
    pub async fn image_present(&self, image: &str, timeout: Duration) -> Result<bool, ProcessError> {
        let spec = CommandSpec::new(DOCKER)
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .timeout(timeout);
        match self.runner.run(&spec).await {
            Ok(_) => Ok(true),
            Err(ProcessError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pull `image` unless it is already present.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`] from inspect or pull.
    pub async fn ensure_pulled(&self, image: &str, timeout: Duration) -> Result<(), ProcessError> {
        if self.image_present(image, timeout).await? {
            return Ok(());
        }
        info!(target: "orchestrator.tools.docker", image = %image, "Pulling image");
        let spec = CommandSpec::new(DOCKER).args(["pull", image]).timeout(timeout);
        self.runner.run(&spec).await.map(|_| ())
    }
}
