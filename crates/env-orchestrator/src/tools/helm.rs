//! `helm` releases.

use crate::config::HelmReleaseSettings;
use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessResult};
use std::path::PathBuf;
use std::time::Duration;

const HELM: &str = "helm";

/// Extra time given to the helm process beyond its own `--timeout`, so helm
/// reports its own failure before the runner kills it.
pub const HELM_TIMEOUT_GRACE: Duration = Duration::from_secs(15);

/// A chart to install as a named release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmRelease {
    pub release: String,
    pub chart: PathBuf,
    pub namespace: String,
    pub values: Vec<PathBuf>,
}

impl From<&HelmReleaseSettings> for HelmRelease {
    fn from(settings: &HelmReleaseSettings) -> Self {
        Self {
            release: settings.release.clone(),
            chart: settings.chart.clone(),
            namespace: settings.namespace.clone(),
            values: settings.values.clone(),
        }
    }
}

pub struct Helm<'r, R: ?Sized> {
    runner: &'r R,
    kube_context: String,
}

impl<'r, R: CommandRunner + ?Sized> Helm<'r, R> {
    pub fn new(runner: &'r R, kube_context: impl Into<String>) -> Self {
        Self {
            runner,
            kube_context: kube_context.into(),
        }
    }

    fn base(&self) -> CommandSpec {
        CommandSpec::new(HELM).args(["--kube-context", self.kube_context.as_str()])
    }

    /// `helm upgrade --install ... --wait --timeout <timeout>`.
    ///
    /// Re-running against an existing release upgrades it in place.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn upgrade_install(
        &self,
        release: &HelmRelease,
        timeout: Duration,
    ) -> Result<ProcessResult, ProcessError> {
        let mut spec = self
            .base()
            .args(["upgrade", "--install", release.release.as_str()])
            .arg(release.chart.to_string_lossy())
            .args([
                "--namespace",
                release.namespace.as_str(),
                "--create-namespace",
                "--wait",
                "--timeout",
            ])
            .arg(go_duration(timeout));
        for values in &release.values {
            spec = spec.arg("-f").arg(values.to_string_lossy());
        }
        self.runner
            .run(&spec.timeout(timeout.saturating_add(HELM_TIMEOUT_GRACE)))
            .await
    }
}

/// Whole seconds in Go duration syntax (`120s`), rounded up.
fn go_duration(d: Duration) -> String {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    format!("{secs}s")
}
