//! `kubectl` manifests, rollouts, and jobs.
//!
//! [`Kubectl`] implements [`DeploymentController`] through `kubectl rollout
//! status --watch=false`, and [`JobSucceeded`] is the readiness probe for
//! one-shot jobs such as the seed-data loader.

use crate::probes::{DeploymentController, Probe, RolloutStatus};
use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessResult};
use crate::readiness::{PollOutcome, ProbeError};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

const KUBECTL: &str = "kubectl";

/// Timeout for a single status query. Queries return immediately; waiting is
/// the poller's job.
pub const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    /// The job hit its backoff limit.
    Failed,
}

/// `kubectl` bound to one context and, optionally, one namespace.
pub struct Kubectl<'r, R: ?Sized> {
    runner: &'r R,
    context: String,
    namespace: Option<String>,
    timeout: Duration,
}

impl<'r, R: ?Sized> Clone for Kubectl<'r, R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner,
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            timeout: self.timeout,
        }
    }
}

impl<'r, R: CommandRunner + ?Sized> Kubectl<'r, R> {
    /// `timeout` bounds `apply` calls.
    pub fn new(runner: &'r R, context: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            context: context.into(),
            namespace: None,
            timeout,
        }
    }

    /// Same context, scoped to `namespace`.
    #[must_use]
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..self.clone()
        }
    }

    fn base(&self) -> CommandSpec {
        let spec = CommandSpec::new(KUBECTL).args(["--context", self.context.as_str()]);
        match &self.namespace {
            Some(ns) => spec.args(["--namespace", ns.as_str()]),
            None => spec,
        }
    }

    /// `kubectl apply -f <path>`.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn apply_file(&self, path: &Path) -> Result<ProcessResult, ProcessError> {
        let spec = self
            .base()
            .args(["apply", "-f"])
            .arg(path.to_string_lossy())
            .timeout(self.timeout);
        self.runner.run(&spec).await
    }

    /// `kubectl apply -f -` with `manifest` on stdin.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn apply_manifest(&self, manifest: &str) -> Result<ProcessResult, ProcessError> {
        let spec = self
            .base()
            .args(["apply", "-f", "-"])
            .stdin(manifest.as_bytes().to_vec())
            .timeout(self.timeout);
        self.runner.run(&spec).await
    }

    /// Create `namespace` if missing. Idempotent.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`].
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<(), ProcessError> {
        let manifest =
            format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {namespace}\n");
        self.apply_manifest(&manifest).await.map(|_| ())
    }

    /// One-shot `kubectl rollout status deployment/<name> --watch=false`.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`], including the deployment not existing yet.
    pub async fn deployment_rollout(&self, deployment: &str) -> Result<RolloutStatus, ProcessError> {
        let spec = self
            .base()
            .args(["rollout", "status"])
            .arg(format!("deployment/{deployment}"))
            .arg("--watch=false")
            .timeout(STATUS_QUERY_TIMEOUT);
        let result = self.runner.run(&spec).await?;
        Ok(parse_rollout(result.stdout()))
    }

    /// Current state of `job`.
    ///
    /// # Errors
    ///
    /// Any [`ProcessError`], including the job not existing yet.
    pub async fn job_status(&self, job: &str) -> Result<JobStatus, ProcessError> {
        let spec = self
            .base()
            .args(["get", "job", job, "-o"])
            .arg(r#"jsonpath={.status.succeeded}|{.status.conditions[?(@.type=="Failed")].status}"#)
            .timeout(STATUS_QUERY_TIMEOUT);
        let result = self.runner.run(&spec).await?;
        Ok(parse_job_status(result.stdout()))
    }
}

fn parse_rollout(stdout: &str) -> RolloutStatus {
    if stdout.contains("successfully rolled out") {
        RolloutStatus::Ready
    } else {
        let detail = stdout.lines().last().unwrap_or_default().trim();
        RolloutStatus::NotReady(if detail.is_empty() {
            "rollout in progress".to_string()
        } else {
            detail.to_string()
        })
    }
}

fn parse_job_status(stdout: &str) -> JobStatus {
    let (succeeded, failed) = stdout.trim().split_once('|').unwrap_or((stdout.trim(), ""));
    if succeeded.trim().parse::<u32>().unwrap_or(0) > 0 {
        JobStatus::Succeeded
    } else if failed.trim().eq_ignore_ascii_case("true") {
        JobStatus::Failed
    } else {
        JobStatus::Running
    }
}

/// Query failures before the object exists are expected while resources are
/// still being created; only a tool that cannot start is fatal.
fn probe_error(e: &ProcessError) -> ProbeError {
    match e {
        ProcessError::EmptyCommand | ProcessError::Spawn { .. } => ProbeError::fatal(e.to_string()),
        _ => ProbeError::transient(e.to_string()),
    }
}

#[async_trait]
impl<'r, R: CommandRunner + ?Sized> DeploymentController for Kubectl<'r, R> {
    async fn rollout_status(&self, name: &str) -> Result<RolloutStatus, ProbeError> {
        self.deployment_rollout(name).await.map_err(|e| probe_error(&e))
    }
}

/// Ready once the job has a succeeded pod; stops on a failed job.
pub struct JobSucceeded<'k, 'r, R: ?Sized> {
    kubectl: &'k Kubectl<'r, R>,
    job: String,
}

impl<'k, 'r, R: CommandRunner + ?Sized> JobSucceeded<'k, 'r, R> {
    pub fn new(kubectl: &'k Kubectl<'r, R>, job: impl Into<String>) -> Self {
        Self {
            kubectl,
            job: job.into(),
        }
    }
}

#[async_trait]
impl<'k, 'r, R: CommandRunner + ?Sized> Probe for JobSucceeded<'k, 'r, R> {
    type Observed = String;

    async fn check(&self) -> PollOutcome<String> {
        match self.kubectl.job_status(&self.job).await {
            Ok(JobStatus::Succeeded) => PollOutcome::Ready,
            Ok(JobStatus::Running) => PollOutcome::NotYetReady(format!("job {} running", self.job)),
            Ok(JobStatus::Failed) => {
                PollOutcome::ProbeFailed(ProbeError::fatal(format!("job {} failed", self.job)))
            }
            Err(e) => PollOutcome::ProbeFailed(probe_error(&e)),
        }
    }
}
