//! Environment descriptor discovery, defaulting, and validation.
//!
//! The descriptor (`env.yaml`) is found by walking upward from a start
//! directory. Loading is a pure constructor: every call returns an
//! independent [`EnvironmentDescriptor`]; there is no process-wide
//! configuration state.
//!
//! # Defaults
//!
//! | Field | Default |
//! |---|---|
//! | `clusters.<key>.name` | `system-tests-<key>` |
//! | `clusters.<key>.kubeContext` | `kind-<name>` |
//! | `clusters.<key>.objectStore.release` | `localstack` |
//! | `clusters.<key>.objectStore.chart` | `infra/helm/localstack` |
//! | `clusters.<key>.objectStore.namespace` | `localstack` |
//! | `clusters.<key>.seedData.manifest` | `infra/k8s/seed-job.yaml` |
//! | `clusters.<key>.seedData.job` | `seed-data` |
//! | `clusters.<key>.seedData.namespace` | `localstack` |
//! | `clusters.<key>.messageBus.image` | `nats:2.10-alpine` |
//! | `clusters.<key>.messageBus.manifest` | `infra/k8s/nats.yaml` |
//! | `clusters.<key>.messageBus.deployment` | `nats` |
//! | `clusters.<key>.messageBus.namespace` | `nats` |
//! | `timeouts.createCluster` / `apply` / `readiness` / `teardown` | `2m` |
//! | `timeouts.testSuite` | none (no limit) |
//! | `polling.initialBackoff` / `maxBackoff` | `300ms` / `2s` |
//! | `flows` | the built-in catalog (see [`FlowCatalog::builtin`]) |
//! | `defaultFlow` | `aws_only` when the built-in catalog is used |
//! | `suite.workdir` | repository root |
//!
//! `clusters.<key>.kindConfig` has no default. Relative paths are resolved
//! against the repository root: the nearest ancestor of the descriptor that
//! contains `.git`, else the descriptor's own directory.
//!
//! Target keys must stay distinct once mapped to suite environment variable
//! names (`cluster-a` and `cluster_a` collide). [`ConfigResolver::resolve`]
//! also requires every `kindConfig` file to exist;
//! [`EnvironmentDescriptor::from_yaml_str`] does not touch the filesystem.

use crate::plan::FlowCatalog;
use crate::readiness::Backoff;
use crate::suite::env_key;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Descriptor file looked up by [`ConfigResolver`].
pub const DESCRIPTOR_FILE_NAME: &str = "env.yaml";

pub const DEFAULT_CREATE_CLUSTER_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_OBJECT_STORE_RELEASE: &str = "localstack";
pub const DEFAULT_OBJECT_STORE_CHART: &str = "infra/helm/localstack";
pub const DEFAULT_OBJECT_STORE_NAMESPACE: &str = "localstack";

pub const DEFAULT_SEED_MANIFEST: &str = "infra/k8s/seed-job.yaml";
pub const DEFAULT_SEED_JOB: &str = "seed-data";
pub const DEFAULT_SEED_NAMESPACE: &str = "localstack";

pub const DEFAULT_MESSAGE_BUS_IMAGE: &str = "nats:2.10-alpine";
pub const DEFAULT_MESSAGE_BUS_MANIFEST: &str = "infra/k8s/nats.yaml";
pub const DEFAULT_MESSAGE_BUS_DEPLOYMENT: &str = "nats";
pub const DEFAULT_MESSAGE_BUS_NAMESPACE: &str = "nats";

/// Default flow of the built-in catalog.
pub const DEFAULT_FLOW: &str = "aws_only";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No {file} found in {} or any parent directory", .start.display())]
    NotFound { file: String, start: PathBuf },

    #[error("Cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Failed to read configuration from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Configuration validation failed for {}:\n  - {}", .path.display(), .violations.join("\n  - "))]
    Validation {
        path: PathBuf,
        violations: Vec<String>,
    },
}

/// Validated, defaulted environment descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
    pub config_path: PathBuf,
    pub repo_root: PathBuf,
    pub clusters: BTreeMap<String, ClusterTarget>,
    pub timeouts: Timeouts,
    pub polling: Backoff,
    pub flows: FlowCatalog,
    pub default_flow: Option<String>,
    pub suite: SuiteSettings,
}

impl EnvironmentDescriptor {
    /// Parse, default, and validate descriptor text.
    ///
    /// `config_path` is only used for error messages; relative paths are
    /// resolved against `repo_root`.
    pub fn from_yaml_str(
        contents: &str,
        config_path: &Path,
        repo_root: &Path,
    ) -> Result<Self, ConfigError> {
        load(contents, config_path, repo_root, FileChecks::Skip)
    }

    pub fn cluster(&self, key: &str) -> Option<&ClusterTarget> {
        self.clusters.get(key)
    }
}

/// One provisionable cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTarget {
    pub key: String,
    pub name: String,
    pub kube_context: String,
    pub kind_config: PathBuf,
    pub object_store: HelmReleaseSettings,
    pub seed_data: SeedJobSettings,
    pub message_bus: MessageBusSettings,
}

/// Helm release backing the object-store capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSettings {
    pub release: String,
    pub chart: PathBuf,
    pub namespace: String,
    pub values: Vec<PathBuf>,
}

/// Job that loads seed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedJobSettings {
    pub manifest: PathBuf,
    pub job: String,
    pub namespace: String,
}

/// Message bus image and manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBusSettings {
    pub image: String,
    pub manifest: PathBuf,
    pub deployment: String,
    pub namespace: String,
}

/// Global step timeouts. All strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(with = "common::duration")]
    pub create_cluster: Duration,
    #[serde(with = "common::duration")]
    pub apply: Duration,
    #[serde(with = "common::duration")]
    pub readiness: Duration,
    #[serde(with = "common::duration")]
    pub teardown: Duration,
    #[serde(with = "common::duration::option")]
    pub test_suite: Option<Duration>,
}

/// How to run the test suite after provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSettings {
    pub command: Option<Vec<String>>,
    pub workdir: PathBuf,
}

// ============================================================================
// Raw (file) shape
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawDescriptor {
    #[serde(default)]
    clusters: BTreeMap<String, RawCluster>,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    polling: RawPolling,
    #[serde(default)]
    flows: Option<FlowCatalog>,
    #[serde(default)]
    default_flow: Option<String>,
    #[serde(default)]
    suite: RawSuite,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCluster {
    name: Option<String>,
    kind_config: Option<PathBuf>,
    kube_context: Option<String>,
    object_store: Option<RawHelmRelease>,
    seed_data: Option<RawSeedJob>,
    message_bus: Option<RawMessageBus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawHelmRelease {
    release: Option<String>,
    chart: Option<PathBuf>,
    namespace: Option<String>,
    #[serde(default)]
    values: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSeedJob {
    manifest: Option<PathBuf>,
    job: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawMessageBus {
    image: Option<String>,
    manifest: Option<PathBuf>,
    deployment: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawTimeouts {
    #[serde(default, with = "common::duration::option")]
    create_cluster: Option<Duration>,
    #[serde(default, with = "common::duration::option")]
    apply: Option<Duration>,
    #[serde(default, with = "common::duration::option")]
    readiness: Option<Duration>,
    #[serde(default, with = "common::duration::option")]
    teardown: Option<Duration>,
    #[serde(default, with = "common::duration::option")]
    test_suite: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawPolling {
    #[serde(default, with = "common::duration::option")]
    initial_backoff: Option<Duration>,
    #[serde(default, with = "common::duration::option")]
    max_backoff: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSuite {
    command: Option<Vec<String>>,
    workdir: Option<PathBuf>,
}

// ============================================================================
// Defaulting
// ============================================================================

fn resolve_path(repo_root: &Path, path: PathBuf) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    }
}

fn or_default(value: Option<String>, default: impl FnOnce() -> String) -> Option<String> {
    Some(value.unwrap_or_else(default))
}

fn or_default_path(repo_root: &Path, value: Option<PathBuf>, default: &str) -> Option<PathBuf> {
    Some(resolve_path(
        repo_root,
        value.unwrap_or_else(|| PathBuf::from(default)),
    ))
}

/// Fill every optional field and resolve relative paths. Idempotent.
fn apply_defaults(raw: RawDescriptor, repo_root: &Path) -> RawDescriptor {
    let clusters = raw
        .clusters
        .into_iter()
        .map(|(key, c)| {
            let name = or_default(c.name, || format!("system-tests-{key}"));
            let kube_context = or_default(c.kube_context, || {
                format!("kind-{}", name.as_deref().unwrap_or_default())
            });

            let os = c.object_store.unwrap_or_default();
            let object_store = RawHelmRelease {
                release: or_default(os.release, || DEFAULT_OBJECT_STORE_RELEASE.to_string()),
                chart: or_default_path(repo_root, os.chart, DEFAULT_OBJECT_STORE_CHART),
                namespace: or_default(os.namespace, || DEFAULT_OBJECT_STORE_NAMESPACE.to_string()),
                values: os
                    .values
                    .into_iter()
                    .map(|v| resolve_path(repo_root, v))
                    .collect(),
            };

            let sd = c.seed_data.unwrap_or_default();
            let seed_data = RawSeedJob {
                manifest: or_default_path(repo_root, sd.manifest, DEFAULT_SEED_MANIFEST),
                job: or_default(sd.job, || DEFAULT_SEED_JOB.to_string()),
                namespace: or_default(sd.namespace, || DEFAULT_SEED_NAMESPACE.to_string()),
            };

            let mb = c.message_bus.unwrap_or_default();
            let message_bus = RawMessageBus {
                image: or_default(mb.image, || DEFAULT_MESSAGE_BUS_IMAGE.to_string()),
                manifest: or_default_path(repo_root, mb.manifest, DEFAULT_MESSAGE_BUS_MANIFEST),
                deployment: or_default(mb.deployment, || {
                    DEFAULT_MESSAGE_BUS_DEPLOYMENT.to_string()
                }),
                namespace: or_default(mb.namespace, || DEFAULT_MESSAGE_BUS_NAMESPACE.to_string()),
            };

            let cluster = RawCluster {
                name,
                kind_config: c.kind_config.map(|p| resolve_path(repo_root, p)),
                kube_context,
                object_store: Some(object_store),
                seed_data: Some(seed_data),
                message_bus: Some(message_bus),
            };
            (key, cluster)
        })
        .collect();

    let timeouts = RawTimeouts {
        create_cluster: raw
            .timeouts
            .create_cluster
            .or(Some(DEFAULT_CREATE_CLUSTER_TIMEOUT)),
        apply: raw.timeouts.apply.or(Some(DEFAULT_APPLY_TIMEOUT)),
        readiness: raw.timeouts.readiness.or(Some(DEFAULT_READINESS_TIMEOUT)),
        teardown: raw.timeouts.teardown.or(Some(DEFAULT_TEARDOWN_TIMEOUT)),
        test_suite: raw.timeouts.test_suite,
    };

    let backoff = Backoff::default();
    let polling = RawPolling {
        initial_backoff: raw.polling.initial_backoff.or(Some(backoff.initial)),
        max_backoff: raw.polling.max_backoff.or(Some(backoff.max)),
    };

    let (flows, default_flow) = match raw.flows {
        Some(flows) => (flows, raw.default_flow),
        None => (
            FlowCatalog::builtin(),
            raw.default_flow.or_else(|| Some(DEFAULT_FLOW.to_string())),
        ),
    };

    let suite = RawSuite {
        command: raw.suite.command,
        workdir: Some(
            raw.suite
                .workdir
                .map_or_else(|| repo_root.to_path_buf(), |w| resolve_path(repo_root, w)),
        ),
    };

    RawDescriptor {
        clusters,
        timeouts,
        polling,
        flows: Some(flows),
        default_flow,
        suite,
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Collects every violation instead of stopping at the first.
#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn text(&mut self, field: String, value: Option<String>) -> String {
        match value {
            Some(v) if !v.trim().is_empty() => v,
            Some(_) => {
                self.0.push(format!("{field} must not be empty"));
                String::new()
            }
            None => {
                self.0.push(format!("{field} is required"));
                String::new()
            }
        }
    }

    fn path(&mut self, field: String, value: Option<PathBuf>) -> PathBuf {
        match value {
            Some(p) if !p.as_os_str().is_empty() => p,
            Some(_) => {
                self.0.push(format!("{field} must not be empty"));
                PathBuf::new()
            }
            None => {
                self.0.push(format!("{field} is required"));
                PathBuf::new()
            }
        }
    }

    fn positive(&mut self, field: &str, value: Option<Duration>) -> Duration {
        match value {
            Some(d) if !d.is_zero() => d,
            Some(d) => {
                self.0.push(format!("{field} must be > 0 (got {d:?})"));
                d
            }
            None => {
                self.0.push(format!("{field} is required"));
                Duration::ZERO
            }
        }
    }

    fn push(&mut self, violation: String) {
        self.0.push(violation);
    }
}

/// Whether validation checks referenced files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChecks {
    Skip,
    Require,
}

fn load(
    contents: &str,
    config_path: &Path,
    repo_root: &Path,
    files: FileChecks,
) -> Result<EnvironmentDescriptor, ConfigError> {
    let raw: RawDescriptor =
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
    let raw = apply_defaults(raw, repo_root);
    build(raw, config_path, repo_root, files).map_err(|violations| ConfigError::Validation {
        path: config_path.to_path_buf(),
        violations,
    })
}

fn build(
    raw: RawDescriptor,
    config_path: &Path,
    repo_root: &Path,
    files: FileChecks,
) -> Result<EnvironmentDescriptor, Vec<String>> {
    let mut v = Violations::default();

    if raw.clusters.is_empty() {
        v.push("clusters: at least one cluster target is required".to_string());
    }

    let mut clusters = BTreeMap::new();
    let mut seen_names: BTreeMap<String, String> = BTreeMap::new();
    let mut seen_env_keys: BTreeMap<String, String> = BTreeMap::new();
    for (key, c) in raw.clusters {
        let at = format!("clusters.{key}");
        if key.trim().is_empty() {
            v.push("clusters: target key must not be empty".to_string());
        } else if let Some(other) = seen_env_keys.insert(env_key(&key), key.clone()) {
            v.push(format!(
                "clusters.{key} maps to the same suite variables as clusters.{other} ({})",
                env_key(&key)
            ));
        }

        let name = v.text(format!("{at}.name"), c.name);
        if !name.is_empty() {
            if let Some(other) = seen_names.insert(name.clone(), key.clone()) {
                v.push(format!(
                    "{at}.name '{name}' is already used by clusters.{other}"
                ));
            }
        }

        let os = c.object_store.unwrap_or_default();
        let sd = c.seed_data.unwrap_or_default();
        let mb = c.message_bus.unwrap_or_default();

        let kind_config = v.path(format!("{at}.kindConfig"), c.kind_config);
        if files == FileChecks::Require
            && !kind_config.as_os_str().is_empty()
            && !kind_config.is_file()
        {
            v.push(format!(
                "{at}.kindConfig: kind config not found at {}",
                kind_config.display()
            ));
        }

        let target = ClusterTarget {
            name,
            kube_context: v.text(format!("{at}.kubeContext"), c.kube_context),
            kind_config,
            object_store: HelmReleaseSettings {
                release: v.text(format!("{at}.objectStore.release"), os.release),
                chart: v.path(format!("{at}.objectStore.chart"), os.chart),
                namespace: v.text(format!("{at}.objectStore.namespace"), os.namespace),
                values: os.values,
            },
            seed_data: SeedJobSettings {
                manifest: v.path(format!("{at}.seedData.manifest"), sd.manifest),
                job: v.text(format!("{at}.seedData.job"), sd.job),
                namespace: v.text(format!("{at}.seedData.namespace"), sd.namespace),
            },
            message_bus: MessageBusSettings {
                image: v.text(format!("{at}.messageBus.image"), mb.image),
                manifest: v.path(format!("{at}.messageBus.manifest"), mb.manifest),
                deployment: v.text(format!("{at}.messageBus.deployment"), mb.deployment),
                namespace: v.text(format!("{at}.messageBus.namespace"), mb.namespace),
            },
            key: key.clone(),
        };
        clusters.insert(key, target);
    }

    let timeouts = Timeouts {
        create_cluster: v.positive("timeouts.createCluster", raw.timeouts.create_cluster),
        apply: v.positive("timeouts.apply", raw.timeouts.apply),
        readiness: v.positive("timeouts.readiness", raw.timeouts.readiness),
        teardown: v.positive("timeouts.teardown", raw.timeouts.teardown),
        test_suite: raw
            .timeouts
            .test_suite
            .map(|d| v.positive("timeouts.testSuite", Some(d))),
    };

    let polling = Backoff::new(
        v.positive("polling.initialBackoff", raw.polling.initial_backoff),
        v.positive("polling.maxBackoff", raw.polling.max_backoff),
    );
    if polling.initial > polling.max {
        v.push(format!(
            "polling.initialBackoff ({:?}) must not exceed polling.maxBackoff ({:?})",
            polling.initial, polling.max
        ));
    }

    let flows = raw.flows.unwrap_or_default();
    for name in flows.names() {
        if name.trim().is_empty() {
            v.push("flows: flow name must not be empty".to_string());
        }
    }
    if let Some(default_flow) = &raw.default_flow {
        if !flows.contains(default_flow) {
            let known: BTreeSet<&str> = flows.names().collect();
            v.push(format!(
                "defaultFlow '{default_flow}' is not a known flow (known: {known:?})"
            ));
        }
    }

    if let Some(command) = &raw.suite.command {
        if command.first().map_or(true, |p| p.trim().is_empty()) {
            v.push("suite.command must name a program".to_string());
        }
    }
    let suite = SuiteSettings {
        command: raw.suite.command,
        workdir: raw
            .suite
            .workdir
            .unwrap_or_else(|| repo_root.to_path_buf()),
    };

    if !v.0.is_empty() {
        return Err(v.0);
    }

    Ok(EnvironmentDescriptor {
        config_path: config_path.to_path_buf(),
        repo_root: repo_root.to_path_buf(),
        clusters,
        timeouts,
        polling,
        flows,
        default_flow: raw.default_flow,
        suite,
    })
}

// ============================================================================
// Discovery
// ============================================================================

/// Locates and loads the environment descriptor.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    file_name: String,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver for [`DESCRIPTOR_FILE_NAME`].
    pub fn new() -> Self {
        Self {
            file_name: DESCRIPTOR_FILE_NAME.to_string(),
        }
    }

    /// Resolver for a differently named descriptor file.
    pub fn with_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    /// Find, parse, default, and validate the descriptor.
    ///
    /// Unlike [`EnvironmentDescriptor::from_yaml_str`], every
    /// `clusters.<key>.kindConfig` must name an existing file.
    ///
    /// `start_dir` defaults to the current working directory.
    pub fn resolve(&self, start_dir: Option<&Path>) -> Result<EnvironmentDescriptor, ConfigError> {
        let config_path = self.locate(start_dir)?;
        let contents =
            std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;

        let config_dir = config_path.parent().unwrap_or(Path::new("/"));
        let repo_root = find_repo_root(config_dir);
        debug!(
            target: "orchestrator.config",
            config_path = %config_path.display(),
            repo_root = %repo_root.display(),
            "Loading environment descriptor"
        );

        load(&contents, &config_path, &repo_root, FileChecks::Require)
    }

    /// Walk upward from `start_dir` until the descriptor file is found.
    pub fn locate(&self, start_dir: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
        let start = match start_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        };

        start
            .ancestors()
            .map(|dir| dir.join(&self.file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::NotFound {
                file: self.file_name.clone(),
                start,
            })
    }
}

/// Nearest ancestor of `dir` (inclusive) containing `.git`, else `dir`.
pub fn find_repo_root(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|d| d.join(".git").exists())
        .unwrap_or(dir)
        .to_path_buf()
}
