//! Pre-built descriptors and fixture repositories.

use env_orchestrator::config::EnvironmentDescriptor;
use env_orchestrator::plan::{Plan, PlanResolver};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Repository root used by in-memory descriptors.
pub const REPO_ROOT: &str = "/repo";

/// Two clusters and the flows the scenario tests use.
///
/// - `both`: `cluster-a` needs the object store, `cluster-b` the message bus
/// - `object_store_only`: `cluster-a` needs the object store
/// - `seeded`: `cluster-a` needs the object store and seed data
/// - `unsupported`: `cluster-a` needs cache and deployment controller
pub const TWO_CLUSTER_YAML: &str = r"
clusters:
  cluster-a:
    kindConfig: infra/kind/cluster-a.yaml
  cluster-b:
    kindConfig: infra/kind/cluster-b.yaml
timeouts:
  createCluster: 2m
  apply: 1m
  readiness: 30s
  teardown: 1m
polling:
  initialBackoff: 300ms
  maxBackoff: 2s
flows:
  both:
    cluster-a: { needsObjectStore: true }
    cluster-b: { needsMessageBus: true }
  object_store_only:
    cluster-a: [objectStore]
  seeded:
    cluster-a: [seedData, objectStore]
  unsupported:
    cluster-a: [cache, deploymentController]
defaultFlow: both
suite:
  command: [make, system-test]
";

/// Parse `yaml` as if it lived at `/repo/env.yaml`.
pub fn descriptor_from(yaml: &str) -> EnvironmentDescriptor {
    let root = Path::new(REPO_ROOT);
    EnvironmentDescriptor::from_yaml_str(yaml, &root.join("env.yaml"), root)
        .unwrap_or_else(|e| panic!("fixture descriptor is invalid: {e}"))
}

pub fn two_cluster_descriptor() -> EnvironmentDescriptor {
    descriptor_from(TWO_CLUSTER_YAML)
}

/// Resolve `flow` against `descriptor`, panicking on failure.
pub fn plan(descriptor: &EnvironmentDescriptor, flow: &str) -> Plan {
    PlanResolver::new(descriptor)
        .resolve(flow)
        .unwrap_or_else(|e| panic!("fixture flow '{flow}' does not resolve: {e}"))
}

/// A throwaway repository on disk: `.git/` plus `env.yaml` at `descriptor_dir`.
pub struct FixtureRepo {
    dir: TempDir,
}

impl FixtureRepo {
    /// Create a repository with `yaml` written to `<root>/<descriptor_dir>/env.yaml`.
    pub fn with_descriptor(descriptor_dir: &str, yaml: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::create_dir(dir.path().join(".git")).expect("create .git");
        let target = dir.path().join(descriptor_dir);
        fs::create_dir_all(&target).expect("create descriptor dir");
        fs::write(target.join("env.yaml"), yaml).expect("write env.yaml");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write an empty-cluster kind config for every `kindConfig` in
    /// [`TWO_CLUSTER_YAML`].
    pub fn with_kind_configs(self) -> Self {
        self.touch("infra/kind/cluster-a.yaml");
        self.touch("infra/kind/cluster-b.yaml");
        self
    }

    /// Create the file `relative` (and parents) under the root.
    pub fn touch(&self, relative: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, "kind: Cluster\napiVersion: kind.x-k8s.io/v1alpha4\n")
            .expect("write fixture file");
        path
    }

    /// Create `relative` (and parents) under the root and return its path.
    pub fn mkdir(&self, relative: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        fs::create_dir_all(&path).expect("create fixture dir");
        path
    }
}
