//! Descriptor discovery from nested flow directories.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use env_orchestrator::config::{ConfigError, ConfigResolver};
use env_orchestrator::plan::{PlanError, PlanResolver};
use env_orchestrator_test_utils::fixtures::{FixtureRepo, TWO_CLUSTER_YAML};

#[test]
fn test_flow_directory_resolves_descriptor_and_flow() {
    let repo = FixtureRepo::with_descriptor("tests/system", TWO_CLUSTER_YAML).with_kind_configs();
    let flow_dir = repo.mkdir("tests/system/flows/object_store_only/cases");

    let descriptor = ConfigResolver::new().resolve(Some(&flow_dir)).unwrap();
    assert_eq!(descriptor.repo_root, repo.root());
    assert_eq!(
        descriptor.cluster("cluster-a").unwrap().kind_config,
        repo.root().join("infra/kind/cluster-a.yaml")
    );

    let plan = PlanResolver::new(&descriptor)
        .resolve_selected(None, Some(&flow_dir))
        .unwrap();
    assert_eq!(plan.flow(), "object_store_only");
    assert_eq!(plan.target_keys().collect::<Vec<_>>(), vec!["cluster-a"]);
}

#[test]
fn test_invalid_descriptor_lists_every_problem() {
    let repo = FixtureRepo::with_descriptor(
        ".",
        "clusters:\n  a:\n    name: dup\n  b:\n    name: dup\n    kindConfig: b.yaml\ntimeouts:\n  readiness: 0s\n",
    );
    repo.touch("b.yaml");

    let err = ConfigResolver::new().resolve(Some(repo.root())).unwrap_err();
    match err {
        ConfigError::Validation { violations, .. } => {
            assert_eq!(violations.len(), 3, "{violations:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_flow_referencing_undeclared_target_fails_at_plan_time() {
    let yaml = TWO_CLUSTER_YAML.replace("cluster-a: [objectStore]", "cluster-c: [objectStore]");
    let repo = FixtureRepo::with_descriptor(".", &yaml).with_kind_configs();

    let descriptor = ConfigResolver::new().resolve(Some(repo.root())).unwrap();
    let err = PlanResolver::new(&descriptor)
        .resolve("object_store_only")
        .unwrap_err();
    assert!(matches!(err, PlanError::TargetNotFound { ref target, .. } if target == "cluster-c"));
}

#[test]
fn test_missing_kind_config_is_reported_at_load() {
    let yaml = TWO_CLUSTER_YAML.replace("infra/kind/cluster-b.yaml", "infra/kind/cluster-bb.yaml");
    let repo = FixtureRepo::with_descriptor(".", &yaml).with_kind_configs();

    let err = ConfigResolver::new().resolve(Some(repo.root())).unwrap_err();
    match err {
        ConfigError::Validation { violations, .. } => {
            assert_eq!(violations.len(), 1, "{violations:?}");
            assert!(violations[0].starts_with("clusters.cluster-b.kindConfig: kind config not found at"));
            assert!(violations[0].ends_with("infra/kind/cluster-bb.yaml"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}
