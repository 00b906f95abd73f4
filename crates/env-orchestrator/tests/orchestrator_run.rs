//! Full runs: provision, test suite, teardown.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use env_orchestrator::errors::OrchestratorError;
use env_orchestrator::orchestrator::Orchestrator;
use env_orchestrator::suite::SuiteError;
use env_orchestrator_test_utils::fixtures::{descriptor_from, two_cluster_descriptor, TWO_CLUSTER_YAML};
use env_orchestrator_test_utils::{MockResponse, MockRunner};
use std::path::Path;

const SUITE: &str = "make system-test";

fn orchestrator(runner: &MockRunner) -> Orchestrator<'_, MockRunner> {
    Orchestrator::new(runner, two_cluster_descriptor())
}

#[tokio::test(start_paused = true)]
async fn test_failing_suite_still_tears_down_once() {
    let runner = MockRunner::healthy().on(SUITE, MockResponse::fail(2, "FAIL: 3 tests failed"));
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let report = orchestrator.run(&plan, &[]).await.unwrap();

    assert!(!report.suite.passed());
    assert_eq!(report.suite.exit_code, 2);
    assert_eq!(report.suite.stderr, "FAIL: 3 tests failed");
    assert!(report.teardown.is_clean());
    assert_eq!(
        report.teardown.deleted,
        vec!["system-tests-cluster-a", "system-tests-cluster-b"]
    );
    assert_eq!(runner.count_matching("kind delete cluster"), 2);
    assert!(runner.expect_position(SUITE) < runner.expect_position("kind delete cluster"));
}

#[tokio::test(start_paused = true)]
async fn test_suite_sees_provisioned_targets() {
    let runner = MockRunner::healthy();
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let report = orchestrator.run(&plan, &[]).await.unwrap();
    assert!(report.suite.passed());
    assert_eq!(report.targets.len(), 2);

    let suite = runner
        .calls()
        .into_iter()
        .find(|c| c.program() == "make")
        .unwrap();
    let env = suite.env_overrides();
    assert_eq!(env.get("ENV_ORCHESTRATOR_FLOW").unwrap(), "both");
    assert_eq!(
        env.get("ENV_ORCHESTRATOR_TARGETS").unwrap(),
        "cluster-a,cluster-b"
    );
    assert_eq!(
        env.get("ENV_ORCHESTRATOR_CLUSTER_A_CLUSTER").unwrap(),
        "system-tests-cluster-a"
    );
    assert_eq!(
        env.get("ENV_ORCHESTRATOR_CLUSTER_B_CONTEXT").unwrap(),
        "kind-system-tests-cluster-b"
    );
    assert_eq!(suite.working_dir(), Some(Path::new("/repo")));
}

#[tokio::test(start_paused = true)]
async fn test_command_override_wins() {
    let runner = MockRunner::healthy();
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("object_store_only"), None).unwrap();
    let command = vec!["cargo".to_string(), "test".to_string(), "--test".to_string(), "system".to_string()];

    orchestrator.run(&plan, &command).await.unwrap();

    assert_eq!(runner.count_matching("cargo test --test system"), 1);
    assert_eq!(runner.count_matching(SUITE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_failure_skips_suite() {
    let runner = MockRunner::healthy().on(
        "upgrade --install",
        MockResponse::fail(1, "Error: INSTALLATION FAILED"),
    );
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let err = orchestrator.run(&plan, &[]).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Provision(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(runner.count_matching(SUITE), 0);
    assert_eq!(
        runner.count_matching("kind delete cluster --name system-tests-cluster-a"),
        1,
        "teardown runs exactly once on the failure path"
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_command_fails_before_provisioning() {
    let yaml = TWO_CLUSTER_YAML.replace("suite:\n  command: [make, system-test]\n", "");
    let runner = MockRunner::healthy();
    let orchestrator = Orchestrator::new(&runner, descriptor_from(&yaml));
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let err = orchestrator.run(&plan, &[]).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Suite(SuiteError::NoCommand)));
    assert_eq!(err.exit_code(), 5);
    assert!(runner.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_suite_timeout_is_error_after_teardown() {
    let runner = MockRunner::healthy().on(SUITE, MockResponse::timeout("ok 1 - partial\n"));
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("object_store_only"), None).unwrap();

    let err = orchestrator.run(&plan, &[]).await.unwrap_err();

    match &err {
        OrchestratorError::Suite(SuiteError::TimedOut(source)) => {
            assert_eq!(source.stdout(), Some("ok 1 - partial\n"));
        }
        other => panic!("expected suite timeout, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 5);
    assert_eq!(runner.count_matching("kind delete cluster"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_continues_after_a_failed_delete() {
    let runner = MockRunner::healthy().on(
        "kind delete cluster --name system-tests-cluster-a",
        MockResponse::fail(1, "ERROR: failed to delete cluster"),
    );
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let report = orchestrator.run(&plan, &[]).await.unwrap();

    assert!(report.suite.passed());
    assert_eq!(report.teardown.attempted(), 2);
    assert_eq!(report.teardown.deleted, vec!["system-tests-cluster-b"]);
    assert_eq!(report.teardown.failures.len(), 1);
    assert_eq!(report.teardown.failures[0].target, "cluster-a");
}

#[tokio::test(start_paused = true)]
async fn test_down_deletes_flow_clusters() {
    let runner = MockRunner::new();
    let orchestrator = orchestrator(&runner);
    let plan = orchestrator.plan(Some("both"), None).unwrap();

    let report = orchestrator.down(&plan).await;

    assert_eq!(
        report.deleted,
        vec!["system-tests-cluster-a", "system-tests-cluster-b"]
    );
    assert_eq!(
        runner.command_lines(),
        vec![
            "kind delete cluster --name system-tests-cluster-a",
            "kind delete cluster --name system-tests-cluster-b",
        ]
    );
}

#[test]
fn test_plan_infers_flow_from_working_directory() {
    let runner = MockRunner::new();
    let orchestrator = orchestrator(&runner);

    let plan = orchestrator
        .plan(None, Some(Path::new("/repo/tests/flows/object_store_only")))
        .unwrap();
    assert_eq!(plan.flow(), "object_store_only");

    let plan = orchestrator.plan(None, Some(Path::new("/repo"))).unwrap();
    assert_eq!(plan.flow(), "both", "falls back to defaultFlow");
}
