//! Provisioner scenarios against a scripted command runner.
//!
//! Every external command is answered by `MockRunner`, so these tests check
//! ordering, teardown scope, and error propagation without kind or helm.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use common::types::Capability;
use env_orchestrator::process::ProcessError;
use env_orchestrator::provisioner::{CapabilityStatus, ProvisionError, Provisioner};
use env_orchestrator::readiness::PollError;
use env_orchestrator_test_utils::fixtures::{plan, two_cluster_descriptor};
use env_orchestrator_test_utils::{MockResponse, MockRunner};
use std::time::Duration;

const CREATE_A: &str = "kind create cluster --name system-tests-cluster-a";
const CREATE_B: &str = "kind create cluster --name system-tests-cluster-b";
const DELETE_A: &str = "kind delete cluster --name system-tests-cluster-a";
const DELETE_B: &str = "kind delete cluster --name system-tests-cluster-b";

#[tokio::test(start_paused = true)]
async fn test_both_flow_provisions_in_sorted_order() {
    let runner = MockRunner::healthy();
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let targets = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap();

    let keys: Vec<_> = targets.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["cluster-a", "cluster-b"]);

    let create_a = runner.expect_position(CREATE_A);
    let helm = runner.expect_position("upgrade --install localstack");
    let object_store_probe = runner.expect_position("rollout status deployment/localstack");
    let create_b = runner.expect_position(CREATE_B);
    let pull = runner.expect_position("docker image inspect");
    let load = runner.expect_position("kind load docker-image nats:2.10-alpine --name system-tests-cluster-b");
    let bus_probe = runner.expect_position("rollout status deployment/nats");

    assert!(create_a < helm);
    assert!(helm < object_store_probe);
    assert!(object_store_probe < create_b, "object-store readiness precedes cluster-b");
    assert!(create_b < pull);
    assert!(pull < load);
    assert!(load < bus_probe);

    assert_eq!(runner.count_matching("kind delete cluster"), 0);
    assert_eq!(
        targets[0].status_of(Capability::ObjectStore),
        Some(CapabilityStatus::Ready)
    );
    assert_eq!(
        targets[1].status_of(Capability::MessageBus),
        Some(CapabilityStatus::Ready)
    );
    assert!(targets.iter().all(|t| !t.reused));
}

#[tokio::test(start_paused = true)]
async fn test_commands_carry_context_and_timeouts() {
    let runner = MockRunner::healthy();
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap();

    let calls = runner.calls();
    let create = calls
        .iter()
        .find(|c| c.command_line().contains(CREATE_A))
        .unwrap();
    assert_eq!(
        create.arguments().last().map(String::as_str),
        Some("/repo/infra/kind/cluster-a.yaml")
    );
    assert_eq!(create.timeout_limit(), Some(Duration::from_secs(120)));

    let helm = calls
        .iter()
        .find(|c| c.program() == "helm")
        .unwrap();
    assert_eq!(
        helm.command_line(),
        "helm --kube-context kind-system-tests-cluster-a upgrade --install localstack \
         /repo/infra/helm/localstack --namespace localstack --create-namespace --wait --timeout 60s"
    );
    assert_eq!(helm.timeout_limit(), Some(Duration::from_secs(75)));

    let namespace = calls
        .iter()
        .find(|c| c.command_line().ends_with("apply -f -"))
        .unwrap();
    let manifest = String::from_utf8(namespace.stdin_payload().unwrap().to_vec()).unwrap();
    assert!(manifest.contains("kind: Namespace"));
    assert!(manifest.contains("name: nats"));
    assert!(namespace
        .command_line()
        .starts_with("kubectl --context kind-system-tests-cluster-b"));
}

#[tokio::test(start_paused = true)]
async fn test_failure_after_both_clusters_created_tears_down_both_once() {
    let runner = MockRunner::healthy().on(
        "kind load docker-image",
        MockResponse::fail(1, "ERROR: image: \"nats:2.10-alpine\" not present locally"),
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::CapabilityFailed {
            target,
            capability,
            source: ProcessError::NonZeroExit { stderr, .. },
        } => {
            assert_eq!(target, "cluster-b");
            assert_eq!(*capability, Capability::MessageBus);
            assert!(stderr.contains("not present locally"));
        }
        other => panic!("expected the original capability error, got {other:?}"),
    }

    assert_eq!(runner.count_matching(DELETE_A), 1);
    assert_eq!(runner.count_matching(DELETE_B), 1);
    assert!(runner.expect_position("kind load docker-image") < runner.expect_position(DELETE_A));
    assert_eq!(runner.count_matching("rollout status deployment/nats"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_first_target_stops_before_second() {
    let runner = MockRunner::healthy().on(
        "upgrade --install",
        MockResponse::fail(1, "Error: INSTALLATION FAILED: chart not found"),
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::CapabilityFailed {
            capability: Capability::ObjectStore,
            ..
        }
    ));
    assert_eq!(err.target(), "cluster-a");
    assert_eq!(runner.count_matching(CREATE_B), 0);
    assert_eq!(runner.count_matching(DELETE_A), 1);
    assert_eq!(runner.count_matching(DELETE_B), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failure_does_not_replace_original_error() {
    let runner = MockRunner::healthy()
        .on("kind load docker-image", MockResponse::fail(1, "load failed"))
        .on(DELETE_A, MockResponse::fail(1, "ERROR: failed to delete cluster"));
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("load failed"), "got: {err}");
    assert!(!err.to_string().contains("failed to delete"));
    assert_eq!(runner.count_matching(DELETE_A), 1);
    assert_eq!(runner.count_matching(DELETE_B), 1, "teardown continues past a failure");
}

#[tokio::test(start_paused = true)]
async fn test_cluster_create_failure_tears_down_earlier_targets_only() {
    let runner = MockRunner::healthy().on(
        CREATE_B,
        MockResponse::fail(1, "ERROR: failed to create cluster: docker not running"),
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::ClusterCreateFailed { target, cluster, .. } => {
            assert_eq!(target, "cluster-b");
            assert_eq!(cluster, "system-tests-cluster-b");
        }
        other => panic!("expected ClusterCreateFailed, got {other:?}"),
    }
    assert_eq!(runner.count_matching(DELETE_A), 1);
    assert_eq!(runner.count_matching(DELETE_B), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_cluster_create_is_torn_down() {
    let runner = MockRunner::healthy().on(CREATE_A, MockResponse::timeout("Preparing nodes"));
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "both");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::ClusterCreateFailed {
            source: ProcessError::Timeout { .. },
            ..
        }
    ));
    assert_eq!(err.target(), "cluster-a");
    assert_eq!(
        runner.command_lines(),
        vec![
            format!("{CREATE_A} --config /repo/infra/kind/cluster-a.yaml"),
            DELETE_A.to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_existing_cluster_is_reused() {
    let runner = MockRunner::healthy().on(
        CREATE_A,
        MockResponse::fail(
            1,
            "ERROR: failed to create cluster: node(s) already exist for a cluster with the name \"system-tests-cluster-a\"",
        ),
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "object_store_only");

    let targets = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap();

    assert_eq!(targets.len(), 1);
    assert!(targets[0].reused);
    assert_eq!(runner.count_matching("upgrade --install localstack"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_capabilities_are_recorded() {
    let runner = MockRunner::healthy();
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "unsupported");

    let targets = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap();

    let lab = &targets[0];
    assert_eq!(lab.capabilities().len(), 2);
    assert_eq!(
        lab.status_of(Capability::Cache),
        Some(CapabilityStatus::Unsupported)
    );
    assert_eq!(
        lab.status_of(Capability::DeploymentController),
        Some(CapabilityStatus::Unsupported)
    );
    assert!(lab.satisfied().is_empty());
    assert_eq!(runner.command_lines().len(), 1, "only the cluster is created");
}

#[tokio::test(start_paused = true)]
async fn test_capabilities_follow_fixed_order() {
    let runner = MockRunner::healthy();
    let descriptor = two_cluster_descriptor();
    // Declared as [seedData, objectStore].
    let plan = plan(&descriptor, "seeded");

    let targets = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap();

    let order: Vec<_> = targets[0]
        .capabilities()
        .iter()
        .map(|r| r.capability)
        .collect();
    assert_eq!(order, vec![Capability::ObjectStore, Capability::SeedData]);
    assert!(
        runner.expect_position("rollout status deployment/localstack")
            < runner.expect_position("apply -f /repo/infra/k8s/seed-job.yaml")
    );
    assert_eq!(runner.count_matching("get job seed-data"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fails_step_and_tears_down() {
    let runner = MockRunner::healthy().on(
        "rollout status deployment/localstack",
        MockResponse::stdout("Waiting for deployment \"localstack\" rollout to finish: 0 of 1 updated replicas are available...\n"),
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "object_store_only");

    let start = tokio::time::Instant::now();
    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::NotReady {
            capability: Capability::ObjectStore,
            source: PollError::Timeout { attempts, last, .. },
            ..
        } => {
            assert!(*attempts > 1);
            assert!(format!("{last:?}").contains("0 of 1 updated replicas"));
        }
        other => panic!("expected NotReady timeout, got {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(start.elapsed() <= Duration::from_secs(32));
    assert_eq!(runner.count_matching(DELETE_A), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_seed_job_stops_polling() {
    let runner = MockRunner::healthy().on_sequence(
        "get job seed-data",
        vec![MockResponse::stdout("|"), MockResponse::stdout("|True")],
    );
    let descriptor = two_cluster_descriptor();
    let plan = plan(&descriptor, "seeded");

    let err = Provisioner::new(&runner)
        .provision(&plan, &descriptor)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::NotReady {
            capability: Capability::SeedData,
            source: PollError::ProbeFailed { attempts: 2, .. },
            ..
        }
    ));
    assert_eq!(runner.count_matching("get job seed-data"), 2);
    assert_eq!(runner.count_matching(DELETE_A), 1);
}
