//! # Env Orchestrator Test Utilities
//!
//! Mocks and fixtures for exercising provisioning, teardown, and probes
//! without kind, helm, kubectl, or docker installed.
//!
//! ## Modules
//!
//! - `mock_runner` - Scripted [`CommandRunner`](env_orchestrator::process::CommandRunner)
//!   that records every command
//! - `fake_stores` - In-memory key-value store, object store, and deployment controller
//! - `fixtures` - Descriptor YAML and on-disk fixture repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use env_orchestrator::provisioner::Provisioner;
//! use env_orchestrator_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let runner = MockRunner::healthy();
//!     let descriptor = fixtures::two_cluster_descriptor();
//!     let plan = fixtures::plan(&descriptor, "both");
//!
//!     Provisioner::new(&runner).provision(&plan, &descriptor).await.unwrap();
//!     assert_eq!(runner.count_matching("kind create cluster"), 2);
//! }
//! ```

pub mod fake_stores;
pub mod fixtures;
pub mod mock_runner;

pub use fake_stores::{FakeDeploymentController, InMemoryKeyValueStore, InMemoryObjectStore};
pub use mock_runner::{MockResponse, MockRunner};
