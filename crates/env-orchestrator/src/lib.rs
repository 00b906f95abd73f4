//! Env Orchestrator
//!
//! Provisions ephemeral kind clusters and the infrastructure a system-test
//! flow needs, waits for everything to become ready, runs the suite, and
//! tears the clusters down again.
//!
//! # Architecture
//!
//! ```text
//! ConfigResolver ─► PlanResolver ─► Provisioner ─► test suite ─► TeardownCoordinator
//!                                      │    │
//!                         CommandRunner    poll_until_ready
//!                      (kind/helm/kubectl/     (probes)
//!                           docker)
//! ```
//!
//! # Modules
//!
//! - [`config`]: descriptor discovery, defaults, validation
//! - [`plan`]: flow selection and plan resolution
//! - [`process`]: external command execution
//! - [`readiness`]: bounded-backoff polling
//! - [`probes`]: capability interfaces and ready-made probes
//! - [`tools`]: kind, helm, kubectl, docker wrappers
//! - [`provisioner`]: ordered, all-or-nothing provisioning
//! - [`teardown`]: collect-and-continue cluster deletion
//! - [`suite`]: running the test command against provisioned targets
//! - [`orchestrator`]: one full run
//! - [`errors`]: top-level error and exit codes
//! - [`observability`]: tracing setup

pub mod config;
pub mod errors;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod probes;
pub mod process;
pub mod provisioner;
pub mod readiness;
pub mod suite;
pub mod teardown;
pub mod tools;
