//! Typed wrappers over the external provisioning tools.
//!
//! Each wrapper only builds argument vectors and interprets exit status and
//! output; execution goes through a [`CommandRunner`](crate::process::CommandRunner).

pub mod docker;
pub mod helm;
pub mod kind;
pub mod kubectl;

pub use docker::Docker;
pub use helm::{Helm, HelmRelease};
pub use kind::{ClusterCreation, Kind};
pub use kubectl::{JobStatus, JobSucceeded, Kubectl};
