//! Capability interfaces for probed systems and the ready-made probes built
//! on them.
//!
//! Client libraries (key-value store, object store, deployment controller)
//! are consumed only through these traits; wire protocols stay behind the
//! implementations. Each probe turns one observation into a
//! [`PollOutcome`] for [`poll_until_ready`](crate::readiness::poll_until_ready).

use crate::readiness::{poll_for, Backoff, PollError, PollOutcome, ProbeError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Key-value store (table) reads used for readiness checks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, ProbeError>;

    /// Current value of `attribute` on `key`; `None` when the key or the
    /// attribute is absent.
    async fn get_attribute(&self, key: &str, attribute: &str)
        -> Result<Option<String>, ProbeError>;
}

/// Object store (bucket) operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ProbeError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProbeError>;

    async fn exists(&self, key: &str) -> Result<bool, ProbeError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProbeError>;
}

/// Rollout state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    Ready,
    /// Not rolled out yet, with the controller's progress message.
    NotReady(String),
}

/// Deployment controller queries.
#[async_trait]
pub trait DeploymentController: Send + Sync {
    async fn rollout_status(&self, name: &str) -> Result<RolloutStatus, ProbeError>;
}

/// A single readiness check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// What a not-ready observation reports.
    type Observed: fmt::Debug + Send;

    async fn check(&self) -> PollOutcome<Self::Observed>;
}

/// Poll `probe` until ready or `timeout` elapses.
///
/// # Errors
///
/// Returns the poller's [`PollError`] unchanged.
pub async fn wait_for<P: Probe + ?Sized>(
    probe: &P,
    timeout: Duration,
    backoff: Backoff,
) -> Result<(), PollError<P::Observed>> {
    poll_for(|| probe.check(), timeout, backoff).await
}

fn from_result<T>(
    result: Result<T, ProbeError>,
    ready: impl FnOnce(T) -> PollOutcome<String>,
) -> PollOutcome<String> {
    match result {
        Ok(value) => ready(value),
        Err(e) => PollOutcome::ProbeFailed(e),
    }
}

/// Ready once `key` exists in the store.
pub struct KeyExists<'a, S: ?Sized> {
    store: &'a S,
    key: String,
}

impl<'a, S: KeyValueStore + ?Sized> KeyExists<'a, S> {
    pub fn new(store: &'a S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl<'a, S: KeyValueStore + ?Sized> Probe for KeyExists<'a, S> {
    type Observed = String;

    async fn check(&self) -> PollOutcome<String> {
        from_result(self.store.exists(&self.key).await, |found| {
            if found {
                PollOutcome::Ready
            } else {
                PollOutcome::NotYetReady(format!("key '{}' not present", self.key))
            }
        })
    }
}

/// Ready once `attribute` on `key` equals `expected`.
///
/// Covers status-change waits such as a table moving from `CREATING` to
/// `ACTIVE`.
pub struct AttributeEquals<'a, S: ?Sized> {
    store: &'a S,
    key: String,
    attribute: String,
    expected: String,
}

impl<'a, S: KeyValueStore + ?Sized> AttributeEquals<'a, S> {
    pub fn new(
        store: &'a S,
        key: impl Into<String>,
        attribute: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            attribute: attribute.into(),
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl<'a, S: KeyValueStore + ?Sized> Probe for AttributeEquals<'a, S> {
    type Observed = String;

    async fn check(&self) -> PollOutcome<String> {
        let current = self.store.get_attribute(&self.key, &self.attribute).await;
        from_result(current, |value| match value {
            Some(v) if v == self.expected => PollOutcome::Ready,
            Some(v) => PollOutcome::NotYetReady(format!("{}={v}", self.attribute)),
            None => PollOutcome::NotYetReady(format!("{} not set", self.attribute)),
        })
    }
}

/// Ready once `key` exists in the object store.
pub struct ObjectExists<'a, S: ?Sized> {
    store: &'a S,
    key: String,
}

impl<'a, S: ObjectStore + ?Sized> ObjectExists<'a, S> {
    pub fn new(store: &'a S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl<'a, S: ObjectStore + ?Sized> Probe for ObjectExists<'a, S> {
    type Observed = String;

    async fn check(&self) -> PollOutcome<String> {
        from_result(self.store.exists(&self.key).await, |found| {
            if found {
                PollOutcome::Ready
            } else {
                PollOutcome::NotYetReady(format!("object '{}' not present", self.key))
            }
        })
    }
}

/// Ready once the named deployment has rolled out.
pub struct RolloutReady<'a, C: ?Sized> {
    controller: &'a C,
    deployment: String,
}

impl<'a, C: DeploymentController + ?Sized> RolloutReady<'a, C> {
    pub fn new(controller: &'a C, deployment: impl Into<String>) -> Self {
        Self {
            controller,
            deployment: deployment.into(),
        }
    }
}

#[async_trait]
impl<'a, C: DeploymentController + ?Sized> Probe for RolloutReady<'a, C> {
    type Observed = String;

    async fn check(&self) -> PollOutcome<String> {
        from_result(
            self.controller.rollout_status(&self.deployment).await,
            |status| match status {
                RolloutStatus::Ready => PollOutcome::Ready,
                RolloutStatus::NotReady(detail) => PollOutcome::NotYetReady(detail),
            },
        )
    }
}
