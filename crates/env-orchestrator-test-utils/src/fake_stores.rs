//! In-memory implementations of the probed capability interfaces.
//!
//! Each fake counts reads and can be told to fail the next N calls, so
//! probe and poller behavior can be driven deterministically.

use async_trait::async_trait;
use env_orchestrator::probes::{DeploymentController, KeyValueStore, ObjectStore, RolloutStatus};
use env_orchestrator::readiness::ProbeError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Shared failure injection and read counting.
#[derive(Debug, Default)]
struct Faults {
    pending: VecDeque<ProbeError>,
    reads: usize,
}

impl Faults {
    fn read(&mut self) -> Result<(), ProbeError> {
        self.reads += 1;
        match self.pending.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Key-value store
// ============================================================================

#[derive(Debug, Default)]
struct KvInner {
    items: HashMap<String, BTreeMap<String, String>>,
    faults: Faults,
}

/// Table-like store: items keyed by string, each with string attributes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyValueStore {
    inner: Arc<Mutex<KvInner>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item.
    pub fn with_item<I, K, V>(self, key: &str, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.put_item(key, attributes);
        self
    }

    pub fn put_item<I, K, V>(&self, key: &str, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.inner
            .lock()
            .unwrap()
            .items
            .insert(key.to_string(), attributes);
    }

    pub fn set_attribute(&self, key: &str, attribute: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .items
            .entry(key.to_string())
            .or_default()
            .insert(attribute.to_string(), value.to_string());
    }

    /// Fail the next call with `error` (queued after earlier failures).
    pub fn fail_next(&self, error: ProbeError) {
        self.inner.lock().unwrap().faults.pending.push_back(error);
    }

    /// Number of `exists`/`get_attribute` calls so far.
    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().faults.reads
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn exists(&self, key: &str) -> Result<bool, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        Ok(inner.items.contains_key(key))
    }

    async fn get_attribute(
        &self,
        key: &str,
        attribute: &str,
    ) -> Result<Option<String>, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        Ok(inner
            .items
            .get(key)
            .and_then(|item| item.get(attribute))
            .cloned())
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Default)]
struct ObjectInner {
    objects: BTreeMap<String, Vec<u8>>,
    faults: Faults,
}

/// Bucket-like store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    inner: Arc<Mutex<ObjectInner>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ProbeError) {
        self.inner.lock().unwrap().faults.pending.push_back(error);
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().faults.reads
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ProbeError> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        Ok(inner.objects.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        Ok(inner.objects.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Deployment controller
// ============================================================================

#[derive(Debug, Default)]
struct DeploymentInner {
    /// Played in order per deployment; the last one repeats.
    rollouts: HashMap<String, VecDeque<RolloutStatus>>,
    faults: Faults,
}

/// Deployment controller with scripted rollout progress.
///
/// Unknown deployments fail with a transient "not found" error, like a
/// controller queried before the manifest is applied.
#[derive(Debug, Clone, Default)]
pub struct FakeDeploymentController {
    inner: Arc<Mutex<DeploymentInner>>,
}

impl FakeDeploymentController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `statuses` for `name`, in order; the last one repeats.
    pub fn with_rollout(self, name: &str, statuses: Vec<RolloutStatus>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .rollouts
            .insert(name.to_string(), statuses.into());
        self
    }

    pub fn fail_next(&self, error: ProbeError) {
        self.inner.lock().unwrap().faults.pending.push_back(error);
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().faults.reads
    }
}

#[async_trait]
impl DeploymentController for FakeDeploymentController {
    async fn rollout_status(&self, name: &str) -> Result<RolloutStatus, ProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.read()?;
        let statuses = inner
            .rollouts
            .get_mut(name)
            .ok_or_else(|| ProbeError::transient(format!("deployment {name} not found")))?;
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(status.unwrap_or(RolloutStatus::NotReady("no status".to_string())))
    }
}
