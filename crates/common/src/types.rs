//! Infrastructure capability types.
//!
//! A [`Capability`] names one piece of infrastructure a test flow needs on a
//! cluster target. An [`InfraCapabilitySet`] is the immutable set of
//! capabilities requested for a single target.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A named infrastructure requirement.
///
/// The declaration order is the provisioning order: services that later
/// capabilities may depend on come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Object-store / cloud API emulation (LocalStack).
    ObjectStore,
    /// Seed data loaded into the emulated key-value store by a job.
    SeedData,
    /// Message bus (NATS).
    MessageBus,
    /// Cache (Redis).
    Cache,
    /// Deployment controller (Argo CD).
    DeploymentController,
}

impl Capability {
    /// All capabilities, in provisioning order.
    pub const ALL: [Capability; 5] = [
        Capability::ObjectStore,
        Capability::SeedData,
        Capability::MessageBus,
        Capability::Cache,
        Capability::DeploymentController,
    ];

    /// Descriptor / CLI name of the capability.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ObjectStore => "objectStore",
            Capability::SeedData => "seedData",
            Capability::MessageBus => "messageBus",
            Capability::Cache => "cache",
            Capability::DeploymentController => "deploymentController",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Capability::ObjectStore => 1,
            Capability::SeedData => 1 << 1,
            Capability::MessageBus => 1 << 2,
            Capability::Cache => 1 << 3,
            Capability::DeploymentController => 1 << 4,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a capability name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown capability '{0}' (expected one of: objectStore, seedData, messageBus, cache, deploymentController)")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the descriptor spelling as well as the "needsX" flag spelling.
        let name = s.strip_prefix("needs").unwrap_or(s);
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable set of capability flags for one target.
///
/// Iteration always yields capabilities in provisioning order, regardless
/// of the order they were declared in.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InfraCapabilitySet {
    bits: u8,
}

impl InfraCapabilitySet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Whether `capability` is requested.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    /// Whether no capability is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of requested capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Requested capabilities in provisioning order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> {
        let set = *self;
        Capability::ALL.into_iter().filter(move |c| set.contains(*c))
    }

    /// Convenience for the object-store flag.
    #[must_use]
    pub fn needs_object_store(&self) -> bool {
        self.contains(Capability::ObjectStore)
    }

    /// Convenience for the seed-data flag.
    #[must_use]
    pub fn needs_seed_data(&self) -> bool {
        self.contains(Capability::SeedData)
    }

    /// Convenience for the message-bus flag.
    #[must_use]
    pub fn needs_message_bus(&self) -> bool {
        self.contains(Capability::MessageBus)
    }

    /// Convenience for the cache flag.
    #[must_use]
    pub fn needs_cache(&self) -> bool {
        self.contains(Capability::Cache)
    }

    /// Convenience for the deployment-controller flag.
    #[must_use]
    pub fn needs_deployment_controller(&self) -> bool {
        self.contains(Capability::DeploymentController)
    }
}

impl FromIterator<Capability> for InfraCapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let bits = iter.into_iter().fold(0, |acc, c| acc | c.bit());
        Self { bits }
    }
}

impl<const N: usize> From<[Capability; N]> for InfraCapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

impl fmt::Debug for InfraCapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for InfraCapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Capability::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

impl Serialize for InfraCapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Accepted spellings: a list of names (`[objectStore, seedData]`) or a map
/// of flags (`{needsObjectStore: true, seedData: false}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum CapabilityRepr {
    List(Vec<Capability>),
    Flags(BTreeMap<String, bool>),
}

impl<'de> Deserialize<'de> for InfraCapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match CapabilityRepr::deserialize(deserializer)? {
            CapabilityRepr::List(caps) => Ok(caps.into_iter().collect()),
            CapabilityRepr::Flags(flags) => {
                let mut set = Vec::with_capacity(flags.len());
                for (name, enabled) in flags {
                    let cap: Capability = name.parse().map_err(serde::de::Error::custom)?;
                    if enabled {
                        set.push(cap);
                    }
                }
                Ok(set.into_iter().collect())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_follows_provisioning_order() {
        let set: InfraCapabilitySet = [
            Capability::DeploymentController,
            Capability::ObjectStore,
            Capability::MessageBus,
        ]
        .into();

        let order: Vec<Capability> = set.iter().collect();
        assert_eq!(
            order,
            vec![
                Capability::ObjectStore,
                Capability::MessageBus,
                Capability::DeploymentController
            ]
        );
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_parse_accepts_needs_prefix() {
        assert_eq!(
            "needsObjectStore".parse::<Capability>().unwrap(),
            Capability::ObjectStore
        );
        assert_eq!("cache".parse::<Capability>().unwrap(), Capability::Cache);
        assert!("kafka".parse::<Capability>().is_err());
    }

    #[test]
    fn test_deserialize_list_and_flag_forms() {
        let from_list: InfraCapabilitySet =
            serde_yaml::from_str("[seedData, objectStore]").unwrap();
        let from_flags: InfraCapabilitySet =
            serde_yaml::from_str("{needsObjectStore: true, needsSeedData: true, cache: false}")
                .unwrap();

        assert_eq!(from_list, from_flags);
        assert!(from_list.needs_object_store());
        assert!(from_list.needs_seed_data());
        assert!(!from_list.needs_cache());
    }

    #[test]
    fn test_deserialize_rejects_unknown_capability() {
        let result: Result<InfraCapabilitySet, _> = serde_yaml::from_str("[objectStore, kafka]");
        assert!(result.is_err());
    }

    #[test]
    fn test_serializes_as_ordered_list() {
        let set: InfraCapabilitySet = [Capability::Cache, Capability::SeedData].into();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["seedData","cache"]"#);
    }
}
