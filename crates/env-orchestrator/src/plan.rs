//! Flow selection and plan resolution.
//!
//! A flow names a test scenario; its definition maps target keys to the
//! capabilities that scenario needs. Resolving a flow against the
//! descriptor yields a [`Plan`]. Resolution has no side effects and fails
//! before anything is provisioned.

use crate::config::EnvironmentDescriptor;
use common::types::{Capability, InfraCapabilitySet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Target key used by every flow of the built-in catalog.
pub const BUILTIN_TARGET: &str = "lab";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Unknown flow '{name}' (known flows: {})", .known.join(", "))]
    UnknownFlow { name: String, known: Vec<String> },

    #[error("Flow '{flow}' references target '{target}', which is not declared under clusters (declared: {})", .declared.join(", "))]
    TargetNotFound {
        flow: String,
        target: String,
        declared: Vec<String>,
    },

    #[error("No flow selected: pass --flow, run from a flow directory, or set defaultFlow")]
    NoFlowSelected,
}

/// Target key to capabilities, for one flow.
pub type FlowDefinition = BTreeMap<String, InfraCapabilitySet>;

/// Named flows known to a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowCatalog {
    flows: BTreeMap<String, FlowDefinition>,
}

impl FlowCatalog {
    /// The catalog used when a descriptor declares no flows.
    ///
    /// | Flow | Capabilities on `lab` |
    /// |---|---|
    /// | `aws_only` | objectStore, seedData |
    /// | `event_flow` | objectStore, seedData, messageBus, cache |
    /// | `platform_flow` | messageBus, cache, deploymentController |
    pub fn builtin() -> Self {
        use Capability::{Cache, DeploymentController, MessageBus, ObjectStore, SeedData};

        let on_lab = |caps: InfraCapabilitySet| -> FlowDefinition {
            BTreeMap::from([(BUILTIN_TARGET.to_string(), caps)])
        };

        Self::default()
            .with_flow("aws_only", on_lab([ObjectStore, SeedData].into()))
            .with_flow(
                "event_flow",
                on_lab([ObjectStore, SeedData, MessageBus, Cache].into()),
            )
            .with_flow(
                "platform_flow",
                on_lab([MessageBus, Cache, DeploymentController].into()),
            )
    }

    /// Add or replace a flow.
    #[must_use]
    pub fn with_flow(mut self, name: impl Into<String>, definition: FlowDefinition) -> Self {
        self.flows.insert(name.into(), definition);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Flow names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// How the flow for a run was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSelection {
    /// `--flow` or `ENV_ORCHESTRATOR_FLOW`.
    Explicit(String),
    /// A component of the working directory path.
    Inferred(String),
    /// The descriptor's `defaultFlow`.
    Default(String),
}

impl FlowSelection {
    pub fn name(&self) -> &str {
        match self {
            Self::Explicit(name) | Self::Inferred(name) | Self::Default(name) => name,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Self::Explicit(_) => "explicit",
            Self::Inferred(_) => "working directory",
            Self::Default(_) => "defaultFlow",
        }
    }
}

impl fmt::Display for FlowSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.source())
    }
}

/// Resolved provisioning plan for one flow.
///
/// Targets iterate in sorted key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    flow: String,
    targets: BTreeMap<String, InfraCapabilitySet>,
}

impl Plan {
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// `(target key, capabilities)` in provisioning order.
    pub fn targets(&self) -> impl Iterator<Item = (&str, InfraCapabilitySet)> {
        self.targets.iter().map(|(k, caps)| (k.as_str(), *caps))
    }

    pub fn target_keys(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn capabilities(&self, target: &str) -> Option<InfraCapabilitySet> {
        self.targets.get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Resolves flows against one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PlanResolver<'a> {
    descriptor: &'a EnvironmentDescriptor,
}

impl<'a> PlanResolver<'a> {
    pub fn new(descriptor: &'a EnvironmentDescriptor) -> Self {
        Self { descriptor }
    }

    /// Choose a flow: explicit override, else a working-directory component,
    /// else the descriptor's default.
    ///
    /// An explicit name is returned as-is so an unknown override fails in
    /// [`resolve`](Self::resolve) instead of being replaced.
    pub fn select(&self, explicit: Option<&str>, cwd: Option<&Path>) -> Result<FlowSelection, PlanError> {
        if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
            return Ok(FlowSelection::Explicit(name.to_string()));
        }
        if let Some(name) = cwd.and_then(|dir| infer_flow(&self.descriptor.flows, dir)) {
            return Ok(FlowSelection::Inferred(name));
        }
        self.descriptor
            .default_flow
            .clone()
            .map(FlowSelection::Default)
            .ok_or(PlanError::NoFlowSelected)
    }

    /// Build the plan for `flow`.
    pub fn resolve(&self, flow: &str) -> Result<Plan, PlanError> {
        let flows = &self.descriptor.flows;
        let definition = flows.get(flow).ok_or_else(|| PlanError::UnknownFlow {
            name: flow.to_string(),
            known: flows.names().map(str::to_string).collect(),
        })?;

        if let Some(missing) = definition
            .keys()
            .find(|target| !self.descriptor.clusters.contains_key(*target))
        {
            return Err(PlanError::TargetNotFound {
                flow: flow.to_string(),
                target: missing.clone(),
                declared: self.descriptor.clusters.keys().cloned().collect(),
            });
        }

        let plan = Plan {
            flow: flow.to_string(),
            targets: definition.clone(),
        };
        debug!(
            target: "orchestrator.plan",
            flow = %plan.flow,
            targets = plan.len(),
            "Resolved plan"
        );
        Ok(plan)
    }

    /// [`select`](Self::select) then [`resolve`](Self::resolve).
    pub fn resolve_selected(
        &self,
        explicit: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<Plan, PlanError> {
        let selection = self.select(explicit, cwd)?;
        info!(target: "orchestrator.plan", flow = %selection, "Selected flow");
        self.resolve(selection.name())
    }
}

/// Deepest component of `dir` that names a known flow.
pub fn infer_flow(flows: &FlowCatalog, dir: &Path) -> Option<String> {
    dir.components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|segment| flows.contains(segment))
        .map(str::to_string)
}
