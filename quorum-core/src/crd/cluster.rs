//! Cluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Cluster = ClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Cluster resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ClusterCRD",
    status = "ClusterStatus",
    group = "quorum.rs",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "qcluster",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The independently scaled components making up this cluster.
    pub components: Vec<ComponentSpec>,
}

impl ClusterCRD {
    /// Get the declared spec of the named component, if any.
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.spec.components.iter().find(|comp| comp.name == name)
    }

    /// Get a mutable handle to the declared spec of the named component, if any.
    pub fn component_mut(&mut self, name: &str) -> Option<&mut ComponentSpec> {
        self.spec.components.iter_mut().find(|comp| comp.name == name)
    }
}

/// The declared topology of a single cluster component.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// The name of this component, unique within its cluster.
    pub name: String,
    /// The container image run by this component's instances.
    #[serde(default)]
    pub image: String,
    /// The port exposed by the database engine, defaulting to 5432.
    #[serde(default)]
    pub service_port: Option<i32>,
    /// The number of active instances of this component.
    pub replicas: i32,
    /// Named instance templates carving sub-groups out of `replicas`.
    ///
    /// The sum of all template replica counts must never exceed `replicas`; the remainder is
    /// served by the anonymous default template.
    #[serde(default)]
    pub instances: Vec<InstanceTemplate>,
    /// Instances excluded from the active topology but retained in naming bookkeeping.
    #[serde(default)]
    pub offline_instances: Vec<String>,
}

impl ComponentSpec {
    /// The total number of replicas claimed by this component's instance templates.
    pub fn template_replicas(&self) -> i32 {
        self.instances.iter().map(InstanceTemplate::replicas).sum()
    }

    /// The effective service port of this component's database engine.
    pub fn service_port(&self) -> i32 {
        self.service_port.unwrap_or(5432)
    }
}

/// A named sub-group within a component with its own replica count.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    /// The name of this template, unique within its component.
    pub name: String,
    /// The number of instances generated from this template, defaulting to 1.
    #[serde(default)]
    pub replicas: Option<i32>,
}

impl InstanceTemplate {
    /// The effective replica count of this template.
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The observed lifecycle phase of the cluster.
    #[serde(default)]
    pub phase: ClusterPhase,
}

/// The observed lifecycle phase of a cluster.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub enum ClusterPhase {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Failed,
    Abnormal,
}

impl ClusterPhase {
    /// Phases from which mutating operations may be admitted.
    ///
    /// Abnormal and Failed clusters are included, as a new operation may repair them.
    pub fn is_up_running(&self) -> bool {
        matches!(self, Self::Running | Self::Updating | Self::Abnormal | Self::Failed)
    }
}

impl Default for ClusterPhase {
    fn default() -> Self {
        Self::Creating
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Creating => "Creating",
                Self::Running => "Running",
                Self::Updating => "Updating",
                Self::Stopping => "Stopping",
                Self::Stopped => "Stopped",
                Self::Failed => "Failed",
                Self::Abnormal => "Abnormal",
            }
        )
    }
}
