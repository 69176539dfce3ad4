//! OpsRequest CRD.
//!
//! An OpsRequest declares one mutating operation against a cluster — currently horizontal
//! scaling — and carries the operation's full lifecycle on its status: phase, the
//! configuration snapshot taken before the action mutated the cluster, and per-instance
//! progress details.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::cluster::InstanceTemplate;

pub type OpsRequest = OpsRequestCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the OpsRequest resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "OpsRequestCRD",
    status = "OpsRequestStatus",
    group = "quorum.rs",
    version = "v1alpha1",
    kind = "OpsRequest",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "qops",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    /// The name of the target cluster.
    pub cluster_name: String,
    /// The kind of operation requested.
    #[serde(rename = "type")]
    pub ops_type: OpsType,
    /// Request cancellation of this operation.
    ///
    /// Cancellation is cooperative: it takes effect on the next reconcile tick, reverting all
    /// in-flight changes made by this operation.
    #[serde(default)]
    pub cancel: bool,
    /// The validation policy applied to named instance lists.
    #[serde(default)]
    pub validate_policy: ValidatePolicy,
    /// The horizontal scaling request for each target component.
    #[serde(default)]
    pub horizontal_scaling: Vec<HorizontalScaling>,
}

impl OpsRequestCRD {
    /// The current phase of this operation.
    pub fn phase(&self) -> OpsPhase {
        self.status.as_ref().map(|status| status.phase).unwrap_or(OpsPhase::Pending)
    }

    /// Returns `true` if this operation has reached a terminal phase and is immutable.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Get the horizontal scaling entry for the named component, if any.
    pub fn horizontal_scaling_for(&self, component: &str) -> Option<&HorizontalScaling> {
        self.spec.horizontal_scaling.iter().find(|hs| hs.component_name == component)
    }

    /// Get the recorded pre-action configuration of the named component, if any.
    pub fn last_configuration_for(&self, component: &str) -> Option<&LastComponentConfiguration> {
        self.status
            .as_ref()
            .and_then(|status| status.last_configuration.components.get(component))
    }
}

/// The closed set of operation kinds.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum OpsType {
    HorizontalScaling,
}

impl std::fmt::Display for OpsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::HorizontalScaling => "HorizontalScaling",
            }
        )
    }
}

/// The validation policy applied to instance names given in a request.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub enum ValidatePolicy {
    /// Named instances must already be in the expected online/offline state, and duplicate
    /// names are rejected.
    Strict,
    /// Only instance names outside the component's instance universe are rejected.
    Permissive,
}

impl Default for ValidatePolicy {
    fn default() -> Self {
        Self::Strict
    }
}

/// A horizontal scaling intent for one component.
///
/// Either an absolute `replicas` value, or named scale-in/scale-out deltas. The two modes are
/// mutually exclusive.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    /// The name of the target component.
    pub component_name: String,
    /// Absolute mode: the desired replica count, overwriting the current value.
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Delta mode: instances to remove from the active topology.
    #[serde(default)]
    pub scale_in: Option<ScaleIn>,
    /// Delta mode: instances to add to the active topology.
    #[serde(default)]
    pub scale_out: Option<ScaleOut>,
}

/// Per-template replica deltas applied by a scale-in or scale-out.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaChanger {
    /// The aggregate replica delta; when unset it is synthesized from the per-template
    /// entries and named instance lists.
    #[serde(default)]
    pub replica_changes: Option<i32>,
    /// Per-template replica deltas.
    #[serde(default)]
    pub instances: Vec<InstanceReplicasTemplate>,
}

/// A replica delta against one named instance template.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReplicasTemplate {
    /// The name of the target instance template.
    pub name: String,
    /// The number of replicas to add or remove.
    pub replica_changes: i32,
}

/// The scale-in half of a delta-mode scaling intent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleIn {
    #[serde(flatten)]
    pub replica_changer: ReplicaChanger,
    /// Names of online instances to move to the offline set.
    #[serde(default)]
    pub online_instances_to_offline: Vec<String>,
}

/// The scale-out half of a delta-mode scaling intent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOut {
    #[serde(flatten)]
    pub replica_changer: ReplicaChanger,
    /// Names of offline instances to bring back online.
    #[serde(default)]
    pub offline_instances_to_online: Vec<String>,
    /// Brand-new instance templates introduced by this scale-out.
    #[serde(default)]
    pub new_instances: Vec<InstanceTemplate>,
}

/// The phase of an operation's lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum OpsPhase {
    Pending,
    Creating,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
    /// Terminal phase of an earlier operation force-terminated by a conflicting newer one.
    Aborted,
}

impl OpsPhase {
    /// Returns `true` if this phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled | Self::Aborted)
    }
}

impl Default for OpsPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for OpsPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "Pending",
                Self::Creating => "Creating",
                Self::Running => "Running",
                Self::Succeeded => "Succeeded",
                Self::Failed => "Failed",
                Self::Cancelling => "Cancelling",
                Self::Cancelled => "Cancelled",
                Self::Aborted => "Aborted",
            }
        )
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    /// The current phase of the operation.
    #[serde(default)]
    pub phase: OpsPhase,
    /// Aggregate progress rendered as `completed/total`.
    #[serde(default)]
    pub progress: String,
    /// A human-readable message describing a terminal failure or abort.
    #[serde(default)]
    pub message: Option<String>,
    /// A point-in-time copy of the mutated values, taken immediately before the action step.
    #[serde(default)]
    pub last_configuration: LastConfiguration,
    /// Per-component operation status.
    #[serde(default)]
    pub components: BTreeMap<String, OpsComponentStatus>,
}

/// Pre-action configuration snapshots, keyed by component name.
///
/// Immutable once written: read by cancellation and by the conflict checks of later
/// operations.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastConfiguration {
    #[serde(default)]
    pub components: BTreeMap<String, LastComponentConfiguration>,
}

/// The configuration of one component as it was before the operation's action executed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastComponentConfiguration {
    pub replicas: i32,
    #[serde(default)]
    pub instances: Vec<InstanceTemplate>,
    #[serde(default)]
    pub offline_instances: Vec<String>,
}

/// Per-component progress of an operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpsComponentStatus {
    /// Progress of each tracked instance transition, keyed by instance name.
    #[serde(default)]
    pub progress_details: BTreeMap<String, ProgressDetail>,
}

/// Progress of a single tracked instance transition.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetail {
    /// The current status of this transition.
    pub status: ProgressStatus,
    /// A human-readable description of the transition.
    #[serde(default)]
    pub message: String,
}

/// The status of a tracked instance transition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ProgressStatus {
    Processing,
    Succeeded,
}
