//! Quorum CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod cluster;
mod ops;

use kube::Resource;

pub use cluster::{Cluster, ClusterPhase, ClusterSpec, ClusterStatus, ComponentSpec, InstanceTemplate};
pub use ops::{
    HorizontalScaling, InstanceReplicasTemplate, LastComponentConfiguration, LastConfiguration, OpsComponentStatus, OpsPhase, OpsRequest,
    OpsRequestSpec, OpsRequestStatus, OpsType, ProgressDetail, ProgressStatus, ReplicaChanger, ScaleIn, ScaleOut, ValidatePolicy,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for Cluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for OpsRequest {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
