//! Observed-snapshot diffing and object merging.
//!
//! The diff is plain set algebra over object keys. Merging is an exhaustive, closed table
//! keyed by object kind: metadata maps are merged key-wise so that externally-owned keys on
//! the old object survive, while structural fields owned by the generator are replaced
//! wholesale from the new object. Everything else is left untouched on the old object.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::Resource;

use quorum_core::error::{OpsError, OpsResult};

/// The closed set of child-resource kinds managed by the object generation pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManagedKind {
    StatefulSet,
    Service,
    ConfigMap,
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::StatefulSet => "StatefulSet",
                Self::Service => "Service",
                Self::ConfigMap => "ConfigMap",
            }
        )
    }
}

/// The identity of a reconciled child resource: kind + namespace + name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ManagedKind,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A child resource managed by the pipeline, wrapped in its closed kind set.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    StatefulSet(StatefulSet),
    Service(Service),
    ConfigMap(ConfigMap),
}

impl ManagedObject {
    /// The kind of this object.
    pub fn kind(&self) -> ManagedKind {
        match self {
            Self::StatefulSet(_) => ManagedKind::StatefulSet,
            Self::Service(_) => ManagedKind::Service,
            Self::ConfigMap(_) => ManagedKind::ConfigMap,
        }
    }

    /// The identity key of this object.
    pub fn key(&self) -> ObjectKey {
        let meta = match self {
            Self::StatefulSet(sts) => sts.meta(),
            Self::Service(svc) => svc.meta(),
            Self::ConfigMap(cm) => cm.meta(),
        };
        ObjectKey {
            kind: self.kind(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// The name of this object.
    pub fn name(&self) -> &str {
        match self {
            Self::StatefulSet(sts) => sts.meta().name.as_deref().unwrap_or_default(),
            Self::Service(svc) => svc.meta().name.as_deref().unwrap_or_default(),
            Self::ConfigMap(cm) => cm.meta().name.as_deref().unwrap_or_default(),
        }
    }
}

/// The create/update/delete key sets produced by diffing an observed snapshot against a
/// freshly generated desired set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffSets {
    pub create: BTreeSet<ObjectKey>,
    pub update: BTreeSet<ObjectKey>,
    pub delete: BTreeSet<ObjectKey>,
}

/// Partition the key domains of the observed and desired snapshots.
pub fn diff(observed: &BTreeMap<ObjectKey, ManagedObject>, desired: &BTreeMap<ObjectKey, ManagedObject>) -> DiffSets {
    let observed_keys: BTreeSet<_> = observed.keys().cloned().collect();
    let desired_keys: BTreeSet<_> = desired.keys().cloned().collect();
    DiffSets {
        create: desired_keys.difference(&observed_keys).cloned().collect(),
        update: desired_keys.intersection(&observed_keys).cloned().collect(),
        delete: observed_keys.difference(&desired_keys).cloned().collect(),
    }
}

/// Merge a freshly generated object into its observed counterpart for updating.
///
/// A kind mismatch between the two objects is a violation of the generator's contract and is
/// reported as a fatal error, never retried.
pub fn merge(old: &ManagedObject, new: &ManagedObject) -> OpsResult<ManagedObject> {
    match (old, new) {
        (ManagedObject::StatefulSet(old_sts), ManagedObject::StatefulSet(new_sts)) => {
            let mut merged = old_sts.clone();
            let mut new_sts = new_sts.clone();
            merge_metadata_map(&old_sts.metadata.labels, &mut new_sts.metadata.labels);
            merged.metadata.labels = new_sts.metadata.labels;
            if let (Some(old_spec), Some(new_spec)) = (old_sts.spec.as_ref(), new_sts.spec) {
                let merged_spec = merged.spec.get_or_insert_with(Default::default);
                let mut template = new_spec.template;
                let old_annotations = old_spec.template.metadata.as_ref().and_then(|meta| meta.annotations.clone());
                if old_annotations.is_some() {
                    // Only materialize template metadata when there is something to preserve,
                    // so merging identical objects yields an identical object.
                    let template_meta = template.metadata.get_or_insert_with(Default::default);
                    merge_metadata_map(&old_annotations, &mut template_meta.annotations);
                }
                merged_spec.template = template;
                merged_spec.replicas = new_spec.replicas;
                merged_spec.update_strategy = new_spec.update_strategy;
            }
            Ok(ManagedObject::StatefulSet(merged))
        }
        (ManagedObject::Service(old_svc), ManagedObject::Service(new_svc)) => {
            let mut merged = old_svc.clone();
            let mut new_svc = new_svc.clone();
            merge_metadata_map(&old_svc.metadata.annotations, &mut new_svc.metadata.annotations);
            merged.metadata.annotations = new_svc.metadata.annotations;
            merged.spec = new_svc.spec;
            Ok(ManagedObject::Service(merged))
        }
        (ManagedObject::ConfigMap(old_cm), ManagedObject::ConfigMap(new_cm)) => {
            let mut merged = old_cm.clone();
            merged.data = new_cm.data.clone();
            merged.binary_data = new_cm.binary_data.clone();
            Ok(ManagedObject::ConfigMap(merged))
        }
        _ => Err(OpsError::fatal(format!(
            "attempted to merge objects of different kinds: {} and {}",
            old.kind(),
            new.kind()
        ))),
    }
}

/// Merge the original metadata map into the target, preserving any original key which is
/// absent from the target.
fn merge_metadata_map(original: &Option<BTreeMap<String, String>>, target: &mut Option<BTreeMap<String, String>>) {
    let original = match original {
        Some(original) => original,
        None => return,
    };
    let target = target.get_or_insert_with(Default::default);
    for (key, val) in original {
        if !target.contains_key(key) {
            target.insert(key.clone(), val.clone());
        }
    }
}
