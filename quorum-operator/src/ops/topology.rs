//! The instance topology calculator.
//!
//! Everything here is pure: given the declared component values, the configuration snapshot
//! taken when the operation began, and a scaling intent, compute the expected topology and
//! the created/deleted instance sets. Identical inputs always produce identical outputs,
//! which lets the conflict checker re-derive any operation's topology on demand.

use std::collections::{BTreeMap, BTreeSet};

use quorum_core::crd::{ComponentSpec, HorizontalScaling, InstanceTemplate, LastComponentConfiguration, ReplicaChanger, ScaleIn, ScaleOut};
use quorum_core::error::OpsResult;
use quorum_core::instances;

/// The expected component topology after a scaling intent is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectedTopology {
    pub replicas: i32,
    pub instances: Vec<InstanceTemplate>,
    pub offline_instances: Vec<String>,
}

/// The instance sets an operation creates and deletes, mapping instance name to its
/// template name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceSets {
    pub created: BTreeMap<String, String>,
    pub deleted: BTreeMap<String, String>,
}

/// Compute the expected replicas, instance templates and offline instances of a component
/// under the given scaling intent.
///
/// Absolute mode baselines from the live component spec; delta mode baselines from the
/// configuration snapshot taken when the operation began, so the delta stays well-defined
/// even after the live spec has been mutated.
pub fn expected_component_values(
    cluster: &str, component: &ComponentSpec, last: &LastComponentConfiguration, scaling: &HorizontalScaling,
) -> OpsResult<ExpectedTopology> {
    let (base_replicas, base_instances, base_offline) = if scaling.replicas.is_some() {
        (component.replicas, component.instances.clone(), component.offline_instances.clone())
    } else {
        (last.replicas, last.instances.clone(), last.offline_instances.clone())
    };
    let scaling = filter_scaling_spec(cluster, &component.name, base_replicas, &base_instances, &base_offline, scaling)?;
    let offline_instances = expected_offline_instances(&base_offline, &scaling);
    let scaling = sync_replica_changes(cluster, &component.name, &base_instances, scaling);
    Ok(ExpectedTopology {
        replicas: expected_replicas(&scaling, base_replicas),
        instances: expected_instances(base_instances, &scaling),
        offline_instances,
    })
}

/// Compute the created and deleted instance sets of an operation: the expected instance-name
/// set diffed against the snapshot's, plus the explicitly named online/offline moves.
///
/// While the operation is cancelling the two sets are swapped, since the reverted spec now
/// converges back toward the snapshot.
pub fn created_deleted_sets(
    cluster: &str, component: &ComponentSpec, last: &LastComponentConfiguration, scaling: &HorizontalScaling, cancelling: bool,
) -> OpsResult<InstanceSets> {
    let last_set = instances::instance_name_set(cluster, &component.name, last.replicas, &last.instances, &last.offline_instances)?;
    let expected = expected_component_values(cluster, component, last, scaling)?;
    let expected_set =
        instances::instance_name_set(cluster, &component.name, expected.replicas, &expected.instances, &expected.offline_instances)?;

    let mut created = BTreeMap::new();
    let mut deleted = BTreeMap::new();
    for name in expected_set.keys() {
        if !last_set.contains_key(name) {
            created.insert(name.clone(), instances::template_of(cluster, &component.name, &component.instances, name));
        }
    }
    for name in last_set.keys() {
        if !expected_set.contains_key(name) {
            deleted.insert(name.clone(), instances::template_of(cluster, &component.name, &component.instances, name));
        }
    }
    if let Some(scale_in) = &scaling.scale_in {
        for name in &scale_in.online_instances_to_offline {
            deleted.insert(name.clone(), instances::template_of(cluster, &component.name, &component.instances, name));
        }
    }
    if let Some(scale_out) = &scaling.scale_out {
        for name in &scale_out.offline_instances_to_online {
            created.insert(name.clone(), instances::template_of(cluster, &component.name, &component.instances, name));
        }
    }
    if cancelling {
        return Ok(InstanceSets { created: deleted, deleted: created });
    }
    Ok(InstanceSets { created, deleted })
}

/// Drop ghost names from the scaling intent: only live instances may be taken offline, and
/// only offline instances may be taken online.
fn filter_scaling_spec(
    cluster: &str, component: &str, replicas: i32, templates: &[InstanceTemplate], offline: &[String], scaling: &HorizontalScaling,
) -> OpsResult<HorizontalScaling> {
    let mut scaling = scaling.clone();
    let live_set = instances::instance_name_set(cluster, component, replicas, templates, offline)?;
    let offline_set: BTreeSet<&String> = offline.iter().collect();
    if let Some(scale_in) = &mut scaling.scale_in {
        scale_in.online_instances_to_offline.retain(|name| live_set.contains_key(name));
    }
    if let Some(scale_out) = &mut scaling.scale_out {
        scale_out.offline_instances_to_online.retain(|name| offline_set.contains(name));
    }
    Ok(scaling)
}

/// The expected offline set: current offline, plus instances moved offline by scale-in,
/// minus instances moved online by scale-out.
fn expected_offline_instances(current: &[String], scaling: &HorizontalScaling) -> Vec<String> {
    let mut offline = current.to_vec();
    if let Some(scale_in) = &scaling.scale_in {
        for name in &scale_in.online_instances_to_offline {
            if !offline.contains(name) {
                offline.push(name.clone());
            }
        }
    }
    if let Some(scale_out) = &scaling.scale_out {
        let to_online: BTreeSet<&String> = scale_out.offline_instances_to_online.iter().collect();
        offline.retain(|name| !to_online.contains(name));
    }
    offline
}

/// Synthesize per-template replica deltas for the named instance moves, and settle each
/// changer's aggregate total. An explicitly supplied aggregate overrides the synthesized one.
fn sync_replica_changes(cluster: &str, component: &str, templates: &[InstanceTemplate], mut scaling: HorizontalScaling) -> HorizontalScaling {
    let count_by_template = |names: &[String]| -> BTreeMap<String, i32> {
        let mut counts = BTreeMap::new();
        for name in names {
            let template = instances::template_of(cluster, component, templates, name);
            *counts.entry(template).or_insert(0) += 1;
        }
        counts
    };
    let sync = |changer: &mut ReplicaChanger, counts: BTreeMap<String, i32>, new_instances: &[InstanceTemplate]| {
        let mut total: i32 = changer.instances.iter().map(|tpl| tpl.replica_changes).sum();
        let named: BTreeSet<String> = changer.instances.iter().map(|tpl| tpl.name.clone()).collect();
        for (template, count) in counts {
            if template == instances::DEFAULT_TEMPLATE {
                total += count;
                continue;
            }
            if !named.contains(&template) {
                changer
                    .instances
                    .push(quorum_core::crd::InstanceReplicasTemplate { name: template, replica_changes: count });
                total += count;
            }
        }
        for tpl in new_instances {
            total += tpl.replicas();
        }
        if let Some(explicit) = changer.replica_changes {
            total = explicit;
        }
        changer.replica_changes = Some(total);
    };
    if let Some(scale_in) = &mut scaling.scale_in {
        let counts = count_by_template(&scale_in.online_instances_to_offline);
        sync(&mut scale_in.replica_changer, counts, &[]);
    }
    if let Some(scale_out) = &mut scaling.scale_out {
        let counts = count_by_template(&scale_out.offline_instances_to_online);
        let new_instances = scale_out.new_instances.clone();
        sync(&mut scale_out.replica_changer, counts, &new_instances);
    }
    scaling
}

/// The expected replica count: absolute if set, otherwise current plus scale-out minus
/// scale-in aggregates.
fn expected_replicas(scaling: &HorizontalScaling, current: i32) -> i32 {
    if let Some(replicas) = scaling.replicas {
        return replicas;
    }
    let mut replicas = current;
    if let Some(changes) = scaling.scale_out.as_ref().and_then(|s: &ScaleOut| s.replica_changer.replica_changes) {
        replicas += changes;
    }
    if let Some(changes) = scaling.scale_in.as_ref().and_then(|s: &ScaleIn| s.replica_changer.replica_changes) {
        replicas -= changes;
    }
    replicas
}

/// The expected instance templates: absolute mode passes through; delta mode appends new
/// scale-out templates and applies the per-template deltas.
fn expected_instances(mut templates: Vec<InstanceTemplate>, scaling: &HorizontalScaling) -> Vec<InstanceTemplate> {
    if scaling.replicas.is_some() {
        return templates;
    }
    let apply = |templates: &mut Vec<InstanceTemplate>, changes: &[quorum_core::crd::InstanceReplicasTemplate], sign: i32| {
        for change in changes {
            if let Some(tpl) = templates.iter_mut().find(|tpl| tpl.name == change.name) {
                tpl.replicas = Some(tpl.replicas() + sign * change.replica_changes);
            }
        }
    };
    if let Some(scale_out) = &scaling.scale_out {
        templates.extend(scale_out.new_instances.iter().cloned());
        apply(&mut templates, &scale_out.replica_changer.instances, 1);
    }
    if let Some(scale_in) = &scaling.scale_in {
        apply(&mut templates, &scale_in.replica_changer.instances, -1);
    }
    templates
}
