use super::topology::{created_deleted_sets, expected_component_values};
use quorum_core::crd::{
    ComponentSpec, HorizontalScaling, InstanceReplicasTemplate, InstanceTemplate, LastComponentConfiguration, ReplicaChanger, ScaleIn, ScaleOut,
};

const CLUSTER: &str = "pg";

fn component(replicas: i32, templates: Vec<InstanceTemplate>, offline: Vec<String>) -> ComponentSpec {
    ComponentSpec {
        name: "shard".into(),
        replicas,
        instances: templates,
        offline_instances: offline,
        ..Default::default()
    }
}

fn snapshot_of(component: &ComponentSpec) -> LastComponentConfiguration {
    LastComponentConfiguration {
        replicas: component.replicas,
        instances: component.instances.clone(),
        offline_instances: component.offline_instances.clone(),
    }
}

fn template(name: &str, replicas: i32) -> InstanceTemplate {
    InstanceTemplate { name: name.into(), replicas: Some(replicas) }
}

fn scale_out_by(changes: i32) -> HorizontalScaling {
    HorizontalScaling {
        component_name: "shard".into(),
        scale_out: Some(ScaleOut {
            replica_changer: ReplicaChanger { replica_changes: Some(changes), ..Default::default() },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn scale_in_named(names: &[&str]) -> HorizontalScaling {
    HorizontalScaling {
        component_name: "shard".into(),
        scale_in: Some(ScaleIn {
            online_instances_to_offline: names.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn test_absolute_mode_overrides_replicas_and_passes_topology_through() {
    let comp = component(3, vec![template("ssd", 1)], vec!["pg-shard-0".into()]);
    // A stale snapshot must not leak into absolute mode.
    let stale = LastComponentConfiguration { replicas: 7, ..Default::default() };
    let scaling = HorizontalScaling { component_name: "shard".into(), replicas: Some(5), ..Default::default() };

    let expected = expected_component_values(CLUSTER, &comp, &stale, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 5);
    assert_eq!(expected.instances, comp.instances);
    assert_eq!(expected.offline_instances, comp.offline_instances);
}

#[test]
fn test_delta_mode_baselines_from_snapshot_not_live_spec() {
    // The live spec has already been mutated to 5 by the action step; the delta stays
    // well-defined against the snapshot taken when the operation began.
    let live = component(5, vec![], vec![]);
    let snapshot = LastComponentConfiguration { replicas: 3, ..Default::default() };

    let expected = expected_component_values(CLUSTER, &live, &snapshot, &scale_out_by(2)).expect("topology failed");
    assert_eq!(expected.replicas, 5);
}

#[test]
fn test_scale_in_named_instances_sync_replicas_and_offline_set() {
    let comp = component(4, vec![], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = scale_in_named(&["pg-shard-2", "pg-shard-3"]);

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 2);
    assert_eq!(expected.offline_instances, vec!["pg-shard-2".to_string(), "pg-shard-3".to_string()]);
}

#[test]
fn test_ghost_instances_are_filtered_out() {
    let comp = component(3, vec![], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = scale_in_named(&["pg-shard-9"]);

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 3, "a ghost name must be a no-op");
    assert!(expected.offline_instances.is_empty());
}

#[test]
fn test_scale_out_brings_offline_instance_back_online() {
    let comp = component(3, vec![], vec!["pg-shard-1".into()]);
    let snapshot = snapshot_of(&comp);
    let scaling = HorizontalScaling {
        component_name: "shard".into(),
        scale_out: Some(ScaleOut {
            offline_instances_to_online: vec!["pg-shard-1".into()],
            ..Default::default()
        }),
        ..Default::default()
    };

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 4);
    assert!(expected.offline_instances.is_empty());
}

#[test]
fn test_named_instances_synthesize_per_template_deltas() {
    let comp = component(4, vec![template("ssd", 2)], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = scale_in_named(&["pg-shard-ssd-1"]);

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 3);
    let ssd = expected.instances.iter().find(|tpl| tpl.name == "ssd").expect("ssd template dropped");
    assert_eq!(ssd.replicas(), 1);
}

#[test]
fn test_explicit_aggregate_overrides_synthesized_total() {
    let comp = component(4, vec![], vec![]);
    let snapshot = snapshot_of(&comp);
    let mut scaling = scale_in_named(&["pg-shard-3"]);
    if let Some(scale_in) = &mut scaling.scale_in {
        scale_in.replica_changer.replica_changes = Some(2);
    }

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 2);
}

#[test]
fn test_scale_out_new_templates_are_appended() {
    let comp = component(3, vec![], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = HorizontalScaling {
        component_name: "shard".into(),
        scale_out: Some(ScaleOut {
            new_instances: vec![template("nvme", 2)],
            ..Default::default()
        }),
        ..Default::default()
    };

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 5);
    assert_eq!(expected.instances, vec![template("nvme", 2)]);
}

#[test]
fn test_per_template_delta_applies_to_existing_template() {
    let comp = component(5, vec![template("ssd", 2)], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = HorizontalScaling {
        component_name: "shard".into(),
        scale_out: Some(ScaleOut {
            replica_changer: ReplicaChanger {
                instances: vec![InstanceReplicasTemplate { name: "ssd".into(), replica_changes: 1 }],
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let expected = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(expected.replicas, 6);
    let ssd = expected.instances.iter().find(|tpl| tpl.name == "ssd").expect("ssd template dropped");
    assert_eq!(ssd.replicas(), 3);
}

#[test]
fn test_created_set_for_scale_out() {
    let comp = component(2, vec![], vec![]);
    let snapshot = snapshot_of(&comp);

    let sets = created_deleted_sets(CLUSTER, &comp, &snapshot, &scale_out_by(2), false).expect("set derivation failed");
    let created: Vec<&String> = sets.created.keys().collect();
    assert_eq!(created, vec!["pg-shard-2", "pg-shard-3"]);
    assert!(sets.deleted.is_empty());
}

#[test]
fn test_created_and_deleted_sets_are_disjoint() {
    let comp = component(4, vec![], vec![]);
    let snapshot = snapshot_of(&comp);
    let scaling = scale_in_named(&["pg-shard-2", "pg-shard-3"]);

    let sets = created_deleted_sets(CLUSTER, &comp, &snapshot, &scaling, false).expect("set derivation failed");
    assert!(sets.created.keys().all(|name| !sets.deleted.contains_key(name)));
    assert_eq!(sets.deleted.len(), 2);
}

#[test]
fn test_cancelling_swaps_created_and_deleted_sets() {
    let comp = component(2, vec![], vec![]);
    let snapshot = snapshot_of(&comp);

    let forward = created_deleted_sets(CLUSTER, &comp, &snapshot, &scale_out_by(2), false).expect("set derivation failed");
    let reverted = created_deleted_sets(CLUSTER, &comp, &snapshot, &scale_out_by(2), true).expect("set derivation failed");
    assert_eq!(forward.created, reverted.deleted);
    assert_eq!(forward.deleted, reverted.created);
}

#[test]
fn test_determinism_of_expected_topology() {
    let comp = component(6, vec![template("ssd", 2), template("hdd", 1)], vec!["pg-shard-0".into()]);
    let snapshot = snapshot_of(&comp);
    let scaling = scale_in_named(&["pg-shard-ssd-0", "pg-shard-1"]);

    let first = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    let second = expected_component_values(CLUSTER, &comp, &snapshot, &scaling).expect("topology failed");
    assert_eq!(first, second);
}
