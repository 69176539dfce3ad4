use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::Resource;

use super::builders;
use super::pipeline::{plan, Action};
use super::snapshot::{ManagedKind, ManagedObject, ObjectKey};
use quorum_core::crd::{Cluster, ClusterSpec, ComponentSpec};

fn cluster(components: Vec<ComponentSpec>) -> Cluster {
    let mut cluster = Cluster::new("pg", ClusterSpec { components });
    cluster.meta_mut().namespace = Some("default".into());
    cluster.meta_mut().uid = Some("uid-0".into());
    cluster
}

fn component(name: &str, replicas: i32) -> ComponentSpec {
    ComponentSpec {
        name: name.into(),
        image: "quorum/engine:14".into(),
        replicas,
        ..Default::default()
    }
}

fn desired_set(cluster: &Cluster) -> BTreeMap<ObjectKey, ManagedObject> {
    let mut desired = BTreeMap::new();
    for comp in &cluster.spec.components {
        for object in builders::build_component_objects(cluster, comp).expect("object generation failed") {
            desired.insert(object.key(), object);
        }
    }
    desired
}

#[test]
fn test_plan_fresh_cluster_creates_everything_in_dependency_order() {
    let cluster = cluster(vec![component("shard", 3)]);
    let desired = desired_set(&cluster);

    let dag = plan(&BTreeMap::new(), &desired, false).expect("planning failed");
    let ordered = dag.into_ordered();
    assert_eq!(ordered.len(), 4);
    assert!(ordered.iter().all(|action| matches!(action, Action::Create(_))));

    let position = |kind: ManagedKind, name: &str| {
        ordered
            .iter()
            .position(|action| {
                let key = action.key();
                key.kind == kind && key.name == name
            })
            .unwrap_or_else(|| panic!("no action for {:?} {}", kind, name))
    };
    let sts = position(ManagedKind::StatefulSet, "pg-shard");
    assert!(position(ManagedKind::Service, "pg-shard-headless") < sts);
    assert!(position(ManagedKind::Service, "pg-shard") < sts);
    assert!(position(ManagedKind::ConfigMap, "pg-shard-env") < sts);
}

#[test]
fn test_plan_unchanged_cluster_is_all_noops() {
    let cluster = cluster(vec![component("shard", 3)]);
    let desired = desired_set(&cluster);
    let observed = desired.clone();

    let dag = plan(&observed, &desired, false).expect("planning failed");
    for action in dag.into_ordered() {
        assert!(matches!(action, Action::NoOp(_)), "second pass over converged state must be a no-op, got: {:?}", action);
    }
}

#[test]
fn test_plan_replica_change_updates_only_the_workload() {
    let before = cluster(vec![component("shard", 3)]);
    let observed = desired_set(&before);
    let after = cluster(vec![component("shard", 5)]);
    let desired = desired_set(&after);

    let dag = plan(&observed, &desired, false).expect("planning failed");
    for action in dag.into_ordered() {
        match &action {
            Action::Update(ManagedObject::StatefulSet(sts)) => {
                assert_eq!(sts.spec.as_ref().and_then(|spec| spec.replicas), Some(5));
            }
            Action::Update(ManagedObject::ConfigMap(cm)) => {
                let data = cm.data.as_ref().expect("no data on env config map");
                assert_eq!(data.get("QUORUM_REPLICAS").map(String::as_str), Some("5"));
            }
            Action::NoOp(_) => (),
            other => panic!("unexpected action for replica change: {:?}", other),
        }
    }
}

#[test]
fn test_plan_removed_component_deletes_its_objects() {
    let before = cluster(vec![component("shard", 3), component("proxy", 1)]);
    let observed = desired_set(&before);
    let after = cluster(vec![component("shard", 3)]);
    let desired = desired_set(&after);

    let dag = plan(&observed, &desired, false).expect("planning failed");
    let deletes: Vec<ObjectKey> = dag
        .into_ordered()
        .into_iter()
        .filter_map(|action| match action {
            Action::Delete(key) => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(deletes.len(), 4);
    assert!(deletes.iter().all(|key| key.name.starts_with("pg-proxy")));
}

#[test]
fn test_plan_compatibility_mode_keeps_orphaned_config_maps() {
    let before = cluster(vec![component("shard", 3), component("proxy", 1)]);
    let observed = desired_set(&before);
    let after = cluster(vec![component("shard", 3)]);
    let desired = desired_set(&after);

    let dag = plan(&observed, &desired, true).expect("planning failed");
    for action in dag.into_ordered() {
        if let Action::Delete(key) = &action {
            assert_ne!(key.kind, ManagedKind::ConfigMap, "compatibility mode must not delete ConfigMaps: {:?}", action);
        }
        if let Action::NoOp(key) = &action {
            if key.kind == ManagedKind::ConfigMap && key.name == "pg-proxy-env" {
                return;
            }
        }
    }
    panic!("orphaned ConfigMap must surface as a NoOp in compatibility mode");
}

#[test]
fn test_plan_preserves_foreign_metadata_on_update() {
    let before = cluster(vec![component("shard", 3)]);
    let mut observed = desired_set(&before);
    for object in observed.values_mut() {
        if let ManagedObject::StatefulSet(sts) = object {
            let labels = sts.metadata.labels.get_or_insert_with(Default::default);
            labels.insert("external.io/team".into(), "dba".into());
        }
    }
    let after = cluster(vec![component("shard", 5)]);
    let desired = desired_set(&after);

    let dag = plan(&observed, &desired, false).expect("planning failed");
    let sts = dag
        .into_ordered()
        .into_iter()
        .find_map(|action| match action {
            Action::Update(ManagedObject::StatefulSet(sts)) => Some(sts),
            _ => None,
        })
        .expect("no workload update planned");
    let labels = sts.metadata.labels.expect("labels dropped from merged workload");
    assert_eq!(labels.get("external.io/team").map(String::as_str), Some("dba"));
}
