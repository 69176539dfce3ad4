use std::collections::{BTreeMap, BTreeSet};

use super::progress::{component_progress, PodSnapshot};
use super::topology::InstanceSets;
use quorum_core::crd::ProgressStatus;

fn deleted_sets(names: &[&str]) -> InstanceSets {
    InstanceSets {
        deleted: names.iter().map(|name| (name.to_string(), String::new())).collect(),
        ..Default::default()
    }
}

fn created_sets(names: &[&str]) -> InstanceSets {
    InstanceSets {
        created: names.iter().map(|name| (name.to_string(), String::new())).collect(),
        ..Default::default()
    }
}

fn pods(present: &[&str], ready: &[&str]) -> PodSnapshot {
    PodSnapshot {
        present: present.iter().map(|name| name.to_string()).collect(),
        ready: ready.iter().map(|name| name.to_string()).collect(),
    }
}

#[test]
fn test_scale_in_progress_advances_as_pods_disappear() {
    // Scaling component c from 4 to 2 replicas tracks two deletions.
    let sets = deleted_sets(&["pg-c-2", "pg-c-3"]);

    // First tick: one target pod is already gone, one is terminating.
    let first = component_progress(&sets, &pods(&["pg-c-0", "pg-c-1", "pg-c-2"], &[]), &BTreeMap::new());
    assert_eq!(first.ratio(), "1/2");
    assert!(!first.is_complete());
    assert_eq!(first.details["pg-c-2"].status, ProgressStatus::Processing);
    assert_eq!(first.details["pg-c-3"].status, ProgressStatus::Succeeded);

    // Second tick: both gone.
    let second = component_progress(&sets, &pods(&["pg-c-0", "pg-c-1"], &[]), &first.details);
    assert_eq!(second.ratio(), "2/2");
    assert!(second.is_complete());
}

#[test]
fn test_created_instance_requires_readiness() {
    let sets = created_sets(&["pg-c-2"]);

    let present_only = component_progress(&sets, &pods(&["pg-c-2"], &[]), &BTreeMap::new());
    assert_eq!(present_only.ratio(), "0/1");
    assert_eq!(present_only.details["pg-c-2"].status, ProgressStatus::Processing);

    let ready = component_progress(&sets, &pods(&["pg-c-2"], &["pg-c-2"]), &BTreeMap::new());
    assert_eq!(ready.ratio(), "1/1");
}

#[test]
fn test_numerator_never_regresses() {
    let sets = created_sets(&["pg-c-2"]);

    let succeeded = component_progress(&sets, &pods(&["pg-c-2"], &["pg-c-2"]), &BTreeMap::new());
    assert_eq!(succeeded.ratio(), "1/1");

    // The pod flaps out of readiness on a later tick; the recorded success stands.
    let flapped = component_progress(&sets, &pods(&["pg-c-2"], &[]), &succeeded.details);
    assert_eq!(flapped.ratio(), "1/1");
    assert_eq!(flapped.details["pg-c-2"].status, ProgressStatus::Succeeded);
}

#[test]
fn test_empty_tracked_set_is_trivially_complete() {
    let outcome = component_progress(&InstanceSets::default(), &PodSnapshot::default(), &BTreeMap::new());
    assert_eq!(outcome.ratio(), "0/0");
    assert!(outcome.is_complete());
    assert!(outcome.details.is_empty());
}

#[test]
fn test_mixed_create_and_delete_tracking() {
    let mut sets = created_sets(&["pg-c-ssd-0"]);
    sets.deleted = deleted_sets(&["pg-c-1"]).deleted;

    let outcome = component_progress(&sets, &pods(&["pg-c-0", "pg-c-ssd-0"], &["pg-c-ssd-0"]), &BTreeMap::new());
    assert_eq!(outcome.ratio(), "2/2");
    let present: BTreeSet<&String> = outcome.details.keys().collect();
    assert_eq!(present.len(), 2);
}
