//! Per-instance progress tracking for a running operation.
//!
//! Progress is derived each tick by correlating the operation's created/deleted instance sets
//! against the observed pod snapshot. A detail which has reached `Succeeded` never regresses,
//! so the reported numerator is non-decreasing across ticks even when the observed snapshot
//! is momentarily stale.

use std::collections::{BTreeMap, BTreeSet};

use crate::ops::topology::InstanceSets;
use quorum_core::crd::{ProgressDetail, ProgressStatus};

/// The observed pods of a component, split into present and ready-to-serve sets.
#[derive(Clone, Debug, Default)]
pub struct PodSnapshot {
    /// Names of pods currently present, regardless of readiness.
    pub present: BTreeSet<String>,
    /// Names of pods currently passing their readiness probe.
    pub ready: BTreeSet<String>,
}

/// The progress of one component's tracked instance transitions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressOutcome {
    pub details: BTreeMap<String, ProgressDetail>,
    pub completed: i32,
    pub total: i32,
}

impl ProgressOutcome {
    /// Render the aggregate progress as a `completed/total` ratio string.
    pub fn ratio(&self) -> String {
        format!("{}/{}", self.completed, self.total)
    }

    /// Returns `true` if every tracked transition has completed.
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

/// Evaluate the progress of one component against the observed pod snapshot.
///
/// A created instance succeeds once its pod reports ready; a deleted instance succeeds once
/// its pod is no longer present. Details already recorded as `Succeeded` are carried forward
/// unchanged.
pub fn component_progress(sets: &InstanceSets, pods: &PodSnapshot, previous: &BTreeMap<String, ProgressDetail>) -> ProgressOutcome {
    let mut outcome = ProgressOutcome {
        total: (sets.created.len() + sets.deleted.len()) as i32,
        ..Default::default()
    };
    for name in sets.created.keys() {
        let detail = if already_succeeded(previous, name) || pods.ready.contains(name) {
            ProgressDetail {
                status: ProgressStatus::Succeeded,
                message: format!(r#"Successfully created instance "{}""#, name),
            }
        } else {
            ProgressDetail {
                status: ProgressStatus::Processing,
                message: format!(r#"Start to create instance "{}""#, name),
            }
        };
        record(&mut outcome, name, detail);
    }
    for name in sets.deleted.keys() {
        let detail = if already_succeeded(previous, name) || !pods.present.contains(name) {
            ProgressDetail {
                status: ProgressStatus::Succeeded,
                message: format!(r#"Successfully deleted instance "{}""#, name),
            }
        } else {
            ProgressDetail {
                status: ProgressStatus::Processing,
                message: format!(r#"Start to delete instance "{}""#, name),
            }
        };
        record(&mut outcome, name, detail);
    }
    outcome
}

fn already_succeeded(previous: &BTreeMap<String, ProgressDetail>, name: &str) -> bool {
    previous.get(name).map(|detail| detail.status == ProgressStatus::Succeeded).unwrap_or(false)
}

fn record(outcome: &mut ProgressOutcome, name: &str, detail: ProgressDetail) {
    if detail.status == ProgressStatus::Succeeded {
        outcome.completed += 1;
    }
    outcome.details.insert(name.to_string(), detail);
}
