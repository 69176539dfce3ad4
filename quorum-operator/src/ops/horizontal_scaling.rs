//! The horizontal scaling operation handler.

use std::collections::{BTreeMap, BTreeSet};

use crate::ops::{progress, topology, AbortedOp, ActionOutcome, CancelOutcome, OpsCtx, OpsHandler, ReconcileOutcome};
use quorum_core::crd::{
    Cluster, ComponentSpec, HorizontalScaling, LastComponentConfiguration, LastConfiguration, OpsComponentStatus, OpsPhase, OpsRequest,
    RequiredMetadata, ValidatePolicy,
};
use quorum_core::error::{OpsError, OpsResult};
use quorum_core::instances;

/// Handler for `OpsType::HorizontalScaling`.
pub struct HorizontalScalingHandler;

impl OpsHandler for HorizontalScalingHandler {
    fn validate(&self, ctx: &OpsCtx) -> OpsResult<()> {
        check_cluster_admits_scaling(ctx.cluster)?;
        for scaling in &ctx.ops.spec.horizontal_scaling {
            let component = component_of(ctx.cluster, &scaling.component_name)?;
            let baseline = snapshot_of(component);
            validate_with_policy(ctx.cluster.name(), &baseline, scaling, ctx.ops.spec.validate_policy)?;
        }
        Ok(())
    }

    fn action(&self, ctx: &OpsCtx) -> OpsResult<ActionOutcome> {
        check_cluster_admits_scaling(ctx.cluster)?;
        let aborted = check_conflicts_with_earlier_ops(ctx)?;

        let mut cluster = ctx.cluster.clone();
        let mut last_configuration = LastConfiguration::default();
        for scaling in &ctx.ops.spec.horizontal_scaling {
            let component = component_of(&cluster, &scaling.component_name)?.clone();
            // A snapshot persisted by an earlier partial tick takes precedence over the live
            // spec, which that tick may already have mutated.
            let baseline = ctx
                .ops
                .last_configuration_for(&scaling.component_name)
                .cloned()
                .unwrap_or_else(|| snapshot_of(&component));
            validate_with_policy(cluster.name(), &baseline, scaling, ctx.ops.spec.validate_policy)?;

            let expected = topology::expected_component_values(ctx.cluster.name(), &component, &baseline, scaling)?;
            let templated: i32 = expected.instances.iter().map(|tpl| tpl.replicas()).sum();
            if templated > expected.replicas {
                return Err(OpsError::fatal(format!(
                    r#"the total number of replicas for the instance templates can not be greater than the number of replicas for component "{}" after horizontally scaling"#,
                    scaling.component_name
                )));
            }

            last_configuration.components.insert(scaling.component_name.clone(), baseline);
            let component = cluster
                .component_mut(&scaling.component_name)
                .ok_or_else(|| OpsError::fatal(format!(r#"component "{}" not found in cluster"#, scaling.component_name)))?;
            component.replicas = expected.replicas;
            component.instances = expected.instances;
            component.offline_instances = expected.offline_instances;
        }
        Ok(ActionOutcome { cluster, last_configuration, aborted })
    }

    fn reconcile(&self, ctx: &OpsCtx) -> OpsResult<ReconcileOutcome> {
        let cancelling = ctx.ops.phase() == OpsPhase::Cancelling;
        let mut completed = 0;
        let mut total = 0;
        let mut components = BTreeMap::new();
        for scaling in &ctx.ops.spec.horizontal_scaling {
            let component = component_of(ctx.cluster, &scaling.component_name)?;
            let last = ctx
                .ops
                .last_configuration_for(&scaling.component_name)
                .ok_or_else(|| {
                    OpsError::fatal(format!(
                        r#"no configuration snapshot recorded for component "{}""#,
                        scaling.component_name
                    ))
                })?;
            let sets = topology::created_deleted_sets(ctx.cluster.name(), component, last, scaling, cancelling)?;
            let previous = ctx
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(&scaling.component_name))
                .map(|comp| comp.progress_details.clone())
                .unwrap_or_default();
            let outcome = progress::component_progress(&sets, ctx.pods, &previous);
            completed += outcome.completed;
            total += outcome.total;
            components.insert(scaling.component_name.clone(), OpsComponentStatus { progress_details: outcome.details });
        }
        let phase = if completed == total {
            if cancelling {
                OpsPhase::Cancelled
            } else {
                OpsPhase::Succeeded
            }
        } else {
            ctx.ops.phase()
        };
        Ok(ReconcileOutcome { phase, progress: format!("{}/{}", completed, total), components })
    }

    fn cancel(&self, ctx: &OpsCtx) -> OpsResult<CancelOutcome> {
        let mut cluster = ctx.cluster.clone();
        let mut release_components = Vec::new();
        for scaling in &ctx.ops.spec.horizontal_scaling {
            let last = ctx
                .ops
                .last_configuration_for(&scaling.component_name)
                .ok_or_else(|| {
                    OpsError::fatal(format!(
                        r#"cannot cancel: no configuration snapshot recorded for component "{}""#,
                        scaling.component_name
                    ))
                })?
                .clone();
            let component = cluster
                .component_mut(&scaling.component_name)
                .ok_or_else(|| OpsError::fatal(format!(r#"component "{}" not found in cluster"#, scaling.component_name)))?;
            component.replicas = last.replicas;
            component.instances = last.instances;
            component.offline_instances = last.offline_instances;
            release_components.push(scaling.component_name.clone());
        }
        Ok(CancelOutcome { cluster, release_components })
    }
}

/// Scaling a stopped cluster is a user error, not a transient condition.
fn check_cluster_admits_scaling(cluster: &Cluster) -> OpsResult<()> {
    let phase = cluster.status.as_ref().map(|status| status.phase).unwrap_or_default();
    if !phase.is_up_running() {
        return Err(OpsError::fatal("please start the cluster before scaling the cluster horizontally".to_string()));
    }
    Ok(())
}

fn component_of<'a>(cluster: &'a Cluster, name: &str) -> OpsResult<&'a ComponentSpec> {
    cluster
        .component(name)
        .ok_or_else(|| OpsError::fatal(format!(r#"component "{}" not found in cluster"#, name)))
}

fn snapshot_of(component: &ComponentSpec) -> LastComponentConfiguration {
    LastComponentConfiguration {
        replicas: component.replicas,
        instances: component.instances.clone(),
        offline_instances: component.offline_instances.clone(),
    }
}

/// Scan earlier non-terminal operations of the same kind for conflicts with the current one.
///
/// The earlier operation is the one aborted — newer operations take precedence. Two
/// operations conflict when either carries an absolute replica count (overwrite semantics
/// cannot compose with deltas), or when the current operation would take offline an instance
/// created by the earlier, still-running one. Earlier operations still `Pending` with pure
/// delta semantics are left alone; they will recompute against whatever state they find.
fn check_conflicts_with_earlier_ops(ctx: &OpsCtx) -> OpsResult<Vec<AbortedOp>> {
    let mut aborted = Vec::new();
    for earlier in ctx.earlier {
        for earlier_scaling in &earlier.spec.horizontal_scaling {
            let scaling = match ctx.ops.horizontal_scaling_for(&earlier_scaling.component_name) {
                Some(scaling) => scaling,
                None => continue,
            };
            if scaling.replicas.is_some() || earlier_scaling.replicas.is_some() {
                aborted.push(AbortedOp {
                    name: earlier.name().to_string(),
                    message: format!(r#"replicas overwritten by newer request "{}""#, ctx.ops.name()),
                });
                break;
            }
            if earlier.phase() == OpsPhase::Pending {
                continue;
            }
            if let Some(instance) = intersects_with_earlier(ctx, earlier, earlier_scaling, scaling)? {
                aborted.push(AbortedOp {
                    name: earlier.name().to_string(),
                    message: format!(
                        r#"instance "{}" created by this request is taken offline by newer request "{}""#,
                        instance,
                        ctx.ops.name()
                    ),
                });
                break;
            }
        }
    }
    Ok(aborted)
}

/// Find an instance created by the earlier running operation which the current operation
/// would delete, re-deriving both operations' instance sets from their snapshots.
fn intersects_with_earlier(
    ctx: &OpsCtx, earlier: &OpsRequest, earlier_scaling: &HorizontalScaling, scaling: &HorizontalScaling,
) -> OpsResult<Option<String>> {
    let component = component_of(ctx.cluster, &earlier_scaling.component_name)?;
    let earlier_last = earlier
        .last_configuration_for(&earlier_scaling.component_name)
        .cloned()
        .unwrap_or_else(|| snapshot_of(component));
    let earlier_sets = topology::created_deleted_sets(ctx.cluster.name(), component, &earlier_last, earlier_scaling, false)?;

    // On the first pass the live spec is the current operation's pre-mutation snapshot; a
    // retried pass prefers the snapshot it already persisted.
    let current_last = ctx
        .ops
        .last_configuration_for(&earlier_scaling.component_name)
        .cloned()
        .unwrap_or_else(|| snapshot_of(component));
    let current_sets = topology::created_deleted_sets(ctx.cluster.name(), component, &current_last, scaling, false)?;

    for name in current_sets.deleted.keys() {
        if earlier_sets.created.contains_key(name) {
            return Ok(Some(name.clone()));
        }
    }
    Ok(None)
}

/// Validate the named instance lists of a scaling intent against its baseline configuration.
fn validate_with_policy(
    cluster: &str, baseline: &LastComponentConfiguration, scaling: &HorizontalScaling, policy: ValidatePolicy,
) -> OpsResult<()> {
    let live_set = instances::instance_name_set(cluster, &scaling.component_name, baseline.replicas, &baseline.instances, &baseline.offline_instances)?;
    let offline_set: BTreeSet<&String> = baseline.offline_instances.iter().collect();

    let classify = |names: &[String]| -> (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>) {
        let mut online = BTreeSet::new();
        let mut offline = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for name in names {
            if offline_set.contains(name) {
                offline.insert(name.clone());
            } else if live_set.contains_key(name) {
                online.insert(name.clone());
            } else {
                missing.insert(name.clone());
            }
        }
        (online, offline, missing)
    };

    let mut missing_from_ops = BTreeSet::new();
    let mut online_from_scale_in = BTreeSet::new();
    let mut offline_from_scale_out = BTreeSet::new();
    if let Some(scale_in) = &scaling.scale_in {
        let (online, _offline, missing) = classify(&scale_in.online_instances_to_offline);
        online_from_scale_in = online;
        missing_from_ops.extend(missing);
    }
    if let Some(scale_out) = &scaling.scale_out {
        let (_online, offline, missing) = classify(&scale_out.offline_instances_to_online);
        offline_from_scale_out = offline;
        missing_from_ops.extend(missing);
    }
    if !missing_from_ops.is_empty() {
        return Err(OpsError::fatal(format!(
            r#"instances "{}" specified in the request do not exist"#,
            missing_from_ops.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    if policy != ValidatePolicy::Strict {
        return Ok(());
    }

    // Under permissive policy absolute mode simply overrides any delta computation; strict
    // policy rejects the ambiguity outright.
    if scaling.replicas.is_some() && (scaling.scale_in.is_some() || scaling.scale_out.is_some()) {
        return Err(OpsError::fatal(format!(
            r#"component "{}" specifies both an absolute replica count and scale-in/scale-out deltas"#,
            scaling.component_name
        )));
    }
    if let Some(scale_in) = &scaling.scale_in {
        check_strict_list(&scale_in.online_instances_to_offline, &online_from_scale_in, "onlineInstancesToOffline", "online")?;
    }
    if let Some(scale_out) = &scaling.scale_out {
        check_strict_list(&scale_out.offline_instances_to_online, &offline_from_scale_out, "offlineInstancesToOnline", "offline")?;
    }
    Ok(())
}

/// Under strict policy every named instance must already be in the expected state, and
/// duplicates are rejected.
fn check_strict_list(names: &[String], matched: &BTreeSet<String>, field: &str, state: &str) -> OpsResult<()> {
    if matched.len() == names.len() {
        return Ok(());
    }
    let unmatched: Vec<&String> = names.iter().filter(|name| !matched.contains(*name)).collect();
    if unmatched.is_empty() {
        return Err(OpsError::fatal(format!("instances specified in {} has duplicates", field)));
    }
    Err(OpsError::fatal(format!(
        r#"instances "{}" specified in {} is not {} or not exist"#,
        unmatched.iter().map(|name| name.as_str()).collect::<Vec<_>>().join(", "),
        field,
        state
    )))
}
