//! The operation (ops) subsystem.
//!
//! An OpsRequest is driven through its lifecycle one reconcile tick at a time:
//! `Pending → Creating → Running → {Succeeded, Failed}`, with `spec.cancel` moving a running
//! operation through `Cancelling → Cancelled`, and conflict detection moving a superseded
//! earlier operation to `Aborted`.
//!
//! Handlers are pure: they read an [`OpsCtx`] and return outcome values describing the
//! mutations to make. All K8s writes happen in the controller driver below, which classifies
//! errors per the fatal/retryable taxonomy — fatal errors terminate the operation with a
//! user-visible message, retryable errors simply reschedule the tick.

mod horizontal_scaling;
pub mod progress;
#[cfg(test)]
mod progress_test;
pub mod topology;
#[cfg(test)]
mod topology_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use tokio::time::timeout;

pub use horizontal_scaling::HorizontalScalingHandler;
use progress::PodSnapshot;

use crate::k8s::builders;
use crate::k8s::{Controller, ReconcileTask, APP_NAME};
use quorum_core::crd::{
    Cluster, LastConfiguration, OpsComponentStatus, OpsPhase, OpsRequest, OpsRequestStatus, OpsType, RequiredMetadata,
};
use quorum_core::error::{OpsError, OpsResult};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a handler may read while deciding an operation's next step.
pub struct OpsCtx<'a> {
    /// The target cluster.
    pub cluster: &'a Cluster,
    /// The operation being driven.
    pub ops: &'a OpsRequest,
    /// Non-terminal operations of the same kind on the same cluster which were admitted
    /// before `ops`, oldest first.
    pub earlier: &'a [&'a OpsRequest],
    /// The observed pods of the target cluster.
    pub pods: &'a PodSnapshot,
}

/// An earlier operation to force-terminate because a newer one supersedes it.
#[derive(Clone, Debug, PartialEq)]
pub struct AbortedOp {
    pub name: String,
    pub message: String,
}

/// The outcome of an operation's action step.
#[derive(Clone, Debug)]
pub struct ActionOutcome {
    /// The cluster with the operation's intent folded into its component specs.
    pub cluster: Cluster,
    /// Pre-mutation configuration snapshots, persisted for delta computation and revert.
    pub last_configuration: LastConfiguration,
    /// Earlier operations superseded by this one.
    pub aborted: Vec<AbortedOp>,
}

/// The outcome of one reconcile tick over a running or cancelling operation.
#[derive(Clone, Debug)]
pub struct ReconcileOutcome {
    pub phase: OpsPhase,
    pub progress: String,
    pub components: BTreeMap<String, OpsComponentStatus>,
}

/// The outcome of cancelling an operation.
#[derive(Clone, Debug)]
pub struct CancelOutcome {
    /// The cluster with the operation's changes reverted from the configuration snapshot.
    pub cluster: Cluster,
    /// Components whose in-flight seed Jobs must be torn down.
    pub release_components: Vec<String>,
}

/// The capability interface shared by all operation kinds.
pub trait OpsHandler: Send + Sync {
    /// Validate the request against the target cluster before any action is taken.
    fn validate(&self, ctx: &OpsCtx) -> OpsResult<()>;

    /// Fold the operation's intent into the cluster spec, snapshotting the prior values.
    fn action(&self, ctx: &OpsCtx) -> OpsResult<ActionOutcome>;

    /// Evaluate progress of an acting operation against observed state.
    fn reconcile(&self, ctx: &OpsCtx) -> OpsResult<ReconcileOutcome>;

    /// Revert the operation's changes from its configuration snapshot.
    fn cancel(&self, ctx: &OpsCtx) -> OpsResult<CancelOutcome>;
}

/// The registry of operation handlers, keyed by operation kind.
pub struct OpsManager {
    handlers: HashMap<OpsType, Box<dyn OpsHandler>>,
}

impl Default for OpsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsManager {
    /// Create the registry with all known operation kinds registered.
    pub fn new() -> Self {
        let mut handlers: HashMap<OpsType, Box<dyn OpsHandler>> = HashMap::new();
        handlers.insert(OpsType::HorizontalScaling, Box::new(HorizontalScalingHandler));
        Self { handlers }
    }

    /// Get the handler registered for the given operation kind.
    pub fn handler(&self, ops_type: OpsType) -> Option<&dyn OpsHandler> {
        self.handlers.get(&ops_type).map(Box::as_ref)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Operation Driver //////////////////////////////////////////////////////////
impl Controller {
    /// Drive the named operation one step forward.
    ///
    /// Fatal errors terminate the operation as `Failed` with the error's message; retryable
    /// errors reschedule this task with a delay.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub(crate) async fn reconcile_ops_request(&mut self, name: Arc<String>) {
        let ops = match self.ops_requests.get(&name) {
            Some(ops) => ops.clone(),
            None => return,
        };
        if ops.is_terminal() {
            return;
        }
        match self.drive_ops_request(&ops).await {
            Ok(()) => (),
            Err(OpsError::Fatal(message)) => {
                tracing::warn!(ops = %name, %message, "operation failed terminally");
                if let Err(err) = self.finalize_ops_request(&ops, OpsPhase::Failed, Some(message)).await {
                    tracing::error!(error = ?err, ops = %name, "error recording terminal failure of operation");
                    self.spawn_task(ReconcileTask::OpsRequestUpdated(name), true);
                }
            }
            Err(OpsError::Retryable(err)) => {
                tracing::error!(error = ?err, ops = %name, "error while reconciling operation, will retry");
                self.spawn_task(ReconcileTask::OpsRequestUpdated(name), true);
            }
        }
    }

    async fn drive_ops_request(&mut self, ops: &OpsRequest) -> OpsResult<()> {
        let cluster = match self.clusters.get(&ops.spec.cluster_name) {
            Some(cluster) => cluster.clone(),
            // The target cluster may simply not have been observed yet.
            None => {
                return Err(OpsError::Retryable(anyhow::anyhow!(
                    r#"cluster "{}" targeted by operation "{}" is not known"#,
                    ops.spec.cluster_name,
                    ops.name()
                )))
            }
        };
        let handler = self
            .ops_manager
            .handler(ops.spec.ops_type)
            .ok_or_else(|| OpsError::fatal(format!("no handler registered for operation type {}", ops.spec.ops_type)))?;
        let pods = self.pod_snapshot(cluster.name());
        let earlier_owned = self.earlier_ops(ops);
        let earlier: Vec<&OpsRequest> = earlier_owned.iter().collect();
        let ctx = OpsCtx { cluster: &cluster, ops, earlier: &earlier, pods: &pods };

        match ops.phase() {
            OpsPhase::Pending => {
                if ops.spec.cancel {
                    return self.finalize_ops_request(ops, OpsPhase::Cancelled, None).await.map_err(OpsError::from);
                }
                handler.validate(&ctx)?;
                self.patch_ops_phase(ops, OpsPhase::Creating).await?;
                self.spawn_task(ReconcileTask::OpsRequestUpdated(Arc::new(ops.name().to_string())), false);
                Ok(())
            }
            OpsPhase::Creating => {
                if ops.spec.cancel {
                    // Nothing has been applied yet, so there is nothing to revert.
                    return self.finalize_ops_request(ops, OpsPhase::Cancelled, None).await.map_err(OpsError::from);
                }
                let outcome = handler.action(&ctx)?;
                for abort in &outcome.aborted {
                    self.abort_ops_request(&abort.name, &abort.message).await?;
                }
                // The snapshot must be persisted before the cluster is mutated: a tick which
                // fails part way through re-enters this phase, and the retried action derives
                // its values from the persisted snapshot instead of the mutated spec.
                let mut status = ops.status.clone().unwrap_or_default();
                status.last_configuration = outcome.last_configuration;
                self.patch_ops_status(ops, status.clone()).await?;
                self.patch_cluster(outcome.cluster).await?;
                status.phase = OpsPhase::Running;
                self.patch_ops_status(ops, status).await?;
                Ok(())
            }
            OpsPhase::Running if ops.spec.cancel => {
                let outcome = handler.cancel(&ctx)?;
                self.patch_cluster(outcome.cluster).await?;
                for component in &outcome.release_components {
                    self.teardown_scaling_job(cluster.name(), component).await?;
                }
                self.patch_ops_phase(ops, OpsPhase::Cancelling).await?;
                Ok(())
            }
            OpsPhase::Running | OpsPhase::Cancelling => {
                let outcome = handler.reconcile(&ctx)?;
                let mut status = ops.status.clone().unwrap_or_default();
                status.phase = outcome.phase;
                status.progress = outcome.progress;
                status.components = outcome.components;
                self.patch_ops_status(ops, status).await?;
                Ok(())
            }
            // Terminal phases are immutable.
            _ => Ok(()),
        }
    }

    /// Assemble the observed pod snapshot of the given cluster.
    fn pod_snapshot(&self, cluster: &str) -> PodSnapshot {
        let mut snapshot = PodSnapshot::default();
        let owned = self.pods.values().filter(|pod| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(builders::LABEL_QUORUM_RS_CLUSTER))
                .map(|owner| owner == cluster)
                .unwrap_or(false)
        });
        for pod in owned {
            let name = match pod.metadata.name.as_ref() {
                Some(name) => name.clone(),
                None => continue,
            };
            if pod_is_ready(pod) {
                snapshot.ready.insert(name.clone());
            }
            snapshot.present.insert(name);
        }
        snapshot
    }

    /// Collect non-terminal operations of the same kind on the same cluster admitted before
    /// the given one, oldest first.
    fn earlier_ops(&self, ops: &OpsRequest) -> Vec<OpsRequest> {
        let mut earlier: Vec<OpsRequest> = self
            .ops_requests
            .values()
            .filter(|other| {
                other.name() != ops.name()
                    && other.spec.cluster_name == ops.spec.cluster_name
                    && other.spec.ops_type == ops.spec.ops_type
                    && !other.is_terminal()
                    && admission_order(other) < admission_order(ops)
            })
            .cloned()
            .collect();
        earlier.sort_by_key(|op| admission_order(op));
        earlier
    }

    /// Move the operation to a terminal phase with an optional message.
    async fn finalize_ops_request(&mut self, ops: &OpsRequest, phase: OpsPhase, message: Option<String>) -> Result<()> {
        let mut status = ops.status.clone().unwrap_or_default();
        status.phase = phase;
        status.message = message;
        self.patch_ops_status(ops, status).await
    }

    /// Force-terminate the named earlier operation as `Aborted`.
    #[tracing::instrument(level = "debug", skip(self, name, message))]
    async fn abort_ops_request(&mut self, name: &str, message: &str) -> Result<()> {
        tracing::info!(ops = %name, %message, "aborting superseded operation");
        let ops = match self.ops_requests.get(&name.to_string()) {
            Some(ops) => ops.clone(),
            None => return Ok(()),
        };
        let mut status = ops.status.clone().unwrap_or_default();
        status.phase = OpsPhase::Aborted;
        status.message = Some(message.to_string());
        self.patch_ops_status(&ops, status).await
    }

    async fn patch_ops_phase(&mut self, ops: &OpsRequest, phase: OpsPhase) -> Result<()> {
        let mut status = ops.status.clone().unwrap_or_default();
        status.phase = phase;
        self.patch_ops_status(ops, status).await
    }

    /// Patch the given OpsRequest status in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, ops, status))]
    async fn patch_ops_status(&mut self, ops: &OpsRequest, status: OpsRequestStatus) -> Result<()> {
        tracing::info!(ops = %ops.name(), phase = %status.phase, "patching operation status");
        let mut updated = ops.clone();
        updated.status = Some(status);
        let api: Api<OpsRequest> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        updated.metadata.managed_fields = None;
        let updated = timeout(API_TIMEOUT, api.patch_status(ops.name(), &params, &Patch::Apply(&updated)))
            .await
            .context("timeout while updating operation status")?
            .context("error updating operation status")?;
        self.ops_requests.insert(Arc::new(ops.name().to_string()), updated);
        Ok(())
    }

    /// Patch the given Cluster in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn patch_cluster(&mut self, mut cluster: Cluster) -> Result<()> {
        tracing::info!(name = cluster.name(), "patching cluster spec");
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        cluster.metadata.managed_fields = None;
        let name = cluster.name().to_string();
        let updated = timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&cluster)))
            .await
            .context("timeout while updating cluster")?
            .context("error updating cluster")?;
        self.clusters.insert(Arc::new(name.clone()), updated);
        self.spawn_task(ReconcileTask::ClusterUpdated(Arc::new(name)), false);
        Ok(())
    }

    /// Delete the in-flight seed Job of a cancelled scale-out, releasing its protection
    /// finalizer so deletion is not blocked.
    #[tracing::instrument(level = "debug", skip(self, cluster, component))]
    async fn teardown_scaling_job(&self, cluster: &str, component: &str) -> Result<()> {
        let name = builders::scaling_job_name(cluster, component);
        tracing::info!(job = %name, "tearing down seed job for cancelled scale-out");
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        self.release_finalizer(&api, &name).await?;
        let res = timeout(API_TIMEOUT, api.delete(&name, &Default::default()))
            .await
            .context("timeout while deleting seed job")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting seed job"),
            },
        }
    }
}

/// Returns `true` if the given pod reports a `Ready=True` condition.
fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// The admission ordering key of an operation: creation timestamp, then name as tiebreak.
fn admission_order(ops: &OpsRequest) -> (Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>, String) {
    (ops.metadata.creation_timestamp.clone(), ops.name().to_string())
}
