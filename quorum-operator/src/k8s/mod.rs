//! Kubernetes controller.
//!
//! This controller observes data in K8s, filters out data unrelated to Quorum, caches data
//! that does apply, and reconciles the child objects and operations of managed clusters.
//!
//! All mutable state is owned by the single controller task: watcher events and reconcile
//! tasks are multiplexed over one `select!` loop, so cluster reconciliation is serialized
//! without locks. Reconcile tasks which fail with retryable errors are rescheduled with a
//! delay via the spawn indirection below.

pub mod builders;
mod data;
mod pipeline;
#[cfg(test)]
mod pipeline_test;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::ops::OpsManager;
use quorum_core::crd::{Cluster, ClusterPhase, ClusterStatus, OpsRequest, RequiredMetadata};
use quorum_core::QUORUM_OPERATOR_LABEL_SELECTORS;

/// The app name used by the operator.
pub(crate) const APP_NAME: &str = "quorum-operator";
/// The timeout duration used before rescheduling a reconcile task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// A reconciliation task to be performed.
#[derive(Debug)]
pub(crate) enum ReconcileTask {
    /// A Cluster or one of its child objects changed; re-converge its children.
    ClusterUpdated(Arc<String>),
    /// A Cluster was deleted; tear down its remaining child objects.
    ClusterDeleted(Arc<String>, Box<Cluster>),
    /// An OpsRequest changed or observed state relevant to it changed; drive it forward.
    OpsRequestUpdated(Arc<String>),
}

/// Kubernetes controller for watching Quorum CRs.
pub struct Controller {
    /// K8s client.
    pub(crate) client: Client,
    /// Runtime config.
    pub(crate) config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of reconcile tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconcile tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// The registry of operation handlers.
    pub(crate) ops_manager: OpsManager,

    /// All known cluster objects managed by this operator.
    pub(crate) clusters: HashMap<Arc<String>, Cluster>,
    /// All known operation requests against managed clusters.
    pub(crate) ops_requests: HashMap<Arc<String>, OpsRequest>,
    /// All known statefulsets managed by this operator.
    pub(crate) statefulsets: HashMap<Arc<String>, StatefulSet>,
    /// All known K8s services backing managed components.
    pub(crate) services: HashMap<Arc<String>, Service>,
    /// All known K8s config maps backing managed components.
    pub(crate) config_maps: HashMap<Arc<String>, ConfigMap>,
    /// All known pods of managed components.
    pub(crate) pods: HashMap<Arc<String>, Pod>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Ok(Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            ops_manager: OpsManager::new(),
            clusters: Default::default(),
            ops_requests: Default::default(),
            statefulsets: Default::default(),
            services: Default::default(),
            config_maps: Default::default(),
            pods: Default::default(),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let params_labels = self.list_params_cluster_selector_labels();
        let params_spec = ListParams::default();
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, params_spec.clone());
        let ops_requests: Api<OpsRequest> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let ops_requests_watcher = watcher(ops_requests, params_spec.clone());
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, params_labels.clone());
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services_watcher = watcher(services, params_labels.clone());
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let config_maps_watcher = watcher(config_maps, params_labels.clone());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods_watcher = watcher(pods, params_labels.clone());
        tokio::pin!(
            clusters_watcher,
            ops_requests_watcher,
            statefulsets_watcher,
            services_watcher,
            config_maps_watcher,
            pods_watcher
        );

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = ops_requests_watcher.next() => self.handle_ops_request_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                Some(k8s_event_res) = services_watcher.next() => self.handle_service_event(k8s_event_res).await,
                Some(k8s_event_res) = config_maps_watcher.next() => self.handle_config_map_event(k8s_event_res).await,
                Some(k8s_event_res) = pods_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_reconcile_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle reconcile tasks.
    async fn handle_reconcile_task(&mut self, task: ReconcileTask) {
        match task {
            ReconcileTask::ClusterUpdated(name) => self.cluster_reconcile(name).await,
            ReconcileTask::ClusterDeleted(name, cluster) => self.cluster_teardown(name, *cluster).await,
            ReconcileTask::OpsRequestUpdated(name) => self.reconcile_ops_request(name).await,
        }
    }

    /// Converge the named cluster's child objects and refresh its observed phase.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn cluster_reconcile(&mut self, name: Arc<String>) {
        if let Err(err) = self.reconcile_cluster_objects(&name).await {
            tracing::error!(error = ?err, cluster = %name, "error reconciling child objects for cluster");
            self.spawn_task(ReconcileTask::ClusterUpdated(name), true);
            return;
        }
        if let Err(err) = self.update_cluster_phase(&name).await {
            tracing::error!(error = ?err, cluster = %name, "error updating observed phase for cluster");
            self.spawn_task(ReconcileTask::ClusterUpdated(name), true);
            return;
        }
        // Wake any in-flight operations targeting this cluster.
        let in_flight: Vec<Arc<String>> = self
            .ops_requests
            .iter()
            .filter(|(_name, ops)| ops.spec.cluster_name == name.as_str() && !ops.is_terminal())
            .map(|(name, _ops)| name.clone())
            .collect();
        for ops_name in in_flight {
            self.spawn_task(ReconcileTask::OpsRequestUpdated(ops_name), false);
        }
    }

    /// Tear down the remaining child objects of a deleted cluster.
    #[tracing::instrument(level = "debug", skip(self, name, cluster))]
    async fn cluster_teardown(&mut self, name: Arc<String>, cluster: Cluster) {
        let sts_names: Vec<String> = self
            .statefulsets
            .values()
            .filter(|sts| owned_by_cluster(&sts.metadata.labels, &name))
            .filter_map(|sts| sts.metadata.name.clone())
            .collect();
        for sts_name in sts_names {
            if let Err(err) = self.delete_statefulset(&sts_name).await {
                tracing::error!(error = ?err, cluster = %name, "error deleting StatefulSet for deleted cluster");
                self.spawn_task(ReconcileTask::ClusterDeleted(name.clone(), Box::new(cluster)), true);
                return;
            }
            self.statefulsets.remove(&sts_name);
        }
        // Services and ConfigMaps carry owner references without finalizers, K8s GC collects
        // them once the Cluster is gone.
    }

    /// Derive and persist the observed lifecycle phase of the named cluster.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn update_cluster_phase(&mut self, name: &Arc<String>) -> Result<()> {
        let cluster = match self.clusters.get(name) {
            Some(cluster) => cluster.clone(),
            None => return Ok(()),
        };
        let current = cluster.status.as_ref().map(|status| status.phase).unwrap_or_default();
        let mut converged = true;
        for component in &cluster.spec.components {
            let sts_name = builders::sts_name(cluster.name(), &component.name);
            let ready = self
                .statefulsets
                .get(&sts_name)
                .and_then(|sts| sts.status.as_ref())
                .and_then(|status| status.ready_replicas)
                .unwrap_or(0);
            if ready != component.replicas {
                converged = false;
                break;
            }
        }
        let phase = if converged {
            ClusterPhase::Running
        } else if matches!(current, ClusterPhase::Creating) {
            ClusterPhase::Creating
        } else {
            ClusterPhase::Updating
        };
        if phase == current {
            return Ok(());
        }

        tracing::info!(cluster = %name, %phase, "updating observed cluster phase");
        let mut updated = cluster;
        updated.status = Some(ClusterStatus { phase });
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        updated.metadata.managed_fields = None;
        let updated = timeout(API_TIMEOUT, api.patch_status(name, &params, &Patch::Apply(&updated)))
            .await
            .context("timeout while updating cluster phase")?
            .context("error updating cluster phase")?;
        self.clusters.insert(name.clone(), updated);
        Ok(())
    }

    /// Spawn a task which emits a new reconcile task.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the task queue cap.
    pub(crate) fn spawn_task(&self, task: ReconcileTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects matching Quorum labels.
    fn list_params_cluster_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(QUORUM_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}

/// Returns `true` if the given labels name the given cluster as owner.
pub(crate) fn owned_by_cluster(labels: &Option<std::collections::BTreeMap<String, String>>, cluster: &str) -> bool {
    labels
        .as_ref()
        .and_then(|labels| labels.get(builders::LABEL_QUORUM_RS_CLUSTER))
        .map(|owner| owner == cluster)
        .unwrap_or(false)
}
