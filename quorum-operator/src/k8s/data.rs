use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::ObjectMeta;
use kube::Resource;
use kube_runtime::watcher::Event;

use crate::k8s::builders;
use crate::k8s::{Controller, EventResult, ReconcileTask};
use quorum_core::crd::{Cluster, OpsRequest};

//////////////////////////////////////////////////////////////////////////////
// Cluster Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Cluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_cluster_event(&mut self, res: EventResult<Cluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Cluster k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.cluster_applied(obj).await,
            Event::Deleted(obj) => self.cluster_deleted(obj).await,
            Event::Restarted(objs) => self.cluster_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_applied(&mut self, cluster: Cluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.clusters.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cluster {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.clusters.insert(name.clone(), cluster);
        self.spawn_task(ReconcileTask::ClusterUpdated(name), false);
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_deleted(&mut self, cluster: Cluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, cluster) = match self.clusters.remove_entry(name_str) {
            Some((name, cluster)) => (name, cluster),
            None => return,
        };
        self.spawn_task(ReconcileTask::ClusterDeleted(name, Box::new(cluster)), false);
    }

    #[tracing::instrument(level = "debug", skip(self, clusters))]
    async fn cluster_restarted(&mut self, clusters: Vec<Cluster>) {
        for cluster in clusters {
            self.cluster_applied(cluster).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// OpsRequest Events /////////////////////////////////////////////////////////
impl Controller {
    /// Handle `OpsRequest` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_ops_request_event(&mut self, res: EventResult<OpsRequest>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from OpsRequest k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.ops_request_applied(obj).await,
            Event::Deleted(obj) => self.ops_request_deleted(obj).await,
            Event::Restarted(objs) => self.ops_request_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, ops))]
    async fn ops_request_applied(&mut self, ops: OpsRequest) {
        let name_str = match ops.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.ops_requests.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &ops {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.ops_requests.insert(name.clone(), ops);
        self.spawn_task(ReconcileTask::OpsRequestUpdated(name), false);
    }

    #[tracing::instrument(level = "debug", skip(self, ops))]
    async fn ops_request_deleted(&mut self, ops: OpsRequest) {
        let name_str = match ops.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        // Nothing to drive once the request object itself is gone.
        let _removed = self.ops_requests.remove_entry(name_str);
    }

    #[tracing::instrument(level = "debug", skip(self, requests))]
    async fn ops_request_restarted(&mut self, requests: Vec<OpsRequest>) {
        for ops in requests {
            self.ops_request_applied(ops).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// StatefulSet Events ////////////////////////////////////////////////////////
impl Controller {
    /// Handle `StatefulSet` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StatefulSet k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.sts_applied(obj).await,
            Event::Deleted(obj) => self.sts_deleted(obj).await,
            Event::Restarted(objs) => self.sts_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, set))]
    async fn sts_applied(&mut self, set: StatefulSet) {
        let name_str = match set.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.statefulsets.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &set {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        let owner = self.owner_cluster_key(set.meta());
        self.statefulsets.insert(name, set);
        if let Some(owner) = owner {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, set))]
    async fn sts_deleted(&mut self, set: StatefulSet) {
        let name_str = match set.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (_name, set) = match self.statefulsets.remove_entry(name_str) {
            Some((name, set)) => (name, set),
            None => return,
        };
        if let Some(owner) = self.owner_cluster_key(set.meta()) {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, sets))]
    async fn sts_restarted(&mut self, sets: Vec<StatefulSet>) {
        for set in sets {
            self.sts_applied(set).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Service Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Service` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_service_event(&mut self, res: EventResult<Service>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Service k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.service_applied(obj).await,
            Event::Deleted(obj) => self.service_deleted(obj).await,
            Event::Restarted(objs) => self.service_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, service))]
    async fn service_applied(&mut self, service: Service) {
        let name_str = match service.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.services.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &service {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        let owner = self.owner_cluster_key(service.meta());
        self.services.insert(name, service);
        if let Some(owner) = owner {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, service))]
    async fn service_deleted(&mut self, service: Service) {
        let name_str = match service.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (_name, service) = match self.services.remove_entry(name_str) {
            Some((name, service)) => (name, service),
            None => return,
        };
        if let Some(owner) = self.owner_cluster_key(service.meta()) {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, services))]
    async fn service_restarted(&mut self, services: Vec<Service>) {
        for service in services {
            self.service_applied(service).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// ConfigMap Events //////////////////////////////////////////////////////////
impl Controller {
    /// Handle `ConfigMap` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_config_map_event(&mut self, res: EventResult<ConfigMap>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from ConfigMap k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.config_map_applied(obj).await,
            Event::Deleted(obj) => self.config_map_deleted(obj).await,
            Event::Restarted(objs) => self.config_map_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cm))]
    async fn config_map_applied(&mut self, cm: ConfigMap) {
        let name_str = match cm.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.config_maps.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cm {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        let owner = self.owner_cluster_key(cm.meta());
        self.config_maps.insert(name, cm);
        if let Some(owner) = owner {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cm))]
    async fn config_map_deleted(&mut self, cm: ConfigMap) {
        let name_str = match cm.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (_name, cm) = match self.config_maps.remove_entry(name_str) {
            Some((name, cm)) => (name, cm),
            None => return,
        };
        if let Some(owner) = self.owner_cluster_key(cm.meta()) {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cms))]
    async fn config_map_restarted(&mut self, cms: Vec<ConfigMap>) {
        for cm in cms {
            self.config_map_applied(cm).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.pod_applied(obj).await,
            Event::Deleted(obj) => self.pod_deleted(obj).await,
            Event::Restarted(objs) => self.pod_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod))]
    async fn pod_applied(&mut self, pod: Pod) {
        let name_str = match pod.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.pods.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &pod {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        let owner = self.owner_cluster_key(pod.meta());
        self.pods.insert(name, pod);
        if let Some(owner) = owner {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod))]
    async fn pod_deleted(&mut self, pod: Pod) {
        let name_str = match pod.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (_name, pod) = match self.pods.remove_entry(name_str) {
            Some((name, pod)) => (name, pod),
            None => return,
        };
        if let Some(owner) = self.owner_cluster_key(pod.meta()) {
            self.spawn_task(ReconcileTask::ClusterUpdated(owner), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pods))]
    async fn pod_restarted(&mut self, pods: Vec<Pod>) {
        for pod in pods {
            self.pod_applied(pod).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Utility Methods ///////////////////////////////////////////////////////////
impl Controller {
    /// Resolve the owning cluster of a child object from its labels, reusing the cache key
    /// when the cluster is known.
    fn owner_cluster_key(&self, meta: &ObjectMeta) -> Option<Arc<String>> {
        let owner = meta.labels.as_ref()?.get(builders::LABEL_QUORUM_RS_CLUSTER)?;
        match self.clusters.get_key_value(owner) {
            Some((key, _cluster)) => Some(Arc::clone(key)), // No additional alloc.
            None => Some(Arc::new(owner.clone())),
        }
    }
}
