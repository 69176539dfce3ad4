//! The object generation pipeline.
//!
//! Each reconcile tick regenerates the full desired object set of a Cluster, diffs it against
//! the observed snapshot, and produces a transient plan graph of create/update/delete actions.
//! The graph is executed in dependency order and discarded. Failed tasks are rescheduled by
//! the controller, so any individual tick only needs to make progress, not finish.
//!
//! We leverage K8s [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/)
//! for all object updates. K8s will reject a request to update a resource if the resource
//! presented is not the most up-to-date version known to the K8s API, which guards against
//! races with other writers without any client-side locking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use tokio::time::timeout;

use crate::k8s::builders;
use crate::k8s::snapshot::{self, ManagedKind, ManagedObject, ObjectKey};
use crate::k8s::{Controller, APP_NAME};
use quorum_core::crd::Cluster;
use quorum_core::error::OpsResult;
use quorum_core::graph::Dag;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A single planned action against a child object.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Create(ManagedObject),
    Update(ManagedObject),
    Delete(ObjectKey),
    /// The observed object already matches its regenerated form, or deletion of this kind is
    /// suppressed by compatibility mode. Nothing is sent to the API.
    NoOp(ObjectKey),
}

impl Action {
    /// The identity key of the object this action targets.
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Create(obj) | Self::Update(obj) => obj.key(),
            Self::Delete(key) | Self::NoOp(key) => key.clone(),
        }
    }
}

/// Plan the actions needed to drive the observed snapshot to the desired set.
///
/// With `compatibility_mode` enabled, ConfigMaps which are no longer generated are left in
/// place rather than deleted, allowing externally provisioned configuration to survive.
pub fn plan(
    observed: &BTreeMap<ObjectKey, ManagedObject>, desired: &BTreeMap<ObjectKey, ManagedObject>, compatibility_mode: bool,
) -> OpsResult<Dag<ObjectKey, Action>> {
    let sets = snapshot::diff(observed, desired);
    let mut dag = Dag::new();
    let mut keys = BTreeSet::new();

    for key in &sets.create {
        dag.add_vertex(key.clone(), Action::Create(desired[key].clone()));
        keys.insert(key.clone());
    }
    for key in &sets.update {
        let merged = snapshot::merge(&observed[key], &desired[key])?;
        let action = if merged == observed[key] { Action::NoOp(key.clone()) } else { Action::Update(merged) };
        dag.add_vertex(key.clone(), action);
        keys.insert(key.clone());
    }
    for key in &sets.delete {
        let action = if compatibility_mode && key.kind == ManagedKind::ConfigMap {
            Action::NoOp(key.clone())
        } else {
            Action::Delete(key.clone())
        };
        dag.add_vertex(key.clone(), action);
        keys.insert(key.clone());
    }

    // Workloads act only after the objects their pods resolve at startup are in place. The
    // dependency keys follow the builder naming scheme; deletes stay unordered.
    for key in keys.iter().filter(|key| key.kind == ManagedKind::StatefulSet) {
        if sets.delete.contains(key) {
            continue;
        }
        let parents = [
            ObjectKey { kind: ManagedKind::Service, namespace: key.namespace.clone(), name: format!("{}-headless", key.name) },
            ObjectKey { kind: ManagedKind::Service, namespace: key.namespace.clone(), name: key.name.clone() },
            ObjectKey { kind: ManagedKind::ConfigMap, namespace: key.namespace.clone(), name: format!("{}-env", key.name) },
        ];
        for parent in parents {
            if keys.contains(&parent) && !sets.delete.contains(&parent) {
                dag.connect(&parent, key);
            }
        }
    }

    Ok(dag)
}

impl Controller {
    /// Reconcile the child objects of the given Cluster.
    ///
    /// Regenerates the desired object set from the cluster spec, plans against the cached
    /// observed snapshot and executes the plan in dependency order.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub(super) async fn reconcile_cluster_objects(&mut self, name: &Arc<String>) -> Result<()> {
        let cluster = match self.clusters.get(name) {
            Some(cluster) => cluster.clone(),
            None => return Ok(()),
        };
        let desired = self.desired_objects(&cluster).context("error generating desired object set for cluster")?;
        let observed = self.observed_objects(name.as_str());
        let dag = plan(&observed, &desired, self.config.compatibility_mode).context("error planning object updates for cluster")?;
        for action in dag.into_ordered() {
            self.execute_action(action).await?;
        }
        Ok(())
    }

    /// Generate the full desired object set of the given Cluster.
    fn desired_objects(&self, cluster: &Cluster) -> OpsResult<BTreeMap<ObjectKey, ManagedObject>> {
        let mut desired = BTreeMap::new();
        for component in &cluster.spec.components {
            for object in builders::build_component_objects(cluster, component)? {
                desired.insert(object.key(), object);
            }
        }
        Ok(desired)
    }

    /// Assemble the observed snapshot of the given Cluster from the watcher caches.
    fn observed_objects(&self, cluster: &str) -> BTreeMap<ObjectKey, ManagedObject> {
        let mut observed = BTreeMap::new();
        let owned_by = |labels: &Option<BTreeMap<String, String>>| {
            labels
                .as_ref()
                .and_then(|labels| labels.get(builders::LABEL_QUORUM_RS_CLUSTER))
                .map(|owner| owner == cluster)
                .unwrap_or(false)
        };
        for sts in self.statefulsets.values().filter(|sts| owned_by(&sts.metadata.labels)) {
            let object = ManagedObject::StatefulSet(sts.clone());
            observed.insert(object.key(), object);
        }
        for svc in self.services.values().filter(|svc| owned_by(&svc.metadata.labels)) {
            let object = ManagedObject::Service(svc.clone());
            observed.insert(object.key(), object);
        }
        for cm in self.config_maps.values().filter(|cm| owned_by(&cm.metadata.labels)) {
            let object = ManagedObject::ConfigMap(cm.clone());
            observed.insert(object.key(), object);
        }
        observed
    }

    /// Execute a single planned action against the K8s API.
    #[tracing::instrument(level = "debug", skip(self, action))]
    async fn execute_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::NoOp(_key) => Ok(()),
            Action::Create(object) | Action::Update(object) => match object {
                ManagedObject::StatefulSet(sts) => {
                    let sts = self.apply_statefulset(sts).await?;
                    if let Some(name) = sts.metadata.name.clone() {
                        self.statefulsets.insert(Arc::new(name), sts);
                    }
                    Ok(())
                }
                ManagedObject::Service(svc) => {
                    let svc = self.apply_service(svc).await?;
                    if let Some(name) = svc.metadata.name.clone() {
                        self.services.insert(Arc::new(name), svc);
                    }
                    Ok(())
                }
                ManagedObject::ConfigMap(cm) => {
                    let cm = self.apply_config_map(cm).await?;
                    if let Some(name) = cm.metadata.name.clone() {
                        self.config_maps.insert(Arc::new(name), cm);
                    }
                    Ok(())
                }
            },
            Action::Delete(key) => {
                match key.kind {
                    ManagedKind::StatefulSet => {
                        self.delete_statefulset(&key.name).await?;
                        self.statefulsets.remove(&key.name);
                    }
                    ManagedKind::Service => {
                        self.delete_service(&key.name).await?;
                        self.services.remove(&key.name);
                    }
                    ManagedKind::ConfigMap => {
                        self.delete_config_map(&key.name).await?;
                        self.config_maps.remove(&key.name);
                    }
                }
                Ok(())
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// K8s API Methods ///////////////////////////////////////////////////////////
impl Controller {
    /// Apply the given StatefulSet in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn apply_statefulset(&self, mut sts: StatefulSet) -> Result<StatefulSet> {
        if let Some(name) = sts.metadata.name.as_ref() {
            tracing::info!(%name, "applying StatefulSet");
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        sts.metadata.managed_fields = None;
        let name = sts.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&sts)))
            .await
            .context("timeout while applying StatefulSet for component")?
            .context("error applying StatefulSet for component")
    }

    /// Apply the given Service in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, service))]
    async fn apply_service(&self, mut service: Service) -> Result<Service> {
        if let Some(name) = service.metadata.name.as_ref() {
            tracing::info!(%name, "applying Service");
        }
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        service.metadata.managed_fields = None;
        let name = service.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&service)))
            .await
            .context("timeout while applying Service for component")?
            .context("error applying Service for component")
    }

    /// Apply the given ConfigMap in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, cm))]
    async fn apply_config_map(&self, mut cm: ConfigMap) -> Result<ConfigMap> {
        if let Some(name) = cm.metadata.name.as_ref() {
            tracing::info!(%name, "applying ConfigMap");
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        cm.metadata.managed_fields = None;
        let name = cm.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&cm)))
            .await
            .context("timeout while applying ConfigMap for component")?
            .context("error applying ConfigMap for component")
    }

    /// Delete the target StatefulSet, first releasing its protection finalizer.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub(super) async fn delete_statefulset(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        self.release_finalizer(&api, name).await?;
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting StatefulSet for component")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting StatefulSet for component"),
            },
        }
    }

    /// Delete the target Service.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_service(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting Service");
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting Service for component")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting Service for component"),
            },
        }
    }

    /// Delete the target ConfigMap.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_config_map(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting ConfigMap");
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting ConfigMap for component")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting ConfigMap for component"),
            },
        }
    }

    /// Strip the component protection finalizer from the target object, tolerating absence.
    pub(crate) async fn release_finalizer<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let object = match timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching object for finalizer release")? {
            Ok(object) => object,
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => return Ok(()),
            Err(err) => return Err(err).context("error fetching object for finalizer release"),
        };
        let finalizers: Vec<String> = object
            .meta()
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|finalizer| finalizer != builders::FINALIZER_COMPONENT_PROTECTION)
            .collect();
        if object.meta().finalizers.as_deref().unwrap_or_default().len() == finalizers.len() {
            return Ok(());
        }
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        let res = timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while releasing finalizer")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error releasing finalizer"),
            },
        }
    }
}
