//! Generation of the desired child objects backing a cluster component.
//!
//! Builders here are pure: given a Cluster and one of its components they return fully formed
//! objects, deterministic for identical inputs. All K8s API interaction lives in the pipeline.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    Probe, Service, ServicePort, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use crate::k8s::snapshot::ManagedObject;
use quorum_core::crd::{Cluster, ComponentSpec, RequiredMetadata};
use quorum_core::error::OpsResult;
use quorum_core::instances;

/// The pod container name of the database engine.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_ENGINE: &str = "quorum-engine";

/// The canonical label identifying the owning Cluster of a child object.
pub const LABEL_QUORUM_RS_CLUSTER: &str = "quorum.rs/cluster";
/// The canonical label identifying the owning component of a child object.
pub const LABEL_QUORUM_RS_COMPONENT: &str = "quorum.rs/component";
/// The finalizer guarding component workloads against out-of-band deletion.
pub const FINALIZER_COMPONENT_PROTECTION: &str = "quorum.rs/component-protection";

/// The name of a component's workload StatefulSet.
pub fn sts_name(cluster: &str, component: &str) -> String {
    format!("{}-{}", cluster, component)
}

/// The name of a component's headless governing Service.
pub fn headless_service_name(cluster: &str, component: &str) -> String {
    format!("{}-{}-headless", cluster, component)
}

/// The name of a component's frontend Service.
pub fn frontend_service_name(cluster: &str, component: &str) -> String {
    format!("{}-{}", cluster, component)
}

/// The name of a component's env ConfigMap.
pub fn env_config_map_name(cluster: &str, component: &str) -> String {
    format!("{}-{}-env", cluster, component)
}

/// The name of the seed Job materialized while a component is scaling out.
pub fn scaling_job_name(cluster: &str, component: &str) -> String {
    format!("{}-{}-scaling", cluster, component)
}

/// Build the full desired object set of the given component, ready for diffing.
pub fn build_component_objects(cluster: &Cluster, component: &ComponentSpec) -> OpsResult<Vec<ManagedObject>> {
    Ok(vec![
        ManagedObject::ConfigMap(build_env_config_map(cluster, component)?),
        ManagedObject::Service(build_headless_service(cluster, component)),
        ManagedObject::Service(build_frontend_service(cluster, component)),
        ManagedObject::StatefulSet(build_component_statefulset(cluster, component)),
    ])
}

/// Build the workload StatefulSet of the given component.
pub fn build_component_statefulset(cluster: &Cluster, component: &ComponentSpec) -> StatefulSet {
    let mut sts = StatefulSet::default();
    let labels = sts.meta_mut().labels.get_or_insert_with(Default::default);
    set_component_labels(labels, cluster.name(), &component.name);
    let labels = labels.clone(); // Used below.
    sts.meta_mut().namespace = Some(cluster.namespace().into());
    sts.meta_mut().name = Some(sts_name(cluster.name(), &component.name));
    sts.meta_mut().owner_references = owner_reference(cluster).map(|owner| vec![owner]);
    sts.meta_mut().finalizers = Some(vec![FINALIZER_COMPONENT_PROTECTION.into()]);

    let port = component.service_port();
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.service_name = headless_service_name(cluster.name(), &component.name);
    spec.replicas = Some(component.replicas);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![Container {
                // NOTE WELL: do not change the name of this container. It will cause breaking changes.
                name: CONTAINER_NAME_ENGINE.into(),
                image: Some(component.image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                ports: Some(vec![ContainerPort {
                    name: Some("engine-port".into()),
                    container_port: port,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: Some(env_config_map_name(cluster.name(), &component.name)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                env: Some(vec![
                    EnvVar {
                        name: "NAMESPACE".into(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.namespace".into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "POD_NAME".into(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.name".into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                readiness_probe: Some(Probe {
                    initial_delay_seconds: Some(5),
                    period_seconds: Some(10),
                    tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(port), host: None }),
                    ..Default::default()
                }),
                liveness_probe: Some(Probe {
                    initial_delay_seconds: Some(15),
                    period_seconds: Some(20),
                    tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(port), host: None }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    sts
}

/// Build the headless governing Service of the given component.
pub fn build_headless_service(cluster: &Cluster, component: &ComponentSpec) -> Service {
    let mut service = build_service_base(cluster, component, headless_service_name(cluster.name(), &component.name));
    let spec = service.spec.get_or_insert_with(Default::default);
    spec.cluster_ip = Some("None".into());
    service
}

/// Build the frontend Service of the given component.
pub fn build_frontend_service(cluster: &Cluster, component: &ComponentSpec) -> Service {
    build_service_base(cluster, component, frontend_service_name(cluster.name(), &component.name))
}

fn build_service_base(cluster: &Cluster, component: &ComponentSpec, name: String) -> Service {
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_component_labels(labels, cluster.name(), &component.name);
    service.meta_mut().namespace = Some(cluster.namespace().into());
    service.meta_mut().name = Some(name);
    service.meta_mut().owner_references = owner_reference(cluster).map(|owner| vec![owner]);

    let port = component.service_port();
    let spec = service.spec.get_or_insert_with(Default::default);
    let selector = spec.selector.get_or_insert_with(Default::default);
    set_component_labels(selector, cluster.name(), &component.name);
    spec.type_ = Some("ClusterIP".into());
    spec.ports = Some(vec![ServicePort {
        name: Some("engine-port".into()),
        port,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }]);
    service
}

/// Build the env ConfigMap of the given component.
///
/// The instance roster embedded here is derived from the component's declared topology, so
/// pods always observe a roster consistent with the spec which produced them.
pub fn build_env_config_map(cluster: &Cluster, component: &ComponentSpec) -> OpsResult<ConfigMap> {
    let names = instances::instance_name_set(
        cluster.name(),
        &component.name,
        component.replicas,
        &component.instances,
        &component.offline_instances,
    )?;
    let roster = names.keys().cloned().collect::<Vec<_>>().join(",");

    let mut cm = ConfigMap::default();
    let labels = cm.meta_mut().labels.get_or_insert_with(Default::default);
    set_component_labels(labels, cluster.name(), &component.name);
    cm.meta_mut().namespace = Some(cluster.namespace().into());
    cm.meta_mut().name = Some(env_config_map_name(cluster.name(), &component.name));
    cm.meta_mut().owner_references = owner_reference(cluster).map(|owner| vec![owner]);

    cm.data = Some(maplit::btreemap! {
        "QUORUM_CLUSTER".into() => cluster.name().to_string(),
        "QUORUM_COMPONENT".into() => component.name.clone(),
        "QUORUM_REPLICAS".into() => component.replicas.to_string(),
        "QUORUM_ENGINE_PORT".into() => component.service_port().to_string(),
        "QUORUM_INSTANCES".into() => roster,
    });
    Ok(cm)
}

/// Build an owner reference pointing at the given Cluster, if it has been assigned a UID.
fn owner_reference(cluster: &Cluster) -> Option<OwnerReference> {
    let uid = cluster.meta().uid.clone()?;
    Some(OwnerReference {
        api_version: "quorum.rs/v1alpha1".into(),
        kind: "Cluster".into(),
        name: cluster.name().into(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    })
}

/// Set the canonical labels on an object controlled by Quorum.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "quorum".into());
    labels.insert("quorum.rs/controlled-by".into(), "quorum-operator".into());
}

fn set_component_labels(labels: &mut BTreeMap<String, String>, cluster: &str, component: &str) {
    set_canonical_labels(labels);
    labels.insert(LABEL_QUORUM_RS_CLUSTER.into(), cluster.into());
    labels.insert(LABEL_QUORUM_RS_COMPONENT.into(), component.into());
}
