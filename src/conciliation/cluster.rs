//! Resources required by an `SGCluster`.
use super::{
    discoverer::{ResourceGenerationDiscoverer, ResourceGenerator},
    to_dynamic, RequiredResourceGenerator,
};
use crate::{apis::sgcluster::SGCluster, defaults, labels, Error, Result};
use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PodSpec,
            PodTemplateSpec, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::DynamicObject, api::ObjectMeta, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};

const PATRONI_CONTAINER: &str = "patroni";
const POSTGRES_PORT_NAME: &str = "pgport";
const ROLE_KEY: &str = "role";
const PRIMARY_ROLE: &str = "master";

/// Everything the generators of a cluster can read
pub struct ClusterContext {
    pub cluster: SGCluster,
    pub namespace: String,
}

impl ClusterContext {
    pub fn new(cluster: &SGCluster) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::InvalidErr(format!("SGCluster {} has no namespace", cluster.name_any())))?;
        Ok(Self {
            cluster: cluster.clone(),
            namespace,
        })
    }

    fn name(&self) -> String {
        self.cluster.name_any()
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..ObjectMeta::default()
        }
    }

    fn env_config_map_name(&self) -> String {
        format!("{}-env", self.name())
    }
}

/// Environment shared by the Patroni containers
pub struct EnvironmentConfigMap;

impl ResourceGenerator<ClusterContext> for EnvironmentConfigMap {
    fn name(&self) -> &'static str {
        "environment-config-map"
    }

    fn generate(&self, context: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let cluster = &context.cluster;
        let data = BTreeMap::from([
            ("PATRONI_SCOPE".to_owned(), context.name()),
            ("PATRONI_KUBERNETES_NAMESPACE".to_owned(), context.namespace.clone()),
            (
                "PATRONI_KUBERNETES_LABELS".to_owned(),
                serde_json::to_string(&labels::patroni_cluster_labels(cluster))?,
            ),
            ("PG_VERSION".to_owned(), cluster.postgres_version().to_owned()),
            ("POSTGRES_PORT".to_owned(), defaults::default_port().to_string()),
        ]);
        let config_map = ConfigMap {
            metadata: context.metadata(context.env_config_map_name(), labels::cluster_labels(cluster)),
            data: Some(data),
            ..ConfigMap::default()
        };
        Ok(vec![to_dynamic(&config_map)?])
    }
}

/// Service pointing to the Patroni leader
pub struct PrimaryService;

impl ResourceGenerator<ClusterContext> for PrimaryService {
    fn name(&self) -> &'static str {
        "primary-service"
    }

    fn generate(&self, context: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let cluster = &context.cluster;
        let mut selector = labels::patroni_cluster_labels(cluster);
        selector.insert(ROLE_KEY.to_owned(), PRIMARY_ROLE.to_owned());
        let service = Service {
            metadata: context.metadata(format!("{}-primary", context.name()), labels::cluster_labels(cluster)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some(POSTGRES_PORT_NAME.to_owned()),
                    protocol: Some("TCP".to_owned()),
                    port: defaults::default_port(),
                    target_port: Some(IntOrString::String(POSTGRES_PORT_NAME.to_owned())),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        Ok(vec![to_dynamic(&service)?])
    }
}

/// The Patroni members
pub struct PatroniStatefulSet;

impl ResourceGenerator<ClusterContext> for PatroniStatefulSet {
    fn name(&self) -> &'static str {
        "patroni-statefulset"
    }

    fn generate(&self, context: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let cluster = &context.cluster;
        let pod_labels = labels::patroni_cluster_labels(cluster);
        let container = Container {
            name: PATRONI_CONTAINER.to_owned(),
            image: Some(defaults::default_patroni_image(cluster.postgres_version())),
            ports: Some(vec![ContainerPort {
                name: Some(POSTGRES_PORT_NAME.to_owned()),
                container_port: defaults::default_port(),
                protocol: Some("TCP".to_owned()),
                ..ContainerPort::default()
            }]),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: Some(context.env_config_map_name()),
                    optional: None,
                }),
                ..EnvFromSource::default()
            }]),
            ..Container::default()
        };
        let statefulset = StatefulSet {
            metadata: context.metadata(context.name(), labels::cluster_labels(cluster)),
            spec: Some(StatefulSetSpec {
                replicas: Some(cluster.spec.instances),
                service_name: context.name(),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..PodSpec::default()
                    }),
                },
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        };
        Ok(vec![to_dynamic(&statefulset)?])
    }
}

/// Generators of every supported operator version
pub fn cluster_discoverer() -> Result<ResourceGenerationDiscoverer<ClusterContext>> {
    ResourceGenerationDiscoverer::default().register(
        ">=0.1.0",
        vec![
            Arc::new(EnvironmentConfigMap),
            Arc::new(PrimaryService),
            Arc::new(PatroniStatefulSet),
        ],
    )
}

/// [`RequiredResourceGenerator`] of `SGCluster` backed by the version registry
pub struct ClusterRequiredResources {
    discoverer: ResourceGenerationDiscoverer<ClusterContext>,
    operator_version: String,
}

impl ClusterRequiredResources {
    /// Clusters without the operator version annotation use `operator_version`
    pub fn new(discoverer: ResourceGenerationDiscoverer<ClusterContext>, operator_version: &str) -> Self {
        Self {
            discoverer,
            operator_version: operator_version.to_owned(),
        }
    }
}

#[async_trait]
impl RequiredResourceGenerator<SGCluster> for ClusterRequiredResources {
    async fn required_resources(&self, cluster: &SGCluster) -> Result<Vec<DynamicObject>> {
        let version = cluster.operator_version().unwrap_or(self.operator_version.as_str());
        let context = ClusterContext::new(cluster)?;
        self.discoverer.generate(version, &context)
    }
}
