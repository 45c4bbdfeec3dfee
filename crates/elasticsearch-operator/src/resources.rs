//! Kubernetes Resource Builders
//!
//! This module generates the manifests owned by an ElasticsearchCluster: one
//! workload per node pool (StatefulSet or Deployment), the service account the
//! nodes run as, and the client and discovery services.

use crate::crd::{owner_reference, ElasticsearchCluster, NodePool, NodeRole, API_GROUP};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, SecurityContext, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// HTTP (REST) port of every node
pub const HTTP_PORT: i32 = 9200;

/// Transport (node-to-node) port of every node
pub const TRANSPORT_PORT: i32 = 9300;

/// Suffix of the client-facing service
pub const CLIENT_SERVICE_SUFFIX: &str = "clients";

/// Suffix of the master discovery service
pub const DISCOVERY_SERVICE_SUFFIX: &str = "discovery";

/// Annotation letting discovery see masters before they are ready
pub const TOLERATE_UNREADY_ANNOTATION: &str =
    "service.alpha.kubernetes.io/tolerate-unready-endpoints";

const DATA_VOLUME: &str = "data";
const DATA_PATH: &str = "/usr/share/elasticsearch/data";

/// Label carrying the node pool a workload belongs to
pub fn pool_label() -> String {
    format!("{}/node-pool", API_GROUP)
}

/// Label tying a data claim to the cluster incarnation that created it
pub fn cluster_uid_label() -> String {
    format!("{}/cluster-uid", API_GROUP)
}

/// Label marking pods that take `role`
pub fn role_label(role: NodeRole) -> String {
    format!("{}/role-{}", API_GROUP, role.as_str())
}

/// Builder for generating Kubernetes resources from an ElasticsearchCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a ElasticsearchCluster,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a ElasticsearchCluster) -> Result<Self> {
        let name =
            cluster.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("cluster name is required".to_string())
            })?;

        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            cluster,
            name,
            namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name shared by the service account and used as prefix of everything else
    pub fn resource_name(&self) -> String {
        format!("es-{}", self.name)
    }

    /// Name of the workload realising `pool`
    pub fn workload_name(&self, pool: &NodePool) -> String {
        format!("{}-{}", self.resource_name(), pool.name)
    }

    pub fn client_service_name(&self) -> String {
        format!("{}-{}", self.resource_name(), CLIENT_SERVICE_SUFFIX)
    }

    pub fn discovery_service_name(&self) -> String {
        format!("{}-{}", self.resource_name(), DISCOVERY_SERVICE_SUFFIX)
    }

    fn owner_reference(&self) -> OwnerReference {
        owner_reference(self.cluster)
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Labels selecting the pods of one pool
    fn pool_selector(&self, pool: &NodePool) -> BTreeMap<String, String> {
        let mut labels = crate::crd::selector_labels(&self.name);
        labels.insert(pool_label(), pool.name.clone());
        labels
    }

    fn pool_labels(&self, pool: &NodePool) -> BTreeMap<String, String> {
        let mut labels = self.cluster.spec.get_labels(&self.name);
        labels.insert(pool_label(), pool.name.clone());
        labels
    }

    /// Claims outlive their StatefulSet and carry no owner reference, so
    /// they are labelled with the owning cluster's uid
    fn claim_labels(&self, pool: &NodePool) -> BTreeMap<String, String> {
        let mut labels = self.pool_labels(pool);
        if let Some(uid) = &self.cluster.metadata.uid {
            labels.insert(cluster_uid_label(), uid.clone());
        }
        labels
    }

    fn pod_labels(&self, pool: &NodePool) -> BTreeMap<String, String> {
        let mut labels = self.pool_labels(pool);
        for role in NodeRole::ALL {
            if pool.has_role(role) {
                labels.insert(role_label(role), "true".to_string());
            }
        }
        labels
    }

    /// Build the StatefulSet for a stateful node pool
    pub fn build_statefulset(&self, pool: &NodePool) -> StatefulSet {
        let name = self.workload_name(pool);
        let persistence = pool.persistence();

        let volume_claim_templates = persistence.map(|p| {
            let mut requests = BTreeMap::new();
            requests.insert("storage".to_string(), Quantity(p.size.clone()));

            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    labels: Some(self.claim_labels(pool)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: p.storage_class.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });

        StatefulSet {
            metadata: self.metadata(name, self.pool_labels(pool)),
            spec: Some(StatefulSetSpec {
                service_name: self.discovery_service_name(),
                replicas: Some(pool.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.pool_selector(pool)),
                    ..Default::default()
                },
                template: self.build_pod_template(pool, persistence.is_none()),
                volume_claim_templates,
                pod_management_policy: Some("Parallel".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Deployment for a non-stateful node pool
    pub fn build_deployment(&self, pool: &NodePool) -> Deployment {
        let name = self.workload_name(pool);

        Deployment {
            metadata: self.metadata(name, self.pool_labels(pool)),
            spec: Some(DeploymentSpec {
                replicas: Some(pool.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.pool_selector(pool)),
                    ..Default::default()
                },
                template: self.build_pod_template(pool, true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_pod_template(&self, pool: &NodePool, ephemeral_data: bool) -> PodTemplateSpec {
        let volumes = ephemeral_data.then(|| {
            vec![Volume {
                name: DATA_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]
        });

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.pod_labels(pool)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![self.build_container(pool)],
                service_account_name: Some(self.resource_name()),
                automount_service_account_token: Some(false),
                volumes,
                security_context: Some(PodSecurityContext {
                    run_as_non_root: Some(true),
                    run_as_user: Some(1000),
                    run_as_group: Some(1000),
                    fs_group: Some(1000),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    /// Build the Elasticsearch container of a pool's pods
    fn build_container(&self, pool: &NodePool) -> Container {
        let env_value = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        };

        let env = vec![
            env_value("cluster.name", self.name.clone()),
            EnvVar {
                name: "node.name".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env_value("network.host", "0.0.0.0".to_string()),
            env_value("discovery.seed_hosts", self.discovery_service_name()),
            env_value("node.master", pool.has_role(NodeRole::Master).to_string()),
            env_value("node.data", pool.has_role(NodeRole::Data).to_string()),
            env_value("node.ingest", pool.has_role(NodeRole::Client).to_string()),
        ];

        Container {
            name: "elasticsearch".to_string(),
            image: Some(self.cluster.spec.get_image()),
            env: Some(env),
            ports: Some(vec![
                ContainerPort {
                    name: Some("http".to_string()),
                    container_port: HTTP_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("transport".to_string()),
                    container_port: TRANSPORT_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            resources: pool.resources.clone(),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/_cluster/health?local=true".to_string()),
                    port: IntOrString::Int(HTTP_PORT),
                    scheme: Some("HTTP".to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_PATH.to_string(),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the service account the nodes run as
    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(
                self.resource_name(),
                self.cluster.spec.get_labels(&self.name),
            ),
            automount_service_account_token: Some(false),
            ..Default::default()
        }
    }

    /// Build the client-facing service, selecting nodes with the client role
    pub fn build_client_service(&self) -> Service {
        let mut selector = crate::crd::selector_labels(&self.name);
        selector.insert(role_label(NodeRole::Client), "true".to_string());

        Service {
            metadata: self.metadata(
                self.client_service_name(),
                self.cluster.spec.get_labels(&self.name),
            ),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector),
                ports: Some(vec![
                    ServicePort {
                        name: Some("http".to_string()),
                        port: HTTP_PORT,
                        target_port: Some(IntOrString::Int(HTTP_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("transport".to_string()),
                        port: TRANSPORT_PORT,
                        target_port: Some(IntOrString::Int(TRANSPORT_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the headless discovery service, selecting master nodes
    pub fn build_discovery_service(&self) -> Service {
        let mut selector = crate::crd::selector_labels(&self.name);
        selector.insert(role_label(NodeRole::Master), "true".to_string());

        let mut metadata = self.metadata(
            self.discovery_service_name(),
            self.cluster.spec.get_labels(&self.name),
        );
        metadata.annotations = Some(BTreeMap::from([(
            TOLERATE_UNREADY_ANNOTATION.to_string(),
            "true".to_string(),
        )]));

        Service {
            metadata,
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("transport".to_string()),
                    port: TRANSPORT_PORT,
                    target_port: Some(IntOrString::Int(TRANSPORT_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        managed_owner_ref, ElasticsearchClusterSpec, NodePoolState, PersistenceSpec, MANAGER_NAME,
    };

    fn pool(name: &str, roles: &[&str], stateful: bool, persistence: bool) -> NodePool {
        NodePool {
            name: name.to_string(),
            replicas: 3,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            resources: None,
            state: Some(NodePoolState {
                stateful,
                persistence: PersistenceSpec {
                    enabled: persistence,
                    size: "50Gi".to_string(),
                    storage_class: Some("fast".to_string()),
                },
            }),
        }
    }

    fn create_test_cluster() -> ElasticsearchCluster {
        let mut cluster = ElasticsearchCluster::new(
            "logs",
            ElasticsearchClusterSpec {
                version: "7.1.1".to_string(),
                image: None,
                node_pools: vec![
                    pool("masters", &["master"], true, true),
                    pool("clients", &["client"], false, false),
                ],
            },
        );
        cluster.metadata.namespace = Some("search".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster
    }

    #[test]
    fn test_build_statefulset() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset(&cluster.spec.node_pools[0]);

        assert_eq!(sts.metadata.name.as_deref(), Some("es-logs-masters"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "es-logs-discovery");

        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        let claim_labels = claims[0].metadata.labels.as_ref().unwrap();
        assert_eq!(claim_labels[&cluster_uid_label()], "uid-1");
        let claim = claims[0].spec.as_ref().unwrap();
        assert_eq!(claim.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            claim.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("50Gi".to_string())
        );

        // persistent pools mount the claim, not an emptyDir
        assert!(spec.template.spec.unwrap().volumes.is_none());
    }

    #[test]
    fn test_statefulset_without_persistence_uses_empty_dir() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset(&pool("data", &["data"], true, false));

        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn test_build_deployment() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let deploy = builder.build_deployment(&cluster.spec.node_pools[1]);

        assert_eq!(deploy.metadata.name.as_deref(), Some("es-logs-clients"));
        let spec = deploy.spec.unwrap();
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()[&pool_label()],
            "clients"
        );

        let pod = spec.template;
        let labels = pod.metadata.unwrap().labels.unwrap();
        assert_eq!(labels[&role_label(NodeRole::Client)], "true");
        assert!(!labels.contains_key(&role_label(NodeRole::Master)));

        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("docker.elastic.co/elasticsearch/elasticsearch:7.1.1")
        );
        let env = container.env.as_ref().unwrap();
        let master = env.iter().find(|e| e.name == "node.master").unwrap();
        assert_eq!(master.value.as_deref(), Some("false"));
        assert_eq!(
            pod.spec.unwrap().service_account_name.as_deref(),
            Some("es-logs")
        );
    }

    #[test]
    fn test_build_client_service() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let svc = builder.build_client_service();

        assert_eq!(svc.metadata.name.as_deref(), Some("es-logs-clients"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.selector.unwrap()[&role_label(NodeRole::Client)], "true");
        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].port, HTTP_PORT);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn test_build_discovery_service() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let svc = builder.build_discovery_service();

        assert_eq!(svc.metadata.name.as_deref(), Some("es-logs-discovery"));
        assert_eq!(
            svc.metadata.annotations.unwrap()[TOLERATE_UNREADY_ANNOTATION],
            "true"
        );
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.selector.unwrap()[&role_label(NodeRole::Master)], "true");
        assert_eq!(spec.ports.unwrap()[0].port, TRANSPORT_PORT);
    }

    #[test]
    fn test_owner_references() {
        let cluster = create_test_cluster();
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let pools = &cluster.spec.node_pools;

        let metas = vec![
            builder.build_statefulset(&pools[0]).metadata,
            builder.build_deployment(&pools[1]).metadata,
            builder.build_service_account().metadata,
            builder.build_client_service().metadata,
            builder.build_discovery_service().metadata,
        ];
        for meta in metas {
            let owner = managed_owner_ref(&meta).expect("owned by the cluster");
            assert_eq!(owner.name, "logs");
            assert_eq!(owner.uid, "uid-1");
            assert_eq!(meta.namespace.as_deref(), Some("search"));
            assert_eq!(
                meta.labels.unwrap()["app.kubernetes.io/managed-by"],
                MANAGER_NAME
            );
        }
    }

    #[test]
    fn test_builder_requires_name() {
        let mut cluster = create_test_cluster();
        cluster.metadata.name = None;
        assert!(ResourceBuilder::new(&cluster).is_err());
    }
}
