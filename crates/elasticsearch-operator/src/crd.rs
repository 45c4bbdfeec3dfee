//! Custom Resource Definitions for the Elasticsearch operator
//!
//! This module defines the `ElasticsearchCluster` CRD that represents an
//! Elasticsearch cluster made of one or more node pools, together with the
//! ownership marker the operator stamps on every resource it creates.

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the operator's resources
pub const API_GROUP: &str = "elasticsearch.operator.io";

/// Kind of the primary resource
pub const CLUSTER_KIND: &str = "ElasticsearchCluster";

/// Value of the `app.kubernetes.io/managed-by` label on owned resources
pub const MANAGER_NAME: &str = "elasticsearch-operator";

/// Regex for validating node pool names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

fn validate_pool_name(value: &str) -> Result<(), ValidationError> {
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name")
            .with_message("node pool name must be a lowercase RFC 1123 label".into()));
    }
    Ok(())
}

fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if !QUANTITY_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid resource quantity", value).into()));
    }
    Ok(())
}

/// ElasticsearchCluster custom resource definition
///
/// Declares the desired shape of an Elasticsearch cluster. The operator
/// watches these resources and converges the owned workloads, service
/// account and services towards the specification.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "elasticsearch.operator.io",
    version = "v1alpha1",
    kind = "ElasticsearchCluster",
    plural = "elasticsearchclusters",
    shortname = "esc",
    namespaced,
    derive = "PartialEq",
    status = "ElasticsearchClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchClusterSpec {
    /// Elasticsearch version to deploy
    #[serde(default)]
    pub version: String,

    /// Container image (overrides the version-based default)
    #[serde(default)]
    pub image: Option<String>,

    /// Node pools making up the cluster, in declaration order
    #[serde(default)]
    #[validate(nested)]
    pub node_pools: Vec<NodePool>,
}

/// A named group of Elasticsearch nodes sharing roles and storage policy
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name, used as a suffix of the generated workload names
    #[validate(
        length(min = 1, max = 40, message = "node pool name must be 1-40 characters"),
        custom(function = "validate_pool_name")
    )]
    pub name: String,

    /// Number of nodes in the pool
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 1000, message = "replicas must be between 0 and 1000"))]
    pub replicas: i32,

    /// Roles of the nodes (data, client, master)
    #[serde(default)]
    pub roles: Vec<String>,

    /// Resource requirements (CPU, memory)
    #[serde(default)]
    #[schemars(skip)]
    pub resources: Option<ResourceRequirements>,

    /// Storage policy of the pool
    #[serde(default)]
    #[validate(nested)]
    pub state: Option<NodePoolState>,
}

/// Storage policy of a node pool
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolState {
    /// Whether nodes keep a stable identity (StatefulSet instead of Deployment)
    #[serde(default)]
    pub stateful: bool,

    /// Persistent volume configuration
    #[serde(default)]
    #[validate(nested)]
    pub persistence: PersistenceSpec,
}

/// Persistent volume configuration of a stateful node pool
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Whether a volume claim is created per node
    #[serde(default)]
    pub enabled: bool,

    /// Requested volume size
    #[serde(default = "default_volume_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class of the volume claims
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for PersistenceSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_volume_size(),
            storage_class: None,
        }
    }
}

/// Role a node can take in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Data,
    Client,
    Master,
}

impl NodeRole {
    /// All roles accepted by the validator
    pub const ALL: [NodeRole; 3] = [NodeRole::Data, NodeRole::Client, NodeRole::Master];

    /// Name as it appears in the spec
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Data => "data",
            NodeRole::Client => "client",
            NodeRole::Master => "master",
        }
    }

    /// Parse a role name, `None` for anything outside data/client/master
    pub fn parse(role: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == role)
    }
}

impl NodePool {
    /// Whether the pool is realised as a StatefulSet
    pub fn is_stateful(&self) -> bool {
        self.state.as_ref().map(|s| s.stateful).unwrap_or(false)
    }

    /// Persistence configuration, if volumes should be claimed
    pub fn persistence(&self) -> Option<&PersistenceSpec> {
        self.state
            .as_ref()
            .filter(|s| s.stateful)
            .map(|s| &s.persistence)
            .filter(|p| p.enabled)
    }

    /// Whether the pool declares the given role
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.iter().any(|r| r == role.as_str())
    }
}

/// Status of an ElasticsearchCluster resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Generation of the spec last acted upon
    #[serde(default)]
    pub observed_generation: i64,

    /// Per node pool replica counts
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolStatus>,

    /// Conditions describing cluster state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Error message if any
    pub message: Option<String>,
}

/// Replica counts of a single node pool
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Desired replicas
    pub replicas: i32,
    /// Replicas passing their readiness checks
    pub ready_replicas: i32,
}

/// Phase of the cluster lifecycle
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Cluster has not been reconciled yet
    #[default]
    Pending,
    /// Some node pools are not fully ready
    Provisioning,
    /// All node pools are ready
    Running,
    /// The spec was rejected
    Failed,
    /// Cluster is being deleted
    Terminating,
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last transition time
    pub last_transition_time: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_volume_size() -> String {
    "10Gi".to_string()
}

impl ElasticsearchClusterSpec {
    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        if let Some(ref image) = self.image {
            image.clone()
        } else {
            format!("docker.elastic.co/elasticsearch/elasticsearch:{}", self.version)
        }
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = selector_labels(cluster_name);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGER_NAME.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.version.clone(),
        );
        labels
    }
}

/// Labels identifying every resource belonging to a cluster
pub fn selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "elasticsearch".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        cluster_name.to_string(),
    );
    labels
}

/// Return the ownership marker of an operator-managed object.
///
/// An object is managed when one of its owner references is the controlling
/// reference and points at an `ElasticsearchCluster` of this API group.
pub fn managed_owner_ref(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|r| {
        r.controller == Some(true)
            && r.kind == CLUSTER_KIND
            && r.api_version.split('/').next() == Some(API_GROUP)
    })
}

/// Build the controlling owner reference for resources created for `cluster`
pub fn owner_reference(cluster: &ElasticsearchCluster) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/v1alpha1", API_GROUP),
        kind: CLUSTER_KIND.to_string(),
        name: cluster.metadata.name.clone().unwrap_or_default(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
