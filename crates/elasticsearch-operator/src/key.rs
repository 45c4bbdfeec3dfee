//! Work queue keys
//!
//! Every cached object is addressed by an [`ObjectKey`]. The work queue holds
//! [`ReconcileKey`]s: either the identity of a cluster that must be re-read
//! from the cache, or a snapshot of a cluster whose deletion was observed.

use crate::crd::ElasticsearchCluster;
use crate::error::{OperatorError, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// `namespace/name` identity of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Kubernetes object
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = OperatorError;

    /// Split a `namespace/name` or bare `name` key
    fn from_str(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new("", name)),
            (Some(ns), Some(name), None) if !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(OperatorError::InvalidKey(key.to_string())),
        }
    }
}

/// A pending unit of reconciliation work
#[derive(Debug, Clone)]
pub enum ReconcileKey {
    /// The cluster may have changed; re-read it from the cache
    ByIdentity(ObjectKey),
    /// The cluster was observed as deleted; reconcile from the captured state
    BySnapshot(Arc<ElasticsearchCluster>),
}

impl ReconcileKey {
    /// Key for a cluster that should be re-read
    pub fn identity(cluster: &ElasticsearchCluster) -> Self {
        ReconcileKey::ByIdentity(ObjectKey::from_resource(cluster))
    }

    /// Identity of the cluster this key refers to
    pub fn object_key(&self) -> ObjectKey {
        match self {
            ReconcileKey::ByIdentity(key) => key.clone(),
            ReconcileKey::BySnapshot(cluster) => ObjectKey::from_resource(cluster.as_ref()),
        }
    }

    fn snapshot_identity(
        cluster: &ElasticsearchCluster,
    ) -> (ObjectKey, Option<&str>, Option<&str>) {
        (
            ObjectKey::from_resource(cluster),
            cluster.metadata.uid.as_deref(),
            cluster.metadata.resource_version.as_deref(),
        )
    }
}

impl PartialEq for ReconcileKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ReconcileKey::ByIdentity(a), ReconcileKey::ByIdentity(b)) => a == b,
            (ReconcileKey::BySnapshot(a), ReconcileKey::BySnapshot(b)) => {
                Arc::ptr_eq(a, b) || Self::snapshot_identity(a) == Self::snapshot_identity(b)
            }
            _ => false,
        }
    }
}

impl Eq for ReconcileKey {}

impl Hash for ReconcileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ReconcileKey::ByIdentity(key) => {
                0u8.hash(state);
                key.hash(state);
            }
            ReconcileKey::BySnapshot(cluster) => {
                1u8.hash(state);
                Self::snapshot_identity(cluster).hash(state);
            }
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileKey::ByIdentity(key) => write!(f, "{}", key),
            ReconcileKey::BySnapshot(cluster) => {
                write!(f, "{} (deleted)", ObjectKey::from_resource(cluster.as_ref()))
            }
        }
    }
}
