//! Event handlers feeding the work queue
//!
//! Changes to an `ElasticsearchCluster` enqueue the cluster itself. Changes to
//! an owned workload, service account or service are mapped back to the
//! controlling cluster through its owner reference.

use crate::cache::{ResourceEventHandler, Store};
use crate::controller::Enqueuer;
use crate::crd::{managed_owner_ref, ElasticsearchCluster};
use kube::Resource;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, trace};

/// Handler for the primary kind
pub struct ClusterEventHandler {
    enqueuer: Enqueuer,
}

impl ClusterEventHandler {
    pub fn new(enqueuer: Enqueuer) -> Self {
        Self { enqueuer }
    }
}

impl ResourceEventHandler<ElasticsearchCluster> for ClusterEventHandler {
    fn on_add(&self, obj: &Arc<ElasticsearchCluster>) {
        self.enqueuer.enqueue_add(obj);
    }

    fn on_update(&self, old: &Arc<ElasticsearchCluster>, new: &Arc<ElasticsearchCluster>) {
        if old == new {
            return;
        }
        self.enqueuer.enqueue_add(new);
    }

    fn on_delete(&self, obj: &Arc<ElasticsearchCluster>) {
        self.enqueuer.enqueue_delete(Arc::clone(obj));
    }
}

/// Routes events of a subordinate kind to the cluster that controls it
pub struct OwnerRouter<K> {
    kind: &'static str,
    clusters: Store<ElasticsearchCluster>,
    enqueuer: Enqueuer,
    _kind: PhantomData<fn(&K)>,
}

impl<K: Resource> OwnerRouter<K> {
    pub fn new(kind: &'static str, clusters: Store<ElasticsearchCluster>, enqueuer: Enqueuer) -> Self {
        Self {
            kind,
            clusters,
            enqueuer,
            _kind: PhantomData,
        }
    }

    /// Enqueue the controlling cluster of `obj`, if it is one of ours
    pub fn route(&self, obj: &K) {
        let meta = obj.meta();
        let Some(owner) = managed_owner_ref(meta) else {
            return;
        };

        let namespace = meta.namespace.as_deref().unwrap_or_default();
        let name = meta.name.as_deref().unwrap_or_default();
        match self.clusters.get(namespace, &owner.name) {
            Some(cluster) => {
                trace!(kind = self.kind, name = %name, cluster = %owner.name, "Routing to owner");
                self.enqueuer.enqueue_add(&cluster);
            }
            None => {
                info!(
                    kind = self.kind,
                    namespace = %namespace,
                    "ignoring orphaned {} '{}' of elasticsearchcluster '{}'",
                    self.kind,
                    name,
                    owner.name
                );
            }
        }
    }
}

impl<K> ResourceEventHandler<K> for OwnerRouter<K>
where
    K: Resource + PartialEq,
{
    fn on_add(&self, obj: &Arc<K>) {
        self.route(obj);
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        // periodic relists deliver unchanged objects
        if old == new {
            return;
        }
        self.route(new);
    }

    fn on_delete(&self, obj: &Arc<K>) {
        self.route(obj);
    }
}
