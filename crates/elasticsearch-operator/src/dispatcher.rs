//! Sync dispatcher
//!
//! Turns a dequeued [`ReconcileKey`] into a strategy call and decides what
//! happens to the key afterwards.
//!
//! - `ByIdentity`: the cluster is re-read from the cache. A missing cluster
//!   was deleted in the meantime and needs no work. A cluster marked for
//!   deletion goes straight to the strategy for teardown. An invalid spec is
//!   recorded on the cluster status and not retried. Otherwise the strategy
//!   runs and retryable failures are requeued with backoff.
//! - `BySnapshot`: the captured cluster is stamped with a deletion timestamp
//!   and handed to the strategy exactly once, whatever the outcome.

use crate::cache::Store;
use crate::crd::ElasticsearchCluster;
use crate::error::Result;
use crate::key::{ObjectKey, ReconcileKey};
use crate::metrics::ControllerMetrics;
use crate::status::StatusRecorder;
use crate::strategy::ClusterStrategy;
use crate::validation::verify_cluster;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// What the worker should do with a key after dispatching it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done for now; clear the key's backoff
    Forget,
    /// Try again after the rate limiter's delay
    Retry,
}

/// Loads cluster state and runs the convergence strategy
pub struct SyncDispatcher {
    clusters: Store<ElasticsearchCluster>,
    strategy: Arc<dyn ClusterStrategy>,
    status: Arc<dyn StatusRecorder>,
    metrics: ControllerMetrics,
}

impl SyncDispatcher {
    pub fn new(
        clusters: Store<ElasticsearchCluster>,
        strategy: Arc<dyn ClusterStrategy>,
        status: Arc<dyn StatusRecorder>,
    ) -> Self {
        Self {
            clusters,
            strategy,
            status,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Process one key and decide its fate
    #[instrument(skip(self), fields(key = %key))]
    pub async fn dispatch(&self, key: &ReconcileKey) -> Disposition {
        self.metrics.reconciliations.increment(1);
        let start = Instant::now();

        let disposition = match key {
            ReconcileKey::ByIdentity(id) => match self.sync(id).await {
                Ok(()) => Disposition::Forget,
                Err(e) if e.is_retryable() => {
                    self.metrics.errors.increment(1);
                    warn!(error = %e, "Error syncing ElasticsearchCluster {}, requeuing", id);
                    Disposition::Retry
                }
                Err(e) => {
                    self.metrics.errors.increment(1);
                    error!(error = %e, "Error syncing ElasticsearchCluster {}, not retrying", id);
                    Disposition::Forget
                }
            },
            ReconcileKey::BySnapshot(cluster) => {
                self.metrics.deletions.increment(1);
                if let Err(e) = self.sync_deleted(cluster).await {
                    self.metrics.errors.increment(1);
                    error!(error = %e, "Error syncing deleted ElasticsearchCluster {}", key);
                }
                Disposition::Forget
            }
        };

        self.metrics.duration.record(start.elapsed().as_secs_f64());
        disposition
    }

    /// Converge the cluster currently cached under `key`
    pub async fn sync(&self, key: &ObjectKey) -> Result<()> {
        let start = Instant::now();
        let result = self.sync_cached(key).await;
        info!(
            "Finished syncing elasticsearchcluster \"{}\" ({:?})",
            key,
            start.elapsed()
        );
        result
    }

    async fn sync_cached(&self, key: &ObjectKey) -> Result<()> {
        let Some(cluster) = self.clusters.get_key(key) else {
            info!("ElasticsearchCluster {} has been deleted", key);
            return Ok(());
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            return self.strategy.sync_cluster(cluster).await;
        }

        if let Err(spec_error) = verify_cluster(&cluster.spec) {
            warn!(error = %spec_error, "Rejecting ElasticsearchCluster {}", key);
            self.metrics.rejections.increment(1);
            return self.status.record_rejection(cluster, spec_error).await;
        }

        self.strategy.sync_cluster(cluster).await
    }

    async fn sync_deleted(&self, snapshot: &Arc<ElasticsearchCluster>) -> Result<()> {
        let mut cluster = ElasticsearchCluster::clone(snapshot);
        cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
        self.strategy.sync_cluster(Arc::new(cluster)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Informer, WatchEvent};
    use crate::crd::{ElasticsearchClusterSpec, NodePool};
    use crate::error::OperatorError;
    use crate::status::MockStatusRecorder;
    use crate::strategy::MockClusterStrategy;
    use crate::validation::SpecError;

    fn cluster(name: &str, version: &str) -> ElasticsearchCluster {
        let mut c = ElasticsearchCluster::new(
            name,
            ElasticsearchClusterSpec {
                version: version.to_string(),
                image: None,
                node_pools: vec![NodePool {
                    name: "data".to_string(),
                    replicas: 1,
                    roles: vec!["data".to_string()],
                    ..Default::default()
                }],
            },
        );
        c.metadata.namespace = Some("ns".to_string());
        c
    }

    fn dispatcher(
        cached: Vec<ElasticsearchCluster>,
        strategy: MockClusterStrategy,
        status: MockStatusRecorder,
    ) -> SyncDispatcher {
        let mut informer = Informer::new("ElasticsearchCluster");
        for c in cached {
            informer.apply(WatchEvent::Apply(c));
        }
        SyncDispatcher::new(informer.store(), Arc::new(strategy), Arc::new(status))
    }

    fn by_id(name: &str) -> ReconcileKey {
        ReconcileKey::ByIdentity(ObjectKey::new("ns", name))
    }

    #[tokio::test]
    async fn test_valid_cluster_runs_strategy_once() {
        let mut strategy = MockClusterStrategy::new();
        strategy
            .expect_sync_cluster()
            .withf(|c| c.metadata.name.as_deref() == Some("A"))
            .times(1)
            .returning(|_| Ok(()));
        let d = dispatcher(vec![cluster("A", "7.1")], strategy, MockStatusRecorder::new());

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Forget);
    }

    #[tokio::test]
    async fn test_missing_cluster_needs_no_work() {
        let d = dispatcher(vec![], MockClusterStrategy::new(), MockStatusRecorder::new());
        assert_eq!(d.dispatch(&by_id("gone")).await, Disposition::Forget);
    }

    #[tokio::test]
    async fn test_retryable_error_requeues() {
        let mut strategy = MockClusterStrategy::new();
        strategy
            .expect_sync_cluster()
            .returning(|_| Err(OperatorError::Timeout("apiserver".to_string())));
        let d = dispatcher(vec![cluster("A", "7.1")], strategy, MockStatusRecorder::new());

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Retry);
    }

    #[tokio::test]
    async fn test_terminal_error_is_dropped() {
        let mut strategy = MockClusterStrategy::new();
        strategy
            .expect_sync_cluster()
            .times(1)
            .returning(|_| Err(OperatorError::InvalidConfig("owned by helm".to_string())));
        let d = dispatcher(vec![cluster("A", "7.1")], strategy, MockStatusRecorder::new());

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Forget);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_recorded_not_converged() {
        let mut status = MockStatusRecorder::new();
        status
            .expect_record_rejection()
            .withf(|c, e| c.metadata.name.as_deref() == Some("A") && *e == SpecError::MissingVersion)
            .times(1)
            .returning(|_, _| Ok(()));
        let d = dispatcher(vec![cluster("A", "")], MockClusterStrategy::new(), status);

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Forget);
    }

    #[tokio::test]
    async fn test_terminating_cluster_skips_validation() {
        let mut strategy = MockClusterStrategy::new();
        strategy
            .expect_sync_cluster()
            .withf(|c| c.metadata.deletion_timestamp.is_some())
            .times(1)
            .returning(|_| Ok(()));
        let mut terminating = cluster("A", "");
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let d = dispatcher(vec![terminating], strategy, MockStatusRecorder::new());

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Forget);
    }

    #[tokio::test]
    async fn test_failed_rejection_record_is_retried() {
        let mut status = MockStatusRecorder::new();
        status
            .expect_record_rejection()
            .returning(|_, _| Err(OperatorError::Timeout("apiserver".to_string())));
        let d = dispatcher(vec![cluster("A", "")], MockClusterStrategy::new(), status);

        assert_eq!(d.dispatch(&by_id("A")).await, Disposition::Retry);
    }

    #[tokio::test]
    async fn test_snapshot_is_stamped_and_always_forgotten() {
        let mut strategy = MockClusterStrategy::new();
        strategy
            .expect_sync_cluster()
            .withf(|c| c.metadata.deletion_timestamp.is_some())
            .times(1)
            .returning(|_| Err(OperatorError::Timeout("apiserver".to_string())));
        let d = dispatcher(vec![], strategy, MockStatusRecorder::new());

        let snapshot = Arc::new(cluster("A", "7.1"));
        let key = ReconcileKey::BySnapshot(Arc::clone(&snapshot));
        assert_eq!(d.dispatch(&key).await, Disposition::Forget);
        assert!(snapshot.metadata.deletion_timestamp.is_none());
    }
}
