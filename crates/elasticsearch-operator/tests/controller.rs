//! End-to-end tests of the reconciliation loop, driven through the informers

use async_trait::async_trait;
use elasticsearch_operator::cache::WatchEvent;
use elasticsearch_operator::config::ControllerConfig;
use elasticsearch_operator::controller::{Controller, Informers};
use elasticsearch_operator::crd::{
    owner_reference, ElasticsearchCluster, ElasticsearchClusterSpec, NodePool, NodePoolState,
    PersistenceSpec,
};
use elasticsearch_operator::error::{OperatorError, Result};
use elasticsearch_operator::key::{ObjectKey, ReconcileKey};
use elasticsearch_operator::status::{NoopStatusRecorder, StatusRecorder};
use elasticsearch_operator::strategy::ClusterStrategy;
use elasticsearch_operator::validation::SpecError;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mockall::mock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

mock! {
    Strategy {}

    #[async_trait]
    impl ClusterStrategy for Strategy {
        async fn sync_cluster(&self, cluster: Arc<ElasticsearchCluster>) -> Result<()>;
    }
}

mock! {
    Recorder {}

    #[async_trait]
    impl StatusRecorder for Recorder {
        async fn record_rejection(
            &self,
            cluster: Arc<ElasticsearchCluster>,
            error: SpecError,
        ) -> Result<()>;
    }
}

const WAIT: Duration = Duration::from_secs(5);

fn cluster(name: &str, version: &str) -> ElasticsearchCluster {
    let mut c = ElasticsearchCluster::new(
        name,
        ElasticsearchClusterSpec {
            version: version.to_string(),
            image: None,
            node_pools: vec![NodePool {
                name: "data".to_string(),
                replicas: 3,
                roles: vec!["data".to_string(), "master".to_string()],
                resources: None,
                state: Some(NodePoolState {
                    stateful: true,
                    persistence: PersistenceSpec {
                        enabled: true,
                        ..Default::default()
                    },
                }),
            }],
        },
    );
    c.metadata.namespace = Some("ns".to_string());
    c.metadata.uid = Some(format!("{}-uid", name));
    c.metadata.resource_version = Some("1".to_string());
    c
}

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 1,
        resync_interval_secs: 0,
        ..Default::default()
    }
}

/// Deliver the initial listing to every informer
fn initial_sync(informers: &mut Informers, clusters: Vec<ElasticsearchCluster>) {
    informers.clusters.apply(WatchEvent::Init);
    for c in clusters {
        informers.clusters.apply(WatchEvent::InitApply(c));
    }
    informers.clusters.apply(WatchEvent::InitDone);
    informers.deployments.apply(WatchEvent::InitDone);
    informers.stateful_sets.apply(WatchEvent::InitDone);
    informers.service_accounts.apply(WatchEvent::InitDone);
    informers.services.apply(WatchEvent::InitDone);
}

fn start(controller: Controller) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(1, rx));
    (tx, handle)
}

async fn stop(tx: watch::Sender<bool>, handle: JoinHandle<Result<()>>) {
    tx.send(true).unwrap();
    timeout(WAIT, handle)
        .await
        .expect("controller should stop")
        .expect("controller task panicked")
        .expect("controller returned an error");
}

/// Strategy mock reporting every call on a channel
fn recording_strategy(
    calls: usize,
) -> (MockStrategy, mpsc::UnboundedReceiver<Arc<ElasticsearchCluster>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut strategy = MockStrategy::new();
    strategy
        .expect_sync_cluster()
        .times(calls)
        .returning(move |c| {
            let _ = tx.send(c);
            Ok(())
        });
    (strategy, rx)
}

async fn next_call(
    rx: &mut mpsc::UnboundedReceiver<Arc<ElasticsearchCluster>>,
) -> Arc<ElasticsearchCluster> {
    timeout(WAIT, rx.recv())
        .await
        .expect("strategy should be called")
        .expect("strategy channel closed")
}

#[tokio::test]
async fn test_valid_cluster_is_synced_once_and_forgotten() {
    let (strategy, mut calls) = recording_strategy(1);
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    initial_sync(&mut informers, vec![cluster("A", "7.1")]);

    // a burst of identical events collapses into the pending key
    informers.clusters.apply(WatchEvent::Apply(cluster("A", "7.1")));

    let (tx, handle) = start(controller);
    let synced = next_call(&mut calls).await;
    assert_eq!(synced.metadata.name.as_deref(), Some("A"));
    assert!(synced.metadata.deletion_timestamp.is_none());

    stop(tx, handle).await;
    let key = ReconcileKey::ByIdentity(ObjectKey::new("ns", "A"));
    assert_eq!(queue.num_requeues(&key), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_deleted_subordinate_retriggers_owner() {
    let (strategy, mut calls) = recording_strategy(2);
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let owner = cluster("A", "7.1");
    initial_sync(&mut informers, vec![owner.clone()]);

    let (tx, handle) = start(controller);
    next_call(&mut calls).await;

    informers.stateful_sets.apply(WatchEvent::Delete(StatefulSet {
        metadata: ObjectMeta {
            name: Some("es-A-data".to_string()),
            namespace: Some("ns".to_string()),
            owner_references: Some(vec![owner_reference(&owner)]),
            ..Default::default()
        },
        ..Default::default()
    }));

    let resynced = next_call(&mut calls).await;
    assert_eq!(resynced.metadata.name.as_deref(), Some("A"));
    stop(tx, handle).await;
}

#[tokio::test]
async fn test_missing_cluster_is_not_retried() {
    let (strategy, mut calls) = recording_strategy(1);
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    let enqueuer = controller.enqueuer();
    initial_sync(&mut informers, vec![]);

    enqueuer.enqueue_key("ns/missing").unwrap();
    informers.clusters.apply(WatchEvent::Apply(cluster("A", "7.1")));

    let (tx, handle) = start(controller);
    // the single worker handles keys in order, so the missing key is done
    let synced = next_call(&mut calls).await;
    assert_eq!(synced.metadata.name.as_deref(), Some("A"));

    stop(tx, handle).await;
    let missing = ReconcileKey::ByIdentity(ObjectKey::new("ns", "missing"));
    assert_eq!(queue.num_requeues(&missing), 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried_with_backoff() {
    let (tx_calls, mut calls) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut strategy = MockStrategy::new();
    {
        let attempts = Arc::clone(&attempts);
        strategy
            .expect_sync_cluster()
            .times(2)
            .returning(move |c| {
                let _ = tx_calls.send(c);
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(OperatorError::Timeout("apiserver".to_string()))
                } else {
                    Ok(())
                }
            });
    }
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    initial_sync(&mut informers, vec![cluster("A", "7.1")]);

    let (tx, handle) = start(controller);
    next_call(&mut calls).await;
    next_call(&mut calls).await;

    stop(tx, handle).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let key = ReconcileKey::ByIdentity(ObjectKey::new("ns", "A"));
    assert_eq!(queue.num_requeues(&key), 0);
}

#[tokio::test]
async fn test_terminal_failure_is_dropped() {
    let (tx_calls, mut calls) = mpsc::unbounded_channel();
    let mut strategy = MockStrategy::new();
    strategy
        .expect_sync_cluster()
        .times(1)
        .returning(move |c| {
            let _ = tx_calls.send(c);
            Err(OperatorError::InvalidConfig(
                "resource 'es-A' is managed by 'Helm'".to_string(),
            ))
        });
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    initial_sync(&mut informers, vec![cluster("A", "7.1")]);

    let (tx, handle) = start(controller);
    next_call(&mut calls).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    stop(tx, handle).await;
    let key = ReconcileKey::ByIdentity(ObjectKey::new("ns", "A"));
    assert_eq!(queue.num_requeues(&key), 0);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_without_convergence() {
    let (tx_rejections, mut rejections) = mpsc::unbounded_channel();
    let mut recorder = MockRecorder::new();
    recorder
        .expect_record_rejection()
        .times(1)
        .returning(move |_, error| {
            let _ = tx_rejections.send(error);
            Ok(())
        });
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(MockStrategy::new()), Arc::new(recorder));
    initial_sync(&mut informers, vec![cluster("A", "")]);

    let (tx, handle) = start(controller);
    let error = timeout(WAIT, rejections.recv())
        .await
        .expect("rejection should be recorded")
        .unwrap();
    assert_eq!(error, SpecError::MissingVersion);

    stop(tx, handle).await;
}

#[tokio::test]
async fn test_deleted_cluster_is_torn_down_from_snapshot() {
    let (strategy, mut calls) = recording_strategy(2);
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    initial_sync(&mut informers, vec![cluster("A", "7.1")]);

    let (tx, handle) = start(controller);
    next_call(&mut calls).await;

    informers.clusters.apply(WatchEvent::Delete(cluster("A", "7.1")));
    let deleted = next_call(&mut calls).await;
    assert_eq!(deleted.metadata.name.as_deref(), Some("A"));
    assert!(deleted.metadata.deletion_timestamp.is_some());

    stop(tx, handle).await;
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_workers_wait_for_every_cache() {
    let (strategy, mut calls) = recording_strategy(1);
    let (controller, mut informers) =
        Controller::new(config(), Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let caches = controller.caches().clone();

    informers.clusters.apply(WatchEvent::Init);
    informers.clusters.apply(WatchEvent::InitApply(cluster("A", "7.1")));
    informers.clusters.apply(WatchEvent::InitDone);
    informers.deployments.apply(WatchEvent::InitDone);
    informers.stateful_sets.apply(WatchEvent::InitDone);
    informers.service_accounts.apply(WatchEvent::InitDone);

    let (tx, handle) = start(controller);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(calls.try_recv().is_err());
    assert_eq!(caches.unsynced(), vec!["Service"]);

    informers.services.apply(WatchEvent::InitDone);
    let synced = next_call(&mut calls).await;
    assert_eq!(synced.metadata.name.as_deref(), Some("A"));

    stop(tx, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_workers_start_after_cache_sync_timeout() {
    let (strategy, mut calls) = recording_strategy(1);
    let config = ControllerConfig {
        cache_sync_timeout_secs: 1,
        ..config()
    };
    let (controller, mut informers) =
        Controller::new(config, Arc::new(strategy), Arc::new(NoopStatusRecorder));
    let caches = controller.caches().clone();

    // cached but never listed, so no cache reports synced
    informers.clusters.apply(WatchEvent::Apply(cluster("A", "7.1")));

    let (tx, handle) = start(controller);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(calls.try_recv().is_err());

    tokio::time::advance(Duration::from_secs(2)).await;
    let synced = next_call(&mut calls).await;
    assert_eq!(synced.metadata.name.as_deref(), Some("A"));
    assert!(!caches.has_synced());

    stop(tx, handle).await;
}

/// Strategy that takes a while and records completion
struct SlowStrategy {
    started: mpsc::UnboundedSender<()>,
    finished: AtomicBool,
}

#[async_trait]
impl ClusterStrategy for SlowStrategy {
    async fn sync_cluster(&self, _cluster: Arc<ElasticsearchCluster>) -> Result<()> {
        let _ = self.started.send(());
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_sync() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let strategy = Arc::new(SlowStrategy {
        started: started_tx,
        finished: AtomicBool::new(false),
    });
    let (controller, mut informers) =
        Controller::new(config(), strategy.clone(), Arc::new(NoopStatusRecorder));
    let queue = controller.queue();
    initial_sync(&mut informers, vec![cluster("A", "7.1")]);

    let (tx, handle) = start(controller);
    timeout(WAIT, started.recv()).await.unwrap();

    stop(tx, handle).await;
    assert!(strategy.finished.load(Ordering::SeqCst));
    assert!(queue.is_shutting_down());
}
