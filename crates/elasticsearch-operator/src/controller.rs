//! ElasticsearchCluster Controller
//!
//! Wires the watch caches, the event handlers, the work queue and the worker
//! pool together. Cluster events enqueue the cluster; events on owned
//! Deployments, StatefulSets, ServiceAccounts and Services enqueue their
//! controlling cluster. Workers drain the queue through the
//! [`SyncDispatcher`].

use crate::cache::{watch_events, Informer, Store};
use crate::config::ControllerConfig;
use crate::crd::ElasticsearchCluster;
use crate::dispatcher::{Disposition, SyncDispatcher};
use crate::error::{OperatorError, Result};
use crate::key::{ObjectKey, ReconcileKey};
use crate::queue::WorkQueue;
use crate::rate_limit::controller_rate_limiter;
use crate::router::{ClusterEventHandler, OwnerRouter};
use crate::status::StatusRecorder;
use crate::strategy::ClusterStrategy;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Name of the controller's work queue
const QUEUE_NAME: &str = "elasticsearchcluster";

/// Puts clusters on the work queue
#[derive(Clone)]
pub struct Enqueuer {
    queue: Arc<WorkQueue<ReconcileKey>>,
}

impl Enqueuer {
    pub fn new(queue: Arc<WorkQueue<ReconcileKey>>) -> Self {
        Self { queue }
    }

    /// Schedule a sync of the cluster's current cached state
    pub fn enqueue_add(&self, cluster: &ElasticsearchCluster) {
        self.queue.add(ReconcileKey::identity(cluster));
    }

    /// Schedule a teardown of a cluster that was removed from the store
    pub fn enqueue_delete(&self, cluster: Arc<ElasticsearchCluster>) {
        self.queue.add(ReconcileKey::BySnapshot(cluster));
    }

    /// Schedule a sync by `namespace/name` key
    pub fn enqueue_key(&self, key: &str) -> Result<()> {
        let key: ObjectKey = key.parse()?;
        self.queue.add(ReconcileKey::ByIdentity(key));
        Ok(())
    }
}

/// Read handles on every cache the controller depends on
#[derive(Clone)]
pub struct Caches {
    pub clusters: Store<ElasticsearchCluster>,
    pub deployments: Store<Deployment>,
    pub stateful_sets: Store<StatefulSet>,
    pub service_accounts: Store<ServiceAccount>,
    pub services: Store<Service>,
}

impl Caches {
    pub fn has_synced(&self) -> bool {
        self.unsynced().is_empty()
    }

    /// Kinds whose initial listing has not been applied yet
    pub fn unsynced(&self) -> Vec<&'static str> {
        [
            ("ElasticsearchCluster", self.clusters.has_synced()),
            ("Deployment", self.deployments.has_synced()),
            ("StatefulSet", self.stateful_sets.has_synced()),
            ("ServiceAccount", self.service_accounts.has_synced()),
            ("Service", self.services.has_synced()),
        ]
        .into_iter()
        .filter(|(_, synced)| !synced)
        .map(|(kind, _)| kind)
        .collect()
    }

    /// Wait until every cache has applied its initial listing
    pub async fn wait_until_synced(&self) {
        tokio::join!(
            self.clusters.wait_until_synced(),
            self.deployments.wait_until_synced(),
            self.stateful_sets.wait_until_synced(),
            self.service_accounts.wait_until_synced(),
            self.services.wait_until_synced(),
        );
    }
}

/// The informers feeding the controller, with their handlers attached
pub struct Informers {
    pub clusters: Informer<ElasticsearchCluster>,
    pub deployments: Informer<Deployment>,
    pub stateful_sets: Informer<StatefulSet>,
    pub service_accounts: Informer<ServiceAccount>,
    pub services: Informer<Service>,
}

impl Informers {
    fn new(enqueuer: &Enqueuer) -> Self {
        let mut clusters = Informer::new("ElasticsearchCluster");
        clusters.add_handler(Arc::new(ClusterEventHandler::new(enqueuer.clone())));
        let cluster_store = clusters.store();

        let mut deployments = Informer::new("Deployment");
        deployments.add_handler(Arc::new(OwnerRouter::<Deployment>::new(
            "Deployment",
            cluster_store.clone(),
            enqueuer.clone(),
        )));

        let mut stateful_sets = Informer::new("StatefulSet");
        stateful_sets.add_handler(Arc::new(OwnerRouter::<StatefulSet>::new(
            "StatefulSet",
            cluster_store.clone(),
            enqueuer.clone(),
        )));

        let mut service_accounts = Informer::new("ServiceAccount");
        service_accounts.add_handler(Arc::new(OwnerRouter::<ServiceAccount>::new(
            "ServiceAccount",
            cluster_store.clone(),
            enqueuer.clone(),
        )));

        let mut services = Informer::new("Service");
        services.add_handler(Arc::new(OwnerRouter::<Service>::new(
            "Service",
            cluster_store,
            enqueuer.clone(),
        )));

        Self {
            clusters,
            deployments,
            stateful_sets,
            service_accounts,
            services,
        }
    }

    pub fn caches(&self) -> Caches {
        Caches {
            clusters: self.clusters.store(),
            deployments: self.deployments.store(),
            stateful_sets: self.stateful_sets.store(),
            service_accounts: self.service_accounts.store(),
            services: self.services.store(),
        }
    }

    /// Start watching the API server, one task per kind
    pub fn spawn(
        self,
        client: Client,
        namespace: Option<&str>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            spawn_informer(self.clusters, &client, namespace, shutdown.clone()),
            spawn_informer(self.deployments, &client, namespace, shutdown.clone()),
            spawn_informer(self.stateful_sets, &client, namespace, shutdown.clone()),
            spawn_informer(self.service_accounts, &client, namespace, shutdown.clone()),
            spawn_informer(self.services, &client, namespace, shutdown),
        ]
    }
}

fn spawn_informer<K>(
    informer: Informer<K>,
    client: &Client,
    namespace: Option<&str>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    tokio::spawn(informer.run(watch_events(api, watcher::Config::default()), shutdown))
}

/// The reconciliation loop for ElasticsearchCluster resources
pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue<ReconcileKey>>,
    caches: Caches,
    dispatcher: Arc<SyncDispatcher>,
}

impl Controller {
    /// Build the controller and the informers that feed it.
    ///
    /// The informers must be driven (see [`Informers::spawn`]) for the
    /// controller to see anything.
    pub fn new(
        config: ControllerConfig,
        strategy: Arc<dyn ClusterStrategy>,
        status: Arc<dyn StatusRecorder>,
    ) -> (Self, Informers) {
        let queue = Arc::new(WorkQueue::new(
            QUEUE_NAME,
            controller_rate_limiter(
                config.backoff_base(),
                config.backoff_max(),
                config.bucket_qps,
                config.bucket_burst,
            ),
        ));
        let informers = Informers::new(&Enqueuer::new(Arc::clone(&queue)));
        let caches = informers.caches();
        let dispatcher = Arc::new(SyncDispatcher::new(
            caches.clusters.clone(),
            strategy,
            status,
        ));

        let controller = Self {
            config,
            queue,
            caches,
            dispatcher,
        };
        (controller, informers)
    }

    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(Arc::clone(&self.queue))
    }

    pub fn queue(&self) -> Arc<WorkQueue<ReconcileKey>> {
        Arc::clone(&self.queue)
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Run `workers` workers until `shutdown` fires.
    ///
    /// Waits for the caches first; a sync timeout is logged and the workers
    /// start anyway. On shutdown the queue stops accepting keys, in-flight
    /// syncs finish and the workers are joined before returning.
    pub async fn run(self, workers: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }

        info!(workers, "Starting ElasticsearchCluster controller");
        info!("Waiting for informer caches to sync");

        tokio::select! {
            synced = tokio::time::timeout(
                self.config.cache_sync_timeout(),
                self.caches.wait_until_synced(),
            ) => {
                if synced.is_err() {
                    error!(pending = ?self.caches.unsynced(), "timed out waiting for caches to sync");
                }
            }
            _ = shutdown_signalled(&mut shutdown) => {
                error!(pending = ?self.caches.unsynced(), "shutdown requested before caches synced");
            }
        }

        info!("Starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let queue = Arc::clone(&self.queue);
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    debug!(worker = id, "Worker started");
                    while process_next_work_item(&queue, &dispatcher).await {}
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        let resync = self.config.resync_interval().map(|period| {
            tokio::spawn(resync_loop(
                self.caches.clusters.clone(),
                self.enqueuer(),
                period,
                shutdown.clone(),
            ))
        });

        shutdown_signalled(&mut shutdown).await;
        info!("Shutting down workers");

        self.queue.shutdown_with_drain().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        if let Some(resync) = resync {
            if let Err(e) = resync.await {
                warn!(error = %e, "Resync task terminated abnormally");
            }
        }

        info!("Controller stopped");
        Ok(())
    }
}

/// Take one key off the queue and dispatch it; `false` once the queue is shut down
async fn process_next_work_item(
    queue: &Arc<WorkQueue<ReconcileKey>>,
    dispatcher: &SyncDispatcher,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match dispatcher.dispatch(&key).await {
        Disposition::Forget => queue.forget(&key),
        Disposition::Retry => queue.add_rate_limited(key.clone()),
    }
    queue.done(&key);
    true
}

/// Enqueue every cached cluster once per `period`
async fn resync_loop(
    clusters: Store<ElasticsearchCluster>,
    enqueuer: Enqueuer,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let all = clusters.list();
                debug!(clusters = all.len(), "Periodic resync");
                for cluster in all {
                    enqueuer.enqueue_add(&cluster);
                }
            }
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
