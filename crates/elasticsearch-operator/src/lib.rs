//! # Elasticsearch Kubernetes Operator
//!
//! Kubernetes operator that keeps Elasticsearch clusters consistent with their
//! declarative `ElasticsearchCluster` specification.
//!
//! ## Architecture
//!
//! The operator follows the level-triggered controller pattern:
//!
//! 1. **Watch**: one informer per kind keeps a local cache of
//!    `ElasticsearchCluster`, `Deployment`, `StatefulSet`, `ServiceAccount` and
//!    `Service` objects in sync with the API server
//! 2. **Route**: cluster events enqueue the cluster; events on owned resources
//!    enqueue their controlling cluster
//! 3. **Queue**: a deduplicating, rate-limited work queue collapses bursts and
//!    guarantees one worker per cluster at a time
//! 4. **Reconcile**: workers validate the spec and run the convergence
//!    strategy; failures are retried with exponential backoff
//!
//! ```rust,ignore
//! use elasticsearch_operator::prelude::*;
//! use std::sync::Arc;
//!
//! let client = kube::Client::try_default().await?;
//! let (controller, informers) = Controller::new(
//!     ControllerConfig::default(),
//!     Arc::new(KubeClusterStrategy::new(client.clone())),
//!     Arc::new(KubeStatusRecorder::new(client.clone())),
//! );
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! informers.spawn(client, None, rx.clone());
//! controller.run(2, rx).await?;
//! ```
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: elasticsearch.operator.io/v1alpha1
//! kind: ElasticsearchCluster
//! metadata:
//!   name: logs
//! spec:
//!   version: "7.1.1"
//!   nodePools:
//!     - name: masters
//!       replicas: 3
//!       roles: [master]
//!       state:
//!         stateful: true
//!         persistence:
//!           enabled: true
//!           size: 10Gi
//!     - name: clients
//!       replicas: 2
//!       roles: [client]
//! ```
//!
//! ## Metrics
//!
//! - `elasticsearch_operator_reconciliations_total` - Reconciliation attempts
//! - `elasticsearch_operator_reconciliation_errors_total` - Failed reconciliations
//! - `elasticsearch_operator_spec_rejections_total` - Specs rejected by validation
//! - `elasticsearch_operator_deletions_total` - Teardowns of deleted clusters
//! - `elasticsearch_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `elasticsearch_operator_workqueue_depth` - Keys waiting to be processed

pub mod cache;
pub mod config;
pub mod controller;
pub mod convergence;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod key;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod resources;
pub mod router;
pub mod status;
pub mod strategy;
pub mod validation;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::cache::{Informer, ResourceEventHandler, Store, WatchEvent};
    pub use crate::config::ControllerConfig;
    pub use crate::controller::{Caches, Controller, Enqueuer, Informers};
    pub use crate::convergence::KubeClusterStrategy;
    pub use crate::crd::{
        ClusterCondition, ClusterPhase, ElasticsearchCluster, ElasticsearchClusterSpec,
        ElasticsearchClusterStatus, NodePool, NodePoolState, NodeRole, PersistenceSpec,
    };
    pub use crate::dispatcher::{Disposition, SyncDispatcher};
    pub use crate::error::{OperatorError, Result};
    pub use crate::key::{ObjectKey, ReconcileKey};
    pub use crate::queue::WorkQueue;
    pub use crate::resources::ResourceBuilder;
    pub use crate::status::{KubeStatusRecorder, NoopStatusRecorder, StatusRecorder};
    pub use crate::strategy::ClusterStrategy;
    pub use crate::validation::{verify_cluster, verify_node_pool, SpecError};
}
