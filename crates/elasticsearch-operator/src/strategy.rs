//! Convergence strategy seam
//!
//! The dispatcher hands every valid cluster to a [`ClusterStrategy`], which
//! does the actual work of making the owned resources match the spec. The
//! default implementation lives in [`crate::convergence`].

use crate::crd::ElasticsearchCluster;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Brings the resources of one cluster in line with its spec
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStrategy: Send + Sync {
    /// Converge `cluster`.
    ///
    /// Must be idempotent. A cluster carrying a deletion timestamp must be
    /// torn down. Errors for which [`crate::error::OperatorError::is_retryable`]
    /// holds are retried with backoff.
    async fn sync_cluster(&self, cluster: Arc<ElasticsearchCluster>) -> Result<()>;
}
