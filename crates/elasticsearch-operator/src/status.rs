//! Status reporting
//!
//! Rejected specs are surfaced on the cluster's status subresource as a
//! `SpecValid=False` condition. The same condition helpers are used by the
//! convergence strategy when it reports a healthy cluster.

use crate::crd::{ClusterCondition, ClusterPhase, ElasticsearchCluster};
use crate::error::{OperatorError, Result};
use crate::validation::SpecError;
use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Condition type recording the validator's verdict
pub const SPEC_VALID_CONDITION: &str = "SpecValid";

/// Records validator verdicts where users can see them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    /// Mark `cluster` as rejected because of `error`
    async fn record_rejection(
        &self,
        cluster: Arc<ElasticsearchCluster>,
        error: SpecError,
    ) -> Result<()>;
}

/// Writes verdicts to the status subresource
pub struct KubeStatusRecorder {
    client: Client,
}

impl KubeStatusRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusRecorder for KubeStatusRecorder {
    async fn record_rejection(
        &self,
        cluster: Arc<ElasticsearchCluster>,
        error: SpecError,
    ) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<ElasticsearchCluster> = Api::namespaced(self.client.clone(), &namespace);

        let mut status = cluster.status.clone().unwrap_or_default();
        let message = error.to_string();
        if is_rejection_recorded(&cluster, &message) {
            debug!(name = %name, "Rejection already recorded");
            return Ok(());
        }
        status.phase = ClusterPhase::Failed;
        status.observed_generation = cluster.metadata.generation.unwrap_or(0);
        status.message = Some(message.clone());
        set_condition(
            &mut status.conditions,
            spec_valid_condition(false, "InvalidSpec", Some(message)),
        );

        debug!(name = %name, namespace = %namespace, "Recording spec rejection");

        let patch = serde_json::json!({ "status": status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}

/// Recorder that only logs; for running without write access to the status
pub struct NoopStatusRecorder;

#[async_trait]
impl StatusRecorder for NoopStatusRecorder {
    async fn record_rejection(
        &self,
        cluster: Arc<ElasticsearchCluster>,
        error: SpecError,
    ) -> Result<()> {
        warn!(name = %cluster.name_any(), error = %error, "Spec rejected (not recorded)");
        Ok(())
    }
}

/// Whether the status already reports this rejection for the current generation
fn is_rejection_recorded(cluster: &ElasticsearchCluster, message: &str) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return false;
    };
    status.observed_generation == cluster.metadata.generation.unwrap_or(0)
        && status.conditions.iter().any(|c| {
            c.condition_type == SPEC_VALID_CONDITION
                && c.status == "False"
                && c.message.as_deref() == Some(message)
        })
}

/// Build the `SpecValid` condition
pub fn spec_valid_condition(valid: bool, reason: &str, message: Option<String>) -> ClusterCondition {
    ClusterCondition {
        condition_type: SPEC_VALID_CONDITION.to_string(),
        status: if valid { "True" } else { "False" }.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Insert or replace the condition of the same type.
///
/// The transition time is kept when the condition status does not change.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, mut condition: ClusterCondition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}
