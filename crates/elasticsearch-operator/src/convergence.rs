//! Default convergence strategy
//!
//! Applies the manifests from [`ResourceBuilder`] with server-side apply,
//! removes workloads that no longer match the spec, and reports per-pool
//! replica counts on the cluster status. A cluster carrying a deletion
//! timestamp is torn down instead.

use crate::crd::{
    managed_owner_ref, selector_labels, ClusterCondition, ClusterPhase, ElasticsearchCluster,
    ElasticsearchClusterStatus, NodePoolStatus, MANAGER_NAME,
};
use crate::error::{OperatorError, Result};
use crate::resources::{cluster_uid_label, pool_label, ResourceBuilder};
use crate::status::{set_condition, spec_valid_condition};
use crate::strategy::ClusterStrategy;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Converges clusters against the Kubernetes API
pub struct KubeClusterStrategy {
    client: Client,
}

impl KubeClusterStrategy {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Apply the full set of owned resources and report status
    #[instrument(skip(self, cluster), fields(name = %cluster.name_any()))]
    async fn apply_cluster(&self, cluster: &ElasticsearchCluster) -> Result<()> {
        let builder = ResourceBuilder::new(cluster)?;
        let namespace = builder.namespace().to_string();

        info!(namespace = %namespace, "Reconciling ElasticsearchCluster");

        apply(self.api(&namespace), builder.build_service_account()).await?;
        apply(self.api(&namespace), builder.build_client_service()).await?;
        apply(self.api(&namespace), builder.build_discovery_service()).await?;

        let mut pools = BTreeMap::new();
        for pool in &cluster.spec.node_pools {
            let workload = builder.workload_name(pool);
            let ready = if pool.is_stateful() {
                let sts = apply(self.api(&namespace), builder.build_statefulset(pool)).await?;
                self.delete_owned::<Deployment>(cluster, &namespace, &workload)
                    .await?;
                sts.status.and_then(|s| s.ready_replicas)
            } else {
                let deploy = apply(self.api(&namespace), builder.build_deployment(pool)).await?;
                self.delete_owned::<StatefulSet>(cluster, &namespace, &workload)
                    .await?;
                deploy.status.and_then(|s| s.ready_replicas)
            };

            pools.insert(
                pool.name.clone(),
                NodePoolStatus {
                    replicas: pool.replicas,
                    ready_replicas: ready.unwrap_or(0),
                },
            );
        }

        self.prune_removed_pools::<StatefulSet>(cluster, &namespace)
            .await?;
        self.prune_removed_pools::<Deployment>(cluster, &namespace)
            .await?;

        let status = build_status(cluster, pools);
        update_status(self.api(&namespace), cluster, status).await?;

        info!("Reconciliation complete");
        Ok(())
    }

    /// Delete `name` if it exists and is controlled by `cluster`
    async fn delete_owned<K>(
        &self,
        cluster: &ElasticsearchCluster,
        namespace: &str,
        name: &str,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        let Some(existing) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !is_controlled_by(&existing, cluster) {
            return Ok(());
        }

        info!(
            kind = %K::kind(&Default::default()),
            resource = %name,
            "Deleting workload of the wrong kind"
        );
        delete(&api, name).await
    }

    /// Delete workloads whose node pool is no longer in the spec
    async fn prune_removed_pools<K>(
        &self,
        cluster: &ElasticsearchCluster,
        namespace: &str,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let wanted: HashSet<&str> = cluster
            .spec
            .node_pools
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        let api: Api<K> = self.api(namespace);
        let pool_key = pool_label();

        for existing in api.list(&cluster_list_params(cluster)).await? {
            let pool = existing.labels().get(&pool_key).map(String::as_str);
            let removed = pool.map_or(false, |p| !wanted.contains(p));
            if removed && is_controlled_by(&existing, cluster) {
                let name = existing.name_any();
                info!(
                    kind = %K::kind(&Default::default()),
                    resource = %name,
                    "Deleting workload of removed node pool"
                );
                delete(&api, &name).await?;
            }
        }
        Ok(())
    }

    /// Delete everything this cluster incarnation created.
    ///
    /// A cluster recreated under the same name shares the instance labels, so
    /// owned objects are matched on the owner uid and claims on the uid label.
    #[instrument(skip(self, cluster), fields(name = %cluster.name_any()))]
    async fn teardown(&self, cluster: &ElasticsearchCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        info!(namespace = %namespace, "Cleaning up ElasticsearchCluster resources");

        let lp = cluster_list_params(cluster);
        let results = [
            self.delete_owned_by::<StatefulSet>(cluster, &namespace, &lp).await,
            self.delete_owned_by::<Deployment>(cluster, &namespace, &lp).await,
            self.delete_owned_by::<Service>(cluster, &namespace, &lp).await,
            self.delete_owned_by::<ServiceAccount>(cluster, &namespace, &lp).await,
            self.delete_claims(cluster, &namespace).await,
        ];

        info!("Cleanup complete");
        results.into_iter().collect()
    }

    async fn delete_owned_by<K>(
        &self,
        cluster: &ElasticsearchCluster,
        namespace: &str,
        lp: &ListParams,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        delete_labelled(self.api::<K>(namespace), lp, |obj| is_controlled_by(obj, cluster)).await
    }

    /// Delete the data claims created from this cluster's volume templates
    async fn delete_claims(&self, cluster: &ElasticsearchCluster, namespace: &str) -> Result<()> {
        let Some(lp) = claim_list_params(cluster) else {
            warn!("Cluster has no uid, leaving persistent volume claims in place");
            return Ok(());
        };
        delete_labelled(self.api::<PersistentVolumeClaim>(namespace), &lp, |_| true).await
    }
}

#[async_trait]
impl ClusterStrategy for KubeClusterStrategy {
    async fn sync_cluster(&self, cluster: Arc<ElasticsearchCluster>) -> Result<()> {
        if cluster.metadata.deletion_timestamp.is_some() {
            self.teardown(&cluster).await
        } else {
            self.apply_cluster(&cluster).await
        }
    }
}

/// Selects every resource the operator manages for `cluster`
fn cluster_list_params(cluster: &ElasticsearchCluster) -> ListParams {
    let mut labels = selector_labels(&cluster.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGER_NAME.to_string(),
    );
    let selector = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    ListParams::default().labels(&selector)
}

/// Selects the claims labelled with `cluster`'s uid
fn claim_list_params(cluster: &ElasticsearchCluster) -> Option<ListParams> {
    let uid = cluster.metadata.uid.as_deref()?;
    let selector = format!(
        "app.kubernetes.io/instance={},{}={}",
        cluster.name_any(),
        cluster_uid_label(),
        uid
    );
    Some(ListParams::default().labels(&selector))
}

/// Whether `obj` carries `cluster`'s controlling owner reference
fn is_controlled_by<K: Resource>(obj: &K, cluster: &ElasticsearchCluster) -> bool {
    managed_owner_ref(obj.meta()).is_some_and(|owner| {
        Some(owner.uid.as_str()) == cluster.metadata.uid.as_deref()
            && Some(owner.name.as_str()) == cluster.metadata.name.as_deref()
    })
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource labelled as managed by someone else (Helm, another operator)
/// is never taken over. Resources without the label are adopted.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != MANAGER_NAME => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, MANAGER_NAME
            )))
        }
        _ => Ok(()),
    }
}

/// Server-side apply `resource`, returning the object the API server stored
async fn apply<K>(api: Api<K>, resource: K) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| OperatorError::InvalidConfig(format!("{} missing metadata.name", kind)))?;

    debug!(kind = %kind, name = %name, "Applying resource");

    if let Some(existing) = api.get_opt(&name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(MANAGER_NAME).force();
    let applied = api
        .patch(&name, &patch_params, &Patch::Apply(&resource))
        .await
        .map_err(OperatorError::from)?;

    Ok(applied)
}

/// Delete by name; an already-missing object counts as deleted
async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let err = OperatorError::from(e);
            if err.is_not_found() {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

/// Delete every object matched by `lp` and accepted by `keep`, attempting
/// all before failing
async fn delete_labelled<K>(api: Api<K>, lp: &ListParams, keep: impl Fn(&K) -> bool) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let mut first_error = None;

    for obj in api.list(lp).await?.into_iter().filter(|o| keep(o)) {
        let name = obj.name_any();
        info!(kind = %kind, resource = %name, "Deleting");
        if let Err(e) = delete(&api, &name).await {
            warn!(kind = %kind, resource = %name, error = %e, "Failed to delete");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Build cluster status from the per-pool replica counts
fn build_status(
    cluster: &ElasticsearchCluster,
    pools: BTreeMap<String, NodePoolStatus>,
) -> ElasticsearchClusterStatus {
    let now = Utc::now().to_rfc3339();

    let desired: i32 = pools.values().map(|p| p.replicas).sum();
    let ready: i32 = pools.values().map(|p| p.ready_replicas).sum();
    let all_ready = pools.values().all(|p| p.ready_replicas >= p.replicas);

    let phase = if all_ready {
        ClusterPhase::Running
    } else {
        ClusterPhase::Provisioning
    };

    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(&mut conditions, spec_valid_condition(true, "Valid", None));
    set_condition(
        &mut conditions,
        ClusterCondition {
            condition_type: "Ready".to_string(),
            status: if all_ready { "True" } else { "False" }.to_string(),
            reason: Some(format!("{}/{} nodes ready", ready, desired)),
            message: None,
            last_transition_time: Some(now),
        },
    );

    ElasticsearchClusterStatus {
        phase,
        observed_generation: cluster.metadata.generation.unwrap_or(0),
        node_pools: pools,
        conditions,
        message: None,
    }
}

/// Merge patch replacing the cluster status. Pools reported earlier but gone
/// from `status` are set to null so the merge removes them.
fn status_patch(
    cluster: &ElasticsearchCluster,
    status: &ElasticsearchClusterStatus,
) -> serde_json::Value {
    let mut patch = serde_json::json!({
        "status": status
    });

    if let Some(pools) = patch["status"]["nodePools"].as_object_mut() {
        let previous = cluster.status.iter().flat_map(|s| s.node_pools.keys());
        for name in previous.filter(|name| !status.node_pools.contains_key(*name)) {
            pools.insert(name.clone(), serde_json::Value::Null);
        }
    }
    patch
}

/// Update the cluster status subresource
async fn update_status(
    api: Api<ElasticsearchCluster>,
    cluster: &ElasticsearchCluster,
    status: ElasticsearchClusterStatus,
) -> Result<()> {
    let name = cluster.name_any();
    debug!(name = %name, phase = ?status.phase, "Updating cluster status");

    let patch = status_patch(cluster, &status);

    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}
