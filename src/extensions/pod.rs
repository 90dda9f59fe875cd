use super::{
    events::RecorderExtensionEvents,
    reconciliator::{ExtensionReconciliationResult, ExtensionReconciliator, SkipSharedLibrariesOverwrites},
    ExtensionManager, ExtensionReconciliationContext,
};
use crate::{
    apis::sgcluster::{ClusterPodStatus, SGCluster},
    status::patch_status,
    worker_pool::WorkerPool,
    Error, Result,
};
use kube::{api::Api, client::Client, runtime::events::Reporter, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::*;

const MAX_STATUS_UPDATE_ATTEMPTS: usize = 3;

/// Drives the extension reconciliation of the pod this process runs in
pub struct PodExtensionsController {
    client: Client,
    namespace: String,
    cluster_name: String,
    pod_name: String,
    pool: WorkerPool,
    extension_manager: Arc<dyn ExtensionManager>,
    skip_shared_libraries_overwrites: SkipSharedLibrariesOverwrites,
    reporter: Reporter,
}

impl PodExtensionsController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        namespace: &str,
        cluster_name: &str,
        pod_name: &str,
        pool: WorkerPool,
        extension_manager: Arc<dyn ExtensionManager>,
        skip_shared_libraries_overwrites: SkipSharedLibrariesOverwrites,
        reporter: Reporter,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            cluster_name: cluster_name.to_owned(),
            pod_name: pod_name.to_owned(),
            pool,
            extension_manager,
            skip_shared_libraries_overwrites,
            reporter,
        }
    }

    /// Run a reconciliation through the pool, one at a time for the pod
    pub fn schedule(self: &Arc<Self>, priority: bool) {
        let controller = self.clone();
        self.pool.schedule_reconciliation(
            self.pod_name.clone(),
            async move {
                if let Err(e) = controller.reconcile().await {
                    error!("Extension reconciliation of pod {} failed: {}", controller.pod_name, e);
                }
            },
            priority,
        );
    }

    /// Reconcile the extensions of the pod against the latest cluster and persist the
    /// pod status when it changed
    #[instrument(skip(self), fields(pod = %self.pod_name))]
    pub async fn reconcile(&self) -> Result<ExtensionReconciliationResult> {
        let api: Api<SGCluster> = Api::namespaced(self.client.clone(), &self.namespace);
        let cluster = api.get(&self.cluster_name).await?;
        let events = Arc::new(RecorderExtensionEvents::new(
            self.client.clone(),
            self.reporter.clone(),
            &cluster,
            &self.pod_name,
        ));
        let reconciliator = ExtensionReconciliator::new(
            &self.pod_name,
            self.extension_manager.clone(),
            self.skip_shared_libraries_overwrites.clone(),
            events.clone(),
            events,
        );
        let context = ExtensionReconciliationContext::new(cluster);
        let result = reconciliator.reconcile(&context).await;
        for e in &result.errors {
            warn!("Extension reconciliation error on pod {}: {}", self.pod_name, e);
        }
        if result.cluster_updated {
            let pod_status = result
                .status
                .pod_statuses
                .iter()
                .find(|p| p.name == self.pod_name)
                .cloned()
                .unwrap_or_else(|| ClusterPodStatus::new(&self.pod_name));
            self.persist(&api, context.cluster, pod_status).await?;
        }
        Ok(result)
    }

    /// Write the pod status, other pods update the same list concurrently so the write
    /// is conditioned on the resource version and retried on conflicts
    async fn persist(&self, api: &Api<SGCluster>, mut cluster: SGCluster, pod_status: ClusterPodStatus) -> Result<()> {
        for attempt in 1..=MAX_STATUS_UPDATE_ATTEMPTS {
            let pod_statuses = merge_pod_status(&cluster, pod_status.clone());
            let patch = json!({
                "metadata": { "resourceVersion": cluster.resource_version() },
                "status": { "podStatuses": pod_statuses }
            });
            match patch_status(api, &cluster.name_any(), patch).await {
                Ok(()) => return Ok(()),
                Err(Error::KubeError(kube::Error::Api(e))) if e.code == 409 && attempt < MAX_STATUS_UPDATE_ATTEMPTS => {
                    debug!("Status of {} changed meanwhile, retrying", self.cluster_name);
                    cluster = api.get(&self.cluster_name).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Pod statuses of `cluster` with the one of `pod_status.name` replaced
pub fn merge_pod_status(cluster: &SGCluster, pod_status: ClusterPodStatus) -> Vec<ClusterPodStatus> {
    let mut pod_statuses: Vec<ClusterPodStatus> = cluster
        .status
        .as_ref()
        .map(|s| s.pod_statuses.clone())
        .unwrap_or_default();
    match pod_statuses.iter_mut().find(|p| p.name == pod_status.name) {
        Some(existing) => *existing = pod_status,
        None => pod_statuses.push(pod_status),
    }
    pod_statuses
}
