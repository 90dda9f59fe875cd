//! Status conditions of the targets.
use crate::{
    apis::{
        condition::{Condition, STATUS_FALSE, STATUS_TRUE},
        sgcluster::{ClusterPodStatus, SGCluster},
        sgconfig::SGConfig,
    },
    conciliation::{cache::DeployedResourcesCache, from_dynamic, target_id, ResourceKey},
    labels, Error, Result,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{fmt::Debug, sync::Arc};
use tracing::*;

pub const PENDING_RESTART: &str = "PendingRestart";
pub const FAILED: &str = "Failed";

const POD_REQUIRES_RESTART: &str = "PodRequiresRestart";
const FALSE_PENDING_RESTART: &str = "FalsePendingRestart";
const CLUSTER_FAILED: &str = "ClusterFailed";
const FALSE_FAILED: &str = "FalseFailed";
const CONFIG_FAILED: &str = "ConfigFailed";

const PATRONI_PENDING_RESTART: &str = "\"pending_restart\":true";

/// Writes the outcome of a reconciliation cycle on the target status
#[async_trait]
pub trait StatusManager<K: Send + Sync>: Send + Sync {
    /// `failure` is set when the cycle could not compute or fully apply its plan
    async fn update_status(&self, target: &K, failure: Option<String>) -> Result<()>;
}

/// Replace the condition of the same type.
///
/// The last transition time only moves when the condition status changes.
pub fn update_condition(conditions: &[Condition], mut condition: Condition, now: &str) -> Vec<Condition> {
    let previous = conditions.iter().find(|c| c.type_ == condition.type_);
    condition.last_transition_time = match previous {
        Some(previous) if previous.status == condition.status => previous
            .last_transition_time
            .clone()
            .or_else(|| Some(now.to_owned())),
        _ => Some(now.to_owned()),
    };
    let mut updated: Vec<Condition> = conditions
        .iter()
        .filter(|c| c.type_ != condition.type_)
        .cloned()
        .collect();
    updated.push(condition);
    updated.sort_by(|a, b| a.type_.cmp(&b.type_));
    updated
}

/// Conditions of a cluster after a reconciliation cycle
pub fn cluster_conditions(
    conditions: &[Condition],
    pending_restart: bool,
    failure: Option<&str>,
    now: &str,
) -> Vec<Condition> {
    let restart = if pending_restart {
        Condition::new(PENDING_RESTART, STATUS_TRUE, POD_REQUIRES_RESTART)
    } else {
        Condition::new(PENDING_RESTART, STATUS_FALSE, FALSE_PENDING_RESTART)
    };
    let conditions = update_condition(conditions, restart, now);
    update_condition(&conditions, failed_condition(failure, CLUSTER_FAILED), now)
}

/// Conditions of an operator configuration after a reconciliation cycle
pub fn config_conditions(conditions: &[Condition], failure: Option<&str>, now: &str) -> Vec<Condition> {
    update_condition(conditions, failed_condition(failure, CONFIG_FAILED), now)
}

fn failed_condition(failure: Option<&str>, reason: &str) -> Condition {
    match failure {
        Some(message) => Condition::new(FAILED, STATUS_TRUE, reason).with_message(message),
        None => Condition::new(FAILED, STATUS_FALSE, FALSE_FAILED),
    }
}

/// A pod needs a restart when it does not run the latest StatefulSet revision, when
/// Patroni reports a pending restart or when an extension change was deferred.
pub fn is_pending_restart(
    statefulset: Option<&StatefulSet>,
    pods: &[Pod],
    pod_statuses: &[ClusterPodStatus],
) -> bool {
    let update_revision = statefulset
        .and_then(|sts| sts.status.as_ref())
        .and_then(|status| status.update_revision.as_deref());
    let outdated = pods.iter().any(|pod| {
        pod.labels().get(labels::CONTROLLER_REVISION_HASH).map(String::as_str) != update_revision
    });
    let patroni = pods.iter().any(|pod| {
        pod.annotations()
            .values()
            .any(|value| value.contains(PATRONI_PENDING_RESTART))
    });
    outdated || patroni || pod_statuses.iter().any(ClusterPodStatus::is_pending_restart)
}

/// Merge patch the status subresource
pub async fn patch_status<K>(api: &Api<K>, name: &str, patch: Value) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let pp = PatchParams {
        field_manager: Some(crate::conciliation::handler::FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    };
    match api.patch_status(name, &pp, &Patch::Merge(&patch)).await {
        Ok(_) => {
            debug!("Successfully updated status for {}", name);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!("Status of {} was modified concurrently: {}", name, e.message);
            Err(Error::KubeError(kube::Error::Api(e)))
        }
        Err(e) => {
            error!("Error updating status for {}: {:?}", name, e);
            Err(Error::KubeError(e))
        }
    }
}

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// [`StatusManager`] of `SGCluster`, reading StatefulSets and pods from the cache
pub struct ClusterStatusManager {
    client: Client,
    cache: Arc<DeployedResourcesCache>,
}

impl ClusterStatusManager {
    pub fn new(client: Client, cache: Arc<DeployedResourcesCache>) -> Self {
        Self { client, cache }
    }

    pub fn is_pending_restart(&self, cluster: &SGCluster) -> Result<bool> {
        let namespace = cluster.namespace().unwrap_or_default();
        let statefulset = self
            .cache
            .get(&ResourceKey {
                api_version: "apps/v1".to_owned(),
                kind: "StatefulSet".to_owned(),
                namespace: Some(namespace.clone()),
                name: cluster.name_any(),
            })
            .map(|sts| from_dynamic::<StatefulSet>(&sts))
            .transpose()?;
        let pods = self
            .cache
            .matching_labels("Pod", &namespace, &labels::patroni_cluster_labels(cluster))
            .iter()
            .map(from_dynamic::<Pod>)
            .collect::<Result<Vec<_>>>()?;
        let pod_statuses = cluster
            .status
            .as_ref()
            .map(|s| s.pod_statuses.as_slice())
            .unwrap_or_default();
        Ok(is_pending_restart(statefulset.as_ref(), &pods, pod_statuses))
    }
}

#[async_trait]
impl StatusManager<SGCluster> for ClusterStatusManager {
    #[instrument(skip_all, fields(target = %target_id(cluster)))]
    async fn update_status(&self, cluster: &SGCluster, failure: Option<String>) -> Result<()> {
        let pending_restart = self.is_pending_restart(cluster)?;
        let conditions = cluster_conditions(cluster.conditions(), pending_restart, failure.as_deref(), &now());
        if conditions == cluster.conditions() {
            trace!("Conditions are up to date");
            return Ok(());
        }
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::InvalidErr(format!("{} has no namespace", target_id(cluster))))?;
        let api: Api<SGCluster> = Api::namespaced(self.client.clone(), &namespace);
        patch_status(&api, &cluster.name_any(), json!({ "status": { "conditions": conditions } })).await
    }
}

/// [`StatusManager`] of `SGConfig`
pub struct ConfigStatusManager {
    client: Client,
}

impl ConfigStatusManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusManager<SGConfig> for ConfigStatusManager {
    #[instrument(skip_all, fields(target = %target_id(config)))]
    async fn update_status(&self, config: &SGConfig, failure: Option<String>) -> Result<()> {
        let conditions = config_conditions(config.conditions(), failure.as_deref(), &now());
        if conditions == config.conditions() {
            trace!("Conditions are up to date");
            return Ok(());
        }
        let namespace = config
            .namespace()
            .ok_or_else(|| Error::InvalidErr(format!("{} has no namespace", target_id(config))))?;
        let api: Api<SGConfig> = Api::namespaced(self.client.clone(), &namespace);
        patch_status(&api, &config.name_any(), json!({ "status": { "conditions": conditions } })).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        apis::sgcluster::SGClusterStatus,
        fixtures::{mock_client, timeout_after_1s, Scenario},
    };
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster_with_conditions(conditions: Vec<Condition>) -> SGCluster {
        let mut cluster = SGCluster::test();
        cluster.status = Some(SGClusterStatus {
            conditions,
            ..SGClusterStatus::default()
        });
        cluster
    }

    #[tokio::test]
    async fn unchanged_conditions_are_not_written() {
        let (client, fakeserver) = mock_client();
        let manager = ClusterStatusManager::new(client, Arc::new(DeployedResourcesCache::default()));
        let cluster = cluster_with_conditions(cluster_conditions(&[], false, None, "2024-01-01T00:00:00Z"));
        let mocksrv = fakeserver.run(Scenario::RadioSilence);

        manager.update_status(&cluster, None).await.unwrap();
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn failures_are_written_to_the_conditions() {
        let (client, fakeserver) = mock_client();
        let manager = ClusterStatusManager::new(client, Arc::new(DeployedResourcesCache::default()));
        let cluster = cluster_with_conditions(cluster_conditions(&[], false, None, "2024-01-01T00:00:00Z"));
        let expected = json!({ "status": { "conditions": [
            { "type": FAILED, "status": STATUS_TRUE, "reason": CLUSTER_FAILED, "message": "generation failed" },
            { "type": PENDING_RESTART, "status": STATUS_FALSE, "lastTransitionTime": "2024-01-01T00:00:00Z" }
        ] } });
        let mocksrv = fakeserver.run(Scenario::StatusPatch(cluster.clone(), expected));

        manager
            .update_status(&cluster, Some("generation failed".to_owned()))
            .await
            .unwrap();
        timeout_after_1s(mocksrv).await;
    }

    fn pod(revision: Option<&str>, patroni_status: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("testdb-0".to_owned()),
                labels: revision.map(|r| {
                    BTreeMap::from([(labels::CONTROLLER_REVISION_HASH.to_owned(), r.to_owned())])
                }),
                annotations: patroni_status.map(|s| BTreeMap::from([("status".to_owned(), s.to_owned())])),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn statefulset(revision: &str) -> StatefulSet {
        StatefulSet {
            status: Some(StatefulSetStatus {
                update_revision: Some(revision.to_owned()),
                ..StatefulSetStatus::default()
            }),
            ..StatefulSet::default()
        }
    }

    #[test]
    fn transition_time_is_kept_while_status_is_unchanged() {
        let conditions = update_condition(
            &[],
            Condition::new(PENDING_RESTART, STATUS_FALSE, FALSE_PENDING_RESTART),
            "2024-01-01T00:00:00Z",
        );
        let same = update_condition(
            &conditions,
            Condition::new(PENDING_RESTART, STATUS_FALSE, FALSE_PENDING_RESTART),
            "2024-01-02T00:00:00Z",
        );
        assert_eq!(same, conditions);

        let changed = update_condition(
            &same,
            Condition::new(PENDING_RESTART, STATUS_TRUE, POD_REQUIRES_RESTART),
            "2024-01-03T00:00:00Z",
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].last_transition_time.as_deref(), Some("2024-01-03T00:00:00Z"));
    }

    #[test]
    fn failure_sets_the_failed_condition() {
        let conditions = cluster_conditions(&[], false, Some("2 of the planned operations failed"), "t0");
        let failed = conditions.iter().find(|c| c.type_ == FAILED).unwrap();
        assert!(failed.is_true());
        assert_eq!(failed.message.as_deref(), Some("2 of the planned operations failed"));

        let recovered = cluster_conditions(&conditions, false, None, "t1");
        let failed = recovered.iter().find(|c| c.type_ == FAILED).unwrap();
        assert!(!failed.is_true());
        assert_eq!(failed.last_transition_time.as_deref(), Some("t1"));
        let restart = recovered.iter().find(|c| c.type_ == PENDING_RESTART).unwrap();
        assert_eq!(restart.last_transition_time.as_deref(), Some("t0"));
    }

    #[tokio::test]
    async fn config_without_failure_changes_is_not_written() {
        let (client, fakeserver) = mock_client();
        let manager = ConfigStatusManager::new(client);
        let mut config = SGConfig::test();
        config.status = Some(crate::apis::sgconfig::SGConfigStatus {
            conditions: config_conditions(&[], None, "2024-01-01T00:00:00Z"),
        });
        let mocksrv = fakeserver.run(Scenario::RadioSilence);

        manager.update_status(&config, None).await.unwrap();
        timeout_after_1s(mocksrv).await;

        let failed = config_conditions(config.conditions(), Some("invalid spec"), "t1");
        assert_eq!(failed.len(), 1);
        assert!(failed[0].is_true());
        assert_eq!(failed[0].reason.as_deref(), Some(CONFIG_FAILED));
    }

    #[test]
    fn outdated_pod_revision_requires_restart() {
        let sts = statefulset("testdb-6d4f");
        assert!(!is_pending_restart(Some(&sts), &[pod(Some("testdb-6d4f"), None)], &[]));
        assert!(is_pending_restart(Some(&sts), &[pod(Some("testdb-5c3e"), None)], &[]));
        assert!(is_pending_restart(None, &[pod(Some("testdb-5c3e"), None)], &[]));
        assert!(!is_pending_restart(None, &[pod(None, None)], &[]));
    }

    #[test]
    fn patroni_pending_restart_requires_restart() {
        let sts = statefulset("r1");
        let status = r#"{"state":"running","role":"master","pending_restart":true}"#;
        assert!(is_pending_restart(Some(&sts), &[pod(Some("r1"), Some(status))], &[]));
        let status = r#"{"state":"running","role":"master"}"#;
        assert!(!is_pending_restart(Some(&sts), &[pod(Some("r1"), Some(status))], &[]));
    }

    #[test]
    fn deferred_extension_changes_require_restart() {
        let mut pod_status = ClusterPodStatus::new("testdb-0");
        assert!(!is_pending_restart(None, &[], &[pod_status.clone()]));
        pod_status.pending_restart = Some(true);
        assert!(is_pending_restart(None, &[], &[pod_status]));
    }
}
