use crate::{
    apis::{sgcluster::SGCluster, sgconfig::SGConfig},
    defaults,
};
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const APP_KEY: &str = "app";
pub const CLUSTER_APP_NAME: &str = "StackGresCluster";
pub const CONFIG_APP_NAME: &str = "StackGresConfig";
pub const CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";

const CLUSTER_NAME_KEY: &str = "cluster-name";
const CLUSTER_UID_KEY: &str = "cluster-uid";
const CLUSTER_KEY: &str = "cluster";
const CONFIG_NAME_KEY: &str = "config-name";
const CONFIG_UID_KEY: &str = "config-uid";

/// Label selector matching every object created for one kind of target, used by the
/// watchers
pub fn app_selector(app: &str) -> String {
    format!("{APP_KEY}={app}")
}

/// Labels of every object generated for a cluster
pub fn cluster_labels(cluster: &SGCluster) -> BTreeMap<String, String> {
    let prefix = cluster.label_prefix();
    BTreeMap::from([
        (APP_KEY.to_owned(), CLUSTER_APP_NAME.to_owned()),
        (format!("{prefix}{CLUSTER_UID_KEY}"), cluster.uid().unwrap_or_default()),
        (format!("{prefix}{CLUSTER_NAME_KEY}"), cluster.name_any()),
    ])
}

/// Labels of the Patroni members (the pods) of a cluster
pub fn patroni_cluster_labels(cluster: &SGCluster) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(format!("{}{CLUSTER_KEY}", cluster.label_prefix()), "true".to_owned());
    labels
}

/// Labels of every object generated for an operator configuration
pub fn config_labels(config: &SGConfig) -> BTreeMap<String, String> {
    let prefix = defaults::DEFAULT_LABEL_PREFIX;
    BTreeMap::from([
        (APP_KEY.to_owned(), CONFIG_APP_NAME.to_owned()),
        (format!("{prefix}{CONFIG_UID_KEY}"), config.uid().unwrap_or_default()),
        (format!("{prefix}{CONFIG_NAME_KEY}"), config.name_any()),
    ])
}

fn owning_name<'a>(labels: &'a BTreeMap<String, String>, app: &str, name_key: &str) -> Option<&'a str> {
    if labels.get(APP_KEY).map(String::as_str) != Some(app) {
        return None;
    }
    labels
        .iter()
        .find(|(key, _)| key.ends_with(&format!("/{name_key}")))
        .map(|(_, value)| value.as_str())
}

/// Name of the cluster owning an object, read back from its labels
pub fn owning_cluster_name(labels: &BTreeMap<String, String>) -> Option<&str> {
    owning_name(labels, CLUSTER_APP_NAME, CLUSTER_NAME_KEY)
}

pub fn owning_config_name(labels: &BTreeMap<String, String>) -> Option<&str> {
    owning_name(labels, CONFIG_APP_NAME, CONFIG_NAME_KEY)
}

/// Every label of `selector` is present with the same value in `labels`
pub fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
