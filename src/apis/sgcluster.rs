use crate::{apis::condition::Condition, defaults};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const OPERATOR_VERSION_ANNOTATION: &str = "stackgres.io/operatorVersion";
pub const RECONCILIATION_PAUSE_ANNOTATION: &str = "stackgres.io/reconciliation-pause";

/// Generate the Kubernetes wrapper struct `SGCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "SGCluster", group = "stackgres.io", version = "v1", namespaced)]
#[kube(status = "SGClusterStatus", shortname = "sgc")]
#[serde(rename_all = "camelCase")]
pub struct SGClusterSpec {
    #[serde(default = "defaults::default_instances")]
    pub instances: i32,

    #[serde(default)]
    pub postgres: ClusterPostgres,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPostgres {
    #[serde(default = "defaults::default_postgres_version")]
    pub version: String,

    /// Extensions that must be installed in every pod of the cluster
    #[serde(default)]
    pub extensions: Vec<ClusterExtension>,
}

impl Default for ClusterPostgres {
    fn default() -> Self {
        Self {
            version: defaults::default_postgres_version(),
            extensions: vec![],
        }
    }
}

/// An extension requested in the cluster spec. Missing fields are resolved against
/// the extensions repository.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtension {
    pub name: String,
    pub publisher: Option<String>,
    pub version: Option<String>,
    pub repository: Option<String>,
}

/// The status object of `SGCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SGClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_statuses: Vec<ClusterPodStatus>,

    /// Extensions resolved against the repository, to be installed in every pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_install_postgres_extensions: Vec<InstalledExtension>,

    pub label_prefix: Option<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodStatus {
    pub name: String,

    #[serde(default)]
    pub installed_postgres_extensions: Vec<InstalledExtension>,

    pub pending_restart: Option<bool>,
}

impl ClusterPodStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            installed_postgres_extensions: vec![],
            pending_restart: None,
        }
    }

    pub fn is_pending_restart(&self) -> bool {
        self.pending_restart.unwrap_or(false)
    }
}

/// An extension installed (or to be installed) in a pod.
///
/// `==` requires the exact same build while [`InstalledExtension::same`] only
/// identifies the extension line.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct InstalledExtension {
    pub name: String,
    pub publisher: String,
    pub repository: String,
    pub version: String,
    pub postgres_version: String,
    pub build: Option<String>,
    pub extra_mounts: Option<Vec<String>>,
}

impl InstalledExtension {
    /// Same extension, regardless of version and build
    pub fn same(&self, other: &InstalledExtension) -> bool {
        self.name == other.name
            && self.publisher == other.publisher
            && self.repository == other.repository
    }

    pub fn description(&self) -> String {
        match &self.build {
            Some(build) => format!(
                "{}-{} (publisher {}, postgres {}, build {})",
                self.name, self.version, self.publisher, self.postgres_version, build
            ),
            None => format!(
                "{}-{} (publisher {}, postgres {})",
                self.name, self.version, self.publisher, self.postgres_version
            ),
        }
    }

    pub fn as_cluster_extension(&self) -> ClusterExtension {
        ClusterExtension {
            name: self.name.clone(),
            publisher: Some(self.publisher.clone()),
            version: (!self.version.is_empty()).then(|| self.version.clone()),
            repository: Some(self.repository.clone()),
        }
    }
}

impl SGCluster {
    pub fn postgres_version(&self) -> &str {
        &self.spec.postgres.version
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn pod_status(&self, pod_name: &str) -> Option<&ClusterPodStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.pod_statuses.iter().find(|p| p.name == pod_name))
    }

    pub fn label_prefix(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.label_prefix.as_deref())
            .unwrap_or(defaults::DEFAULT_LABEL_PREFIX)
    }

    pub fn operator_version(&self) -> Option<&str> {
        self.annotations()
            .get(OPERATOR_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn is_reconciliation_paused(&self) -> bool {
        self.annotations()
            .get(RECONCILIATION_PAUSE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Extensions every pod must converge to.
    ///
    /// The resolved list from the status wins, otherwise the spec extensions are
    /// taken with the default publisher and repository.
    pub fn required_extensions(&self) -> Vec<InstalledExtension> {
        let resolved = self
            .status
            .as_ref()
            .map(|s| s.to_install_postgres_extensions.clone())
            .unwrap_or_default();
        if !resolved.is_empty() {
            return resolved;
        }
        self.spec
            .postgres
            .extensions
            .iter()
            .map(|extension| InstalledExtension {
                name: extension.name.clone(),
                publisher: extension
                    .publisher
                    .clone()
                    .unwrap_or_else(defaults::default_publisher),
                repository: extension
                    .repository
                    .clone()
                    .unwrap_or_else(defaults::default_repository),
                version: extension.version.clone().unwrap_or_default(),
                postgres_version: self.postgres_version().to_owned(),
                build: None,
                extra_mounts: None,
            })
            .collect()
    }
}
