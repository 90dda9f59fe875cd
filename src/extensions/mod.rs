//! Convergence of the Postgres extensions installed in a pod.
//!
//! The [`reconciliator::ExtensionReconciliator`] decides what to install, upgrade or
//! remove. The filesystem work is done by the collaborators of an [`ExtensionManager`]
//! provided by the agent running next to Postgres.
pub mod events;
pub mod pod;
pub mod reconciliator;

use crate::{
    apis::sgcluster::{ClusterExtension, InstalledExtension, SGCluster},
    Error, Result,
};
use async_trait::async_trait;

/// Inputs of an extension reconciliation: the cluster as last read and the extensions
/// every pod must have
#[derive(Clone, Debug)]
pub struct ExtensionReconciliationContext {
    pub cluster: SGCluster,
    pub extensions: Vec<InstalledExtension>,
}

impl ExtensionReconciliationContext {
    pub fn new(cluster: SGCluster) -> Self {
        let extensions = cluster.required_extensions();
        Self { cluster, extensions }
    }
}

/// A build of an extension found in the repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionMetadata {
    pub name: String,
    pub publisher: String,
    pub repository: String,
    pub version: String,
    pub postgres_version: String,
    pub build: Option<String>,
    pub extra_mounts: Vec<String>,
}

impl ExtensionMetadata {
    pub fn installed_extension(&self) -> InstalledExtension {
        InstalledExtension {
            name: self.name.clone(),
            publisher: self.publisher.clone(),
            repository: self.repository.clone(),
            version: self.version.clone(),
            postgres_version: self.postgres_version.clone(),
            build: self.build.clone(),
            extra_mounts: (!self.extra_mounts.is_empty()).then(|| self.extra_mounts.clone()),
        }
    }
}

/// Installs one extension build in the pod
#[async_trait]
pub trait ExtensionInstaller: Send + Sync {
    async fn is_extension_installed(&self) -> Result<bool>;

    /// The extension was extracted but its installation waits for a restart
    async fn is_extension_pending_overwrite(&self) -> Result<bool>;

    async fn does_install_overwrite_any_shared_file(&self) -> Result<bool>;

    async fn download_and_extract(&self) -> Result<()>;

    async fn verify(&self) -> Result<()>;

    async fn install_extension(&self) -> Result<()>;

    async fn set_extension_as_pending(&self) -> Result<()>;

    async fn are_links_created(&self) -> Result<bool>;

    async fn create_extension_links(&self) -> Result<()>;
}

#[async_trait]
pub trait ExtensionUninstaller: Send + Sync {
    async fn is_extension_installed(&self) -> Result<bool>;

    async fn uninstall_extension(&self) -> Result<()>;
}

#[async_trait]
pub trait ExtensionMetadataManager: Send + Sync {
    /// Newest build with the same major version as the requested extension
    async fn extension_candidate_same_major_build(
        &self,
        cluster: &SGCluster,
        extension: &ClusterExtension,
        detect_os: bool,
    ) -> Result<ExtensionMetadata>;
}

#[async_trait]
pub trait ExtensionManager: Send + Sync {
    /// `None` when no build of the extension can be installed in the pod
    async fn extension_installer(
        &self,
        context: &ExtensionReconciliationContext,
        extension: &InstalledExtension,
    ) -> Result<Option<Box<dyn ExtensionInstaller>>>;

    async fn extension_uninstaller(
        &self,
        context: &ExtensionReconciliationContext,
        extension: &InstalledExtension,
    ) -> Result<Box<dyn ExtensionUninstaller>>;

    fn metadata_manager(&self) -> &dyn ExtensionMetadataManager;
}

/// Notifications about extension changes, nothing waits for them
pub trait ExtensionEventEmitter: Send + Sync {
    fn emit_extension_downloading(&self, extension: &InstalledExtension);

    fn emit_extension_deployed(&self, extension: &InstalledExtension);

    /// The extension was extracted but needs a restart to be installed
    fn emit_extension_deployed_restart(&self, extension: &InstalledExtension);

    fn emit_extension_changed(&self, previous: &InstalledExtension, extension: &InstalledExtension);

    fn emit_extension_removed(&self, extension: &InstalledExtension);
}

pub trait ExtensionFailureHook: Send + Sync {
    fn on_install_failure(&self, cluster: &SGCluster, extension: &str, pod_name: &str, error: &Error);

    fn on_uninstall_failure(&self, cluster: &SGCluster, extension: &str, pod_name: &str, error: &Error);
}
