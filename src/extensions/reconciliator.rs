use super::{
    ExtensionEventEmitter, ExtensionFailureHook, ExtensionManager, ExtensionReconciliationContext,
};
use crate::{
    apis::sgcluster::{ClusterPodStatus, InstalledExtension, SGCluster, SGClusterStatus},
    Error, Result,
};
use std::sync::Arc;
use tracing::*;

/// Reads whether installs overwriting shared libraries must wait for a restart.
/// Called once per cycle so the setting can change at runtime.
pub type SkipSharedLibrariesOverwrites = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug)]
pub struct ExtensionReconciliationResult {
    /// The cluster status with the pod status updated
    pub status: SGClusterStatus,
    /// The status changed and must be persisted
    pub cluster_updated: bool,
    /// One entry per extension that could not be converged
    pub errors: Vec<Error>,
}

/// Converges the extensions installed in one pod to the ones required by its cluster
pub struct ExtensionReconciliator {
    pod_name: String,
    extension_manager: Arc<dyn ExtensionManager>,
    skip_shared_libraries_overwrites: SkipSharedLibrariesOverwrites,
    events: Arc<dyn ExtensionEventEmitter>,
    failure_hook: Arc<dyn ExtensionFailureHook>,
}

impl ExtensionReconciliator {
    pub fn new(
        pod_name: &str,
        extension_manager: Arc<dyn ExtensionManager>,
        skip_shared_libraries_overwrites: SkipSharedLibrariesOverwrites,
        events: Arc<dyn ExtensionEventEmitter>,
        failure_hook: Arc<dyn ExtensionFailureHook>,
    ) -> Self {
        Self {
            pod_name: pod_name.to_owned(),
            extension_manager,
            skip_shared_libraries_overwrites,
            events,
            failure_hook,
        }
    }

    /// Uninstall what is no longer required, then install or upgrade what is missing.
    ///
    /// A failing extension never prevents the others from converging, its error is
    /// collected in the result. With shared library overwrites skipped, removals and
    /// installs touching shared files are deferred and the pod is flagged for restart.
    #[instrument(skip_all, fields(pod = %self.pod_name))]
    pub async fn reconcile(&self, context: &ExtensionReconciliationContext) -> ExtensionReconciliationResult {
        let skip = (self.skip_shared_libraries_overwrites)();
        let cluster = &context.cluster;
        let mut status = cluster.status.clone().unwrap_or_default();
        let mut pod_status = status
            .pod_statuses
            .iter()
            .find(|p| p.name == self.pod_name)
            .cloned()
            .unwrap_or_else(|| ClusterPodStatus::new(&self.pod_name));
        let mut cluster_updated = false;
        let mut errors = vec![];
        info!("Reconcile postgres extensions...");

        let to_uninstall: Vec<InstalledExtension> = pod_status
            .installed_postgres_extensions
            .iter()
            .filter(|installed| !context.extensions.iter().any(|required| installed.same(required)))
            .cloned()
            .collect();
        for installed in &to_uninstall {
            match self.uninstall(context, installed, skip, &mut pod_status).await {
                Ok(updated) => cluster_updated |= updated,
                Err(e) => {
                    let e = extension_error(installed, e);
                    self.failure_hook
                        .on_uninstall_failure(cluster, &installed.description(), &self.pod_name, &e);
                    errors.push(e);
                }
            }
        }

        for required in &context.extensions {
            let extension = match self.resolve(cluster, required, &pod_status).await {
                Ok(extension) => extension,
                Err(e) => {
                    warn!("Can not detect extension {}", required.description());
                    let e = extension_error(required, e);
                    self.failure_hook
                        .on_install_failure(cluster, &required.description(), &self.pod_name, &e);
                    errors.push(e);
                    continue;
                }
            };
            match self.install(context, &extension, skip, &mut pod_status).await {
                Ok(updated) => cluster_updated |= updated,
                Err(e) => {
                    let e = extension_error(&extension, e);
                    self.failure_hook
                        .on_install_failure(cluster, &extension.description(), &self.pod_name, &e);
                    errors.push(e);
                }
            }
        }

        if !skip && pod_status.is_pending_restart() {
            pod_status.pending_restart = Some(false);
            cluster_updated = true;
        }

        match status.pod_statuses.iter_mut().find(|p| p.name == self.pod_name) {
            Some(existing) => *existing = pod_status,
            None => status.pod_statuses.push(pod_status),
        }
        info!("Reconciliation of postgres extensions completed");
        ExtensionReconciliationResult {
            status,
            cluster_updated,
            errors,
        }
    }

    async fn uninstall(
        &self,
        context: &ExtensionReconciliationContext,
        installed: &InstalledExtension,
        skip: bool,
        pod_status: &mut ClusterPodStatus,
    ) -> Result<bool> {
        let uninstaller = self
            .extension_manager
            .extension_uninstaller(context, installed)
            .await?;
        if skip {
            info!("Skip uninstallation of extension {}", installed.description());
            return Ok(set_pending_restart(pod_status));
        }
        if uninstaller.is_extension_installed().await? {
            info!("Removing extension {}", installed.description());
            self.events.emit_extension_removed(installed);
            uninstaller.uninstall_extension().await?;
        }
        pod_status
            .installed_postgres_extensions
            .retain(|extension| extension != installed);
        Ok(true)
    }

    /// Build to install: the recorded one when it is exactly the required one, otherwise
    /// the repository candidate
    async fn resolve(
        &self,
        cluster: &SGCluster,
        required: &InstalledExtension,
        pod_status: &ClusterPodStatus,
    ) -> Result<InstalledExtension> {
        if let Some(installed) = pod_status
            .installed_postgres_extensions
            .iter()
            .find(|installed| *installed == required)
        {
            return Ok(installed.clone());
        }
        let candidate = self
            .extension_manager
            .metadata_manager()
            .extension_candidate_same_major_build(cluster, &required.as_cluster_extension(), true)
            .await?;
        let extension = candidate.installed_extension();
        info!("Detected extension {}", extension.description());
        Ok(extension)
    }

    async fn install(
        &self,
        context: &ExtensionReconciliationContext,
        extension: &InstalledExtension,
        skip: bool,
        pod_status: &mut ClusterPodStatus,
    ) -> Result<bool> {
        let installer = self
            .extension_manager
            .extension_installer(context, extension)
            .await?
            .ok_or_else(|| {
                Error::MissingCollaborator(format!("Can not find extension {}", extension.description()))
            })?;
        let mut updated = false;

        let needs_install = !installer.is_extension_installed().await?
            && (!skip || !installer.is_extension_pending_overwrite().await?);
        if needs_install {
            info!("Download extension {}", extension.description());
            self.events.emit_extension_downloading(extension);
            installer.download_and_extract().await?;
            info!("Verify extension {}", extension.description());
            installer.verify().await?;
            if skip && installer.does_install_overwrite_any_shared_file().await? {
                info!("Skip installation of extension {}", extension.description());
                if !installer.is_extension_pending_overwrite().await? {
                    installer.set_extension_as_pending().await?;
                }
                if !pod_status.is_pending_restart() {
                    self.events.emit_extension_deployed_restart(extension);
                    updated |= set_pending_restart(pod_status);
                }
            } else {
                info!("Install extension {}", extension.description());
                installer.install_extension().await?;
                self.events.emit_extension_deployed(extension);
            }
        }

        if installer.is_extension_installed().await? {
            if !installer.are_links_created().await? {
                info!("Create links for extension {}", extension.description());
                installer.create_extension_links().await?;
            }
            let installed = &mut pod_status.installed_postgres_extensions;
            if !installed.contains(extension) {
                if let Some(index) = installed.iter().position(|previous| previous.same(extension)) {
                    let previous = installed.remove(index);
                    info!(
                        "Extension upgraded from {} to {}",
                        previous.description(),
                        extension.description()
                    );
                    self.events.emit_extension_changed(&previous, extension);
                }
                installed.push(extension.clone());
                updated = true;
            }
        }
        Ok(updated)
    }
}

fn set_pending_restart(pod_status: &mut ClusterPodStatus) -> bool {
    if pod_status.is_pending_restart() {
        false
    } else {
        pod_status.pending_restart = Some(true);
        true
    }
}

fn extension_error(extension: &InstalledExtension, e: Error) -> Error {
    match e {
        Error::MissingCollaborator(_) | Error::ExtensionError { .. } => e,
        other => Error::ExtensionError {
            extension: extension.description(),
            message: other.to_string(),
        },
    }
}
