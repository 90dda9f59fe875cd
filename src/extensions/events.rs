use super::{ExtensionEventEmitter, ExtensionFailureHook};
use crate::{
    apis::sgcluster::{InstalledExtension, SGCluster},
    Error,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Resource, ResourceExt,
};
use std::sync::Arc;
use tracing::*;

const ACTION: &str = "ExtensionReconciliation";

/// Publishes extension changes as Kubernetes events of the cluster, with the pod as
/// related object
pub struct RecorderExtensionEvents {
    recorder: Arc<Recorder>,
    pod: ObjectReference,
}

impl RecorderExtensionEvents {
    pub fn new(client: Client, reporter: Reporter, cluster: &SGCluster, pod_name: &str) -> Self {
        Self {
            recorder: Arc::new(Recorder::new(client, reporter, cluster.object_ref(&()))),
            pod: pod_reference(cluster, pod_name),
        }
    }

    fn publish(&self, type_: EventType, reason: &str, note: String) {
        let recorder = self.recorder.clone();
        let event = extension_event(type_, reason, note, &self.pod);
        tokio::spawn(async move {
            if let Err(e) = recorder.publish(event).await {
                warn!("Unable to publish extension event: {}", e);
            }
        });
    }
}

fn pod_reference(cluster: &SGCluster, pod_name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_owned()),
        kind: Some("Pod".to_owned()),
        name: Some(pod_name.to_owned()),
        namespace: cluster.namespace(),
        ..ObjectReference::default()
    }
}

fn extension_event(type_: EventType, reason: &str, note: String, pod: &ObjectReference) -> Event {
    Event {
        type_,
        reason: reason.to_owned(),
        note: Some(note),
        action: ACTION.to_owned(),
        secondary: Some(pod.clone()),
    }
}

impl ExtensionEventEmitter for RecorderExtensionEvents {
    fn emit_extension_downloading(&self, extension: &InstalledExtension) {
        self.publish(
            EventType::Normal,
            "ExtensionDownloading",
            format!("Downloading extension {}", extension.description()),
        );
    }

    fn emit_extension_deployed(&self, extension: &InstalledExtension) {
        self.publish(
            EventType::Normal,
            "ExtensionDeployed",
            format!("Extension {} deployed", extension.description()),
        );
    }

    fn emit_extension_deployed_restart(&self, extension: &InstalledExtension) {
        self.publish(
            EventType::Normal,
            "ExtensionDeployedRestart",
            format!(
                "Extension {} deployed, a restart is required to complete the installation",
                extension.description()
            ),
        );
    }

    fn emit_extension_changed(&self, previous: &InstalledExtension, extension: &InstalledExtension) {
        self.publish(
            EventType::Normal,
            "ExtensionChanged",
            format!(
                "Extension upgraded from {} to {}",
                previous.description(),
                extension.description()
            ),
        );
    }

    fn emit_extension_removed(&self, extension: &InstalledExtension) {
        self.publish(
            EventType::Normal,
            "ExtensionRemoved",
            format!("Extension {} removed", extension.description()),
        );
    }
}

impl ExtensionFailureHook for RecorderExtensionEvents {
    fn on_install_failure(&self, _cluster: &SGCluster, extension: &str, pod_name: &str, error: &Error) {
        warn!("Installation of extension {} failed on pod {}: {}", extension, pod_name, error);
        self.publish(
            EventType::Warning,
            "ExtensionInstallFailed",
            format!("Extension {extension} installation failed on pod {pod_name}: {error}"),
        );
    }

    fn on_uninstall_failure(&self, _cluster: &SGCluster, extension: &str, pod_name: &str, error: &Error) {
        warn!("Removal of extension {} failed on pod {}: {}", extension, pod_name, error);
        self.publish(
            EventType::Warning,
            "ExtensionUninstallFailed",
            format!("Extension {extension} removal failed on pod {pod_name}: {error}"),
        );
    }
}
