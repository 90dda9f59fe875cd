//! Helper methods only available for tests
use crate::{
    apis::{
        sgcluster::{ClusterExtension, InstalledExtension, SGCluster, SGClusterSpec},
        sgconfig::{SGConfig, SGConfigSpec},
    },
    conciliation::{handler::HandlerDelegator, to_dynamic, RequiredResourceGenerator, ResourceKey},
    defaults, labels,
    extensions::{
        ExtensionEventEmitter, ExtensionFailureHook, ExtensionInstaller, ExtensionManager,
        ExtensionMetadata, ExtensionMetadataManager, ExtensionReconciliationContext, ExtensionUninstaller,
    },
    status::StatusManager,
    Error, Result,
};
use assert_json_diff::{assert_json_eq, assert_json_include};
use async_trait::async_trait;
use http::{Request, Response};
use hyper::Body;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{DynamicObject, ObjectMeta},
    Client, Resource, ResourceExt,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;

pub const TEST_UID: &str = "752d59ef-2671-4890-9feb-0097459b18c8";

impl SGCluster {
    /// A normal test cluster
    pub fn test() -> Self {
        let mut cluster = SGCluster::new("testdb", SGClusterSpec::default());
        cluster.meta_mut().namespace = Some("testns".into());
        cluster.meta_mut().uid = Some(TEST_UID.to_string());
        cluster
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// the object already exists, its creation returns the live object
    CreateConflict(DynamicObject),
    /// the object is merge patched with the expected body
    Patch(DynamicObject, Value),
    /// the object to delete is already gone
    DeleteNotFound(DynamicObject),
    /// the status write of the stale cluster conflicts, it is retried on the latest one
    /// with a body including the expected one
    StatusConflictThenRetry {
        stale: SGCluster,
        latest: SGCluster,
        expected: Value,
    },
    /// every status write conflicts
    StatusConflicts(SGCluster),
    /// the status is patched with a body including the expected one
    StatusPatch(SGCluster, Value),
    /// no call is expected, any call fails
    RadioSilence,
}

/// A kube client answered by the returned verifier
pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), ApiServerVerifier(handle))
}

pub async fn timeout_after_1s(handle: JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

fn collection_path(key: &ResourceKey) -> String {
    let resource = key.api_resource();
    let base = if resource.group.is_empty() {
        format!("/api/{}", resource.version)
    } else {
        format!("/apis/{}/{}", resource.group, resource.version)
    };
    format!(
        "{base}/namespaces/{}/{}",
        key.namespace.as_deref().unwrap_or_default(),
        resource.plural
    )
}

fn object_path(resource: &DynamicObject) -> String {
    let key = ResourceKey::of(resource);
    format!("{}/{}", collection_path(&key), key.name)
}

fn cluster_path(cluster: &SGCluster) -> String {
    format!(
        "/apis/stackgres.io/v1/namespaces/{}/sgclusters/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

fn json_response<T: Serialize>(object: &T) -> Response<Body> {
    let body = serde_json::to_vec(object).unwrap();
    Response::builder().body(Body::from(body)).unwrap()
}

/// Failure answered the way the API server does, with a `Status` body
fn status_response(code: u16, reason: &str) -> Response<Body> {
    let status = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{reason} for the test"),
        "reason": reason,
        "code": code
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&status).unwrap()))
        .unwrap()
}

async fn json_body(request: Request<Body>) -> Value {
    let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
    serde_json::from_slice(&body).expect("json request body")
}

impl ApiServerVerifier {
    /// Answer the calls of a scenario, in order.
    ///
    /// Await the returned handle with [`timeout_after_1s`] to check that every expected
    /// call was made. Calls beyond the scenario fail with a closed service error.
    pub fn run(self, scenario: Scenario) -> JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::CreateConflict(resource) => {
                    self.handle_create_conflict(&resource)
                        .await
                        .handle_get(&object_path(&resource), &resource)
                        .await
                }
                Scenario::Patch(resource, expected) => self.handle_patch(&resource, expected).await,
                Scenario::DeleteNotFound(resource) => self.handle_delete_not_found(&resource).await,
                Scenario::StatusConflictThenRetry { stale, latest, expected } => {
                    self.handle_status_conflict(&stale)
                        .await
                        .handle_get(&cluster_path(&latest), &latest)
                        .await
                        .handle_status_patch(&latest, expected)
                        .await
                }
                Scenario::StatusConflicts(cluster) => {
                    self.handle_status_conflict(&cluster)
                        .await
                        .handle_get(&cluster_path(&cluster), &cluster)
                        .await
                        .handle_status_conflict(&cluster)
                        .await
                        .handle_get(&cluster_path(&cluster), &cluster)
                        .await
                        .handle_status_conflict(&cluster)
                        .await
                }
                Scenario::StatusPatch(cluster, expected) => self.handle_status_patch(&cluster, expected).await,
                Scenario::RadioSilence => self,
            };
        })
    }

    async fn next(&mut self, method: http::Method, path: &str) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), path);
        (request, send)
    }

    // chainable scenario handlers
    async fn handle_create_conflict(mut self, resource: &DynamicObject) -> Self {
        let path = collection_path(&ResourceKey::of(resource));
        let (_, send) = self.next(http::Method::POST, &path).await;
        send.send_response(status_response(409, "AlreadyExists"));
        self
    }

    async fn handle_get<T: Serialize>(mut self, path: &str, object: &T) -> Self {
        let (_, send) = self.next(http::Method::GET, path).await;
        send.send_response(json_response(object));
        self
    }

    async fn handle_patch(mut self, resource: &DynamicObject, expected: Value) -> Self {
        let (request, send) = self.next(http::Method::PATCH, &object_path(resource)).await;
        assert_json_eq!(json_body(request).await, expected);
        send.send_response(json_response(resource));
        self
    }

    async fn handle_delete_not_found(mut self, resource: &DynamicObject) -> Self {
        let (_, send) = self.next(http::Method::DELETE, &object_path(resource)).await;
        send.send_response(status_response(404, "NotFound"));
        self
    }

    /// Status write conditioned on the resource version of `cluster`, rejected
    async fn handle_status_conflict(mut self, cluster: &SGCluster) -> Self {
        let path = format!("{}/status", cluster_path(cluster));
        let (request, send) = self.next(http::Method::PATCH, &path).await;
        let expected = json!({ "metadata": { "resourceVersion": cluster.resource_version() } });
        assert_json_include!(actual: json_body(request).await, expected: expected);
        send.send_response(status_response(409, "Conflict"));
        self
    }

    async fn handle_status_patch(mut self, cluster: &SGCluster, expected: Value) -> Self {
        let path = format!("{}/status", cluster_path(cluster));
        let (request, send) = self.next(http::Method::PATCH, &path).await;
        assert_json_include!(actual: json_body(request).await, expected: expected);
        send.send_response(json_response(cluster));
        self
    }
}

impl SGConfig {
    /// The operator configuration of the test operator namespace
    pub fn test() -> Self {
        let mut config = SGConfig::new("stackgres", SGConfigSpec::default());
        config.meta_mut().namespace = Some("stackgres".into());
        config.meta_mut().uid = Some("f3d4a7b2-2f5e-4c4e-9a55-0a3e1f6c9d21".into());
        config
    }
}

/// A config map of the test namespace labeled as part of a cluster
pub fn config_map(name: &str, value: &str) -> DynamicObject {
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("testns".to_owned()),
            labels: Some(BTreeMap::from([(
                labels::APP_KEY.to_owned(),
                labels::CLUSTER_APP_NAME.to_owned(),
            )])),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([("value".to_owned(), value.to_owned())])),
        ..ConfigMap::default()
    };
    to_dynamic(&config_map).expect("config map converts to a dynamic object")
}

/// Returns a fixed set of resources, or always fails
pub struct FakeGenerator {
    resources: Vec<DynamicObject>,
    failure: Option<String>,
}

impl FakeGenerator {
    pub fn new(resources: Vec<DynamicObject>) -> Self {
        Self {
            resources,
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            resources: vec![],
            failure: Some(message.to_owned()),
        }
    }
}

#[async_trait]
impl<K: Send + Sync> RequiredResourceGenerator<K> for FakeGenerator {
    async fn required_resources(&self, _target: &K) -> Result<Vec<DynamicObject>> {
        match &self.failure {
            Some(message) => Err(Error::InvalidErr(message.clone())),
            None => Ok(self.resources.clone()),
        }
    }
}

/// Records the calls it receives as `"<operation> <name>"`
#[derive(Default)]
pub struct FakeHandler {
    failing_on: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeHandler {
    pub fn failing_on(name: &str) -> Self {
        Self {
            failing_on: Some(name.to_owned()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &str, resource: &DynamicObject) -> Result<()> {
        let name = resource.metadata.name.clone().unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{operation} {name}"));
        if self.failing_on.as_deref() == Some(name.as_str()) {
            return Err(Error::InvalidErr(format!("{name} is rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl<K: Send + Sync> HandlerDelegator<K> for FakeHandler {
    async fn create(&self, _target: &K, resource: &DynamicObject) -> Result<DynamicObject> {
        self.record("create", resource)?;
        Ok(resource.clone())
    }

    async fn patch(&self, _target: &K, desired: &DynamicObject, _deployed: &DynamicObject) -> Result<DynamicObject> {
        self.record("patch", desired)?;
        Ok(desired.clone())
    }

    async fn delete(&self, _target: &K, resource: &DynamicObject) -> Result<()> {
        self.record("delete", resource)
    }
}

/// Records the failure reported by every cycle
#[derive(Default)]
pub struct FakeStatusManager {
    failures: Mutex<Vec<Option<String>>>,
}

impl FakeStatusManager {
    pub fn failures(&self) -> Vec<Option<String>> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl<K: Send + Sync> StatusManager<K> for FakeStatusManager {
    async fn update_status(&self, _target: &K, failure: Option<String>) -> Result<()> {
        self.failures.lock().unwrap().push(failure);
        Ok(())
    }
}

/// The build the fake repository resolves for `name` and `version`
pub fn extension(name: &str, version: &str) -> InstalledExtension {
    InstalledExtension {
        name: name.to_owned(),
        publisher: defaults::default_publisher(),
        repository: defaults::default_repository(),
        version: version.to_owned(),
        postgres_version: "16".to_owned(),
        build: Some("6.22".to_owned()),
        extra_mounts: None,
    }
}

/// What is extracted, installed and linked in the pod filesystem
#[derive(Default)]
struct FakeDisk {
    installed: HashSet<InstalledExtension>,
    pending: HashSet<InstalledExtension>,
    links: HashSet<InstalledExtension>,
    overwrites_shared_files: HashSet<String>,
    fails_download: HashSet<String>,
    unknown: HashSet<String>,
    without_installer: HashSet<String>,
}

/// In memory extension manager with a repository that knows every extension
#[derive(Default)]
pub struct FakeExtensionManager {
    disk: Arc<Mutex<FakeDisk>>,
}

impl FakeExtensionManager {
    pub fn install_on_disk(&self, extension: &InstalledExtension) {
        let mut disk = self.disk.lock().unwrap();
        disk.installed.insert(extension.clone());
        disk.links.insert(extension.clone());
    }

    pub fn overwrites_shared_files(&self, name: &str) {
        self.disk.lock().unwrap().overwrites_shared_files.insert(name.to_owned());
    }

    pub fn fails_download(&self, name: &str) {
        self.disk.lock().unwrap().fails_download.insert(name.to_owned());
    }

    pub fn unknown_in_repository(&self, name: &str) {
        self.disk.lock().unwrap().unknown.insert(name.to_owned());
    }

    pub fn without_installer(&self, name: &str) {
        self.disk.lock().unwrap().without_installer.insert(name.to_owned());
    }

    pub fn has_links(&self, extension: &InstalledExtension) -> bool {
        self.disk.lock().unwrap().links.contains(extension)
    }

    pub fn is_pending(&self, extension: &InstalledExtension) -> bool {
        self.disk.lock().unwrap().pending.contains(extension)
    }

    pub fn is_installed(&self, extension: &InstalledExtension) -> bool {
        self.disk.lock().unwrap().installed.contains(extension)
    }
}

struct FakeInstaller {
    disk: Arc<Mutex<FakeDisk>>,
    extension: InstalledExtension,
}

impl FakeInstaller {
    fn disk(&self) -> std::sync::MutexGuard<'_, FakeDisk> {
        self.disk.lock().unwrap()
    }
}

#[async_trait]
impl ExtensionInstaller for FakeInstaller {
    async fn is_extension_installed(&self) -> Result<bool> {
        Ok(self.disk().installed.contains(&self.extension))
    }

    async fn is_extension_pending_overwrite(&self) -> Result<bool> {
        Ok(self.disk().pending.contains(&self.extension))
    }

    async fn does_install_overwrite_any_shared_file(&self) -> Result<bool> {
        Ok(self.disk().overwrites_shared_files.contains(&self.extension.name))
    }

    async fn download_and_extract(&self) -> Result<()> {
        if self.disk().fails_download.contains(&self.extension.name) {
            return Err(Error::InvalidErr("download interrupted".to_owned()));
        }
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    async fn install_extension(&self) -> Result<()> {
        let mut disk = self.disk();
        disk.pending.remove(&self.extension);
        disk.installed.insert(self.extension.clone());
        Ok(())
    }

    async fn set_extension_as_pending(&self) -> Result<()> {
        self.disk().pending.insert(self.extension.clone());
        Ok(())
    }

    async fn are_links_created(&self) -> Result<bool> {
        Ok(self.disk().links.contains(&self.extension))
    }

    async fn create_extension_links(&self) -> Result<()> {
        self.disk().links.insert(self.extension.clone());
        Ok(())
    }
}

struct FakeUninstaller {
    disk: Arc<Mutex<FakeDisk>>,
    extension: InstalledExtension,
}

#[async_trait]
impl ExtensionUninstaller for FakeUninstaller {
    async fn is_extension_installed(&self) -> Result<bool> {
        Ok(self.disk.lock().unwrap().installed.contains(&self.extension))
    }

    async fn uninstall_extension(&self) -> Result<()> {
        let mut disk = self.disk.lock().unwrap();
        disk.installed.remove(&self.extension);
        disk.links.remove(&self.extension);
        Ok(())
    }
}

#[async_trait]
impl ExtensionManager for FakeExtensionManager {
    async fn extension_installer(
        &self,
        _context: &ExtensionReconciliationContext,
        extension: &InstalledExtension,
    ) -> Result<Option<Box<dyn ExtensionInstaller>>> {
        if self.disk.lock().unwrap().without_installer.contains(&extension.name) {
            return Ok(None);
        }
        Ok(Some(Box::new(FakeInstaller {
            disk: self.disk.clone(),
            extension: extension.clone(),
        })))
    }

    async fn extension_uninstaller(
        &self,
        _context: &ExtensionReconciliationContext,
        extension: &InstalledExtension,
    ) -> Result<Box<dyn ExtensionUninstaller>> {
        Ok(Box::new(FakeUninstaller {
            disk: self.disk.clone(),
            extension: extension.clone(),
        }))
    }

    fn metadata_manager(&self) -> &dyn ExtensionMetadataManager {
        self
    }
}

#[async_trait]
impl ExtensionMetadataManager for FakeExtensionManager {
    async fn extension_candidate_same_major_build(
        &self,
        cluster: &SGCluster,
        extension: &ClusterExtension,
        _detect_os: bool,
    ) -> Result<ExtensionMetadata> {
        if self.disk.lock().unwrap().unknown.contains(&extension.name) {
            return Err(Error::InvalidErr(format!("extension {} not found", extension.name)));
        }
        Ok(ExtensionMetadata {
            name: extension.name.clone(),
            publisher: extension.publisher.clone().unwrap_or_else(defaults::default_publisher),
            repository: extension.repository.clone().unwrap_or_else(defaults::default_repository),
            version: extension.version.clone().unwrap_or_default(),
            postgres_version: cluster.postgres_version().to_owned(),
            build: Some("6.22".to_owned()),
            extra_mounts: vec![],
        })
    }
}

/// Keeps extension events as short strings naming `<name>-<version>`
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn short(extension: &InstalledExtension) -> String {
    format!("{}-{}", extension.name, extension.version)
}

impl ExtensionEventEmitter for RecordingEvents {
    fn emit_extension_downloading(&self, extension: &InstalledExtension) {
        self.push(format!("downloading {}", short(extension)));
    }

    fn emit_extension_deployed(&self, extension: &InstalledExtension) {
        self.push(format!("deployed {}", short(extension)));
    }

    fn emit_extension_deployed_restart(&self, extension: &InstalledExtension) {
        self.push(format!("restart {}", short(extension)));
    }

    fn emit_extension_changed(&self, previous: &InstalledExtension, extension: &InstalledExtension) {
        self.push(format!("changed {} -> {}", short(previous), short(extension)));
    }

    fn emit_extension_removed(&self, extension: &InstalledExtension) {
        self.push(format!("removed {}", short(extension)));
    }
}

impl ExtensionFailureHook for RecordingEvents {
    fn on_install_failure(&self, _cluster: &SGCluster, extension: &str, _pod_name: &str, _error: &Error) {
        let name = extension.split_whitespace().next().unwrap_or_default();
        self.failures.lock().unwrap().push(format!("install {name}"));
    }

    fn on_uninstall_failure(&self, _cluster: &SGCluster, extension: &str, _pod_name: &str, _error: &Error) {
        let name = extension.split_whitespace().next().unwrap_or_default();
        self.failures.lock().unwrap().push(format!("uninstall {name}"));
    }
}
