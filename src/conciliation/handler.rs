use super::{comparator, with_types, ResourceKey};
use crate::Result;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    client::Client,
};
use tracing::*;

pub const FIELD_MANAGER: &str = "stackgres-controller";

/// Performs the API calls of a reconciliation plan.
///
/// Implementations are idempotent: creating an object that already exists returns the
/// live object and deleting a missing object succeeds.
#[async_trait]
pub trait HandlerDelegator<K: Send + Sync>: Send + Sync {
    async fn create(&self, target: &K, resource: &DynamicObject) -> Result<DynamicObject>;

    async fn patch(&self, target: &K, desired: &DynamicObject, deployed: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, target: &K, resource: &DynamicObject) -> Result<()>;
}

/// [`HandlerDelegator`] working on any kind through the dynamic API
#[derive(Clone)]
pub struct KubeHandlerDelegator {
    client: Client,
}

impl KubeHandlerDelegator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
        let resource = key.api_resource();
        match &key.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl<K: Send + Sync> HandlerDelegator<K> for KubeHandlerDelegator {
    async fn create(&self, _target: &K, resource: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::of(resource);
        let api = self.api(&key);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        let created = match api.create(&pp, resource).await {
            Ok(created) => created,
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("{key} already exists");
                api.get(&key.name).await?
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Created {key}");
        Ok(with_types(created, &key.api_version, &key.kind))
    }

    async fn patch(&self, _target: &K, desired: &DynamicObject, deployed: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::of(desired);
        let patch = comparator::patch_for(desired, deployed)?;
        trace!("Patching {key} with {patch}");
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let patched = self.api(&key).patch(&key.name, &pp, &Patch::Merge(&patch)).await?;
        debug!("Patched {key}");
        Ok(with_types(patched, &key.api_version, &key.kind))
    }

    async fn delete(&self, _target: &K, resource: &DynamicObject) -> Result<()> {
        let key = ResourceKey::of(resource);
        match self.api(&key).delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => debug!("Deleted {key}"),
            Err(kube::Error::Api(e)) if e.code == 404 => debug!("{key} was already deleted"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
