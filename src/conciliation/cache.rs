use super::{with_types, ResourceKey};
use crate::labels;
use futures::StreamExt;
use kube::{
    api::{Api, DynamicObject},
    client::Client,
    core::ApiResource,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::*;

/// Last observed state of the objects created for the targets
#[derive(Default)]
pub struct DeployedResourcesCache {
    resources: RwLock<BTreeMap<ResourceKey, DynamicObject>>,
}

impl DeployedResourcesCache {
    pub fn get(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.read(|resources| resources.get(key).cloned())
    }

    pub fn put(&self, resource: DynamicObject) {
        let key = ResourceKey::of(&resource);
        self.write(|resources| {
            resources.insert(key, resource);
        });
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.write(|resources| resources.remove(key))
    }

    /// Replace every cached object of a kind, after a watcher (re)listed it
    pub fn replace_kind(&self, api_version: &str, kind: &str, listed: Vec<DynamicObject>) {
        self.write(|resources| {
            resources.retain(|key, _| key.api_version != api_version || key.kind != kind);
            for resource in listed {
                let resource = with_types(resource, api_version, kind);
                resources.insert(ResourceKey::of(&resource), resource);
            }
        });
    }

    /// Objects with an owner reference to the given uid
    pub fn owned_by(&self, uid: &str) -> Vec<DynamicObject> {
        self.read(|resources| {
            resources
                .values()
                .filter(|resource| is_owned_by(resource, uid))
                .cloned()
                .collect()
        })
    }

    pub fn matching_labels(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Vec<DynamicObject> {
        self.read(|resources| {
            resources
                .iter()
                .filter(|(key, _)| key.kind == kind && key.namespace.as_deref() == Some(namespace))
                .filter(|(_, resource)| labels::matches(resource.labels(), selector))
                .map(|(_, resource)| resource.clone())
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.read(BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a watcher event for objects of the given kind
    pub fn apply_event(&self, resource: &ApiResource, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Applied(applied) => {
                self.put(with_types(applied, &resource.api_version, &resource.kind))
            }
            watcher::Event::Deleted(deleted) => {
                let deleted = with_types(deleted, &resource.api_version, &resource.kind);
                self.remove(&ResourceKey::of(&deleted));
            }
            watcher::Event::Restarted(listed) => {
                self.replace_kind(&resource.api_version, &resource.kind, listed)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<ResourceKey, DynamicObject>) -> T) -> T {
        f(&self.resources.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut BTreeMap<ResourceKey, DynamicObject>) -> T) -> T {
        f(&mut self.resources.write().unwrap_or_else(PoisonError::into_inner))
    }
}

pub fn is_owned_by(resource: &DynamicObject, uid: &str) -> bool {
    resource.owner_references().iter().any(|owner| owner.uid == uid)
}

/// Keep the cache in sync with the objects of a kind matching `selector`.
///
/// `on_change` is called with every applied or deleted object so that its owner can be
/// scheduled for a reconciliation.
pub async fn watch_kind(
    client: Client,
    resource: ApiResource,
    selector: String,
    cache: Arc<DeployedResourcesCache>,
    on_change: impl Fn(&DynamicObject),
) {
    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let config = watcher::Config::default().labels(&selector);
    let mut events = watcher(api, config).default_backoff().boxed();
    info!("Watching {} objects", resource.kind);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                match &event {
                    watcher::Event::Applied(changed) | watcher::Event::Deleted(changed) => {
                        on_change(changed)
                    }
                    watcher::Event::Restarted(listed) => {
                        debug!("Listed {} {} objects", listed.len(), resource.kind)
                    }
                }
                cache.apply_event(&resource, event);
            }
            Err(e) => warn!("Watch of {} objects failed: {}", resource.kind, e),
        }
    }
}
