//! Desired state planning and application.
//!
//! The [`conciliator::Conciliator`] diffs the resources a target requires against the
//! ones deployed for it, the [`reconciliator::Reconciliator`] applies the resulting plan
//! through a [`handler::HandlerDelegator`] and reports the outcome with a
//! [`crate::status::StatusManager`].
pub mod cache;
pub mod cluster;
pub mod comparator;
pub mod config;
pub mod conciliator;
pub mod discoverer;
pub mod handler;
pub mod reconciliator;

use crate::Result;
use async_trait::async_trait;
use itertools::Itertools;
use kube::{
    api::DynamicObject,
    core::{ApiResource, GroupVersionKind, TypeMeta},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Identity of a Kubernetes object, ordered to keep plans and logs stable
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn of(resource: &DynamicObject) -> Self {
        let (api_version, kind) = resource
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            api_version,
            kind,
            namespace: resource.metadata.namespace.clone(),
            name: resource.name_any(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        match self.api_version.split_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, &self.kind),
            None => GroupVersionKind::gvk("", &self.api_version, &self.kind),
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&self.gvk())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{} {}.{}", self.kind, namespace, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Scheduler identity of a target, `"<Kind> <namespace>.<name>"`
pub fn target_id<K: Resource<DynamicType = ()>>(target: &K) -> String {
    format!(
        "{} {}.{}",
        K::kind(&()),
        target.namespace().unwrap_or_default(),
        target.name_any()
    )
}

/// Convert a typed object into a [`DynamicObject`] keeping its type meta
pub fn to_dynamic<T: Serialize>(resource: &T) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(resource)?)?)
}

pub fn from_dynamic<T: DeserializeOwned>(resource: &DynamicObject) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(resource)?)?)
}

/// Objects returned by list and watch calls do not carry their type meta
pub fn with_types(mut resource: DynamicObject, api_version: &str, kind: &str) -> DynamicObject {
    if resource.types.is_none() {
        resource.types = Some(TypeMeta {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
        });
    }
    resource
}

/// Plan computed by the conciliator, every list is sorted by [`ResourceKey`]
#[derive(Clone, Debug, Default)]
pub struct ReconciliationResult {
    pub creations: Vec<DynamicObject>,
    /// Pairs of (desired, deployed)
    pub patches: Vec<(DynamicObject, DynamicObject)>,
    pub deletions: Vec<DynamicObject>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.patches.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creations.len() + self.patches.len() + self.deletions.len()
    }

    pub fn creation_keys(&self) -> Vec<ResourceKey> {
        self.creations.iter().map(ResourceKey::of).collect()
    }

    pub fn patch_keys(&self) -> Vec<ResourceKey> {
        self.patches.iter().map(|(desired, _)| ResourceKey::of(desired)).collect()
    }

    pub fn deletion_keys(&self) -> Vec<ResourceKey> {
        self.deletions.iter().map(ResourceKey::of).collect()
    }
}

impl fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |keys: Vec<ResourceKey>| keys.iter().join(", ");
        write!(
            f,
            "creations: [{}], patches: [{}], deletions: [{}]",
            join(self.creation_keys()),
            join(self.patch_keys()),
            join(self.deletion_keys())
        )
    }
}

/// Computes the resources a target needs. Failing aborts the whole reconciliation cycle.
#[async_trait]
pub trait RequiredResourceGenerator<K: Send + Sync>: Send + Sync {
    async fn required_resources(&self, target: &K) -> Result<Vec<DynamicObject>>;
}
