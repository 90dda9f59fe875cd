use super::{
    cache::{is_owned_by, DeployedResourcesCache},
    comparator, target_id, ReconciliationResult, RequiredResourceGenerator, ResourceKey,
};
use crate::{Error, Result};
use kube::{api::DynamicObject, Resource, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};
use tracing::*;

/// Computes the create, patch and delete plan of a target
pub struct Conciliator<K: Send + Sync> {
    generator: Arc<dyn RequiredResourceGenerator<K>>,
    cache: Arc<DeployedResourcesCache>,
}

impl<K> Conciliator<K>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    pub fn new(generator: Arc<dyn RequiredResourceGenerator<K>>, cache: Arc<DeployedResourcesCache>) -> Self {
        Self { generator, cache }
    }

    /// Diff the required resources of `target` against the deployed ones it owns.
    ///
    /// Deployed objects that are not owned by the target are never planned for a patch or
    /// a deletion. A generator failure aborts the evaluation.
    #[instrument(skip_all, fields(target = %target_id(target)))]
    pub async fn eval_reconciliation_state(&self, target: &K) -> Result<ReconciliationResult> {
        let uid = target
            .uid()
            .ok_or_else(|| Error::InvalidErr(format!("{} has no uid", target_id(target))))?;
        let owner = target
            .controller_owner_ref(&())
            .ok_or_else(|| Error::InvalidErr(format!("{} has no name", target_id(target))))?;

        let required = self
            .generator
            .required_resources(target)
            .await
            .map_err(|e| match e {
                Error::ResourceGenerationError(_) | Error::MissingCollaborator(_) => e,
                other => Error::ResourceGenerationError(other.to_string()),
            })?;
        let mut desired = BTreeMap::new();
        for mut resource in required {
            let owners = resource.metadata.owner_references.get_or_insert_with(Vec::new);
            if !owners.iter().any(|o| o.uid == owner.uid) {
                owners.push(owner.clone());
            }
            if let Some(previous) = desired.insert(ResourceKey::of(&resource), resource) {
                warn!("Duplicated required resource {}", ResourceKey::of(&previous));
            }
        }

        let mut result = ReconciliationResult::default();
        for (key, desired) in &desired {
            match self.cache.get(key) {
                None => result.creations.push(desired.clone()),
                Some(deployed) if !is_owned_by(&deployed, &uid) => {
                    warn!("{key} already exists and is not owned by {}, skipping", target_id(target));
                }
                Some(deployed) => {
                    if !comparator::semantically_equal(desired, &deployed)? {
                        result.patches.push((desired.clone(), deployed));
                    }
                }
            }
        }
        // owned_by returns objects sorted by key
        result.deletions = self
            .cache
            .owned_by(&uid)
            .into_iter()
            .filter(|deployed| !desired.contains_key(&ResourceKey::of(deployed)))
            .filter(|deployed| !is_terminating(deployed))
            .collect();

        if result.is_empty() {
            debug!("Nothing to reconcile");
        } else {
            debug!("Reconciliation plan: {}", result);
        }
        Ok(result)
    }
}

fn is_terminating(resource: &DynamicObject) -> bool {
    resource.metadata.deletion_timestamp.is_some()
}
