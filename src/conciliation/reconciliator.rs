use super::{
    cache::DeployedResourcesCache, conciliator::Conciliator, handler::HandlerDelegator, target_id,
    ReconciliationResult, RequiredResourceGenerator, ResourceKey,
};
use crate::{status::StatusManager, telemetry, Error, Metrics, Result};
use kube::Resource;
use std::sync::Arc;
use tracing::*;

/// Runs reconciliation cycles of one kind of target: plan, apply, report.
pub struct Reconciliator<K: Send + Sync> {
    conciliator: Conciliator<K>,
    handler: Arc<dyn HandlerDelegator<K>>,
    status_manager: Arc<dyn StatusManager<K>>,
    cache: Arc<DeployedResourcesCache>,
    metrics: Metrics,
}

impl<K> Reconciliator<K>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    pub fn new(
        generator: Arc<dyn RequiredResourceGenerator<K>>,
        handler: Arc<dyn HandlerDelegator<K>>,
        status_manager: Arc<dyn StatusManager<K>>,
        cache: Arc<DeployedResourcesCache>,
        metrics: Metrics,
    ) -> Self {
        Self {
            conciliator: Conciliator::new(generator, cache.clone()),
            handler,
            status_manager,
            cache,
            metrics,
        }
    }

    /// One reconciliation cycle of `target`.
    ///
    /// Every planned operation is attempted even when some fail. The status is updated
    /// in every case, with the failure when the plan could not be computed or applied.
    #[instrument(skip_all, fields(target = %target_id(target), trace_id))]
    pub async fn reconciliation_cycle(&self, target: &K) -> Result<ReconciliationResult> {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", &field::display(&trace_id));
        let _timer = self.metrics.count_and_measure();

        let outcome = match self.conciliator.eval_reconciliation_state(target).await {
            Ok(plan) => self.apply(target, &plan).await.map(|_| plan),
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            warn!("Reconciliation of {} failed: {}", target_id(target), e);
            self.metrics.reconcile_failure(&target_id(target), e);
        }

        let failure = outcome.as_ref().err().map(ToString::to_string);
        if let Err(status_error) = self.status_manager.update_status(target, failure).await {
            error!("Unable to update the status of {}: {}", target_id(target), status_error);
            return match outcome {
                Err(e) => Err(e),
                Ok(_) => Err(status_error),
            };
        }
        outcome
    }

    async fn apply(&self, target: &K, plan: &ReconciliationResult) -> Result<()> {
        let mut failures = vec![];
        for resource in &plan.creations {
            match self.handler.create(target, resource).await {
                Ok(created) => self.cache.put(created),
                Err(e) => failures.push(format!("create {}: {}", ResourceKey::of(resource), e)),
            }
        }
        for (desired, deployed) in &plan.patches {
            match self.handler.patch(target, desired, deployed).await {
                Ok(patched) => self.cache.put(patched),
                Err(e) => failures.push(format!("patch {}: {}", ResourceKey::of(desired), e)),
            }
        }
        for resource in &plan.deletions {
            let key = ResourceKey::of(resource);
            match self.handler.delete(target, resource).await {
                Ok(()) => {
                    self.cache.remove(&key);
                }
                Err(e) => failures.push(format!("delete {}: {}", key, e)),
            }
        }
        self.metrics.count_operations("create", plan.creations.len());
        self.metrics.count_operations("patch", plan.patches.len());
        self.metrics.count_operations("delete", plan.deletions.len());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ApplyError(failures))
        }
    }
}
