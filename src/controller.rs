use crate::{
    apis::{sgcluster::SGCluster, sgconfig::SGConfig},
    conciliation::{
        cache::{self, DeployedResourcesCache},
        cluster::{cluster_discoverer, ClusterRequiredResources},
        config::{config_discoverer, ConfigRequiredResources},
        handler::KubeHandlerDelegator,
        reconciliator::Reconciliator,
    },
    config::Config,
    labels,
    status::{ClusterStatusManager, ConfigStatusManager},
    worker_pool::{PoolSnapshot, WorkerPool},
    Error, Metrics, Result,
};
use chrono::{DateTime, Utc};
use futures::{future::FutureExt, stream::StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount},
    },
    NamespaceResourceScope,
};
use kube::{
    api::{Api, DynamicObject, ListParams, ResourceExt},
    client::Client,
    core::ApiResource,
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        watcher, WatchStreamExt,
    },
    Resource,
};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Runs the reconciliations, one at a time per target
    pub pool: WorkerPool,
    pub config: Config,
    /// Objects deployed for the targets, fed by the watchers
    pub cache: Arc<DeployedResourcesCache>,
    pub reconciliator: Arc<Reconciliator<SGCluster>>,
    pub config_reconciliator: Arc<Reconciliator<SGConfig>>,
}

/// Custom resources reconciled by the controller
pub trait Target:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    fn reconciliator(ctx: &Context) -> &Reconciliator<Self>;

    fn is_reconciliation_paused(&self) -> bool;
}

impl Target for SGCluster {
    fn reconciliator(ctx: &Context) -> &Reconciliator<Self> {
        &ctx.reconciliator
    }

    fn is_reconciliation_paused(&self) -> bool {
        SGCluster::is_reconciliation_paused(self)
    }
}

impl Target for SGConfig {
    fn reconciliator(ctx: &Context) -> &Reconciliator<Self> {
        &ctx.config_reconciliator
    }

    fn is_reconciliation_paused(&self) -> bool {
        SGConfig::is_reconciliation_paused(self)
    }
}

/// Scheduler identity of the `K` named `namespace`/`name`
fn target_id_of<K: Target>(namespace: &str, name: &str) -> String {
    format!("{} {namespace}.{name}", K::kind(&()))
}

/// Queue a reconciliation of the `K` named `namespace`/`name`
pub fn schedule<K: Target>(ctx: &Arc<Context>, namespace: &str, name: &str, priority: bool) {
    let target_id = target_id_of::<K>(namespace, name);
    trace!("Scheduling {} (priority: {})", target_id, priority);
    let task_ctx = ctx.clone();
    let namespace = namespace.to_owned();
    let name = name.to_owned();
    ctx.pool.schedule_reconciliation(
        target_id,
        async move {
            if let Err(e) = reconcile::<K>(task_ctx, &namespace, &name).await {
                warn!("reconcile of {} {namespace}.{name} failed: {:?}", K::kind(&()), e);
            }
        },
        priority,
    );
}

/// Reconcile the latest version of a target, the scheduled one may be outdated
#[instrument(skip(ctx), fields(kind = %K::kind(&())))]
async fn reconcile<K: Target>(ctx: Arc<Context>, namespace: &str, name: &str) -> Result<()> {
    ctx.diagnostics.write().await.last_event = Utc::now();
    let kind = K::kind(&());
    let targets: Api<K> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(target) = targets.get_opt(name).await? else {
        debug!("{kind} {namespace}.{name} no longer exists");
        return Ok(());
    };
    if target.is_reconciliation_paused() {
        info!("Skipping reconciliation for {kind} \"{}\" in {}", name, namespace);
        return Ok(());
    }
    if target.meta().deletion_timestamp.is_some() {
        debug!("{kind} {namespace}.{name} is being deleted");
        return Ok(());
    }

    debug!("Reconciling {kind} \"{}\" in {}", name, namespace);
    match K::reconciliator(&ctx).reconciliation_cycle(&target).await {
        Ok(plan) if plan.is_empty() => Ok(()),
        Ok(plan) => {
            info!("{kind} {namespace}.{name} reconciled: {plan}");
            Ok(())
        }
        Err(e) => {
            let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), &target);
            let event = Event {
                type_: EventType::Warning,
                reason: "ReconciliationFailed".into(),
                note: Some(e.to_string()),
                action: "Reconciling".into(),
                secondary: None,
            };
            if let Err(publish_error) = recorder.publish(event).await {
                warn!("Unable to publish reconciliation event: {}", publish_error);
            }
            Err(e)
        }
    }
}

type OwningName = for<'a> fn(&'a BTreeMap<String, String>) -> Option<&'a str>;

/// Target (namespace, name) to reconcile after a change of an object it owns
fn owner_of(resource: &DynamicObject, owning_name: OwningName) -> Option<(String, String)> {
    let name = owning_name(resource.labels())?;
    Some((resource.namespace()?, name.to_owned()))
}

/// Resync period with up to 10% jitter so that clusters do not resync together
fn resync_period(ttl: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=ttl.saturating_mul(100));
    Duration::from_secs(ttl).saturating_add(Duration::from_millis(jitter))
}

/// Kinds created for the clusters, or read to compute their status
fn cluster_owned_kinds() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<ConfigMap>(&()),
        ApiResource::erase::<Secret>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<StatefulSet>(&()),
        ApiResource::erase::<Pod>(&()),
    ]
}

/// Targets created or updated are reconciled first, relists are low priority
async fn watch_targets<K: Target>(ctx: Arc<Context>) {
    let api = Api::<K>::all(ctx.client.clone());
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(target)) => {
                if let Some(namespace) = target.namespace() {
                    schedule::<K>(&ctx, &namespace, &target.name_any(), true);
                }
            }
            Ok(watcher::Event::Deleted(target)) => {
                debug!("{} {} deleted", K::kind(&()), target.name_any());
            }
            Ok(watcher::Event::Restarted(targets)) => {
                for target in targets {
                    if let Some(namespace) = target.namespace() {
                        schedule::<K>(&ctx, &namespace, &target.name_any(), false);
                    }
                }
            }
            Err(e) => warn!("{} watch failed: {}", K::kind(&()), e),
        }
    }
}

async fn resync_kind<K: Target>(ctx: &Arc<Context>) {
    let api = Api::<K>::all(ctx.client.clone());
    match api.list(&ListParams::default()).await {
        Ok(targets) => {
            debug!("Resync of {} {} objects", targets.items.len(), K::kind(&()));
            for target in targets {
                if let Some(namespace) = target.namespace() {
                    schedule::<K>(ctx, &namespace, &target.name_any(), false);
                }
            }
        }
        Err(e) => warn!("Unable to list {} objects for resync: {}", K::kind(&()), e),
    }
}

/// Periodic low priority reconciliation of every target
async fn resync(ctx: Arc<Context>) {
    loop {
        tokio::time::sleep(resync_period(ctx.config.reconcile_ttl)).await;
        resync_kind::<SGCluster>(&ctx).await;
        resync_kind::<SGConfig>(&ctx).await;
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "stackgres-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder<K: Target>(&self, client: Client, target: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), target.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    pool: WorkerPool,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Must be called within the runtime, the pool workers are started here
    pub fn new(config: &Config) -> Self {
        Self {
            diagnostics: Arc::default(),
            registry: prometheus::Registry::default(),
            pool: WorkerPool::new(config.reconciliation_threads),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// What the workers are doing and what is waiting
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client, config: Config) -> Result<Arc<Context>> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .map_err(|e| Error::InvalidErr(format!("metrics registration failed: {e}")))?;
        let cache = Arc::new(DeployedResourcesCache::default());
        let handler = Arc::new(KubeHandlerDelegator::new(client.clone()));
        let reconciliator = Reconciliator::new(
            Arc::new(ClusterRequiredResources::new(
                cluster_discoverer()?,
                &config.operator_version,
            )),
            handler.clone(),
            Arc::new(ClusterStatusManager::new(client.clone(), cache.clone())),
            cache.clone(),
            metrics.clone(),
        );
        let config_reconciliator = Reconciliator::new(
            Arc::new(ConfigRequiredResources::new(
                config_discoverer()?,
                &config.operator_version,
            )),
            handler,
            Arc::new(ConfigStatusManager::new(client.clone())),
            cache.clone(),
            metrics.clone(),
        );
        Ok(Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics,
            pool: self.pool.clone(),
            config,
            cache,
            reconciliator: Arc::new(reconciliator),
            config_reconciliator: Arc::new(config_reconciliator),
        }))
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State, config: Config) {
    // Initialize the Kubernetes client
    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => panic!("Please configure your Kubernetes Context: {e}"),
    };

    let clusters = Api::<SGCluster>::all(client.clone());
    let configs = Api::<SGConfig>::all(client.clone());
    let lp = ListParams::default().limit(1);
    if let Err(e) = futures::try_join!(clusters.list(&lp), configs.list(&lp)) {
        error!("CRD is not queryable; {e:?}. Are the CRDs installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let ctx = match state.create_context(client.clone(), config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Unable to initialize the controller: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "Starting with {} reconciliation workers, resync every {}s",
        ctx.config.reconciliation_threads, ctx.config.reconcile_ttl
    );

    let mut watchers = futures::stream::FuturesUnordered::new();
    for resource in cluster_owned_kinds() {
        let owned_ctx = ctx.clone();
        let selector = labels::app_selector(labels::CLUSTER_APP_NAME);
        watchers.push(
            cache::watch_kind(client.clone(), resource, selector, ctx.cache.clone(), move |changed| {
                if let Some((namespace, name)) = owner_of(changed, labels::owning_cluster_name) {
                    schedule::<SGCluster>(&owned_ctx, &namespace, &name, false);
                }
            })
            .boxed(),
        );
    }
    let owned_ctx = ctx.clone();
    watchers.push(
        cache::watch_kind(
            client.clone(),
            ApiResource::erase::<ServiceAccount>(&()),
            labels::app_selector(labels::CONFIG_APP_NAME),
            ctx.cache.clone(),
            move |changed| {
                if let Some((namespace, name)) = owner_of(changed, labels::owning_config_name) {
                    schedule::<SGConfig>(&owned_ctx, &namespace, &name, false);
                }
            },
        )
        .boxed(),
    );
    watchers.push(watch_targets::<SGCluster>(ctx.clone()).boxed());
    watchers.push(watch_targets::<SGConfig>(ctx.clone()).boxed());
    watchers.push(resync(ctx.clone()).boxed());

    tokio::select! {
        _ = watchers.next() => error!("A watcher stopped unexpectedly"),
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }
    ctx.pool.shutdown().await;
    info!("Reconciliation workers stopped");
}
