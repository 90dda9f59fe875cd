//! Resources required by an `SGConfig`.
use super::{
    discoverer::{ResourceGenerationDiscoverer, ResourceGenerator},
    to_dynamic, RequiredResourceGenerator,
};
use crate::{apis::sgconfig::SGConfig, labels, Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use kube::{
    api::{DynamicObject, ObjectMeta},
    ResourceExt,
};
use std::sync::Arc;

pub const RESTAPI_NAME: &str = "stackgres-restapi";

pub struct ConfigContext {
    pub config: SGConfig,
    pub namespace: String,
}

impl ConfigContext {
    pub fn new(config: &SGConfig) -> Result<Self> {
        let namespace = config
            .namespace()
            .ok_or_else(|| Error::InvalidErr(format!("SGConfig {} has no namespace", config.name_any())))?;
        Ok(Self {
            config: config.clone(),
            namespace,
        })
    }
}

/// Identity the REST API and the web console run with
pub struct WebConsoleServiceAccount;

impl ResourceGenerator<ConfigContext> for WebConsoleServiceAccount {
    fn name(&self) -> &'static str {
        "web-console-service-account"
    }

    fn generate(&self, context: &ConfigContext) -> Result<Vec<DynamicObject>> {
        let config = &context.config;
        if !config.spec.deploy.restapi {
            return Ok(vec![]);
        }
        let settings = config.spec.service_account.clone().unwrap_or_default();
        let pull_secrets: Vec<LocalObjectReference> = settings
            .repo_credentials
            .into_iter()
            .map(|name| LocalObjectReference { name: Some(name) })
            .collect();
        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(RESTAPI_NAME.to_owned()),
                namespace: Some(context.namespace.clone()),
                labels: Some(labels::config_labels(config)),
                annotations: settings.annotations,
                ..ObjectMeta::default()
            },
            image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
            ..ServiceAccount::default()
        };
        Ok(vec![to_dynamic(&service_account)?])
    }
}

pub fn config_discoverer() -> Result<ResourceGenerationDiscoverer<ConfigContext>> {
    ResourceGenerationDiscoverer::default().register(">=0.1.0", vec![Arc::new(WebConsoleServiceAccount)])
}

/// [`RequiredResourceGenerator`] of `SGConfig` backed by the version registry
pub struct ConfigRequiredResources {
    discoverer: ResourceGenerationDiscoverer<ConfigContext>,
    operator_version: String,
}

impl ConfigRequiredResources {
    pub fn new(discoverer: ResourceGenerationDiscoverer<ConfigContext>, operator_version: &str) -> Self {
        Self {
            discoverer,
            operator_version: operator_version.to_owned(),
        }
    }
}

#[async_trait]
impl RequiredResourceGenerator<SGConfig> for ConfigRequiredResources {
    async fn required_resources(&self, config: &SGConfig) -> Result<Vec<DynamicObject>> {
        let version = config.operator_version().unwrap_or(self.operator_version.as_str());
        let context = ConfigContext::new(config)?;
        self.discoverer.generate(version, &context)
    }
}
