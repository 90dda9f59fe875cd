use super::{
    condition::Condition,
    sgcluster::{OPERATOR_VERSION_ANNOTATION, RECONCILIATION_PAUSE_ANNOTATION},
};
use crate::defaults;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operator wide configuration, reconciled into the resources the operator components
/// share
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "SGConfig", group = "stackgres.io", version = "v1", namespaced)]
#[kube(status = "SGConfigStatus", shortname = "sgconfig")]
#[serde(rename_all = "camelCase")]
pub struct SGConfigSpec {
    #[serde(default)]
    pub deploy: ConfigDeploy,

    pub service_account: Option<ConfigServiceAccount>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDeploy {
    /// Deploy the REST API and the web console
    #[serde(default = "defaults::default_true")]
    pub restapi: bool,
}

impl Default for ConfigDeploy {
    fn default() -> Self {
        Self { restapi: true }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServiceAccount {
    pub annotations: Option<BTreeMap<String, String>>,

    /// Image pull secrets of the operator components
    #[serde(default)]
    pub repo_credentials: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SGConfigStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SGConfig {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn operator_version(&self) -> Option<&str> {
        self.annotations()
            .get(OPERATOR_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn is_reconciliation_paused(&self) -> bool {
        self.annotations()
            .get(RECONCILIATION_PAUSE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn restapi_is_deployed_unless_disabled() {
        let config: SGConfig = serde_json::from_value(json!({
            "apiVersion": "stackgres.io/v1",
            "kind": "SGConfig",
            "metadata": { "name": "stackgres", "namespace": "stackgres" },
            "spec": {}
        }))
        .unwrap();
        assert!(config.spec.deploy.restapi);

        let disabled: SGConfigSpec = serde_json::from_value(json!({ "deploy": { "restapi": false } })).unwrap();
        assert!(!disabled.deploy.restapi);
    }
}
