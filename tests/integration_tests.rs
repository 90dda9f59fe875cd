// Include the #[ignore] macro on slow tests
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
//
// These tests assume there is already kubernetes running and you have a context configured.
// It also assumes that the SGCluster CRD and the controller are already installed for this
// cluster. In this way, it can be used as a conformance test on a target.

#[cfg(test)]
mod test {
    use controller::apis::sgcluster::SGCluster;
    use k8s_openapi::{
        api::{
            apps::v1::StatefulSet,
            core::v1::{ConfigMap, Namespace, Service},
        },
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    };
    use kube::{
        api::{DeleteParams, Patch, PatchParams, PostParams},
        runtime::wait::{await_condition, conditions},
        Api, Client, Config, Resource, ResourceExt,
    };
    use rand::Rng;
    use serde_json::json;
    use std::time::Duration;

    const TIMEOUT_SECONDS_RESOURCES_CREATED: u64 = 120;
    const TIMEOUT_SECONDS_CLUSTER_DELETED: u64 = 120;

    async fn kube_client() -> Client {
        let kube_config = Config::infer()
            .await
            .expect("Please configure your Kubernetes context.");
        let selected_namespace = &kube_config.default_namespace;
        let client = Client::try_from(kube_config.clone()).expect("Failed to initialize Kubernetes client");

        // The selected namespace must be labeled to allow the running of tests
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace = namespaces.get(selected_namespace).await.unwrap();
        let labels = namespace.metadata.labels.unwrap_or_default();
        assert_eq!(
            labels.get("safe-to-run-stackgres-tests").map(String::as_str),
            Some("true"),
            "expected to find label 'safe-to-run-stackgres-tests' with value 'true'"
        );

        let custom_resource_definitions: Api<CustomResourceDefinition> = Api::all(client.clone());
        tokio::time::timeout(
            Duration::from_secs(2),
            await_condition(
                custom_resource_definitions,
                "sgclusters.stackgres.io",
                conditions::is_crd_established(),
            ),
        )
        .await
        .expect("Custom Resource Definition for SGCluster was not found.")
        .unwrap();

        client
    }

    fn test_cluster(name: &str, instances: i32) -> serde_json::Value {
        json!({
            "apiVersion": "stackgres.io/v1",
            "kind": "SGCluster",
            "metadata": { "name": name },
            "spec": { "instances": instances, "postgres": { "version": "16" } }
        })
    }

    async fn wait_for_owned<K>(api: Api<K>, name: &str, cluster: &SGCluster) -> K
    where
        K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    {
        let uid = cluster.uid().unwrap();
        let owned = move |obj: Option<&K>| {
            obj.map(|o| o.owner_references().iter().any(|r| r.uid == uid))
                .unwrap_or(false)
        };
        tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_RESOURCES_CREATED),
            await_condition(api.clone(), name, owned),
        )
        .await
        .unwrap_or_else(|_| panic!("{name} was not created in time"))
        .unwrap();
        api.get(name).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_cluster_resources_follow_the_spec() {
        let client = kube_client().await;
        let namespace = client.default_namespace().to_owned();
        let suffix = rand::thread_rng().gen_range(0..100000);
        let name = format!("test-cluster-{suffix}");

        let clusters: Api<SGCluster> = Api::namespaced(client.clone(), &namespace);
        let cluster: SGCluster = serde_json::from_value(test_cluster(&name, 1)).unwrap();
        let cluster = clusters.create(&PostParams::default(), &cluster).await.unwrap();

        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
        let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
        let statefulset = wait_for_owned(statefulsets.clone(), &name, &cluster).await;
        assert_eq!(statefulset.spec.unwrap().replicas, Some(1));
        wait_for_owned(config_maps, &format!("{name}-env"), &cluster).await;
        wait_for_owned(services, &format!("{name}-primary"), &cluster).await;

        // Scaling the cluster is reflected on the statefulset
        clusters
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "instances": 2 } })),
            )
            .await
            .unwrap();
        let scaled = |obj: Option<&StatefulSet>| {
            obj.and_then(|s| s.spec.as_ref())
                .and_then(|s| s.replicas)
                .map(|r| r == 2)
                .unwrap_or(false)
        };
        tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_RESOURCES_CREATED),
            await_condition(statefulsets, &name, scaled),
        )
        .await
        .expect("statefulset was not scaled in time")
        .unwrap();

        // A manual change of an owned object is reverted
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
        config_maps
            .patch(
                &format!("{name}-env"),
                &PatchParams::default(),
                &Patch::Merge(json!({ "data": { "PATRONI_SCOPE": "tampered" } })),
            )
            .await
            .unwrap();
        let restored = |obj: Option<&ConfigMap>| {
            obj.and_then(|c| c.data.as_ref())
                .and_then(|d| d.get("PATRONI_SCOPE"))
                .map(|scope| scope != "tampered")
                .unwrap_or(false)
        };
        tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_RESOURCES_CREATED),
            await_condition(config_maps, &format!("{name}-env"), restored),
        )
        .await
        .expect("config map was not restored in time")
        .unwrap();

        clusters.delete(&name, &DeleteParams::default()).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_CLUSTER_DELETED),
            await_condition(clusters, &name, conditions::is_deleted(&cluster.uid().unwrap())),
        )
        .await
        .expect("SGCluster was not deleted in time")
        .unwrap();
    }
}
