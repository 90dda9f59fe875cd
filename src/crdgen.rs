use controller::apis::{sgcluster::SGCluster, sgconfig::SGConfig};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let mut documents = Vec::new();
    for mut crd in [SGCluster::crd(), SGConfig::crd()] {
        // Keep the CRDs, and their objects, when the chart is uninstalled
        crd.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("helm.sh/resource-policy".to_string(), "keep".to_string());
        documents.push(serde_yaml::to_string(&crd)?);
    }

    print!("{}", documents.join("---\n"));
    Ok(())
}
