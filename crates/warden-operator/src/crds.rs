//! CRD installation
//!
//! The operator applies its own CRDs on startup, so the installed schema
//! always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use warden_common::crd::{AdmissionSensor, NodeSensor};
use warden_common::MANAGER;

/// Every CRD the operator serves
pub fn all() -> Vec<CustomResourceDefinition> {
    vec![NodeSensor::crd(), AdmissionSensor::crd()]
}

/// Multi-document YAML of [`all`], as printed by the `crd` subcommand
pub fn to_yaml() -> anyhow::Result<String> {
    let docs = all()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
    Ok(docs.join("---\n"))
}

/// Install or update every CRD with server-side apply
pub async fn ensure_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(MANAGER).force();

    for crd in all() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    }
    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names() {
        let names: Vec<_> = all().into_iter().filter_map(|c| c.metadata.name).collect();
        assert_eq!(
            names,
            vec!["nodesensors.warden.dev", "admissionsensors.warden.dev"]
        );
    }

    #[test]
    fn test_yaml_has_both_documents() {
        let yaml = to_yaml().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 2);
        assert!(yaml.contains("---\n"));
        assert!(yaml.contains("scope: Cluster"));
    }
}
