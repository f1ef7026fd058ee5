use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use crate::cli::CrdAction;
use skyhook_operator::crd::{DeploymentPolicy, Skyhook};

pub async fn run(action: CrdAction) -> Result<()> {
    match action {
        CrdAction::Generate => generate(),
        CrdAction::Install => install().await,
    }
}

fn generate() -> Result<()> {
    let skyhook = serde_yaml::to_string(&Skyhook::crd()).context("CRD should serialize")?;
    let policy =
        serde_yaml::to_string(&DeploymentPolicy::crd()).context("CRD should serialize")?;
    println!("{skyhook}---\n{policy}");
    Ok(())
}

async fn install() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [Skyhook::crd(), DeploymentPolicy::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        crds.patch(
            &name,
            &PatchParams::apply("skyhook-operator").force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("Failed to apply CRD {name}"))?;
        info!(crd = %name, "crd_applied");
        println!("Applied {name}");
    }

    Ok(())
}
