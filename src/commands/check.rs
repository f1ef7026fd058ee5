use anyhow::{Context, Result};
use kube::api::ListParams;
use kube::{Api, Client};

use skyhook_operator::crd::{DeploymentPolicy, Skyhook};

/// Preflight: connectivity, CRD installation, and basic list permissions.
pub async fn run() -> Result<()> {
    println!("Checking cluster access...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Skyhook CRD ................. ");
    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    match skyhooks.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} found)", list.items.len()),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot list skyhooks: {e}. Run 'crd install' first.");
        }
    }

    print!("  DeploymentPolicy CRD ........ ");
    let policies: Api<DeploymentPolicy> = Api::all(client.clone());
    match policies.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} found)", list.items.len()),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot list deploymentpolicies: {e}. Run 'crd install' first.");
        }
    }

    print!("  Node access ................. ");
    let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot list nodes: {e}");
        }
    }

    println!("\nAll checks passed.");
    Ok(())
}
