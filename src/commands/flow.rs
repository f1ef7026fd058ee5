use anyhow::{Context, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use skyhook_operator::crd::Skyhook;
use skyhook_operator::node_state::{DISABLE_ANNOTATION, PAUSE_ANNOTATION};

/// Toggle the pause annotation. Paused Skyhooks halt themselves and every
/// later priority on each node they target.
pub async fn pause(skyhook: &str, on: bool, confirm: bool, dry_run: bool) -> Result<()> {
    toggle(skyhook, PAUSE_ANNOTATION, on, confirm, dry_run, if on { "pause" } else { "resume" })
        .await
}

/// Toggle the disable annotation. Disabled Skyhooks are treated as absent
/// by the priority chain.
pub async fn disable(skyhook: &str, on: bool, confirm: bool, dry_run: bool) -> Result<()> {
    toggle(
        skyhook,
        DISABLE_ANNOTATION,
        on,
        confirm,
        dry_run,
        if on { "disable" } else { "enable" },
    )
    .await
}

async fn toggle(
    skyhook: &str,
    annotation: &str,
    on: bool,
    confirm: bool,
    dry_run: bool,
    verb: &str,
) -> Result<()> {
    if dry_run {
        println!("[dry-run] Would {verb} skyhook '{skyhook}'");
        return Ok(());
    }
    if !confirm {
        anyhow::bail!("Refusing to {verb} '{skyhook}' without --confirm (or use --dry-run)");
    }

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let skyhooks: Api<Skyhook> = Api::all(client);

    // Verify it exists before patching for a friendlier error.
    skyhooks
        .get(skyhook)
        .await
        .with_context(|| format!("Skyhook '{skyhook}' not found"))?;

    let value = if on {
        serde_json::Value::String("true".to_string())
    } else {
        serde_json::Value::Null
    };
    let patch = serde_json::json!({
        "metadata": { "annotations": { annotation: value } }
    });

    skyhooks
        .patch(
            skyhook,
            &PatchParams::apply("skyhook-operator-cli"),
            &Patch::Merge(&patch),
        )
        .await
        .with_context(|| format!("Failed to {verb} '{skyhook}'"))?;

    info!(skyhook = %skyhook, action = %verb, "flow_control_updated");
    println!("Skyhook '{skyhook}': {verb} applied");
    Ok(())
}
