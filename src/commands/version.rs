use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;

/// Parse a human duration like "5s", "2m", "1h" (plain numbers are seconds).
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => raw.split_at(i),
        None => (raw, "s"),
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("invalid duration '{raw}'"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => anyhow::bail!("invalid duration unit '{unit}' in '{raw}'"),
    };
    Ok(Duration::from_secs(seconds))
}

pub async fn run(client_only: bool, timeout: &str) -> Result<()> {
    println!("Client version: {}", env!("CARGO_PKG_VERSION"));

    if client_only {
        return Ok(());
    }

    let timeout = parse_duration(timeout)?;
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    let version = tokio::time::timeout(timeout, client.apiserver_version())
        .await
        .context("Timed out waiting for the apiserver version")?
        .context("Cannot reach cluster")?;

    println!("Server version: v{}.{}", version.major, version.minor);
    Ok(())
}
