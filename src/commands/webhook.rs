use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use crate::cli::WebhookAction;
use skyhook_operator::admission::{
    AdmissionVerdict, review_deployment_policy, review_policy_deletion, review_skyhook,
};
use skyhook_operator::crd::{DeploymentPolicy, Skyhook};
use skyhook_operator::metrics;

pub async fn run(action: WebhookAction) -> Result<()> {
    match action {
        WebhookAction::Serve {
            addr,
            tls_cert,
            tls_key,
        } => serve(&addr, &tls_cert, &tls_key).await,
        WebhookAction::CertGenerate {
            service_name,
            namespace,
            output_dir,
        } => generate_certs(&service_name, &namespace, &output_dir),
        WebhookAction::InstallConfig {
            service_name,
            namespace,
            ca_bundle_path,
        } => install_config(&service_name, &namespace, &ca_bundle_path),
    }
}

/* ============================= SERVE ============================= */

async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting admission webhook...\n");
    info!("webhook_starting");

    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  TLS ......................... ");
    let tls = load_tls(tls_cert, tls_key).await?;
    println!("loaded ({tls_cert}, {tls_key})");

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;
    println!("  Validating endpoint ......... https://{addr}/validate");
    println!();
    println!("Webhook running. Press Ctrl+C to stop.\n");

    // Ctrl+C feeds the same shutdown path the operator uses when it embeds
    // this server.
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    serve_tls(client, addr, tls, shutdown_rx).await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/// Embedded entry used by the operator when ENABLE_WEBHOOKS is set.
pub(crate) async fn serve_embedded(
    client: Client,
    addr: SocketAddr,
    tls_cert: String,
    tls_key: String,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let tls = load_tls(&tls_cert, &tls_key).await?;
    serve_tls(client, addr, tls, shutdown).await
}

async fn serve_tls(
    client: Client,
    addr: SocketAddr,
    tls: RustlsConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!(addr = %addr, "webhook_listening");
    let server =
        axum_server::bind_rustls(addr, tls).serve(admission_router(client).into_make_service());
    tokio::select! {
        result = server => result.context("webhook server failed")?,
        _ = shutdown.recv() => info!("webhook_shutdown"),
    }
    Ok(())
}

/* ============================= TLS ============================= */

/// Read and sanity-check the PEM pair before handing it to the server, so
/// a bad cert mount fails with a pointed error instead of a handshake one.
async fn load_tls(cert_path: &str, key_path: &str) -> Result<RustlsConfig> {
    let cert_bytes = std::fs::read(cert_path)
        .with_context(|| format!("cannot read TLS certificate {cert_path}"))?;
    let key_bytes =
        std::fs::read(key_path).with_context(|| format!("cannot read TLS key {key_path}"))?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("invalid PEM in {cert_path}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {cert_path}");
    }
    if rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .with_context(|| format!("invalid PEM in {key_path}"))?
        .is_none()
    {
        anyhow::bail!("no private key found in {key_path}");
    }

    RustlsConfig::from_pem(cert_bytes, key_bytes)
        .await
        .context("TLS configuration rejected")
}

/* ============================= ROUTER ============================= */

pub(crate) fn admission_router(client: Client) -> Router {
    Router::new()
        .route("/validate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "READY") }))
        .route(
            "/metrics",
            get(|| async {
                match metrics::render() {
                    Ok(body) => (StatusCode::OK, body),
                    Err(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "metrics encoding error".to_string(),
                    ),
                }
            }),
        )
        .with_state(client)
}

/* ============================= ADMISSION ============================= */

async fn admission_handler(
    State(client): State<Client>,
    Json(review): Json<serde_json::Value>,
) -> impl IntoResponse {
    let request = &review["request"];
    let uid = request["uid"].as_str().unwrap_or("");
    let kind = request["kind"]["kind"].as_str().unwrap_or("");
    let operation = request["operation"].as_str().unwrap_or("UNKNOWN");
    let name = request["name"].as_str().unwrap_or("");

    // Only the DeploymentPolicy deletion guard needs cluster state.
    let policy_refs = if kind == "DeploymentPolicy" && operation == "DELETE" {
        match referencing_skyhooks(&client, name).await {
            Ok(refs) => refs,
            Err(e) => {
                // Lookup failures allow, like every other infra error here.
                info!(error = %e, policy = %name, "reference_lookup_failed_failopen");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let verdict = review_request(kind, operation, name, &request["object"], &policy_refs);

    metrics::inc_webhook_request(kind, operation, verdict.allowed);
    if !verdict.allowed {
        info!(
            kind = %kind,
            operation = %operation,
            violations = ?verdict.violations,
            "admission_denied"
        );
    }

    Json(ReviewEnvelope::reply(uid, &verdict))
}

/// Admission decision for one AdmissionReview request. Pure apart from
/// logging; the deletion guard's reference list is looked up by the caller.
pub(crate) fn review_request(
    kind: &str,
    operation: &str,
    name: &str,
    object: &serde_json::Value,
    policy_refs: &[String],
) -> AdmissionVerdict {
    match (kind, operation) {
        ("Skyhook", "CREATE" | "UPDATE") => {
            match serde_json::from_value::<Skyhook>(object.clone()) {
                Ok(skyhook) => review_skyhook(&skyhook.spec),
                Err(e) => {
                    // A shape this far off the CRD schema never reaches the
                    // webhook in practice; fail open like the infra errors.
                    info!(error = %e, "failed_to_parse_skyhook");
                    AdmissionVerdict::allow()
                }
            }
        }
        ("DeploymentPolicy", "CREATE" | "UPDATE") => {
            match serde_json::from_value::<DeploymentPolicy>(object.clone()) {
                Ok(policy) => review_deployment_policy(&policy.spec),
                Err(e) => {
                    info!(error = %e, "failed_to_parse_deployment_policy");
                    AdmissionVerdict::allow()
                }
            }
        }
        ("DeploymentPolicy", "DELETE") => review_policy_deletion(name, policy_refs),
        _ => AdmissionVerdict::allow(),
    }
}

async fn referencing_skyhooks(client: &Client, policy: &str) -> Result<Vec<String>> {
    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    let list = skyhooks.list(&ListParams::default()).await?;
    Ok(list
        .items
        .iter()
        .filter(|s| s.spec.deployment_policy.as_deref() == Some(policy))
        .map(|s| s.name_any())
        .collect())
}

/* ============================= RESPONSE ============================= */

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewEnvelope {
    api_version: &'static str,
    kind: &'static str,
    response: ReviewResponse,
}

#[derive(Debug, Serialize)]
struct ReviewResponse {
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ReviewStatus>,
}

#[derive(Debug, Serialize)]
struct ReviewStatus {
    message: String,
}

impl ReviewEnvelope {
    fn reply(uid: &str, verdict: &AdmissionVerdict) -> Self {
        Self {
            api_version: "admission.k8s.io/v1",
            kind: "AdmissionReview",
            response: ReviewResponse {
                uid: uid.to_string(),
                allowed: verdict.allowed,
                status: verdict
                    .message
                    .clone()
                    .map(|message| ReviewStatus { message }),
            },
        }
    }
}

/* ============================= CERT GENERATION ============================= */

struct IssuedCerts {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
}

/// Self-signed CA plus a server certificate covering the webhook Service
/// DNS names. Development convenience; production mounts managed certs.
fn issue_certs(service_name: &str, namespace: &str) -> Result<IssuedCerts> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    let service_dns = format!("{service_name}.{namespace}.svc");

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, format!("{service_name}-ca"));
    ca_params.distinguished_name = ca_dn;
    let ca_key = KeyPair::generate().context("CA key generation failed")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("CA self-sign failed")?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, service_dns.clone());
    params.distinguished_name = dn;
    params.subject_alt_names = vec![
        SanType::DnsName(service_dns.clone().try_into().context("invalid SAN")?),
        SanType::DnsName(
            format!("{service_dns}.cluster.local")
                .try_into()
                .context("invalid SAN")?,
        ),
    ];
    let key = KeyPair::generate().context("server key generation failed")?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .context("server cert signing failed")?;

    Ok(IssuedCerts {
        ca_pem: ca_cert.pem(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn generate_certs(service_name: &str, namespace: &str, output_dir: &str) -> Result<()> {
    let issued = issue_certs(service_name, namespace)?;

    let dir = std::path::Path::new(output_dir);
    std::fs::create_dir_all(dir).context("cannot create output directory")?;

    for (file, contents) in [
        ("ca.crt", &issued.ca_pem),
        ("tls.crt", &issued.cert_pem),
        ("tls.key", &issued.key_pem),
    ] {
        let path = dir.join(file);
        std::fs::write(&path, contents)
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("wrote {}", path.display());
    }

    println!();
    println!("Certificates cover {service_name}.{namespace}.svc and .svc.cluster.local.");
    Ok(())
}

/* ============================= INSTALL CONFIG ============================= */

fn webhook_config_yaml(service_name: &str, namespace: &str, ca_b64: &str) -> String {
    format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.skyhook.nvidia.com
    rules:
      - apiGroups: ["skyhook.nvidia.com"]
        resources: ["skyhooks", "deploymentpolicies"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE", "DELETE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    )
}

fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    println!("{}", webhook_config_yaml(service_name, namespace, &ca_b64));
    Ok(())
}

/* ============================= TESTS ============================= */
