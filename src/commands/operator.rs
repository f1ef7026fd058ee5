use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skyhook_operator::crd::{DeploymentPolicy, Skyhook, SkyhookStatus};
use skyhook_operator::engine::{self, Mutation, Plan, Snapshot};
use skyhook_operator::interrupts;
use skyhook_operator::metrics;
use skyhook_operator::node_state;
use skyhook_operator::planner::{self, DEFAULT_RUNNER_NAMESPACE};
use skyhook_operator::scheduler::selects_node;
use skyhook_operator::taints::{DEFAULT_RUNTIME_REQUIRED_TAINT, RuntimeTaint};

/* ============================= CONFIG ============================= */

const FINALIZER: &str = "skyhook.nvidia.com/cleanup";
const FIELD_MANAGER: &str = "skyhook-operator";
const REQUEUE_QUIESCENT: Duration = Duration::from_secs(30);
const REQUEUE_PENDING: Duration = Duration::from_secs(5);
const LEASE_NAME: &str = "skyhook-operator-leader";
const LEASE_SECONDS: i32 = 15;

/// Operator configuration, sourced from the environment.
struct OperatorConfig {
    metrics_port: u16,
    probe_port: u16,
    leader_election: bool,
    enable_webhooks: bool,
    agent_image: String,
    runtime_taint: RuntimeTaint,
    runner_namespace: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("true") | Ok("1") | Ok("TRUE")
    )
}

impl OperatorConfig {
    fn from_env() -> Result<Self> {
        let taint_raw = env_or("runtimeRequiredTaint", DEFAULT_RUNTIME_REQUIRED_TAINT);
        Ok(Self {
            metrics_port: env_or("METRICS_PORT", "9090")
                .parse()
                .context("METRICS_PORT must be a port number")?,
            probe_port: env_or("PROBE_PORT", "8081")
                .parse()
                .context("PROBE_PORT must be a port number")?,
            leader_election: env_flag("LEADER_ELECTION"),
            enable_webhooks: env_flag("ENABLE_WEBHOOKS"),
            agent_image: env_or("AGENT_IMAGE", "skyhook-agent:latest"),
            runtime_taint: RuntimeTaint::parse(&taint_raw)
                .map_err(|e| anyhow::anyhow!("runtimeRequiredTaint: {e}"))?,
            runner_namespace: env_or("RUNNER_NAMESPACE", DEFAULT_RUNNER_NAMESPACE),
        })
    }
}

/// Subscriber setup honoring LOG_LEVEL, LOG_ENCODER, LOG_TIME_ENCODER and
/// LOG_STACK_TRACE_LEVEL. A debug/trace stack-trace level pulls source
/// file and line into every event.
fn init_tracing() {
    let filter = EnvFilter::try_new(env_or("LOG_LEVEL", "info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env_or("LOG_ENCODER", "json") == "json";
    let epoch_time = env_or("LOG_TIME_ENCODER", "rfc3339") == "epoch";
    let locations = matches!(
        env_or("LOG_STACK_TRACE_LEVEL", "error").as_str(),
        "debug" | "trace"
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(locations)
        .with_line_number(locations);
    match (json, epoch_time) {
        (true, _) => builder.json().init(),
        (false, true) => builder.with_timer(tracing_subscriber::fmt::time::uptime()).init(),
        (false, false) => builder.init(),
    }
}

/* ============================= STATE ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

struct ReconcileContext {
    client: Client,
    config: OperatorConfig,
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    init_tracing();

    println!("Starting skyhook operator...\n");

    let config = OperatorConfig::from_env()?;

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

    metrics::force_init();

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let probe_addr = SocketAddr::from(([0, 0, 0, 0], config.probe_port));

    println!("  CRD watch ................... Skyhook.skyhook.nvidia.com/v1alpha1");
    println!("  Agent image ................. {}", config.agent_image);
    println!("  Runner namespace ............ {}", config.runner_namespace);
    println!("  Metrics server .............. http://{metrics_addr}/metrics");
    println!("  Probe server ................ http://{probe_addr}/healthz");
    if config.leader_election {
        println!("  Leader election ............. lease {LEASE_NAME}");
    }
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");

    if config.leader_election {
        acquire_leadership(&client, &config.runner_namespace).await?;
    }

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics_handle = tokio::spawn(start_http_server(
        build_metrics_router(),
        metrics_addr,
        shutdown_tx.subscribe(),
    ));
    let probe_handle = tokio::spawn(start_http_server(
        build_probe_router(reconcile_state.clone()),
        probe_addr,
        shutdown_tx.subscribe(),
    ));

    if config.enable_webhooks {
        let addr: SocketAddr = env_or("WEBHOOK_ADDR", "0.0.0.0:8443")
            .parse()
            .context("WEBHOOK_ADDR must be host:port")?;
        let tls_cert = env_or("WEBHOOK_TLS_CERT", "/etc/webhook/certs/tls.crt");
        let tls_key = env_or("WEBHOOK_TLS_KEY", "/etc/webhook/certs/tls.key");
        let webhook_client = client.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = crate::commands::webhook::serve_embedded(
                webhook_client,
                addr,
                tls_cert,
                tls_key,
                shutdown,
            )
            .await
            {
                warn!(error = %e, "embedded_webhook_failed");
            }
        });
        println!("  Admission webhook ........... https://{addr}/validate");
    }

    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());

    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        config,
    });

    let controller = Controller::new(skyhooks, watcher::Config::default());
    let store = controller.store();

    // Node events fan out to every Skyhook whose selector matches the node;
    // pod events map back through the runner labels.
    let node_store = store.clone();
    let controller_state = reconcile_state.clone();
    let controller = controller
        .watches(nodes, watcher::Config::default(), move |node: Node| {
            let labels = node_state::node_labels(&node);
            node_store
                .state()
                .iter()
                .filter(|s| selects_node(s, &labels))
                .map(|s| ObjectRef::from_obj(s.as_ref()))
                .collect::<Vec<_>>()
        })
        .watches(pods, watcher::Config::default(), |pod: Pod| {
            planner::runner_skyhook(&pod)
                .map(ObjectRef::<Skyhook>::new)
                .into_iter()
                .collect::<Vec<_>>()
        })
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "reconcile_dispatch_error");
                }
            }
        });

    // Dropping the controller future is the only clean way to stop it.
    tokio::select! {
        _ = controller => {
            info!("operator_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping operator...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = metrics_handle.await?;
    let _ = probe_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

/* ============================= LEADER ELECTION ============================= */

/// Minimal Lease-based election: block until this replica holds the lease,
/// then keep renewing it in the background.
async fn acquire_leadership(client: &Client, namespace: &str) -> Result<()> {
    let identity = format!(
        "{}-{}",
        env_or("HOSTNAME", "skyhook-operator"),
        std::process::id()
    );
    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);

    loop {
        let now = Utc::now();
        let current = leases.get_opt(LEASE_NAME).await?;

        let held_by_other = current.as_ref().is_some_and(|lease| {
            let spec = lease.spec.as_ref();
            let holder = spec.and_then(|s| s.holder_identity.as_deref());
            let renewed = spec.and_then(|s| s.renew_time.as_ref());
            holder.is_some_and(|h| h != identity)
                && renewed.is_some_and(|t| {
                    (now - t.0).num_seconds() < i64::from(LEASE_SECONDS)
                })
        });

        if !held_by_other {
            let lease = serde_json::json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": { "name": LEASE_NAME },
                "spec": {
                    "holderIdentity": identity,
                    "leaseDurationSeconds": LEASE_SECONDS,
                    "renewTime": now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                }
            });
            match leases
                .patch(
                    LEASE_NAME,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&lease),
                )
                .await
            {
                Ok(_) => {
                    info!(identity = %identity, "leadership_acquired");
                    break;
                }
                Err(e) => warn!(error = %e, "lease_acquire_failed"),
            }
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    // Renew in the background; a failed renewal only logs, the next
    // renewal attempt retries.
    let leases_bg = leases.clone();
    let identity_bg = identity.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(u64::from(LEASE_SECONDS as u32) / 3)).await;
            let lease = serde_json::json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": { "name": LEASE_NAME },
                "spec": {
                    "holderIdentity": identity_bg,
                    "leaseDurationSeconds": LEASE_SECONDS,
                    "renewTime": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                }
            });
            if let Err(e) = leases_bg
                .patch(
                    LEASE_NAME,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&lease),
                )
                .await
            {
                warn!(error = %e, "lease_renew_failed");
            }
        }
    });

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    skyhook: Arc<Skyhook>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, kube::Error> {
    let name = skyhook.name_any();

    metrics::inc_reconcile();
    let _timer = metrics::reconcile_timer();

    info!(skyhook = %name, "reconcile_start");

    // ── Load observed state ──
    let skyhooks_api: Api<Skyhook> = Api::all(ctx.client.clone());
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let pods_api: Api<Pod> = Api::all(ctx.client.clone());

    let all_skyhooks = skyhooks_api.list(&ListParams::default()).await?.items;
    let nodes = nodes_api.list(&ListParams::default()).await?.items;
    let pods = pods_api.list(&ListParams::default()).await?.items;

    let policy = match &skyhook.spec.deployment_policy {
        Some(policy_name) => {
            let policies: Api<DeploymentPolicy> = Api::all(ctx.client.clone());
            match policies.get_opt(policy_name).await? {
                Some(p) => Some(p),
                None => {
                    warn!(skyhook = %name, policy = %policy_name, "deployment_policy_missing");
                    let status = SkyhookStatus {
                        observed_generation: skyhook.metadata.generation,
                        status: Some(skyhook_operator::crd::Status::Erroring),
                        ..Default::default()
                    };
                    patch_status(&ctx.client, &name, &skyhook, &status).await?;
                    return Ok(Action::requeue(Duration::from_secs(60)));
                }
            }
        }
        None => None,
    };

    let snapshot = Snapshot {
        skyhook: &skyhook,
        all_skyhooks: &all_skyhooks,
        policy: policy.as_ref(),
        nodes: &nodes,
        pods: &pods,
        agent_image: &ctx.config.agent_image,
        runner_namespace: &ctx.config.runner_namespace,
        runtime_taint: &ctx.config.runtime_taint,
        now: Utc::now(),
    };

    // ── Deletion: run the cleanup plan, drop metrics, release the finalizer ──
    if skyhook.metadata.deletion_timestamp.is_some() {
        let mutations = engine::build_cleanup_plan(&snapshot);
        apply_mutations(&ctx.client, &name, &mutations).await?;
        metrics::clear_skyhook(&name);
        if has_finalizer(&skyhook) {
            remove_finalizer(&skyhook, &ctx.client).await?;
        }
        info!(skyhook = %name, "finalized");
        return Ok(Action::await_change());
    }

    if !has_finalizer(&skyhook) {
        add_finalizer(&skyhook, &ctx.client).await?;
    }

    // ── Plan and apply ──
    let plan: Plan = engine::build_plan(&snapshot);

    apply_mutations(&ctx.client, &name, &plan.mutations).await?;
    patch_status(&ctx.client, &name, &skyhook, &plan.status).await?;
    metrics::record_skyhook(&name, &plan.status);

    info!(
        skyhook = %name,
        status = %plan.status.status.unwrap_or_default(),
        mutations = plan.mutations.len(),
        pending = plan.work_pending,
        "reconcile_done"
    );

    if plan.work_pending {
        Ok(Action::requeue(REQUEUE_PENDING))
    } else {
        Ok(Action::requeue(REQUEUE_QUIESCENT))
    }
}

fn error_policy(
    _skyhook: Arc<Skyhook>,
    error: &kube::Error,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    metrics::inc_reconcile_error();
    warn!(error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= MUTATION APPLIER ============================= */

async fn apply_mutations(
    client: &Client,
    skyhook: &str,
    mutations: &[Mutation],
) -> std::result::Result<(), kube::Error> {
    let nodes: Api<Node> = Api::all(client.clone());

    for mutation in mutations {
        match mutation {
            Mutation::AnnotateNode { node, key, value } => {
                let json_value = match value {
                    Some(v) => serde_json::Value::String(v.clone()),
                    None => serde_json::Value::Null,
                };
                let patch = serde_json::json!({
                    "metadata": { "annotations": { key: json_value } }
                });
                nodes
                    .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
            }
            Mutation::LabelNode { node, key, value } => {
                let json_value = match value {
                    Some(v) => serde_json::Value::String(v.clone()),
                    None => serde_json::Value::Null,
                };
                let patch = serde_json::json!({
                    "metadata": { "labels": { key: json_value } }
                });
                nodes
                    .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
            }
            Mutation::Cordon { node } => {
                interrupts::cordon_node(client, node, skyhook).await?;
            }
            Mutation::Uncordon { node } => {
                if let Some(node_obj) = nodes.get_opt(node).await? {
                    interrupts::uncordon_node(client, &node_obj, skyhook).await?;
                }
            }
            Mutation::SetNodeTaints { node, taints } => {
                let patch = serde_json::json!({ "spec": { "taints": taints } });
                nodes
                    .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                info!(node = %node, "taints_updated");
            }
            Mutation::CreatePod { pod } => {
                let namespace = pod.namespace().unwrap_or_default();
                let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
                match pods.create(&Default::default(), pod).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        // A leftover pod with this name is being replaced;
                        // the delete earlier in the plan may still be
                        // propagating. The next pass retries.
                    }
                    Err(e) => return Err(e),
                }
            }
            Mutation::DeletePod { namespace, name } => {
                let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
                match pods.delete(name, &Default::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e),
                }
            }
            Mutation::EvictPod { namespace, name } => {
                match interrupts::evict_pod(client, namespace, name).await {
                    Ok(_) => {}
                    // Disruption budgets push back with 429; retry next pass.
                    Err(kube::Error::Api(e)) if e.code == 429 || e.code == 404 => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(())
}

async fn patch_status(
    client: &Client,
    name: &str,
    skyhook: &Skyhook,
    status: &SkyhookStatus,
) -> std::result::Result<(), kube::Error> {
    // Skip the write when nothing changed; keeps a settled cluster at zero
    // writes per pass.
    let current = serde_json::to_value(&skyhook.status).unwrap_or_default();
    let next = serde_json::to_value(Some(status)).unwrap_or_default();
    if current == next {
        return Ok(());
    }

    let api: Api<Skyhook> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(skyhook = %name, "status_updated");
    Ok(())
}

/* ============================= FINALIZER ============================= */

fn has_finalizer(skyhook: &Skyhook) -> bool {
    skyhook
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(
    skyhook: &Skyhook,
    client: &Client,
) -> std::result::Result<(), kube::Error> {
    let name = skyhook.name_any();
    let api: Api<Skyhook> = Api::all(client.clone());

    let mut finalizers = skyhook.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(skyhook = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(
    skyhook: &Skyhook,
    client: &Client,
) -> std::result::Result<(), kube::Error> {
    let name = skyhook.name_any();
    let api: Api<Skyhook> = Api::all(client.clone());

    let finalizers: Vec<String> = skyhook
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(skyhook = %name, "finalizer_removed");
    Ok(())
}

/* ============================= HTTP SERVERS ============================= */

pub(crate) fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub(crate) fn build_probe_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_http_server(
    app: Router,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
