use std::collections::{BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex};

use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder};

use crate::crd::{PackageState, SkyhookStatus, Stage, Status};
use crate::status::count_by_status;

/* ============================= REGISTRY ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static SKYHOOK_STATUS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("skyhook_status", "Current overall status per Skyhook (0/1)"),
        &["skyhook_name", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static NODE_STATUS_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "skyhook_node_status_count",
            "Targeted nodes per Skyhook by node status",
        ),
        &["skyhook_name", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static NODE_TARGET_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "skyhook_node_target_count",
            "Number of nodes a Skyhook currently targets",
        ),
        &["skyhook_name"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static PACKAGE_STATE_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "skyhook_package_state_count",
            "Per-package record count by state across targeted nodes",
        ),
        &["skyhook_name", "package_name", "package_version", "state"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static PACKAGE_STAGE_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "skyhook_package_stage_count",
            "Per-package record count by stage across targeted nodes",
        ),
        &["skyhook_name", "package_name", "package_version", "stage"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static PACKAGE_RESTARTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "skyhook_package_restarts_count",
            "Total runner restarts per package across targeted nodes",
        ),
        &["skyhook_name", "package_name", "package_version"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("skyhook_reconcile_total", "Total reconcile passes")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("skyhook_reconcile_errors_total", "Total reconcile errors")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "skyhook_webhook_requests_total",
            "Admission webhook requests by kind, operation, and outcome",
        ),
        &["kind", "operation", "allowed"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "skyhook_reconcile_duration_seconds",
        "Duration of each reconcile pass in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

// Package label tuples seen per Skyhook, so deletion can drop every series.
static SEEN_PACKAGES: LazyLock<Mutex<HashMap<String, BTreeSet<(String, String)>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/* ============================= API ============================= */

pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Touch every metric so /metrics lists them before the first reconcile.
pub fn force_init() {
    LazyLock::force(&SKYHOOK_STATUS);
    LazyLock::force(&NODE_STATUS_COUNT);
    LazyLock::force(&NODE_TARGET_COUNT);
    LazyLock::force(&PACKAGE_STATE_COUNT);
    LazyLock::force(&PACKAGE_STAGE_COUNT);
    LazyLock::force(&PACKAGE_RESTARTS);
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&WEBHOOK_REQUESTS);
}

/// Render the whole registry in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn inc_webhook_request(kind: &str, operation: &str, allowed: bool) {
    WEBHOOK_REQUESTS
        .with_label_values(&[kind, operation, if allowed { "true" } else { "false" }])
        .inc();
}

pub fn inc_reconcile() {
    RECONCILE_TOTAL.inc();
}

pub fn inc_reconcile_error() {
    RECONCILE_ERRORS.inc();
}

pub fn reconcile_timer() -> prometheus::HistogramTimer {
    RECONCILE_DURATION.start_timer()
}

/// Refresh every series for one Skyhook from its freshly-computed status.
pub fn record_skyhook(name: &str, status: &SkyhookStatus) {
    let current = status.status.unwrap_or_default();
    for s in Status::all() {
        SKYHOOK_STATUS
            .with_label_values(&[name, s.as_str()])
            .set(i64::from(*s == current));
    }

    let node_statuses: Vec<Status> = status.node_status.values().copied().collect();
    let counts = count_by_status(&node_statuses);
    for s in Status::all() {
        NODE_STATUS_COUNT
            .with_label_values(&[name, s.as_str()])
            .set(*counts.get(s.as_str()).unwrap_or(&0) as i64);
    }

    NODE_TARGET_COUNT
        .with_label_values(&[name])
        .set(status.node_status.len() as i64);

    // Package tuples present now plus any seen before (stale tuples zero out).
    let mut packages: BTreeSet<(String, String)> = status
        .node_state
        .values()
        .flat_map(|m| m.values())
        .map(|r| (r.name.clone(), r.version.clone()))
        .collect();
    {
        let mut seen = SEEN_PACKAGES.lock().expect("metrics lock");
        let entry = seen.entry(name.to_string()).or_default();
        packages.extend(entry.iter().cloned());
        *entry = packages.clone();
    }

    for (pkg, version) in &packages {
        let records: Vec<_> = status
            .node_state
            .values()
            .flat_map(|m| m.values())
            .filter(|r| &r.name == pkg && &r.version == version)
            .collect();

        for state in PackageState::all() {
            let count = records.iter().filter(|r| r.state == *state).count();
            PACKAGE_STATE_COUNT
                .with_label_values(&[name, pkg, version, state.as_str()])
                .set(count as i64);
        }
        for stage in Stage::all() {
            let count = records.iter().filter(|r| r.stage == *stage).count();
            PACKAGE_STAGE_COUNT
                .with_label_values(&[name, pkg, version, stage.as_str()])
                .set(count as i64);
        }
        let restarts: i64 = records.iter().map(|r| i64::from(r.restarts)).sum();
        PACKAGE_RESTARTS
            .with_label_values(&[name, pkg, version])
            .set(restarts);
    }
}

/// Drop every series belonging to a deleted Skyhook.
pub fn clear_skyhook(name: &str) {
    for s in Status::all() {
        let _ = SKYHOOK_STATUS.remove_label_values(&[name, s.as_str()]);
        let _ = NODE_STATUS_COUNT.remove_label_values(&[name, s.as_str()]);
    }
    let _ = NODE_TARGET_COUNT.remove_label_values(&[name]);

    let packages = SEEN_PACKAGES
        .lock()
        .expect("metrics lock")
        .remove(name)
        .unwrap_or_default();
    for (pkg, version) in &packages {
        for state in PackageState::all() {
            let _ = PACKAGE_STATE_COUNT.remove_label_values(&[name, pkg, version, state.as_str()]);
        }
        for stage in Stage::all() {
            let _ = PACKAGE_STAGE_COUNT.remove_label_values(&[name, pkg, version, stage.as_str()]);
        }
        let _ = PACKAGE_RESTARTS.remove_label_values(&[name, pkg, version]);
    }
}

/* ============================= TESTS ============================= */
