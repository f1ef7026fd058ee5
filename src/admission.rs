use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::crd::{
    Budget, DEFAULT_COMPARTMENT, DeploymentPolicySpec, DeploymentStrategy, Package, SkyhookSpec,
};
use crate::graph::{GraphError, PackageGraph};
use crate::lifecycle::config_key_matches;

/* ============================= TYPES ============================= */

static PACKAGE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][-a-z0-9]{0,41}[a-z]$").expect("pattern is valid"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("package name '{name}' is invalid (lowercase alphanumeric and '-', 2-43 chars)")]
    InvalidPackageName { name: String },

    #[error("package '{package}' version '{version}' is not valid semver")]
    InvalidVersion { package: String, version: String },

    #[error("package '{package}' image tag '{tag}' does not match version '{version}'")]
    ImageTagMismatch {
        package: String,
        tag: String,
        version: String,
    },

    #[error("package '{package}' configInterrupts pattern '{pattern}' matches no configMap key")]
    UnmatchedConfigInterrupt { package: String, pattern: String },

    #[error("package '{package}' resource '{field}' is not a positive quantity")]
    NonPositiveResource { package: String, field: String },

    #[error("package '{package}' {resource} limit is below its request")]
    LimitBelowRequest { package: String, resource: String },

    #[error("package '{package}' gracefulShutdownSeconds must be positive")]
    NonPositiveGracePeriod { package: String },

    #[error("priority must be at least 1")]
    InvalidPriority,

    #[error("exactly one of interruptionBudget and deploymentPolicy must be set")]
    BudgetConflict,

    #[error("budget must set exactly one of percent and count")]
    BudgetShape,

    #[error("budget percent must be 1-100, got {0}")]
    BudgetPercentRange(u32),

    #[error("budget count must be at least 1")]
    BudgetCountRange,

    #[error("strategy {0}")]
    InvalidStrategy(String),

    #[error("compartment name '{name}' is reserved")]
    ReservedCompartmentName { name: String },

    #[error("compartment name '{name}' is duplicated")]
    DuplicateCompartmentName { name: String },

    #[error("compartment '{name}' has an empty selector")]
    EmptyCompartmentSelector { name: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Webhook verdict, also reused by `check`-style dry validation.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
    pub violations: Vec<String>,
}

impl AdmissionVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
            violations: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        if errors.is_empty() {
            return Self::allow();
        }
        let violations: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        let message = Some(format_denial_message(&violations));
        Self {
            allowed: false,
            message,
            violations,
        }
    }
}

pub fn format_denial_message(violations: &[String]) -> String {
    format!("Denied by skyhook admission: {}", violations.join(", "))
}

/* ============================= QUANTITIES ============================= */

/// Parse a Kubernetes resource quantity ("500m", "128Mi", "2") into a
/// comparable f64. Enough for ordering and positivity checks.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let suffixes: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0_f64.powi(3)),
        ("Ti", 1024.0_f64.powi(4)),
        ("m", 0.001),
        ("k", 1_000.0),
        ("M", 1_000_000.0),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    raw.parse::<f64>().ok()
}

/* ============================= IMAGES ============================= */

/// Split an image reference into repository and optional tag. A colon only
/// counts as a tag separator after the last path segment, so registries
/// with ports parse correctly.
pub fn split_image_tag(image: &str) -> (&str, Option<&str>) {
    let after_slash = image.rfind('/').map_or(0, |i| i + 1);
    match image[after_slash..].rfind(':') {
        Some(i) => {
            let split = after_slash + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}

/* ============================= SKYHOOK VALIDATION ============================= */

fn validate_package(name: &str, package: &Package, errors: &mut Vec<ValidationError>) {
    if !PACKAGE_NAME_RE.is_match(name) {
        errors.push(ValidationError::InvalidPackageName {
            name: name.to_string(),
        });
    }

    if semver::Version::parse(&package.version).is_err() {
        errors.push(ValidationError::InvalidVersion {
            package: name.to_string(),
            version: package.version.clone(),
        });
    }

    if let (_, Some(tag)) = split_image_tag(&package.image) {
        if tag != package.version {
            errors.push(ValidationError::ImageTagMismatch {
                package: name.to_string(),
                tag: tag.to_string(),
                version: package.version.clone(),
            });
        }
    }

    for pattern in package.config_interrupts.keys() {
        let matched = package
            .config_map
            .keys()
            .any(|key| config_key_matches(pattern, key));
        if !matched {
            errors.push(ValidationError::UnmatchedConfigInterrupt {
                package: name.to_string(),
                pattern: pattern.clone(),
            });
        }
    }

    if let Some(resources) = &package.resources {
        let fields = [
            ("cpuRequest", &resources.cpu_request),
            ("cpuLimit", &resources.cpu_limit),
            ("memoryRequest", &resources.memory_request),
            ("memoryLimit", &resources.memory_limit),
        ];
        let mut parsed = std::collections::BTreeMap::new();
        for (field, raw) in fields {
            match parse_quantity(raw) {
                Some(v) if v > 0.0 => {
                    parsed.insert(field, v);
                }
                _ => errors.push(ValidationError::NonPositiveResource {
                    package: name.to_string(),
                    field: field.to_string(),
                }),
            }
        }
        for (request, limit, label) in [
            ("cpuRequest", "cpuLimit", "cpu"),
            ("memoryRequest", "memoryLimit", "memory"),
        ] {
            if let (Some(req), Some(lim)) = (parsed.get(request), parsed.get(limit)) {
                if lim < req {
                    errors.push(ValidationError::LimitBelowRequest {
                        package: name.to_string(),
                        resource: label.to_string(),
                    });
                }
            }
        }
    }

    if let Some(grace) = package.graceful_shutdown_seconds {
        if grace <= 0 {
            errors.push(ValidationError::NonPositiveGracePeriod {
                package: name.to_string(),
            });
        }
    }
}

fn validate_budget(budget: &Budget, errors: &mut Vec<ValidationError>) {
    match (budget.percent, budget.count) {
        (Some(_), Some(_)) | (None, None) => errors.push(ValidationError::BudgetShape),
        (Some(p), None) if !(1..=100).contains(&p) => {
            errors.push(ValidationError::BudgetPercentRange(p))
        }
        (None, Some(c)) if c < 1 => errors.push(ValidationError::BudgetCountRange),
        _ => {}
    }
}

/// Full admission rule set for a Skyhook spec. Returns every violation so
/// the denial message is actionable in one pass.
pub fn validate_skyhook(spec: &SkyhookSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if spec.priority < 1 {
        errors.push(ValidationError::InvalidPriority);
    }

    match (&spec.interruption_budget, &spec.deployment_policy) {
        (Some(budget), None) => validate_budget(budget, &mut errors),
        (None, Some(_)) => {}
        _ => errors.push(ValidationError::BudgetConflict),
    }

    for (name, package) in &spec.packages {
        validate_package(name, package, &mut errors);
    }

    if let Err(e) = PackageGraph::build(&spec.packages) {
        errors.push(e.into());
    }

    errors
}

/* ============================= POLICY VALIDATION ============================= */

fn validate_strategy(strategy: &DeploymentStrategy, errors: &mut Vec<ValidationError>) {
    if strategy.initial_batch() < 1 {
        errors.push(ValidationError::InvalidStrategy(
            "initialBatch must be at least 1".to_string(),
        ));
    }
    if !(1..=100).contains(&strategy.batch_threshold()) {
        errors.push(ValidationError::InvalidStrategy(
            "batchThreshold must be 1-100".to_string(),
        ));
    }
    if !(1..=100).contains(&strategy.safety_limit()) {
        errors.push(ValidationError::InvalidStrategy(
            "safetyLimit must be 1-100".to_string(),
        ));
    }
    if strategy.failure_threshold() == Some(0) {
        errors.push(ValidationError::InvalidStrategy(
            "failureThreshold must be at least 1 when set".to_string(),
        ));
    }
    match strategy {
        DeploymentStrategy::Linear { delta, .. } if *delta < 1 => {
            errors.push(ValidationError::InvalidStrategy(
                "delta must be at least 1".to_string(),
            ));
        }
        DeploymentStrategy::Exponential { growth_factor, .. } if *growth_factor < 2 => {
            errors.push(ValidationError::InvalidStrategy(
                "growthFactor must be at least 2".to_string(),
            ));
        }
        _ => {}
    }
}

pub fn validate_deployment_policy(spec: &DeploymentPolicySpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_budget(&spec.default.budget, &mut errors);
    validate_strategy(&spec.default.strategy, &mut errors);

    let mut seen = std::collections::BTreeSet::new();
    for compartment in &spec.compartments {
        if compartment.name == DEFAULT_COMPARTMENT {
            errors.push(ValidationError::ReservedCompartmentName {
                name: compartment.name.clone(),
            });
        }
        if !seen.insert(compartment.name.clone()) {
            errors.push(ValidationError::DuplicateCompartmentName {
                name: compartment.name.clone(),
            });
        }
        if compartment.selector.is_empty() {
            errors.push(ValidationError::EmptyCompartmentSelector {
                name: compartment.name.clone(),
            });
        }
        validate_budget(&compartment.budget, &mut errors);
        if let Some(strategy) = &compartment.strategy {
            validate_strategy(strategy, &mut errors);
        }
    }

    errors
}

/* ============================= VERDICTS ============================= */

pub fn review_skyhook(spec: &SkyhookSpec) -> AdmissionVerdict {
    AdmissionVerdict::from_errors(validate_skyhook(spec))
}

pub fn review_deployment_policy(spec: &DeploymentPolicySpec) -> AdmissionVerdict {
    AdmissionVerdict::from_errors(validate_deployment_policy(spec))
}

/// Deletion guard: a DeploymentPolicy cannot go away while Skyhooks
/// reference it.
pub fn review_policy_deletion(policy: &str, referenced_by: &[String]) -> AdmissionVerdict {
    if referenced_by.is_empty() {
        return AdmissionVerdict::allow();
    }
    let violations = vec![format!(
        "deployment policy '{policy}' is referenced by: {}",
        referenced_by.join(", ")
    )];
    AdmissionVerdict {
        allowed: false,
        message: Some(format_denial_message(&violations)),
        violations,
    }
}

/* ============================= TESTS ============================= */
