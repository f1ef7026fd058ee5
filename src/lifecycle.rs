use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::crd::{Interrupt, Package, PackageState, PackageStatus, Stage};

/* ============================= CONFIG MATCHING ============================= */

/// Hex sha256 of one config key's content. Recorded per package when the
/// config stage completes; diffed on later passes to find changed keys.
pub fn config_digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Glob match where `*` is the only meta character.
pub fn config_key_matches(pattern: &str, key: &str) -> bool {
    fn matches(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Star swallows zero or more characters.
                matches(&p[1..], k) || (!k.is_empty() && matches(p, &k[1..]))
            }
            (Some(pc), Some(kc)) if pc == kc => matches(&p[1..], &k[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), key.as_bytes())
}

/// Config keys whose content differs from what was recorded at the last
/// successful config stage. A key with no recorded digest only counts as
/// an update when some digest was recorded before (first install is not
/// a config update).
pub fn config_updates(
    package: &Package,
    recorded: Option<&BTreeMap<String, String>>,
) -> Vec<String> {
    let Some(recorded) = recorded else {
        return Vec::new();
    };
    package
        .config_map
        .iter()
        .filter(|(key, value)| recorded.get(*key) != Some(&config_digest(value)))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Current digests for every config key of a package.
pub fn config_digests(package: &Package) -> BTreeMap<String, String> {
    package
        .config_map
        .iter()
        .map(|(key, value)| (key.clone(), config_digest(value)))
        .collect()
}

/// Interrupts triggered by the given updated config keys, in pattern order.
pub fn config_interrupts_for<'a>(
    package: &'a Package,
    updates: &[String],
) -> Vec<&'a Interrupt> {
    package
        .config_interrupts
        .iter()
        .filter(|(pattern, _)| updates.iter().any(|key| config_key_matches(pattern, key)))
        .map(|(_, interrupt)| interrupt)
        .collect()
}

/// A package carries an interrupt this cycle if the spec declares one or a
/// changed config key has one attached.
pub fn has_interrupt(package: &Package, updates: &[String]) -> bool {
    package.interrupt.is_some() || !config_interrupts_for(package, updates).is_empty()
}

/// The interrupt to dispatch: the package's own wins over config-triggered.
pub fn effective_interrupt<'a>(
    package: &'a Package,
    updates: &[String],
) -> Option<&'a Interrupt> {
    package
        .interrupt
        .as_ref()
        .or_else(|| config_interrupts_for(package, updates).into_iter().next())
}

/* ============================= STAGE MACHINE ============================= */

/// First stage for a package on a node.
///
/// - removed from the spec → `uninstall`
/// - a different version recorded → `upgrade`
/// - otherwise → `apply`
pub fn initial_stage(in_spec: bool, prior: Option<&PackageStatus>, spec_version: &str) -> Stage {
    if !in_spec {
        return Stage::Uninstall;
    }
    match prior {
        Some(p) if p.version != spec_version => Stage::Upgrade,
        _ => Stage::Apply,
    }
}

/// Next stage after the current one completes. `None` is terminal.
///
/// `in_spec` distinguishes an uninstall that precedes a reinstall from the
/// final uninstall of a removed package.
pub fn next_stage(current: Stage, has_interrupt: bool, in_spec: bool) -> Option<Stage> {
    match current {
        Stage::Uninstall => in_spec.then_some(Stage::Apply),
        Stage::Upgrade => Some(Stage::Apply),
        Stage::Apply => Some(Stage::Config),
        Stage::Config => has_interrupt.then_some(Stage::Interrupt),
        Stage::Interrupt => Some(Stage::PostInterrupt),
        Stage::PostInterrupt => None,
    }
}

/// Terminal success for dependency edges and completion accounting.
pub fn is_terminal_complete(status: &PackageStatus, has_interrupt: bool) -> bool {
    if status.state != PackageState::Complete {
        return false;
    }
    match status.stage {
        Stage::Config => !has_interrupt,
        Stage::PostInterrupt => true,
        _ => false,
    }
}

/// Fresh in-progress record for a stage dispatch.
pub fn start_stage(name: &str, package: &Package, stage: Stage) -> PackageStatus {
    PackageStatus {
        name: name.to_string(),
        version: package.version.clone(),
        image: package.effective_image(),
        stage,
        state: PackageState::InProgress,
        restarts: 0,
    }
}

/* ============================= RUNNER OUTCOMES ============================= */

/// Observed result of the runner pod for a (package, stage) dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerOutcome {
    /// Work and check containers both exited 0.
    Succeeded,
    /// Some container failed; carries the pod's restart count.
    Failed { restarts: i32 },
    /// Still executing; carries the pod's restart count so far.
    Running { restarts: i32 },
}

/// Fold a runner outcome into the package record. Transitions to
/// `complete` happen here and nowhere else; stage advancement is the
/// caller's job once the state is complete.
pub fn apply_outcome(status: &mut PackageStatus, outcome: RunnerOutcome) {
    match outcome {
        RunnerOutcome::Succeeded => {
            status.state = PackageState::Complete;
        }
        RunnerOutcome::Failed { restarts } => {
            status.state = PackageState::Erroring;
            status.restarts = status.restarts.max(restarts);
        }
        RunnerOutcome::Running { restarts } => {
            status.state = PackageState::InProgress;
            status.restarts = status.restarts.max(restarts);
        }
    }
}

/// Elevate a collapsed (`skipped`) interrupt once the side effect is
/// confirmed out-of-band. Skipped interrupts count as successes.
pub fn promote_skipped(status: &mut PackageStatus) {
    if status.state == PackageState::Skipped {
        status.state = PackageState::Complete;
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::InterruptKind;

    fn package_with_config(keys: &[(&str, &str)]) -> Package {
        Package {
            version: "1.0.0".to_string(),
            image: "ghcr.io/acme/img".to_string(),
            config_map: keys
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn service_interrupt(services: &[&str]) -> Interrupt {
        Interrupt {
            kind: InterruptKind::Service,
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ── Glob matching ──

    #[test]
    fn test_glob_literal_match() {
        assert!(config_key_matches("upgrade.sh", "upgrade.sh"));
        assert!(!config_key_matches("upgrade.sh", "upgrade.sh.bak"));
    }

    #[test]
    fn test_glob_star_suffix() {
        assert!(config_key_matches("*.sh", "upgrade.sh"));
        assert!(config_key_matches("*.sh", ".sh"));
        assert!(!config_key_matches("*.sh", "upgrade.sh.bak"));
    }

    #[test]
    fn test_glob_star_alone_matches_everything() {
        assert!(config_key_matches("*", "anything"));
        assert!(config_key_matches("*", ""));
    }

    #[test]
    fn test_glob_star_in_middle() {
        assert!(config_key_matches("conf*.toml", "conf-prod.toml"));
        assert!(!config_key_matches("conf*.toml", "conf-prod.yaml"));
    }

    #[test]
    fn test_glob_question_mark_is_literal() {
        // Only `*` is a meta character.
        assert!(config_key_matches("a?b", "a?b"));
        assert!(!config_key_matches("a?b", "axb"));
    }

    // ── Config digests and updates ──

    #[test]
    fn test_config_digest_is_stable_hex() {
        let a = config_digest("hello");
        let b = config_digest("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_config_updates_none_recorded_means_no_updates() {
        let pkg = package_with_config(&[("upgrade.sh", "echo hi")]);
        assert!(config_updates(&pkg, None).is_empty());
    }

    #[test]
    fn test_config_updates_detects_changed_key() {
        let pkg = package_with_config(&[("upgrade.sh", "echo v2"), ("static.conf", "same")]);
        let recorded = BTreeMap::from([
            ("upgrade.sh".to_string(), config_digest("echo v1")),
            ("static.conf".to_string(), config_digest("same")),
        ]);
        assert_eq!(config_updates(&pkg, Some(&recorded)), vec!["upgrade.sh"]);
    }

    #[test]
    fn test_config_updates_new_key_counts() {
        let pkg = package_with_config(&[("new.sh", "fresh")]);
        let recorded = BTreeMap::from([("old.sh".to_string(), config_digest("x"))]);
        assert_eq!(config_updates(&pkg, Some(&recorded)), vec!["new.sh"]);
    }

    #[test]
    fn test_config_digests_covers_all_keys() {
        let pkg = package_with_config(&[("a", "1"), ("b", "2")]);
        let digests = config_digests(&pkg);
        assert_eq!(digests.len(), 2);
        assert_eq!(digests["a"], config_digest("1"));
    }

    // ── Interrupt resolution ──

    #[test]
    fn test_has_interrupt_from_spec() {
        let mut pkg = package_with_config(&[]);
        pkg.interrupt = Some(service_interrupt(&["kubelet"]));
        assert!(has_interrupt(&pkg, &[]));
    }

    #[test]
    fn test_has_interrupt_from_config_update() {
        let mut pkg = package_with_config(&[("upgrade.sh", "v2")]);
        pkg.config_interrupts
            .insert("*.sh".to_string(), service_interrupt(&["kubelet"]));
        assert!(!has_interrupt(&pkg, &[]));
        assert!(has_interrupt(&pkg, &["upgrade.sh".to_string()]));
    }

    #[test]
    fn test_config_update_without_matching_pattern_no_interrupt() {
        let mut pkg = package_with_config(&[("settings.toml", "v2")]);
        pkg.config_interrupts
            .insert("*.sh".to_string(), service_interrupt(&["kubelet"]));
        assert!(!has_interrupt(&pkg, &["settings.toml".to_string()]));
    }

    #[test]
    fn test_effective_interrupt_spec_wins() {
        let mut pkg = package_with_config(&[("upgrade.sh", "v2")]);
        pkg.interrupt = Some(Interrupt {
            kind: InterruptKind::Reboot,
            services: vec![],
        });
        pkg.config_interrupts
            .insert("*.sh".to_string(), service_interrupt(&["kubelet"]));
        let interrupt = effective_interrupt(&pkg, &["upgrade.sh".to_string()]).unwrap();
        assert_eq!(interrupt.kind, InterruptKind::Reboot);
    }

    #[test]
    fn test_effective_interrupt_config_triggered() {
        let mut pkg = package_with_config(&[("upgrade.sh", "v2")]);
        pkg.config_interrupts
            .insert("*.sh".to_string(), service_interrupt(&["kubelet"]));
        let interrupt = effective_interrupt(&pkg, &["upgrade.sh".to_string()]).unwrap();
        assert_eq!(interrupt.kind, InterruptKind::Service);
        assert_eq!(interrupt.services, vec!["kubelet"]);
    }

    // ── Initial stage ──

    fn recorded(version: &str) -> PackageStatus {
        PackageStatus {
            name: "p".to_string(),
            version: version.to_string(),
            image: format!("img:{version}"),
            stage: Stage::Config,
            state: PackageState::Complete,
            restarts: 0,
        }
    }

    #[test]
    fn test_initial_stage_fresh_is_apply() {
        assert_eq!(initial_stage(true, None, "1.0.0"), Stage::Apply);
    }

    #[test]
    fn test_initial_stage_version_change_is_upgrade() {
        assert_eq!(
            initial_stage(true, Some(&recorded("0.9.0")), "1.0.0"),
            Stage::Upgrade
        );
    }

    #[test]
    fn test_initial_stage_same_version_is_apply() {
        assert_eq!(
            initial_stage(true, Some(&recorded("1.0.0")), "1.0.0"),
            Stage::Apply
        );
    }

    #[test]
    fn test_initial_stage_removed_is_uninstall() {
        assert_eq!(
            initial_stage(false, Some(&recorded("1.0.0")), "1.0.0"),
            Stage::Uninstall
        );
    }

    // ── Progression ──

    #[test]
    fn test_progression_without_interrupt() {
        assert_eq!(next_stage(Stage::Apply, false, true), Some(Stage::Config));
        assert_eq!(next_stage(Stage::Config, false, true), None);
    }

    #[test]
    fn test_progression_with_interrupt() {
        assert_eq!(next_stage(Stage::Config, true, true), Some(Stage::Interrupt));
        assert_eq!(
            next_stage(Stage::Interrupt, true, true),
            Some(Stage::PostInterrupt)
        );
        assert_eq!(next_stage(Stage::PostInterrupt, true, true), None);
    }

    #[test]
    fn test_progression_upgrade_flows_into_apply() {
        assert_eq!(next_stage(Stage::Upgrade, false, true), Some(Stage::Apply));
    }

    #[test]
    fn test_progression_uninstall_terminal_when_removed() {
        assert_eq!(next_stage(Stage::Uninstall, false, false), None);
    }

    #[test]
    fn test_progression_uninstall_reinstall() {
        assert_eq!(next_stage(Stage::Uninstall, false, true), Some(Stage::Apply));
    }

    // ── Terminal completion ──

    #[test]
    fn test_terminal_complete_config_without_interrupt() {
        let s = recorded("1.0.0");
        assert!(is_terminal_complete(&s, false));
        assert!(!is_terminal_complete(&s, true));
    }

    #[test]
    fn test_terminal_complete_post_interrupt() {
        let mut s = recorded("1.0.0");
        s.stage = Stage::PostInterrupt;
        assert!(is_terminal_complete(&s, true));
    }

    #[test]
    fn test_terminal_complete_requires_complete_state() {
        let mut s = recorded("1.0.0");
        s.state = PackageState::InProgress;
        assert!(!is_terminal_complete(&s, false));
    }

    // ── Outcomes ──

    #[test]
    fn test_apply_outcome_success() {
        let mut s = recorded("1.0.0");
        s.state = PackageState::InProgress;
        apply_outcome(&mut s, RunnerOutcome::Succeeded);
        assert_eq!(s.state, PackageState::Complete);
    }

    #[test]
    fn test_apply_outcome_failure_sets_erroring_and_restarts() {
        let mut s = recorded("1.0.0");
        s.state = PackageState::InProgress;
        apply_outcome(&mut s, RunnerOutcome::Failed { restarts: 3 });
        assert_eq!(s.state, PackageState::Erroring);
        assert_eq!(s.restarts, 3);
    }

    #[test]
    fn test_apply_outcome_restarts_never_decrease() {
        let mut s = recorded("1.0.0");
        s.restarts = 5;
        apply_outcome(&mut s, RunnerOutcome::Running { restarts: 2 });
        assert_eq!(s.restarts, 5);
        assert_eq!(s.state, PackageState::InProgress);
    }

    #[test]
    fn test_start_stage_record() {
        let pkg = package_with_config(&[]);
        let s = start_stage("tuning", &pkg, Stage::Apply);
        assert_eq!(s.name, "tuning");
        assert_eq!(s.version, "1.0.0");
        assert_eq!(s.image, "ghcr.io/acme/img:1.0.0");
        assert_eq!(s.state, PackageState::InProgress);
    }

    #[test]
    fn test_promote_skipped() {
        let mut s = recorded("1.0.0");
        s.stage = Stage::Interrupt;
        s.state = PackageState::Skipped;
        promote_skipped(&mut s);
        assert_eq!(s.state, PackageState::Complete);

        // Only skipped is promoted.
        let mut erroring = recorded("1.0.0");
        erroring.state = PackageState::Erroring;
        promote_skipped(&mut erroring);
        assert_eq!(erroring.state, PackageState::Erroring);
    }
}
