use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::crd::{Package, PackageStatus, unique_key};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("package '{package}' depends on '{dependency}' with an empty version")]
    EmptyDependencyVersion { package: String, dependency: String },

    #[error("package '{package}' depends on unknown package '{dependency}'")]
    UnknownDependency { package: String, dependency: String },

    #[error(
        "package '{package}' requires '{dependency}' version '{requested}' \
         but the Skyhook carries version '{actual}'"
    )]
    VersionMismatch {
        package: String,
        dependency: String,
        requested: String,
        actual: String,
    },

    #[error("ambiguous package '{name}': versions '{first}' and '{second}' both present")]
    AmbiguousVersions {
        name: String,
        first: String,
        second: String,
    },

    #[error("dependency cycle detected: {path}")]
    Cycle { path: String },
}

/* ============================= GRAPH ============================= */

/// Directed acyclic dependency graph over one Skyhook's packages,
/// keyed `name|version`. Construction validates the full invariant set;
/// a built graph is always a DAG with every edge resolved.
#[derive(Debug, Clone)]
pub struct PackageGraph {
    versions: BTreeMap<String, String>,
    edges: BTreeMap<String, BTreeSet<String>>,
    topo: Vec<String>,
}

impl PackageGraph {
    /// Build and validate from the Skyhook's package map.
    pub fn build(packages: &BTreeMap<String, Package>) -> Result<Self, GraphError> {
        Self::build_from(packages.iter().map(|(name, pkg)| (name.as_str(), pkg)))
    }

    /// Build from an arbitrary `(name, package)` sequence. Duplicate names
    /// with differing versions are ambiguous and rejected.
    pub fn build_from<'a, I>(entries: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (&'a str, &'a Package)>,
    {
        let mut versions: BTreeMap<String, String> = BTreeMap::new();
        let mut depends_on: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for (name, pkg) in entries {
            if let Some(existing) = versions.get(name) {
                if existing != &pkg.version {
                    return Err(GraphError::AmbiguousVersions {
                        name: name.to_string(),
                        first: existing.clone(),
                        second: pkg.version.clone(),
                    });
                }
                continue;
            }
            versions.insert(name.to_string(), pkg.version.clone());
            depends_on.insert(name.to_string(), pkg.depends_on.clone());
        }

        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, deps) in &depends_on {
            let mut resolved = BTreeSet::new();
            for (dep_name, dep_version) in deps {
                if dep_version.is_empty() {
                    return Err(GraphError::EmptyDependencyVersion {
                        package: name.clone(),
                        dependency: dep_name.clone(),
                    });
                }
                let actual = versions.get(dep_name).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        package: name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;
                if actual != dep_version {
                    return Err(GraphError::VersionMismatch {
                        package: name.clone(),
                        dependency: dep_name.clone(),
                        requested: dep_version.clone(),
                        actual: actual.clone(),
                    });
                }
                resolved.insert(dep_name.clone());
            }
            edges.insert(name.clone(), resolved);
        }

        let topo = topo_sort(&edges)?;

        Ok(Self {
            versions,
            edges,
            topo,
        })
    }

    /// Package names in topological order, roots first. Names within one
    /// level come out sorted, so the order is reproducible.
    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    pub fn contains(&self, name: &str) -> bool {
        self.versions.contains_key(name)
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }

    /// `name|version` key for a package in this graph.
    pub fn key_of(&self, name: &str) -> Option<String> {
        self.versions.get(name).map(|v| unique_key(name, v))
    }

    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(name)
    }

    /// True iff every dependency of `name` has reached terminal success in
    /// the given node state, as judged by `terminal_complete` on the
    /// dependency's record. The judgment belongs to the caller because
    /// where the lifecycle ends depends on whether the dependency carries
    /// an interrupt: `config` is terminal only without one, otherwise
    /// `post-interrupt` is.
    pub fn can_advance(
        &self,
        name: &str,
        node_state: &BTreeMap<String, PackageStatus>,
        terminal_complete: impl Fn(&str, &PackageStatus) -> bool,
    ) -> bool {
        let Some(deps) = self.edges.get(name) else {
            return false;
        };
        deps.iter().all(|dep| {
            let Some(key) = self.key_of(dep) else {
                return false;
            };
            node_state
                .get(&key)
                .is_some_and(|record| terminal_complete(dep, record))
        })
    }
}

/* ============================= TOPO SORT ============================= */

// Kahn's algorithm over a BTreeSet ready-queue: deterministic, roots first,
// name-sorted within each level.
fn topo_sort(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, GraphError> {
    let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = edges
        .iter()
        .map(|(n, deps)| (n.as_str(), deps.iter().map(String::as_str).collect()))
        .collect();

    let mut order = Vec::with_capacity(edges.len());
    let mut ready: BTreeSet<&str> = remaining_deps
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(n, _)| *n)
        .collect();

    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        remaining_deps.remove(next);
        order.push(next.to_string());

        for (name, deps) in remaining_deps.iter_mut() {
            if deps.remove(next) && deps.is_empty() {
                ready.insert(name);
            }
        }
    }

    if !remaining_deps.is_empty() {
        let path = cycle_path(&remaining_deps);
        return Err(GraphError::Cycle { path });
    }

    Ok(order)
}

// Walk edges from the lexicographically-first stuck node until a repeat.
fn cycle_path(stuck: &BTreeMap<&str, BTreeSet<&str>>) -> String {
    let Some((&start, _)) = stuck.iter().next() else {
        return String::new();
    };

    let mut seen: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let Some(deps) = stuck.get(current) else {
            break;
        };
        let Some(&next) = deps.iter().find(|d| stuck.contains_key(*d)) else {
            break;
        };
        if let Some(pos) = seen.iter().position(|&s| s == next) {
            let mut cycle: Vec<&str> = seen[pos..].to_vec();
            cycle.push(next);
            return cycle.join(" -> ");
        }
        seen.push(next);
        current = next;
    }
    seen.join(" -> ")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PackageState, Stage};

    // Terminality for dependencies without an interrupt attached.
    fn plain_terminal(_dep: &str, record: &PackageStatus) -> bool {
        record.state == PackageState::Complete
            && matches!(record.stage, Stage::Config | Stage::PostInterrupt)
    }

    // Terminality for dependencies that carry an interrupt: only a
    // completed post-interrupt counts.
    fn interrupt_terminal(_dep: &str, record: &PackageStatus) -> bool {
        record.state == PackageState::Complete && record.stage == Stage::PostInterrupt
    }

    fn pkg(version: &str, deps: &[(&str, &str)]) -> Package {
        Package {
            version: version.to_string(),
            image: "ghcr.io/acme/img".to_string(),
            depends_on: deps
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn packages(entries: &[(&str, Package)]) -> BTreeMap<String, Package> {
        entries
            .iter()
            .map(|(n, p)| (n.to_string(), p.clone()))
            .collect()
    }

    fn complete_status(name: &str, version: &str, stage: Stage) -> PackageStatus {
        PackageStatus {
            name: name.to_string(),
            version: version.to_string(),
            image: format!("img:{version}"),
            stage,
            state: PackageState::Complete,
            restarts: 0,
        }
    }

    // ── Build validation ──

    #[test]
    fn test_build_single_package() {
        let g = PackageGraph::build(&packages(&[("a", pkg("1.0.0", &[]))])).unwrap();
        assert_eq!(g.topo_order(), &["a".to_string()]);
        assert_eq!(g.key_of("a").unwrap(), "a|1.0.0");
    }

    #[test]
    fn test_build_chain_orders_roots_first() {
        let g = PackageGraph::build(&packages(&[
            ("c", pkg("1.0.0", &[("b", "1.0.0")])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
            ("a", pkg("1.0.0", &[])),
        ]))
        .unwrap();
        assert_eq!(
            g.topo_order(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_build_level_order_stable_by_name() {
        // b and z are both roots; c depends on both. Roots come out sorted.
        let g = PackageGraph::build(&packages(&[
            ("z", pkg("1.0.0", &[])),
            ("c", pkg("1.0.0", &[("b", "1.0.0"), ("z", "1.0.0")])),
            ("b", pkg("1.0.0", &[])),
        ]))
        .unwrap();
        assert_eq!(
            g.topo_order(),
            &["b".to_string(), "z".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_build_rejects_empty_dependency_version() {
        let err = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "")])),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::EmptyDependencyVersion {
                package: "b".to_string(),
                dependency: "a".to_string(),
            }
        );
    }

    #[test]
    fn test_build_rejects_unknown_dependency() {
        let err = PackageGraph::build(&packages(&[(
            "b",
            pkg("1.0.0", &[("missing", "1.0.0")]),
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                package: "b".to_string(),
                dependency: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_build_rejects_version_mismatch() {
        let err = PackageGraph::build(&packages(&[
            ("a", pkg("2.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap_err();
        assert!(matches!(err, GraphError::VersionMismatch { .. }));
    }

    #[test]
    fn test_build_rejects_ambiguous_versions() {
        let a1 = pkg("1.0.0", &[]);
        let a2 = pkg("2.0.0", &[]);
        let err =
            PackageGraph::build_from([("a", &a1), ("a", &a2)].into_iter()).unwrap_err();
        assert!(matches!(err, GraphError::AmbiguousVersions { .. }));
    }

    #[test]
    fn test_build_accepts_duplicate_same_version() {
        let a = pkg("1.0.0", &[]);
        let g = PackageGraph::build_from([("a", &a), ("a", &a)].into_iter()).unwrap();
        assert_eq!(g.topo_order().len(), 1);
    }

    #[test]
    fn test_build_rejects_self_cycle() {
        let err = PackageGraph::build(&packages(&[("a", pkg("1.0.0", &[("a", "1.0.0")]))]))
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_build_rejects_two_node_cycle_with_path() {
        let err = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[("b", "1.0.0")])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap_err();
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle error");
        };
        assert!(path.contains("a"));
        assert!(path.contains("b"));
        assert!(path.contains("->"));
    }

    #[test]
    fn test_build_diamond_is_valid() {
        let g = PackageGraph::build(&packages(&[
            ("base", pkg("1.0.0", &[])),
            ("left", pkg("1.0.0", &[("base", "1.0.0")])),
            ("right", pkg("1.0.0", &[("base", "1.0.0")])),
            (
                "top",
                pkg("1.0.0", &[("left", "1.0.0"), ("right", "1.0.0")]),
            ),
        ]))
        .unwrap();
        let order = g.topo_order();
        assert_eq!(order[0], "base");
        assert_eq!(order[3], "top");
    }

    // ── can_advance ──

    #[test]
    fn test_can_advance_no_dependencies() {
        let g = PackageGraph::build(&packages(&[("a", pkg("1.0.0", &[]))])).unwrap();
        assert!(g.can_advance("a", &BTreeMap::new(), plain_terminal));
    }

    #[test]
    fn test_can_advance_unknown_package_is_false() {
        let g = PackageGraph::build(&packages(&[("a", pkg("1.0.0", &[]))])).unwrap();
        assert!(!g.can_advance("nope", &BTreeMap::new(), plain_terminal));
    }

    #[test]
    fn test_can_advance_blocked_until_dependency_terminal() {
        let g = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap();

        let mut state = BTreeMap::new();
        assert!(!g.can_advance("b", &state, plain_terminal));

        // In-progress apply does not satisfy the edge.
        let mut in_progress = complete_status("a", "1.0.0", Stage::Apply);
        in_progress.state = PackageState::InProgress;
        state.insert("a|1.0.0".to_string(), in_progress);
        assert!(!g.can_advance("b", &state, plain_terminal));

        // Complete apply is still not terminal.
        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::Apply),
        );
        assert!(!g.can_advance("b", &state, plain_terminal));

        // Complete config is terminal success without an interrupt.
        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::Config),
        );
        assert!(g.can_advance("b", &state, plain_terminal));
    }

    #[test]
    fn test_can_advance_interrupt_dependency_holds_past_config() {
        // A dependency with an interrupt attached sits at complete config
        // for the whole cordon/drain window; the edge stays unsatisfied
        // until post-interrupt completes.
        let g = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap();

        let mut state = BTreeMap::new();
        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::Config),
        );
        assert!(!g.can_advance("b", &state, interrupt_terminal));

        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::PostInterrupt),
        );
        assert!(g.can_advance("b", &state, interrupt_terminal));
    }

    #[test]
    fn test_can_advance_post_interrupt_complete_is_terminal() {
        let g = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap();
        let mut state = BTreeMap::new();
        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::PostInterrupt),
        );
        assert!(g.can_advance("b", &state, plain_terminal));
    }

    #[test]
    fn test_can_advance_uninstalled_dependency_never_satisfies() {
        let g = PackageGraph::build(&packages(&[
            ("a", pkg("1.0.0", &[])),
            ("b", pkg("1.0.0", &[("a", "1.0.0")])),
        ]))
        .unwrap();
        let mut state = BTreeMap::new();
        state.insert(
            "a|1.0.0".to_string(),
            complete_status("a", "1.0.0", Stage::Uninstall),
        );
        assert!(!g.can_advance("b", &state, plain_terminal));
    }
}
