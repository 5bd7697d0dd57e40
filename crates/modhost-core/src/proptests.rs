//! Property-based tests for modhost-core.
//!
//! # Properties Tested
//!
//! - Version ordering agrees with numeric (major, minor, patch) ordering
//! - Caret and tilde ranges accept exactly their documented windows
//! - Acyclic graphs never report cycles and batch plans respect every edge
//! - A closing back-edge is always reported with the full cycle path

#![cfg(test)]

use std::collections::HashMap;

use proptest::prelude::*;

use crate::graph::tests::module;
use crate::graph::ModuleGraph;
use crate::module::{Environment, Module};
use crate::resolver::DependencyResolver;
use crate::version::{ModuleVersion, VersionConstraint};

// =============================================================================
// Generators
// =============================================================================

fn arb_version() -> impl Strategy<Value = ModuleVersion> {
    (0u64..20, 0u64..20, 0u64..20).prop_map(|(major, minor, patch)| ModuleVersion::new(major, minor, patch))
}

/// A random DAG over `n` modules: module `i` may only depend on `j < i`.
fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| prop::collection::vec(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|mut edges| {
                edges[0].clear();
                for deps in edges.iter_mut() {
                    deps.sort_unstable();
                    deps.dedup();
                }
                edges
            })
    })
}

fn build_modules(edges: &[Vec<usize>]) -> Vec<Module> {
    edges
        .iter()
        .enumerate()
        .map(|(i, deps)| {
            let deps: Vec<String> = deps.iter().map(|d| format!("m{d}")).collect();
            let refs: Vec<&str> = deps.iter().map(String::as_str).collect();
            module(&format!("m{i}"), "1.0.0", &refs)
        })
        .collect()
}

// =============================================================================
// Version properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_ordering_is_numeric(a in arb_version(), b in arb_version()) {
        let tuple_a = (a.major(), a.minor(), a.patch());
        let tuple_b = (b.major(), b.minor(), b.patch());
        prop_assert_eq!(a.cmp(&b), tuple_a.cmp(&tuple_b));
    }

    #[test]
    fn prop_display_parse_identity(v in arb_version()) {
        let reparsed = ModuleVersion::parse(&v.to_string()).unwrap();
        prop_assert_eq!(reparsed, v);
    }

    #[test]
    fn prop_major_upgrade_iff_major_grows(a in arb_version(), b in arb_version()) {
        prop_assert_eq!(a.is_major_upgrade_from(&b), a.major() > b.major());
    }

    #[test]
    fn prop_caret_window(base in arb_version(), v in arb_version()) {
        prop_assume!(base.major() > 0);
        let constraint = VersionConstraint::parse(&format!("^{base}")).unwrap();
        let expected = v.major() == base.major() && v >= base;
        prop_assert_eq!(constraint.satisfied_by(&v), expected);
    }

    #[test]
    fn prop_tilde_window(base in arb_version(), v in arb_version()) {
        let constraint = VersionConstraint::parse(&format!("~{base}")).unwrap();
        let expected = v.major() == base.major() && v.minor() == base.minor() && v >= base;
        prop_assert_eq!(constraint.satisfied_by(&v), expected);
    }

    #[test]
    fn prop_empty_constraint_accepts_all(v in arb_version()) {
        prop_assert!(VersionConstraint::parse("").unwrap().satisfied_by(&v));
        prop_assert!(VersionConstraint::any().satisfied_by(&v));
    }
}

// =============================================================================
// Graph properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_dag_has_no_cycle(edges in arb_dag()) {
        let graph = ModuleGraph::build(&build_modules(&edges));
        prop_assert_eq!(graph.find_any_cycle(), None);
    }

    #[test]
    fn prop_plan_enable_respects_edges(edges in arb_dag(), seed in any::<u64>()) {
        let modules = build_modules(&edges);
        let graph = ModuleGraph::build(&modules);
        let env = Environment::new(ModuleVersion::new(1, 0, 0));

        // enable everything, in a shuffled request order
        let mut names: Vec<String> = modules.iter().map(|m| m.name.clone()).collect();
        let len = names.len();
        for i in 0..len {
            let j = ((seed.wrapping_mul(i as u64 + 7)) % len as u64) as usize;
            names.swap(i, j);
        }

        let plan = DependencyResolver::new(&graph, &env).plan_enable(&names).unwrap();
        prop_assert_eq!(plan.len(), len);

        let position: HashMap<&str, usize> =
            plan.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        for (i, deps) in edges.iter().enumerate() {
            let me = format!("m{i}");
            for d in deps {
                let dep = format!("m{d}");
                prop_assert!(position[dep.as_str()] < position[me.as_str()]);
            }
        }
    }

    #[test]
    fn prop_back_edge_reports_full_cycle(len in 2usize..10) {
        // m0 -> m1 -> ... -> m(len-1) -> m0
        let modules: Vec<Module> = (0..len)
            .map(|i| {
                let dep = format!("m{}", (i + 1) % len);
                module(&format!("m{i}"), "1.0.0", &[dep.as_str()])
            })
            .collect();
        let graph = ModuleGraph::build(&modules);
        let cycle = graph.find_cycle_from("m0").unwrap();
        prop_assert_eq!(cycle.len(), len);
        prop_assert_eq!(cycle[0].as_str(), "m0");
    }
}
