//! Dependency graph over installed modules.
//!
//! The graph is an arena: modules live in a `Vec` indexed by position, a
//! name index maps names to positions, and edges are adjacency lists of
//! positions. Traversals are iterative so deep chains cannot overflow the
//! stack.

use std::collections::HashMap;

use chrono::Utc;

use crate::module::{Module, ModuleStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Snapshot of the installed modules and their "depends on" edges.
///
/// Built from a slice of modules without touching them; the graph owns
/// its own copies.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    nodes: Vec<Module>,
    index: HashMap<String, usize>,
    /// node -> installed modules it depends on
    edges: Vec<Vec<usize>>,
    /// node -> installed modules that depend on it
    reverse: Vec<Vec<usize>>,
}

impl ModuleGraph {
    pub fn build(modules: &[Module]) -> Self {
        let mut sorted: Vec<Module> = modules.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let index: HashMap<String, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();

        let mut edges = vec![Vec::new(); sorted.len()];
        let mut reverse = vec![Vec::new(); sorted.len()];
        for (i, module) in sorted.iter().enumerate() {
            for dep in module.dependency_names() {
                if let Some(&j) = index.get(&dep) {
                    edges[i].push(j);
                    reverse[j].push(i);
                }
            }
        }

        Self {
            nodes: sorted,
            index,
            edges,
            reverse,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// All modules, ordered by name.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.nodes.iter()
    }

    /// Installed modules that `name` depends on.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.edges[i].iter().map(|&j| self.name_at(j)).collect())
            .unwrap_or_default()
    }

    /// Installed modules that depend on `name`, ordered by name.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.reverse[i].iter().map(|&j| self.name_at(j)).collect())
            .unwrap_or_default()
    }

    /// Enabled modules that depend on `name`, ordered by name.
    pub fn enabled_dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.reverse[i]
                    .iter()
                    .filter(|&&j| self.nodes[j].is_enabled())
                    .map(|&j| self.name_at(j))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look for a cycle reachable from `name`.
    ///
    /// Returns the cycle as the list of modules on it, starting from the
    /// first module of the cycle that the traversal entered.
    pub fn find_cycle_from(&self, name: &str) -> Option<Vec<String>> {
        let &start = self.index.get(name)?;
        self.walk(&[start], |_| true).err().map(|c| self.names(&c))
    }

    /// Look for any cycle in the whole graph.
    pub fn find_any_cycle(&self) -> Option<Vec<String>> {
        let roots: Vec<usize> = (0..self.nodes.len()).collect();
        self.walk(&roots, |_| true).err().map(|c| self.names(&c))
    }

    /// Order `names` so every module comes after the modules it depends on,
    /// considering only edges between members of the set.
    ///
    /// Unknown names are skipped. A cycle inside the set is returned as `Err`.
    pub fn topological_order(&self, names: &[String]) -> Result<Vec<String>, Vec<String>> {
        let mut members = vec![false; self.nodes.len()];
        let mut roots: Vec<usize> = names
            .iter()
            .filter_map(|n| self.index.get(n).copied())
            .collect();
        roots.sort_unstable();
        roots.dedup();
        for &r in &roots {
            members[r] = true;
        }

        self.walk(&roots, |i| members[i])
            .map(|order| self.names(&order))
            .map_err(|cycle| self.names(&cycle))
    }

    /// Change a node's status in this snapshot only.
    pub(crate) fn set_status(&mut self, name: &str, status: ModuleStatus) {
        if let Some(&i) = self.index.get(name) {
            let now = Utc::now();
            match status {
                ModuleStatus::Enabled => self.nodes[i].mark_enabled(now),
                ModuleStatus::Disabled => self.nodes[i].mark_disabled(now),
            }
        }
    }

    fn name_at(&self, i: usize) -> &str {
        &self.nodes[i].name
    }

    fn names(&self, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| self.nodes[i].name.clone()).collect()
    }

    /// Three-colour depth-first walk from `roots`, following only edges into
    /// nodes accepted by `include`.
    ///
    /// Returns nodes in post-order (dependencies first), or the cycle path
    /// when an in-progress node is reached again.
    fn walk(&self, roots: &[usize], include: impl Fn(usize) -> bool) -> Result<Vec<usize>, Vec<usize>> {
        let mut colors = vec![Color::White; self.nodes.len()];
        let mut order = Vec::new();

        for &root in roots {
            if colors[root] != Color::White {
                continue;
            }
            colors[root] = Color::Grey;
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, edge) = *frame;
                match self.edges[node].get(edge) {
                    Some(&next) => {
                        frame.1 += 1;
                        if !include(next) {
                            continue;
                        }
                        match colors[next] {
                            Color::White => {
                                colors[next] = Color::Grey;
                                stack.push((next, 0));
                            }
                            Color::Grey => {
                                let start = stack
                                    .iter()
                                    .position(|&(n, _)| n == next)
                                    .unwrap_or(0);
                                return Err(stack[start..].iter().map(|&(n, _)| n).collect());
                            }
                            Color::Black => {}
                        }
                    }
                    None => {
                        colors[node] = Color::Black;
                        order.push(node);
                        stack.pop();
                    }
                }
            }
        }

        Ok(order)
    }
}
