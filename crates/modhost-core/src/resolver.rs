//! Legality checks and ordering for enable/disable requests.

use tracing::debug;

use crate::error::{CoreError, MissingReason};
use crate::graph::ModuleGraph;
use crate::module::{Environment, ModuleStatus};

/// Answers whether module status transitions are legal against a graph
/// snapshot and the live environment.
///
/// The resolver never mutates anything; batch plans are simulated on a
/// private copy of the graph.
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'a> {
    graph: &'a ModuleGraph,
    environment: &'a Environment,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(graph: &'a ModuleGraph, environment: &'a Environment) -> Self {
        Self { graph, environment }
    }

    /// Check that `name` can be enabled right now.
    ///
    /// # Errors
    /// * `ModuleNotFound` if no such module is installed
    /// * `CircularDependencyDetected` if a cycle is reachable from it
    /// * `MissingDependency` for a dependency that is absent or disabled,
    ///   or a runtime extension that is not loaded
    /// * `VersionMismatch` for a dependency or core version outside the
    ///   declared constraint
    pub fn can_enable(&self, name: &str) -> Result<(), CoreError> {
        let module = self
            .graph
            .get(name)
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;

        if let Some(cycle) = self.graph.find_cycle_from(name) {
            return Err(CoreError::CircularDependencyDetected { cycle });
        }

        for dep in module.dependency_names() {
            let Some(installed) = self.graph.get(&dep) else {
                return Err(CoreError::MissingDependency {
                    module: name.to_string(),
                    dependency: dep,
                    reason: MissingReason::NotInstalled,
                });
            };
            if !installed.is_enabled() {
                return Err(CoreError::MissingDependency {
                    module: name.to_string(),
                    dependency: dep,
                    reason: MissingReason::Disabled,
                });
            }
            if let Some(constraint) = module.constraint_for(&dep) {
                if !constraint.satisfied_by(&installed.version) {
                    return Err(CoreError::VersionMismatch {
                        module: name.to_string(),
                        dependency: dep,
                        constraint: constraint.to_string(),
                        found: installed.version.to_string(),
                    });
                }
            }
        }

        if let Some(core) = &module.requirements.core {
            if !self.environment.core_satisfies(Some(core)) {
                return Err(CoreError::VersionMismatch {
                    module: name.to_string(),
                    dependency: "core".to_string(),
                    constraint: core.to_string(),
                    found: self.environment.core_version.to_string(),
                });
            }
        }

        if let Some(ext) = module
            .requirements
            .extensions
            .iter()
            .find(|ext| !self.environment.has_extension(ext))
        {
            return Err(CoreError::MissingDependency {
                module: name.to_string(),
                dependency: ext.clone(),
                reason: MissingReason::ExtensionNotLoaded,
            });
        }

        Ok(())
    }

    /// Check that `name` can be disabled: no enabled module depends on it.
    pub fn can_disable(&self, name: &str) -> Result<(), CoreError> {
        if !self.graph.contains(name) {
            return Err(CoreError::ModuleNotFound(name.to_string()));
        }
        let dependents = self.graph.enabled_dependents_of(name);
        if !dependents.is_empty() {
            return Err(CoreError::DependentModulesExist {
                module: name.to_string(),
                dependents: dependents.into_iter().map(String::from).collect(),
            });
        }
        Ok(())
    }

    /// Check that `name` can be removed: no installed module depends on it.
    pub fn can_uninstall(&self, name: &str) -> Result<(), CoreError> {
        if !self.graph.contains(name) {
            return Err(CoreError::ModuleNotFound(name.to_string()));
        }
        let dependents = self.graph.dependents_of(name);
        if !dependents.is_empty() {
            return Err(CoreError::DependentModulesExist {
                module: name.to_string(),
                dependents: dependents.into_iter().map(String::from).collect(),
            });
        }
        Ok(())
    }

    /// Compute the order in which to enable `names`.
    ///
    /// Dependencies come first. Modules that are already enabled are left
    /// out of the plan. Every step is validated against a simulated graph
    /// in which the earlier steps have been applied, so the whole batch is
    /// either legal or rejected.
    pub fn plan_enable(&self, names: &[String]) -> Result<Vec<String>, CoreError> {
        let order = self.ordered(names)?;
        let mut simulated = self.graph.clone();
        let mut plan = Vec::with_capacity(order.len());

        for name in order {
            if simulated.get(&name).is_some_and(|m| m.is_enabled()) {
                debug!("{} already enabled, skipping", name);
                continue;
            }
            DependencyResolver::new(&simulated, self.environment).can_enable(&name)?;
            simulated.set_status(&name, ModuleStatus::Enabled);
            plan.push(name);
        }

        Ok(plan)
    }

    /// Compute the order in which to disable `names`: dependents first.
    pub fn plan_disable(&self, names: &[String]) -> Result<Vec<String>, CoreError> {
        let mut order = self.ordered(names)?;
        order.reverse();
        let mut simulated = self.graph.clone();
        let mut plan = Vec::with_capacity(order.len());

        for name in order {
            if simulated.get(&name).is_some_and(|m| !m.is_enabled()) {
                debug!("{} already disabled, skipping", name);
                continue;
            }
            DependencyResolver::new(&simulated, self.environment).can_disable(&name)?;
            simulated.set_status(&name, ModuleStatus::Disabled);
            plan.push(name);
        }

        Ok(plan)
    }

    fn ordered(&self, names: &[String]) -> Result<Vec<String>, CoreError> {
        if let Some(unknown) = names.iter().find(|n| !self.graph.contains(n)) {
            return Err(CoreError::ModuleNotFound(unknown.clone()));
        }
        self.graph
            .topological_order(names)
            .map_err(|cycle| CoreError::CircularDependencyDetected { cycle })
    }
}
