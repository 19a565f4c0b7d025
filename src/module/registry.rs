//! Module registry: manifest collection, dependency validation, and
//! instantiation in topological order.

use log::info;
use std::collections::{HashMap, HashSet};

use super::lifecycle::{ModuleRecord, ModuleSet};
use super::manifest::ModuleManifest;
use super::{ModuleState, Runtime};
use crate::error::{Error, Result};

/// Collects manifests and produces the load order.
pub struct ModuleRegistry {
    manifests: Vec<ModuleManifest>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            manifests: Vec::new(),
        }
    }

    /// Registry preloaded with the built-in module set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for manifest in super::manifest::builtin_manifests() {
            registry.register(manifest).expect("builtin manifests are valid");
        }
        registry
    }

    /// Add a manifest. Duplicate names are rejected.
    pub fn register(&mut self, manifest: ModuleManifest) -> Result<()> {
        if self.manifests.iter().any(|m| m.name == manifest.name) {
            return Err(Error::invalid_argument(format!(
                "module '{}' registered twice",
                manifest.name
            )));
        }
        self.manifests.push(manifest);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Check that every dependency resolves and the graph is acyclic,
    /// returning manifest indices in a dependency-respecting load order.
    /// Registration order is preserved among unconstrained modules.
    pub fn load_order(&self) -> Result<Vec<usize>> {
        let index_by_name: HashMap<&str, usize> = self
            .manifests
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name, i))
            .collect();

        for manifest in &self.manifests {
            for dep in manifest.dependencies {
                if !index_by_name.contains_key(dep) {
                    return Err(Error::not_found(format!(
                        "module '{}' depends on unknown module '{dep}'",
                        manifest.name
                    )));
                }
            }
        }

        // Kahn's algorithm, scanning in registration order for stability.
        let n = self.manifests.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, manifest) in self.manifests.iter().enumerate() {
            for dep in manifest.dependencies {
                let d = index_by_name[dep];
                dependents[d].push(i);
                indegree[i] += 1;
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut placed = HashSet::new();
        while order.len() < n {
            let mut progressed = false;
            for i in 0..n {
                if indegree[i] == 0 && !placed.contains(&i) {
                    placed.insert(i);
                    order.push(i);
                    for &dependent in &dependents[i] {
                        indegree[dependent] -= 1;
                    }
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = (0..n)
                    .filter(|i| !placed.contains(i))
                    .map(|i| self.manifests[i].name)
                    .collect();
                return Err(Error::invalid_state(format!(
                    "dependency cycle among modules: {}",
                    stuck.join(", ")
                )));
            }
        }
        Ok(order)
    }

    /// Instantiate every module in load order and hand the records to
    /// the lifecycle controller.
    pub fn instantiate(&self, rt: &Runtime) -> Result<ModuleSet> {
        let order = self.load_order()?;
        let mut records = Vec::with_capacity(order.len());
        for idx in order {
            let manifest = &self.manifests[idx];
            info!(
                "module '{}' v{} ({:?}) instantiated",
                manifest.name, manifest.version, manifest.module_type
            );
            records.push(ModuleRecord {
                name: manifest.name.to_string(),
                module_type: manifest.module_type,
                priority: manifest.priority,
                state: ModuleState::Created,
                max_update_us: manifest.max_update_us,
                config_section: manifest.config_section.to_string(),
                dependencies: manifest.dependencies.iter().map(|d| (*d).to_string()).collect(),
                instance: (manifest.factory)(rt),
                overruns: 0,
                consecutive_overruns: 0,
                restarts: 0,
            });
        }
        Ok(ModuleSet::new(records))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
