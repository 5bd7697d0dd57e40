//! # modhost-core
//!
//! Module model and lifecycle rules for a modular host application.
//!
//! This crate handles:
//! - Semantic versions and version constraints
//! - `module.json` manifests and discovery of installed modules
//! - The module dependency graph, cycle detection and batch ordering
//! - Enable/disable legality checks against the live environment
//! - The module registry, its persistence, and lifecycle events

pub mod error;
pub mod events;
pub mod graph;
pub mod manifest;
pub mod module;
#[cfg(test)]
mod proptests;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod version;

// Re-export main types for convenience
pub use error::{CoreError, MissingReason};
pub use events::{EventBus, EventListener, LoggingListener, ModuleEvent, RecordingListener};
pub use graph::ModuleGraph;
pub use manifest::{is_kebab_case, scan_modules_dir, ManifestScan, ModuleManifest, MANIFEST_FILE};
pub use module::{Environment, Module, ModuleStatus, RepositoryRef, Requirements};
pub use registry::{DiscoveryReport, ModuleRegistry};
pub use resolver::DependencyResolver;
pub use store::{InMemoryModuleStore, JsonFileModuleStore, ModuleStore, StoreError};
pub use version::{ModuleVersion, VersionConstraint, VersionError};
