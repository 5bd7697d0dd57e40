//! Post-update smoke test.
//!
//! After new files and migrations are in place the module is checked in
//! three steps: its provider loads, its routes respond, and its admin panel
//! registers. Only the loader step and hard errors fail the check; warnings
//! are advisory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use modhost_core::{Module, ModuleManifest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::UpdateError;

/// Outcome of the three health probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub provider_loads: bool,
    pub routes_respond: bool,
    pub panel_registers: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl HealthCheckResult {
    /// True iff the provider loaded and nothing reported an error.
    pub fn passes(&self) -> bool {
        self.provider_loads && self.errors.is_empty()
    }

    /// Convert a failing result into `HealthCheckFailed`.
    pub fn into_result(self, module: &str) -> Result<Self, UpdateError> {
        if self.passes() {
            return Ok(self);
        }
        let mut errors = self.errors;
        if errors.is_empty() {
            errors.push("provider did not load".to_string());
        }
        Err(UpdateError::HealthCheckFailed {
            module: module.to_string(),
            errors,
        })
    }
}

/// What a single probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    /// The probe could not run; recorded as a warning
    Skipped(String),
    Failed(String),
}

/// Hooks into the running application for health probes.
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    async fn load_provider(&self, module: &Module) -> anyhow::Result<ProbeOutcome>;

    async fn probe_routes(&self, module: &Module) -> anyhow::Result<ProbeOutcome>;

    async fn register_panel(&self, module: &Module) -> anyhow::Result<ProbeOutcome>;
}

pub struct HealthChecker {
    runtime: Arc<dyn ModuleRuntime>,
}

impl HealthChecker {
    pub fn new(runtime: Arc<dyn ModuleRuntime>) -> Self {
        Self { runtime }
    }

    /// Run every probe against `module`.
    ///
    /// Routes and panel are only probed once the provider has loaded.
    pub async fn check(&self, module: &Module) -> HealthCheckResult {
        let mut result = HealthCheckResult::default();

        result.provider_loads = record(
            &mut result,
            "provider",
            self.runtime.load_provider(module).await,
        );
        if !result.provider_loads {
            result
                .warnings
                .push("routes and panel not checked because the provider did not load".to_string());
            warn!(module = %module.name, errors = ?result.errors, "Health check failed");
            return result;
        }

        result.routes_respond = record(&mut result, "routes", self.runtime.probe_routes(module).await);
        result.panel_registers = record(&mut result, "panel", self.runtime.register_panel(module).await);

        if result.passes() {
            info!(module = %module.name, warnings = result.warnings.len(), "Health check passed");
        } else {
            warn!(module = %module.name, errors = ?result.errors, "Health check failed");
        }
        result
    }
}

fn record(result: &mut HealthCheckResult, probe: &str, outcome: anyhow::Result<ProbeOutcome>) -> bool {
    match outcome {
        Ok(ProbeOutcome::Passed) => true,
        Ok(ProbeOutcome::Skipped(reason)) => {
            debug!(probe, reason = %reason, "Probe skipped");
            result.warnings.push(format!("{probe}: {reason}"));
            true
        }
        Ok(ProbeOutcome::Failed(reason)) => {
            result.errors.push(format!("{probe}: {reason}"));
            false
        }
        Err(e) => {
            result.errors.push(format!("{probe}: {e:#}"));
            false
        }
    }
}

// ============================================================================
// Installed-files runtime
// ============================================================================

/// Probes a module from its installed files, plus an optional HTTP route.
pub struct InstalledModuleRuntime {
    client: reqwest::Client,
    route_url_template: Option<String>,
}

impl InstalledModuleRuntime {
    pub fn new(config: &HealthConfig, timeout: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            route_url_template: config.route_url_template.clone(),
        })
    }
}

#[async_trait]
impl ModuleRuntime for InstalledModuleRuntime {
    async fn load_provider(&self, module: &Module) -> anyhow::Result<ProbeOutcome> {
        let path = module.manifest_path();
        let manifest = tokio::task::spawn_blocking(move || ModuleManifest::load(&path))
            .await
            .context("manifest loader task failed")?
            .context("installed manifest does not load")?;

        if manifest.name != module.name {
            bail!(
                "installed manifest names {}, expected {}",
                manifest.name,
                module.name
            );
        }
        match manifest.provider.as_deref().map(str::trim) {
            None => Ok(ProbeOutcome::Skipped("module declares no provider".to_string())),
            Some("") => Ok(ProbeOutcome::Failed("provider entry point is empty".to_string())),
            Some(_) => Ok(ProbeOutcome::Passed),
        }
    }

    async fn probe_routes(&self, module: &Module) -> anyhow::Result<ProbeOutcome> {
        let Some(template) = &self.route_url_template else {
            return Ok(ProbeOutcome::Skipped("no route probe configured".to_string()));
        };
        let url = template.replace("{module}", &module.name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if status.is_server_error() {
            Ok(ProbeOutcome::Failed(format!("GET {url} returned {}", status.as_u16())))
        } else if status.is_client_error() {
            Ok(ProbeOutcome::Skipped(format!("GET {url} returned {}", status.as_u16())))
        } else {
            Ok(ProbeOutcome::Passed)
        }
    }

    async fn register_panel(&self, module: &Module) -> anyhow::Result<ProbeOutcome> {
        let Some(panel) = &module.panel else {
            return Ok(ProbeOutcome::Passed);
        };
        let entry = module.path.join(panel);
        let exists = tokio::fs::try_exists(&entry)
            .await
            .with_context(|| format!("checking {}", entry.display()))?;
        if exists {
            Ok(ProbeOutcome::Passed)
        } else {
            Ok(ProbeOutcome::Failed(format!("panel entry {panel} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modhost_core::MANIFEST_FILE;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct ScriptedRuntime {
        provider: ProbeOutcome,
        routes: ProbeOutcome,
        panel: Option<ProbeOutcome>,
    }

    #[async_trait]
    impl ModuleRuntime for ScriptedRuntime {
        async fn load_provider(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
            Ok(self.provider.clone())
        }

        async fn probe_routes(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
            Ok(self.routes.clone())
        }

        async fn register_panel(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
            match &self.panel {
                Some(outcome) => Ok(outcome.clone()),
                None => bail!("panel registry unavailable"),
            }
        }
    }

    fn installed(root: &Path, manifest: &str) -> Module {
        let path = root.join("blog");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
        let parsed = ModuleManifest::from_json(manifest, &path.join(MANIFEST_FILE)).unwrap();
        Module::from_manifest(parsed, path, Utc::now())
    }

    fn checker(provider: ProbeOutcome, routes: ProbeOutcome, panel: Option<ProbeOutcome>) -> HealthChecker {
        HealthChecker::new(Arc::new(ScriptedRuntime {
            provider,
            routes,
            panel,
        }))
    }

    #[tokio::test]
    async fn test_warnings_do_not_fail() {
        let temp = TempDir::new().unwrap();
        let module = installed(temp.path(), r#"{"name": "blog", "version": "1.0.0"}"#);
        let result = checker(
            ProbeOutcome::Passed,
            ProbeOutcome::Skipped("no routes".into()),
            Some(ProbeOutcome::Passed),
        )
        .check(&module)
        .await;
        assert!(result.passes());
        assert!(result.routes_respond);
        assert_eq!(result.warnings, vec!["routes: no routes"]);
    }

    #[tokio::test]
    async fn test_provider_failure_short_circuits() {
        let temp = TempDir::new().unwrap();
        let module = installed(temp.path(), r#"{"name": "blog", "version": "1.0.0"}"#);
        let result = checker(
            ProbeOutcome::Failed("class not found".into()),
            ProbeOutcome::Passed,
            Some(ProbeOutcome::Passed),
        )
        .check(&module)
        .await;
        assert!(!result.passes());
        assert!(!result.routes_respond);
        assert_eq!(result.errors, vec!["provider: class not found"]);
        assert!(matches!(
            result.into_result("blog"),
            Err(UpdateError::HealthCheckFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_error_is_recorded() {
        let temp = TempDir::new().unwrap();
        let module = installed(temp.path(), r#"{"name": "blog", "version": "1.0.0"}"#);
        let result = checker(ProbeOutcome::Passed, ProbeOutcome::Passed, None)
            .check(&module)
            .await;
        assert!(result.provider_loads);
        assert!(!result.panel_registers);
        assert!(!result.passes());
        assert_eq!(result.errors, vec!["panel: panel registry unavailable"]);
    }

    #[tokio::test]
    async fn test_installed_runtime_checks_files() {
        let temp = TempDir::new().unwrap();
        let module = installed(
            temp.path(),
            r#"{"name": "blog", "version": "1.0.0", "provider": "Blog\\Provider", "panel": "panel/index.js"}"#,
        );
        let runtime = InstalledModuleRuntime::new(&HealthConfig::default(), Duration::from_secs(5)).unwrap();
        let checker = HealthChecker::new(Arc::new(runtime));

        let result = checker.check(&module).await;
        assert!(result.provider_loads);
        assert!(!result.panel_registers);
        assert_eq!(result.errors, vec!["panel: panel entry panel/index.js not found"]);
        assert_eq!(result.warnings, vec!["routes: no route probe configured"]);

        fs::create_dir_all(module.path.join("panel")).unwrap();
        fs::write(module.path.join("panel/index.js"), "export {}").unwrap();
        assert!(checker.check(&module).await.passes());
    }

    #[tokio::test]
    async fn test_installed_runtime_broken_manifest() {
        let temp = TempDir::new().unwrap();
        let module = installed(temp.path(), r#"{"name": "blog", "version": "1.0.0"}"#);
        fs::write(module.manifest_path(), "{ not json").unwrap();

        let runtime = InstalledModuleRuntime::new(&HealthConfig::default(), Duration::from_secs(5)).unwrap();
        let result = HealthChecker::new(Arc::new(runtime)).check(&module).await;
        assert!(!result.provider_loads);
        assert!(!result.passes());
        assert!(result.errors[0].starts_with("provider: installed manifest does not load"));
    }
}
