//! Idempotent capability installation.

use super::recipe::InstallRecipe;
use super::record::{ProvisionSource, ProvisioningLedger, ProvisioningRecord};
use crate::cancellation::CancellationToken;
use crate::core::Capability;
use crate::errors::ProvisioningError;
use crate::sandbox::{ExecRequest, ExecStatus, ExecutionContext, StepEnvironment};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Bound on a probe command.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Installs capabilities into execution contexts, at most once per context.
///
/// Every call consults the ledger first; a recorded capability returns
/// immediately without touching the context. Installs are not transactional:
/// after a failed install the next call probes again.
#[derive(Debug, Clone)]
pub struct EnvironmentProvisioner {
    ledger: Arc<ProvisioningLedger>,
    recipes: HashMap<Capability, InstallRecipe>,
}

impl EnvironmentProvisioner {
    /// Creates a provisioner with the built-in SQL driver recipe.
    #[must_use]
    pub fn new(ledger: Arc<ProvisioningLedger>) -> Self {
        let mut recipes = HashMap::new();
        let mssql = InstallRecipe::mssql_odbc17();
        recipes.insert(mssql.capability, mssql);
        Self { ledger, recipes }
    }

    /// Registers or replaces the recipe for its capability.
    #[must_use]
    pub fn with_recipe(mut self, recipe: InstallRecipe) -> Self {
        self.recipes.insert(recipe.capability, recipe);
        self
    }

    /// Sets the per-command install timeout on every recipe.
    #[must_use]
    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        for recipe in self.recipes.values_mut() {
            recipe.timeout = timeout;
        }
        self
    }

    /// The run's ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ProvisioningLedger> {
        &self.ledger
    }

    /// The recipe for `capability`, if any.
    #[must_use]
    pub fn recipe(&self, capability: Capability) -> Option<&InstallRecipe> {
        self.recipes.get(&capability)
    }

    fn recipe_or_err(
        &self,
        capability: Capability,
        context: &dyn ExecutionContext,
    ) -> Result<&InstallRecipe, ProvisioningError> {
        self.recipes.get(&capability).ok_or_else(|| {
            ProvisioningError::new(capability, context.name(), "no install recipe is registered")
        })
    }

    /// Makes sure `capability` is present in `context`, installing it if needed.
    #[instrument(skip(self, context, cancel), fields(context = %context.name()))]
    pub async fn ensure(
        &self,
        capability: Capability,
        context: &dyn ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningRecord, ProvisioningError> {
        if let Some(record) = self.recorded(capability, context) {
            debug!(%capability, "Capability already recorded, skipping");
            return Ok(record);
        }

        let recipe = self.recipe_or_err(capability, context)?;
        let lock = self.ledger.lock_for(context.id(), capability);
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(record) = self.recorded(capability, context) {
            return Ok(record);
        }

        if self.run_probe(recipe, context, cancel).await? {
            info!(%capability, "Capability already present");
            return Ok(self.mark(recipe, context, ProvisionSource::Probed));
        }

        info!(%capability, steps = recipe.steps.len(), "Installing capability");
        let env = install_env(recipe);
        let label = format!("provision/{capability}");
        for step in &recipe.steps {
            let outcome = context
                .exec(ExecRequest {
                    label: &label,
                    script: step,
                    env: &env,
                    workdir: None,
                    timeout: recipe.timeout,
                    cancel,
                    quiet: false,
                })
                .await
                .map_err(|e| {
                    ProvisioningError::new(capability, context.name(), e.to_string()).with_command(step.as_str(), None)
                })?;

            match outcome.status {
                ExecStatus::Exited(0) => {}
                ExecStatus::Exited(code) => {
                    let detail = outcome.tail.last().map_or("", String::as_str);
                    warn!(%capability, command = %step, exit_code = code, "Install command failed");
                    return Err(ProvisioningError::new(
                        capability,
                        context.name(),
                        format!("install command exited with code {code}: {detail}"),
                    )
                    .with_command(step.as_str(), Some(code)));
                }
                ExecStatus::TimedOut => {
                    return Err(ProvisioningError::new(
                        capability,
                        context.name(),
                        format!("install command timed out after {}s", recipe.timeout.as_secs()),
                    )
                    .with_command(step.as_str(), None));
                }
                ExecStatus::Cancelled => {
                    return Err(ProvisioningError::new(capability, context.name(), "install cancelled")
                        .with_command(step.as_str(), None));
                }
            }
        }

        if !self.run_probe(recipe, context, cancel).await? {
            return Err(ProvisioningError::new(
                capability,
                context.name(),
                "install finished but the probe still fails",
            )
            .with_command(recipe.probe.as_str(), None));
        }

        info!(%capability, "Capability installed");
        Ok(self.mark(recipe, context, ProvisionSource::Installed))
    }

    /// Checks for `capability` without installing. Records it when present.
    #[instrument(skip(self, context, cancel), fields(context = %context.name()))]
    pub async fn probe(
        &self,
        capability: Capability,
        context: &dyn ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<bool, ProvisioningError> {
        if self.ledger.has(context.id(), capability) {
            return Ok(true);
        }
        let recipe = self.recipe_or_err(capability, context)?;
        let present = self.run_probe(recipe, context, cancel).await?;
        if present {
            self.mark(recipe, context, ProvisionSource::Probed);
        }
        Ok(present)
    }

    fn recorded(&self, capability: Capability, context: &dyn ExecutionContext) -> Option<ProvisioningRecord> {
        self.ledger
            .record(context.id())
            .filter(|record| record.has(capability))
    }

    fn mark(&self, recipe: &InstallRecipe, context: &dyn ExecutionContext, source: ProvisionSource) -> ProvisioningRecord {
        self.ledger.mark(
            context.id(),
            context.name(),
            recipe.capability,
            recipe.fingerprint(),
            source,
        )
    }

    async fn run_probe(
        &self,
        recipe: &InstallRecipe,
        context: &dyn ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<bool, ProvisioningError> {
        let env = install_env(recipe);
        let label = format!("probe/{}", recipe.capability);
        let outcome = context
            .exec(ExecRequest {
                label: &label,
                script: &recipe.probe,
                env: &env,
                workdir: None,
                timeout: PROBE_TIMEOUT,
                cancel,
                quiet: true,
            })
            .await
            .map_err(|e| {
                ProvisioningError::new(recipe.capability, context.name(), e.to_string())
                    .with_command(recipe.probe.as_str(), None)
            })?;

        match outcome.status {
            ExecStatus::Exited(code) => {
                debug!(capability = %recipe.capability, exit_code = code, "Probe finished");
                Ok(code == 0)
            }
            ExecStatus::TimedOut => Err(ProvisioningError::new(
                recipe.capability,
                context.name(),
                format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()),
            )
            .with_command(recipe.probe.as_str(), None)),
            ExecStatus::Cancelled => Err(ProvisioningError::new(recipe.capability, context.name(), "probe cancelled")
                .with_command(recipe.probe.as_str(), None)),
        }
    }
}

fn install_env(recipe: &InstallRecipe) -> StepEnvironment {
    let mut env = StepEnvironment::from_host();
    env.extend(recipe.env.iter().cloned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedContext;

    const PROBE: &str = "odbcinst";

    fn provisioner() -> EnvironmentProvisioner {
        EnvironmentProvisioner::new(Arc::new(ProvisioningLedger::new()))
    }

    #[tokio::test]
    async fn test_installs_once_then_noop() {
        let ctx = ScriptedContext::new("sql-runner").probe_fails_until_installed(PROBE, "msodbcsql17");
        let provisioner = provisioner();
        let cancel = CancellationToken::new();

        let first = provisioner.ensure(Capability::SqlDriver, &ctx, &cancel).await.unwrap();
        assert_eq!(first.entry(Capability::SqlDriver).unwrap().source, ProvisionSource::Installed);
        let after_first = ctx.commands().len();
        assert_eq!(ctx.count_matching("msodbcsql17"), 1);

        let second = provisioner.ensure(Capability::SqlDriver, &ctx, &cancel).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(ctx.commands().len(), after_first);
    }

    #[tokio::test]
    async fn test_install_commands_get_noninteractive_env() {
        let ctx = ScriptedContext::new("sql-runner").probe_fails_until_installed(PROBE, "msodbcsql17");
        provisioner()
            .ensure(Capability::SqlDriver, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        let install = ctx
            .executions()
            .into_iter()
            .find(|e| e.script.contains("msodbcsql17"))
            .unwrap();
        assert_eq!(install.env.get("ACCEPT_EULA"), Some("Y"));
        assert_eq!(install.env.get("DEBIAN_FRONTEND"), Some("noninteractive"));
    }

    #[tokio::test]
    async fn test_present_driver_is_recorded_without_install() {
        let ctx = ScriptedContext::new("sql-runner");
        let record = provisioner()
            .ensure(Capability::SqlDriver, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.entry(Capability::SqlDriver).unwrap().source, ProvisionSource::Probed);
        assert_eq!(ctx.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_install_names_command() {
        let ctx = ScriptedContext::new("sql-runner")
            .fail_when(PROBE, 1)
            .fail_when("apt-get update", 100);
        let err = provisioner()
            .ensure(Capability::SqlDriver, &ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.command.as_deref(), Some("apt-get update"));
        assert_eq!(err.exit_code, Some(100));
        assert_eq!(err.context, "sql-runner");
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded_and_reprobes() {
        let ctx = ScriptedContext::new("sql-runner")
            .fail_when(PROBE, 1)
            .fail_when("apt-get update", 100);
        let provisioner = provisioner();
        let cancel = CancellationToken::new();

        assert!(provisioner.ensure(Capability::SqlDriver, &ctx, &cancel).await.is_err());
        assert!(!provisioner.ledger().has(ctx.id(), Capability::SqlDriver));
        assert!(provisioner.ensure(Capability::SqlDriver, &ctx, &cancel).await.is_err());
        assert_eq!(ctx.count_matching(PROBE), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_installs_once() {
        let ctx = Arc::new(ScriptedContext::new("sql-runner").probe_fails_until_installed(PROBE, "msodbcsql17"));
        let provisioner = Arc::new(provisioner());
        let cancel = Arc::new(CancellationToken::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (ctx, provisioner, cancel) = (ctx.clone(), provisioner.clone(), cancel.clone());
            handles.push(tokio::spawn(async move {
                provisioner.ensure(Capability::SqlDriver, ctx.as_ref(), &cancel).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ctx.count_matching("msodbcsql17"), 1);
    }

    #[tokio::test]
    async fn test_probe_without_install() {
        let ctx = ScriptedContext::new("sql-runner").fail_when(PROBE, 1);
        let provisioner = provisioner();
        let present = provisioner
            .probe(Capability::SqlDriver, &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!present);
        assert_eq!(ctx.count_matching("apt-get"), 0);
    }

    #[tokio::test]
    async fn test_missing_recipe() {
        let ctx = ScriptedContext::new("node");
        let err = provisioner()
            .ensure(Capability::Credentials, &ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("no install recipe"));
    }
}
