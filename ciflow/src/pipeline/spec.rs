//! Stage and step declarations.

use crate::core::Capability;
use crate::errors::ConfigError;
use crate::sandbox::ContextSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// One shell command within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the stage.
    pub name: String,
    /// Shell command line.
    pub run: String,
    /// Overrides the default step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extra environment for this step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the checkout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl StepSpec {
    /// Creates a step.
    #[must_use]
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            timeout_secs: None,
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    /// Sets the step timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// The effective timeout.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_secs.map_or(default, Duration::from_secs)
    }
}

/// An ordered group of steps run in one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, unique within the plan.
    pub name: String,
    /// Name of the execution context the stage runs in.
    pub context: String,
    /// Steps in order.
    pub steps: Vec<StepSpec>,
    /// Capabilities needed before the first step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Capability>,
    /// Whether the stage produces structured test results.
    #[serde(default)]
    pub collect_results: bool,
    /// Environment shared by all steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl StageSpec {
    /// Creates a stage with no steps.
    #[must_use]
    pub fn new(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
            steps: Vec::new(),
            requires: Vec::new(),
            collect_results: false,
            env: BTreeMap::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, run: impl Into<String>) -> Self {
        self.steps.push(StepSpec::new(name, run));
        self
    }

    /// Appends a fully built step.
    #[must_use]
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a required capability.
    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.requires.contains(&capability) {
            self.requires.push(capability);
        }
        self
    }

    /// Marks the stage as producing test results.
    #[must_use]
    pub fn with_results(mut self) -> Self {
        self.collect_results = true;
        self
    }

    /// Adds a stage-wide environment entry.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Returns true if the stage declared `capability`.
    #[must_use]
    pub fn needs(&self, capability: Capability) -> bool {
        self.requires.contains(&capability)
    }
}

/// Execution contexts plus the ordered stages that use them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Named execution contexts.
    pub contexts: Vec<ContextSpec>,
    /// Stages in execution order.
    pub stages: Vec<StageSpec>,
}

impl PipelinePlan {
    /// Names of all stages in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Checks names, references and step lists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::invalid("stages", "at least one stage is required"));
        }

        let mut contexts = HashSet::new();
        for ctx in &self.contexts {
            if ctx.name.trim().is_empty() {
                return Err(ConfigError::invalid("contexts.name", "must not be empty"));
            }
            if !contexts.insert(ctx.name.as_str()) {
                return Err(ConfigError::invalid(
                    "contexts.name",
                    format!("duplicate context '{}'", ctx.name),
                ));
            }
        }

        let mut stages = HashSet::new();
        for stage in &self.stages {
            let field = format!("stages.{}", stage.name);
            if stage.name.trim().is_empty() {
                return Err(ConfigError::invalid("stages.name", "must not be empty"));
            }
            if !stages.insert(stage.name.as_str()) {
                return Err(ConfigError::invalid(field, "duplicate stage name"));
            }
            if !contexts.contains(stage.context.as_str()) {
                return Err(ConfigError::invalid(
                    format!("{field}.context"),
                    format!("unknown context '{}'", stage.context),
                ));
            }
            if stage.steps.is_empty() {
                return Err(ConfigError::invalid(format!("{field}.steps"), "at least one step is required"));
            }
            for step in &stage.steps {
                if step.run.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        format!("{field}.steps.{}", step.name),
                        "command must not be empty",
                    ));
                }
                if step.timeout_secs == Some(0) {
                    return Err(ConfigError::invalid(
                        format!("{field}.steps.{}.timeout_secs", step.name),
                        "must be positive",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PipelinePlan {
        PipelinePlan {
            contexts: vec![ContextSpec::local("node")],
            stages: vec![StageSpec::new("build", "node").step("compile", "make")],
        }
    }

    #[test]
    fn test_valid_plan() {
        assert!(plan().validate().is_ok());
        assert_eq!(plan().stage_names(), vec!["build"]);
    }

    #[test]
    fn test_unknown_context_rejected() {
        let mut p = plan();
        p.stages.push(StageSpec::new("test", "tester").step("run", "true"));
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("unknown context 'tester'"));
    }

    #[test]
    fn test_duplicate_stage_and_empty_steps_rejected() {
        let mut p = plan();
        p.stages.push(StageSpec::new("build", "node").step("again", "true"));
        assert!(p.validate().is_err());

        let mut p = plan();
        p.stages.push(StageSpec::new("empty", "node"));
        assert!(p.validate().unwrap_err().to_string().contains("at least one step"));
    }

    #[test]
    fn test_stage_from_toml() {
        let stage: StageSpec = toml::from_str(
            r#"
            name = "sql-test"
            context = "sql-runner"
            requires = ["sql-driver"]
            [[steps]]
            name = "run"
            run = "python3 tests/run_sql_test.py"
            timeout_secs = 120
            "#,
        )
        .unwrap();
        assert!(stage.needs(Capability::SqlDriver));
        assert!(!stage.collect_results);
        assert_eq!(stage.steps[0].timeout_or(Duration::from_secs(5)), Duration::from_secs(120));
    }

    #[test]
    fn test_requires_is_deduplicated() {
        let stage = StageSpec::new("s", "c")
            .requires(Capability::Credentials)
            .requires(Capability::Credentials);
        assert_eq!(stage.requires.len(), 1);
    }
}
