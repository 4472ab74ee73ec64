//! Built-in pipeline variants.
//!
//! Both presets run the same stage sequence; they differ only in where the
//! stages run. `multi-container` gives build, test and SQL stages their own
//! containers; `single-node` runs everything as host processes.

use super::spec::{PipelinePlan, StageSpec};
use crate::core::Capability;
use crate::sandbox::ContextSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default image for container contexts.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Where dependencies are installed inside the checkout.
const DEPS_DIR: &str = ".ciflow/deps";

/// A named pipeline variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Every stage on the host.
    SingleNode,
    /// One container per role.
    #[default]
    MultiContainer,
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleNode => write!(f, "single-node"),
            Self::MultiContainer => write!(f, "multi-container"),
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-node" => Ok(Self::SingleNode),
            "multi-container" => Ok(Self::MultiContainer),
            other => Err(format!(
                "unknown preset '{other}' (expected 'single-node' or 'multi-container')"
            )),
        }
    }
}

/// Knobs shared by every preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetOptions {
    /// Adds the access check and makes test stages require credentials.
    pub require_credentials: bool,
    /// Image for container contexts.
    pub image: String,
}

impl Default for PresetOptions {
    fn default() -> Self {
        Self {
            require_credentials: false,
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

impl Preset {
    /// Builds the plan for this preset.
    #[must_use]
    pub fn plan(self, options: &PresetOptions) -> PipelinePlan {
        let (contexts, builder, tester, sql) = match self {
            Self::SingleNode => (vec![ContextSpec::local("node")], "node", "node", "node"),
            Self::MultiContainer => (
                vec![
                    ContextSpec::container("builder", &options.image),
                    ContextSpec::container("tester", &options.image),
                    ContextSpec::container("sql-runner", &options.image),
                ],
                "builder",
                "tester",
                "sql-runner",
            ),
        };

        let mut stages = vec![StageSpec::new("build", builder)
            .step(
                "install-dependencies",
                format!("python3 -m pip install --no-cache-dir --target {DEPS_DIR} -r requirements.txt"),
            )
            .step("compile", "python3 -m compileall -q -x '/\\.ciflow/' .")];

        if options.require_credentials {
            stages.push(
                python_stage("verify-access", tester)
                    .requires(Capability::Credentials)
                    .step(
                        "caller-identity",
                        "python3 -c \"import boto3; print(boto3.client('sts').get_caller_identity()['Arn'])\"",
                    ),
            );
        }

        let tests = [
            ("test-run-1", "python3 tests/test_run_1.py"),
            ("test-run-3", "python3 tests/test_run_3.py"),
            (
                "test-etl-allure",
                "python3 -m pytest tests/test_etl_allure.py --alluredir \"$CIFLOW_RESULTS_DIR\"",
            ),
        ];
        for (name, command) in tests {
            let mut stage = python_stage(name, tester).with_results().step("run", command);
            if options.require_credentials {
                stage = stage.requires(Capability::Credentials);
            }
            stages.push(stage);
        }

        stages.push(
            python_stage("sql-test", sql)
                .requires(Capability::SqlDriver)
                .step("run", "python3 tests/run_sql_test.py"),
        );

        PipelinePlan { contexts, stages }
    }
}

fn python_stage(name: &str, context: &str) -> StageSpec {
    StageSpec::new(name, context).with_env("PYTHONPATH", DEPS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ContextKind;

    #[test]
    fn test_default_is_multi_container() {
        assert_eq!(Preset::default(), Preset::MultiContainer);
        assert_eq!("single-node".parse::<Preset>().unwrap(), Preset::SingleNode);
        assert!("three-node".parse::<Preset>().is_err());
    }

    #[test]
    fn test_stage_order_without_credentials() {
        let plan = Preset::MultiContainer.plan(&PresetOptions::default());
        assert_eq!(
            plan.stage_names(),
            vec!["build", "test-run-1", "test-run-3", "test-etl-allure", "sql-test"]
        );
        assert!(plan.validate().is_ok());
        assert!(plan.stages.iter().all(|s| !s.needs(Capability::Credentials)));
        assert!(plan.stages[4].needs(Capability::SqlDriver));
        assert_eq!(plan.contexts.len(), 3);
        assert!(matches!(plan.contexts[0].kind, ContextKind::Container { ref image } if image == DEFAULT_IMAGE));
    }

    #[test]
    fn test_credentials_add_verify_stage() {
        let options = PresetOptions {
            require_credentials: true,
            ..PresetOptions::default()
        };
        let plan = Preset::SingleNode.plan(&options);
        assert_eq!(plan.stages[1].name, "verify-access");
        assert!(plan.stages[1].needs(Capability::Credentials));
        assert!(plan.stages[2].needs(Capability::Credentials));
        assert!(!plan.stages[0].needs(Capability::Credentials));
        assert_eq!(plan.contexts, vec![ContextSpec::local("node")]);
        assert!(plan.validate().is_ok());
    }
}
