//! Layered configuration.
//!
//! Values are read from `ciflow.toml`, then overridden by environment
//! variables, then by command-line flags. Each environment variable has a
//! `CIFLOW_*` name and, where a CI server already exports an equivalent,
//! a fallback name:
//!
//! | Setting | Variable | Fallback |
//! |---|---|---|
//! | workspace | `CIFLOW_WORKSPACE` | `WORKSPACE` |
//! | run id | `CIFLOW_RUN_ID` | `BUILD_NUMBER` |
//! | target identity | `CIFLOW_TARGET_IDENTITY` | `TARGET_ROLE_ARN` |
//! | region | `CIFLOW_REGION` | `AWS_REGION` |
//! | require credentials | `CIFLOW_REQUIRE_CREDENTIALS` | |
//! | install driver | `CIFLOW_INSTALL_DRIVER` | |
//! | preset | `CIFLOW_PRESET` | |

use crate::credentials::{validate_target_identity, MAX_DURATION_SECS, MIN_DURATION_SECS};
use crate::errors::ConfigError;
use crate::pipeline::{
    PipelinePlan, Preset, PresetOptions, RunOptions, StageSpec, DEFAULT_IMAGE, DEFAULT_REGION,
    DEFAULT_SESSION_PREFIX,
};
use crate::sandbox::ContextSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file name, looked up in the workspace.
pub const DEFAULT_CONFIG_FILE: &str = "ciflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run/build id. Normally supplied by the CI server.
    pub run_id: Option<String>,
    /// Repository checkout.
    pub workspace: Option<PathBuf>,
    /// Stage plan preset.
    pub preset: Preset,
    /// Image for container contexts.
    pub image: String,
    /// Prefix of derived session names.
    pub session_prefix: String,
    /// Acquire a credential session for the run.
    pub require_credentials: bool,
    /// Role to assume.
    pub target_identity: Option<String>,
    /// Region for the credential environment.
    pub region: String,
    /// Install the SQL driver when missing.
    pub install_driver: bool,
    /// Where to publish the report.
    pub report_dir: Option<PathBuf>,
    /// Leave the run workspace on disk after the run.
    pub keep_workspace: bool,
    /// Time bounds.
    pub timeouts: TimeoutConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Contexts for a custom plan. Empty means the preset's contexts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextSpec>,
    /// Stages for a custom plan. Empty means the preset's stages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            workspace: None,
            preset: Preset::default(),
            image: DEFAULT_IMAGE.to_string(),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            require_credentials: false,
            target_identity: None,
            region: DEFAULT_REGION.to_string(),
            install_driver: true,
            report_dir: None,
            keep_workspace: false,
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            contexts: Vec::new(),
            stages: Vec::new(),
        }
    }
}

/// Time bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-step timeout.
    pub step_secs: u64,
    /// Driver install timeout.
    pub install_secs: u64,
    /// Credential acquisition timeout.
    pub acquire_secs: u64,
    /// Whole cleanup pass.
    pub cleanup_secs: u64,
    /// Requested credential session lifetime.
    pub credential_duration_secs: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_secs: 1800,
            install_secs: 600,
            acquire_secs: 60,
            cleanup_secs: 120,
            credential_duration_secs: 3600,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `ciflow=debug`.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Loads `path`, applies environment overrides and validates.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise starts from defaults.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::from_file(path).await {
            Ok(config) => Ok(config),
            Err(ConfigError::FileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Reads and parses `path` without overrides.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::ParseFailed {
                    reason: format!("reading {}: {e}", path.display()),
                }
            }
        })?;
        Self::parse(&content)
    }

    /// Parses TOML.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Applies `CIFLOW_*` variables and their CI fallbacks.
    ///
    /// Values that are set but cannot be parsed are errors, not ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_opt_path(&mut self.workspace, &["CIFLOW_WORKSPACE", "WORKSPACE"]);
        override_opt_string(&mut self.run_id, &["CIFLOW_RUN_ID", "BUILD_NUMBER"]);
        override_opt_string(&mut self.target_identity, &["CIFLOW_TARGET_IDENTITY", "TARGET_ROLE_ARN"]);
        override_string(&mut self.region, &["CIFLOW_REGION", "AWS_REGION"]);
        override_bool(&mut self.require_credentials, "CIFLOW_REQUIRE_CREDENTIALS")?;
        override_bool(&mut self.install_driver, "CIFLOW_INSTALL_DRIVER")?;
        override_parsed(&mut self.preset, "CIFLOW_PRESET")?;
        override_string(&mut self.image, &["CIFLOW_IMAGE"]);
        override_opt_path(&mut self.report_dir, &["CIFLOW_REPORT_DIR"]);
        override_string(&mut self.logging.level, &["CIFLOW_LOG_LEVEL"]);
        override_string(&mut self.logging.format, &["CIFLOW_LOG_FORMAT"]);
        Ok(())
    }

    /// Checks values and the resulting plan.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::invalid("region", "must not be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(ConfigError::invalid("image", "must not be empty"));
        }
        if self.require_credentials {
            let target = self
                .target_identity
                .as_deref()
                .ok_or_else(|| ConfigError::invalid("target_identity", "required when require_credentials is set"))?;
            validate_target_identity(target).map_err(|e| ConfigError::invalid("target_identity", e.message))?;
        }

        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.step_secs", t.step_secs),
            ("timeouts.install_secs", t.install_secs),
            ("timeouts.acquire_secs", t.acquire_secs),
            ("timeouts.cleanup_secs", t.cleanup_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&t.credential_duration_secs) {
            return Err(ConfigError::invalid(
                "timeouts.credential_duration_secs",
                format!("must be between {MIN_DURATION_SECS} and {MAX_DURATION_SECS}"),
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("unknown format '{}', expected 'json' or 'pretty'", self.logging.format),
            ));
        }

        self.plan().validate()
    }

    /// The stage plan: custom stages if any were configured, else the preset.
    #[must_use]
    pub fn plan(&self) -> PipelinePlan {
        let preset = self.preset.plan(&PresetOptions {
            require_credentials: self.require_credentials,
            image: self.image.clone(),
        });
        if self.stages.is_empty() {
            return preset;
        }
        PipelinePlan {
            contexts: if self.contexts.is_empty() {
                preset.contexts
            } else {
                self.contexts.clone()
            },
            stages: self.stages.clone(),
        }
    }

    /// Resolves everything a run needs.
    pub fn run_options(&self) -> Result<RunOptions, ConfigError> {
        let run_id = self
            .run_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ConfigError::invalid("run_id", "set --run-id, CIFLOW_RUN_ID or BUILD_NUMBER"))?;
        let checkout = self.workspace.clone().unwrap_or_else(|| PathBuf::from("."));

        let mut options = RunOptions::new(run_id, checkout);
        options.session_prefix.clone_from(&self.session_prefix);
        options.require_credentials = self.require_credentials;
        options.target_identity.clone_from(&self.target_identity);
        options.region.clone_from(&self.region);
        options.install_driver = self.install_driver;
        options.credential_duration_secs = self.timeouts.credential_duration_secs;
        options.acquire_timeout = Duration::from_secs(self.timeouts.acquire_secs);
        options.default_step_timeout = Duration::from_secs(self.timeouts.step_secs);
        options.install_timeout = Duration::from_secs(self.timeouts.install_secs);
        options.cleanup_timeout = Duration::from_secs(self.timeouts.cleanup_secs);
        options.report_dir.clone_from(&self.report_dir);
        options.keep_workspace = self.keep_workspace;
        options.validate()?;
        Ok(options)
    }
}

fn env_value(keys: &[&str]) -> Option<(String, String)> {
    keys.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| ((*key).to_string(), v))
    })
}

fn override_string(target: &mut String, keys: &[&str]) {
    if let Some((_, val)) = env_value(keys) {
        *target = val;
    }
}

fn override_opt_string(target: &mut Option<String>, keys: &[&str]) {
    if let Some((_, val)) = env_value(keys) {
        *target = Some(val);
    }
}

fn override_opt_path(target: &mut Option<PathBuf>, keys: &[&str]) {
    if let Some((_, val)) = env_value(keys) {
        *target = Some(PathBuf::from(val));
    }
}

fn override_parsed<T>(target: &mut T, key: &str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some((key, val)) = env_value(&[key]) {
        *target = val
            .trim()
            .to_ascii_lowercase()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, e.to_string()))?;
    }
    Ok(())
}

fn override_bool(target: &mut bool, key: &str) -> Result<(), ConfigError> {
    if let Some((key, val)) = env_value(&[key]) {
        *target = parse_flag(&val).ok_or_else(|| {
            ConfigError::invalid(key, format!("'{val}' is not a boolean (true/false, 1/0, yes/no, on/off)"))
        })?;
    }
    Ok(())
}

/// Accepts the boolean spellings CI systems commonly export.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Capability;
    use serial_test::serial;

    const ROLE: &str = "arn:aws:iam::123456789012:role/ci-runner";

    const ENV_KEYS: &[&str] = &[
        "CIFLOW_WORKSPACE",
        "WORKSPACE",
        "CIFLOW_RUN_ID",
        "BUILD_NUMBER",
        "CIFLOW_TARGET_IDENTITY",
        "TARGET_ROLE_ARN",
        "CIFLOW_REGION",
        "AWS_REGION",
        "CIFLOW_REQUIRE_CREDENTIALS",
        "CIFLOW_INSTALL_DRIVER",
        "CIFLOW_PRESET",
        "CIFLOW_IMAGE",
        "CIFLOW_REPORT_DIR",
        "CIFLOW_LOG_LEVEL",
        "CIFLOW_LOG_FORMAT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.preset, Preset::MultiContainer);
        assert!(config.install_driver);
        assert_eq!(config.plan().stages.len(), 5);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        assert_eq!(PipelineConfig::parse("").unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::parse(
            r#"
            preset = "single-node"
            require_credentials = true
            target_identity = "arn:aws:iam::123456789012:role/ci-runner"

            [timeouts]
            step_secs = 60
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.timeouts.step_secs, 60);
        assert_eq!(config.timeouts.cleanup_secs, 120);
        assert_eq!(config.plan().stages[1].name, "verify-access");
    }

    #[test]
    fn test_custom_stages_replace_preset() {
        let config = PipelineConfig::parse(
            r#"
            [[contexts]]
            name = "box"
            kind = "local"

            [[stages]]
            name = "sql-test"
            context = "box"
            requires = ["sql-driver"]
            [[stages.steps]]
            name = "run"
            run = "python3 tests/run_sql_test.py"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let plan = config.plan();
        assert_eq!(plan.stage_names(), vec!["sql-test"]);
        assert_eq!(plan.contexts, vec![ContextSpec::local("box")]);
        assert!(plan.stages[0].needs(Capability::SqlDriver));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = PipelineConfig {
            require_credentials: true,
            ..PipelineConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("target_identity"));

        config.target_identity = Some("not-an-arn".into());
        assert!(config.validate().is_err());

        config.target_identity = Some(ROLE.into());
        config.timeouts.credential_duration_secs = 60;
        assert!(config.validate().unwrap_err().to_string().contains("credential_duration_secs"));

        let config = PipelineConfig {
            logging: LoggingConfig {
                format: "xml".into(),
                ..LoggingConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PipelineConfig::parse("preset = 3").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_with_fallbacks() {
        clear_env();
        std::env::set_var("BUILD_NUMBER", "88");
        std::env::set_var("WORKSPACE", "/var/ci/job");
        std::env::set_var("TARGET_ROLE_ARN", ROLE);
        std::env::set_var("CIFLOW_REQUIRE_CREDENTIALS", "true");
        std::env::set_var("CIFLOW_INSTALL_DRIVER", "false");
        std::env::set_var("CIFLOW_PRESET", "single-node");
        std::env::set_var("AWS_REGION", "eu-west-1");

        let mut config = PipelineConfig::default();
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.run_id.as_deref(), Some("88"));
        assert_eq!(config.workspace, Some(PathBuf::from("/var/ci/job")));
        assert_eq!(config.target_identity.as_deref(), Some(ROLE));
        assert!(config.require_credentials);
        assert!(!config.install_driver);
        assert_eq!(config.preset, Preset::SingleNode);
        assert_eq!(config.region, "eu-west-1");
    }

    #[test]
    #[serial]
    fn test_primary_env_wins() {
        clear_env();
        std::env::set_var("CIFLOW_RUN_ID", "primary");
        std::env::set_var("BUILD_NUMBER", "fallback");

        let mut config = PipelineConfig::default();
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.run_id.as_deref(), Some("primary"));
    }

    #[test]
    #[serial]
    fn test_numeric_flag_requires_credentials() {
        clear_env();
        std::env::set_var("CIFLOW_REQUIRE_CREDENTIALS", "1");
        std::env::set_var("CIFLOW_TARGET_IDENTITY", ROLE);
        std::env::set_var("CIFLOW_INSTALL_DRIVER", "off");

        let mut config = PipelineConfig::default();
        let applied = config.apply_env_overrides();
        clear_env();

        applied.unwrap();
        assert!(config.require_credentials);
        assert!(!config.install_driver);
        config.validate().unwrap();
        assert!(config.plan().stages.iter().any(|s| s.needs(Capability::Credentials)));
    }

    #[test]
    #[serial]
    fn test_unparseable_env_values_are_errors() {
        clear_env();
        std::env::set_var("CIFLOW_INSTALL_DRIVER", "maybe");
        let mut config = PipelineConfig::default();
        let err = config.apply_env_overrides().unwrap_err();
        clear_env();
        assert!(err.to_string().contains("CIFLOW_INSTALL_DRIVER"));
        assert!(config.install_driver);

        std::env::set_var("CIFLOW_PRESET", "cluster");
        let err = PipelineConfig::default().apply_env_overrides().unwrap_err();
        clear_env();
        assert!(err.to_string().contains("CIFLOW_PRESET"));
    }

    #[test]
    fn test_parse_flag_spellings() {
        for raw in ["true", "1", "YES", " on "] {
            assert_eq!(parse_flag(raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "no", "Off"] {
            assert_eq!(parse_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_flag("2"), None);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_file_and_missing_file() {
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "run_id = \"12\"\ninstall_driver = false\n").unwrap();

        let config = PipelineConfig::load(&path).await.unwrap();
        let options = config.run_options().unwrap();
        assert_eq!(options.run_id, "12");
        assert!(!options.install_driver);
        assert_eq!(options.checkout, PathBuf::from("."));

        let missing = tmp.path().join("absent.toml");
        assert!(matches!(
            PipelineConfig::load(&missing).await,
            Err(ConfigError::FileNotFound { .. })
        ));
        assert_eq!(
            PipelineConfig::load_or_default(&missing).await.unwrap(),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_run_options_need_run_id() {
        let err = PipelineConfig::default().run_options().unwrap_err();
        assert!(err.to_string().contains("run_id"));
    }
}
