//! Run identity for tracking a pipeline execution.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest role-session-name the identity service accepts.
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Identifies one pipeline run.
///
/// The external run/build identifier drives the credential session name;
/// the generated `pipeline_run_id` keeps workspaces distinct even when an
/// identifier is reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// The external run/build identifier (e.g., a build number).
    pub run_id: String,
    /// Unique ID generated for this execution.
    pub pipeline_run_id: Uuid,
    /// Role session name used for the credential exchange.
    pub session_name: String,
}

impl RunIdentity {
    /// Creates a run identity, deriving the session name from `session_prefix` and `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the run id is empty or the
    /// derived session name is too short to be accepted.
    pub fn new(run_id: impl Into<String>, session_prefix: &str) -> Result<Self, ConfigError> {
        let run_id = run_id.into();
        let trimmed = run_id.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::invalid("run_id", "must not be empty"));
        }

        let session_name = derive_session_name(session_prefix, trimmed);
        if session_name.len() < 2 {
            return Err(ConfigError::invalid(
                "session_prefix",
                "derived session name must be at least 2 characters",
            ));
        }

        Ok(Self {
            run_id: trimmed.to_string(),
            pipeline_run_id: Uuid::new_v4(),
            session_name,
        })
    }

    /// Directory name for this run's private workspace.
    #[must_use]
    pub fn workspace_dir_name(&self) -> String {
        let short = self.pipeline_run_id.simple().to_string();
        format!("{}-{}", sanitize_path_component(&self.run_id), &short[..8])
    }

    /// Converts to a JSON value for events and reports.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "pipeline_run_id": self.pipeline_run_id.to_string(),
            "session_name": self.session_name,
        })
    }
}

/// Builds `<prefix>-<run id>` restricted to the role-session-name charset.
///
/// Characters outside `[A-Za-z0-9+=,.@-]` become `-` and the result is
/// truncated to [`MAX_SESSION_NAME_LEN`].
#[must_use]
pub fn derive_session_name(prefix: &str, run_id: &str) -> String {
    let raw = if prefix.is_empty() {
        run_id.to_string()
    } else {
        format!("{prefix}-{run_id}")
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SESSION_NAME_LEN)
        .collect()
}

/// Makes `value` safe to use as a single path component.
#[must_use]
pub fn sanitize_path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_from_build_number() {
        let identity = RunIdentity::new("142", "ciflow").unwrap();
        assert_eq!(identity.session_name, "ciflow-142");
        assert_eq!(identity.run_id, "142");
    }

    #[test]
    fn test_session_name_sanitized_and_truncated() {
        let name = derive_session_name("jenkins", "feature/x y#1");
        assert_eq!(name, "jenkins-feature-x-y-1");

        let long = "9".repeat(100);
        assert_eq!(derive_session_name("p", &long).len(), MAX_SESSION_NAME_LEN);
    }

    #[test]
    fn test_empty_run_id_rejected() {
        assert!(RunIdentity::new("   ", "ciflow").is_err());
        assert!(RunIdentity::new("7", "").is_err());
    }

    #[test]
    fn test_workspace_dir_names_differ_for_same_run_id() {
        let a = RunIdentity::new("5", "ciflow").unwrap();
        let b = RunIdentity::new("5", "ciflow").unwrap();
        assert_eq!(a.session_name, b.session_name);
        assert_ne!(a.workspace_dir_name(), b.workspace_dir_name());
        assert!(a.workspace_dir_name().starts_with("5-"));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("../etc"), ".._etc");
        assert_eq!(sanitize_path_component(".."), "_");
        assert_eq!(sanitize_path_component("test-run-1"), "test-run-1");
    }
}
