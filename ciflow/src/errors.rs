//! Error types for ciflow.
//!
//! The taxonomy separates fatal failures (credential acquisition, driver
//! provisioning, missing credentials, failed steps) from the non-fatal
//! [`CleanupWarning`], which is only ever logged and reported.

use crate::core::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code used when a fatal error carries no step exit code of its own.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code used for configuration and usage errors.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code used when the run was cancelled (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// The main error type for ciflow operations.
#[derive(Debug, Error)]
pub enum CiflowError {
    /// Credential acquisition or authorization failed.
    #[error("{0}")]
    Credential(#[from] CredentialError),

    /// A dependency install in an execution context failed.
    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    /// A stage required credentials that were never established or expired.
    #[error("{0}")]
    MissingCredential(#[from] MissingCredentialError),

    /// A step returned non-success.
    #[error("{0}")]
    Step(#[from] StepFailure),

    /// Invalid or unreadable configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An execution context could not run a command at all.
    #[error("Execution context '{context}' error: {message}")]
    Context {
        /// The context name.
        context: String,
        /// What went wrong.
        message: String,
    },

    /// The run was cancelled by the invoker.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiflowError {
    /// Creates a context error.
    #[must_use]
    pub fn context(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Returns the process exit code this error maps to.
    ///
    /// A failing step's own exit code is passed through unchanged.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Step(failure) => failure.exit_code.filter(|c| *c != 0).unwrap_or(EXIT_FAILURE),
            Self::Config(_) => EXIT_CONFIG,
            Self::Cancelled(_) => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }

    /// Returns a short machine-readable kind for events and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "credential_error",
            Self::Provisioning(_) => "provisioning_error",
            Self::MissingCredential(_) => "missing_credential_error",
            Self::Step(_) => "step_failure",
            Self::Config(_) => "config_error",
            Self::Context { .. } => "context_error",
            Self::Cancelled(_) => "cancelled",
            Self::Io(_) => "io_error",
        }
    }
}

/// Why a credential acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialErrorReason {
    /// The base identity is not trusted to assume the target identity.
    TrustRejected,
    /// The identity service could not be reached.
    ServiceUnavailable,
    /// The base identity's own credentials have expired.
    BaseIdentityExpired,
    /// The target identity or base identity is malformed.
    MalformedIdentity,
    /// The identity service answered with something unparseable.
    MalformedResponse,
    /// The exchange did not finish within its time bound.
    Timeout,
    /// Writing or reading the credential artifact failed.
    Io,
}

impl CredentialErrorReason {
    /// Returns the stable reason code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TrustRejected => "CRED-TRUST-REJECTED",
            Self::ServiceUnavailable => "CRED-SERVICE-UNAVAILABLE",
            Self::BaseIdentityExpired => "CRED-BASE-EXPIRED",
            Self::MalformedIdentity => "CRED-MALFORMED-IDENTITY",
            Self::MalformedResponse => "CRED-MALFORMED-RESPONSE",
            Self::Timeout => "CRED-TIMEOUT",
            Self::Io => "CRED-IO",
        }
    }
}

impl fmt::Display for CredentialErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error raised when a scoped credential session cannot be established.
///
/// Messages never contain secret material.
#[derive(Debug, Clone, Error)]
#[error("Credential error [{reason}]: {message}")]
pub struct CredentialError {
    /// The reason code.
    pub reason: CredentialErrorReason,
    /// Human readable detail.
    pub message: String,
}

impl CredentialError {
    /// Creates a new credential error.
    #[must_use]
    pub fn new(reason: CredentialErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Error raised when installing a capability into an execution context fails.
#[derive(Debug, Clone, Error)]
#[error("Provisioning of '{capability}' in context '{context}' failed: {message}")]
pub struct ProvisioningError {
    /// The capability being provisioned.
    pub capability: Capability,
    /// The execution context name.
    pub context: String,
    /// The command that failed, if any.
    pub command: Option<String>,
    /// Exit code of the failed command, if it exited.
    pub exit_code: Option<i32>,
    /// Human readable detail.
    pub message: String,
}

impl ProvisioningError {
    /// Creates a new provisioning error.
    #[must_use]
    pub fn new(capability: Capability, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            capability,
            context: context.into(),
            command: None,
            exit_code: None,
            message: message.into(),
        }
    }

    /// Records the failing command and its exit code.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, exit_code: Option<i32>) -> Self {
        self.command = Some(command.into());
        self.exit_code = exit_code;
        self
    }
}

/// Error raised when a stage needs credentials and no live session exists.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' requires credentials but {}", missing_reason(.expired))]
pub struct MissingCredentialError {
    /// The stage that declared the requirement.
    pub stage: String,
    /// True when a session existed but is past its expiry.
    pub expired: bool,
}

fn missing_reason(expired: &bool) -> &'static str {
    if *expired {
        "the session has expired"
    } else {
        "none were established"
    }
}

/// A step returned a non-success status.
#[derive(Debug, Clone, Error)]
#[error("Step '{step}' in stage '{stage}' failed: {message}")]
pub struct StepFailure {
    /// The stage name.
    pub stage: String,
    /// The step name.
    pub step: String,
    /// The exit code, if the process exited on its own.
    pub exit_code: Option<i32>,
    /// True when the step hit its time bound.
    pub timed_out: bool,
    /// Human readable detail.
    pub message: String,
}

impl StepFailure {
    /// A step that exited with a non-zero code.
    #[must_use]
    pub fn exited(stage: impl Into<String>, step: impl Into<String>, code: i32) -> Self {
        Self {
            stage: stage.into(),
            step: step.into(),
            exit_code: Some(code),
            timed_out: false,
            message: format!("exited with code {code}"),
        }
    }

    /// A step that was killed after exceeding its timeout.
    #[must_use]
    pub fn timed_out(stage: impl Into<String>, step: impl Into<String>, after_secs: u64) -> Self {
        Self {
            stage: stage.into(),
            step: step.into(),
            exit_code: None,
            timed_out: true,
            message: format!("timed out after {after_secs}s"),
        }
    }
}

/// A best-effort cleanup task that failed. Never changes a run's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Cleanup warning in '{task}': {message}")]
pub struct CleanupWarning {
    /// The cleanup task name.
    pub task: String,
    /// Human readable detail.
    pub message: String,
}

impl CleanupWarning {
    /// Creates a new cleanup warning.
    #[must_use]
    pub fn new(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            message: message.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Config file not found: {}", path.display())]
    FileNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse config: {reason}")]
    ParseFailed {
        /// Parser message.
        reason: String,
    },

    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted field name.
        field: String,
        /// Why it is invalid.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when publishing a consolidated report fails.
#[derive(Debug, Error)]
#[error("Failed to publish report to {}: {message}", destination.display())]
pub struct PublishError {
    /// The destination that could not be written.
    pub destination: PathBuf,
    /// Human readable detail.
    pub message: String,
}
