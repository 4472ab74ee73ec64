//! Identity service backed by the `aws` command-line client.

use super::service::{AssumeRoleRequest, IdentityService};
use crate::errors::{CredentialError, CredentialErrorReason};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_STDERR_CHARS: usize = 512;

/// Calls `aws sts assume-role` with the ambient base identity.
#[derive(Debug, Clone)]
pub struct AwsCliIdentityService {
    program: String,
}

impl Default for AwsCliIdentityService {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
        }
    }
}

impl AwsCliIdentityService {
    /// Creates a service using the `aws` binary on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different client binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl IdentityService for AwsCliIdentityService {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<String, CredentialError> {
        let duration = request.duration_secs.to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "sts",
            "assume-role",
            "--role-arn",
            &request.role_arn,
            "--role-session-name",
            &request.session_name,
            "--duration-seconds",
            &duration,
            "--region",
            &request.region,
            "--output",
            "json",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        debug!(program = %self.program, session_name = %request.session_name, "Invoking assume-role");

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CredentialError::new(
                    CredentialErrorReason::ServiceUnavailable,
                    format!("'{}' not found on PATH", self.program),
                )
            } else {
                CredentialError::new(CredentialErrorReason::Io, format!("failed to spawn '{}': {e}", self.program))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = classify_stderr(&stderr);
            let message = summarize_stderr(&stderr);
            warn!(reason = %reason, exit_code = ?output.status.code(), "assume-role failed: {}", message);
            return Err(CredentialError::new(reason, message));
        }

        String::from_utf8(output.stdout).map_err(|_| {
            CredentialError::new(CredentialErrorReason::MalformedResponse, "response is not valid UTF-8")
        })
    }
}

/// Maps the client's error output to a failure reason.
#[must_use]
pub fn classify_stderr(stderr: &str) -> CredentialErrorReason {
    let has = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));

    if has(&["AccessDenied", "is not authorized to perform"]) {
        CredentialErrorReason::TrustRejected
    } else if has(&["ExpiredToken", "RequestExpired", "token included in the request is expired"]) {
        CredentialErrorReason::BaseIdentityExpired
    } else if has(&[
        "InvalidClientTokenId",
        "SignatureDoesNotMatch",
        "Unable to locate credentials",
        "ValidationError",
    ]) {
        CredentialErrorReason::MalformedIdentity
    } else {
        CredentialErrorReason::ServiceUnavailable
    }
}

fn summarize_stderr(stderr: &str) -> String {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("identity service returned an error");
    line.chars().take(MAX_STDERR_CHARS).collect()
}
