//! A canned identity service for tests.

use crate::credentials::{AssumeRoleRequest, IdentityService};
use crate::errors::{CredentialError, CredentialErrorReason};
use crate::utils::now_utc;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Mode {
    Issue {
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
    },
    Raw(String),
    Reject(CredentialError),
}

/// Answers every assume-role request the same way and records the requests.
#[derive(Debug)]
pub struct StaticIdentityService {
    mode: Mode,
    expires_in: chrono::Duration,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AssumeRoleRequest>>,
}

impl StaticIdentityService {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            expires_in: chrono::Duration::hours(1),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Issues the given triple, expiring in one hour.
    #[must_use]
    pub fn issuing(access_key_id: &str, secret_access_key: &str, session_token: &str) -> Self {
        Self::with_mode(Mode::Issue {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: session_token.to_string(),
        })
    }

    /// Returns `raw` verbatim as the response body.
    #[must_use]
    pub fn responding(raw: impl Into<String>) -> Self {
        Self::with_mode(Mode::Raw(raw.into()))
    }

    /// Fails every request.
    #[must_use]
    pub fn rejecting(reason: CredentialErrorReason, message: impl Into<String>) -> Self {
        Self::with_mode(Mode::Reject(CredentialError::new(reason, message)))
    }

    /// Sets how long issued credentials stay valid.
    #[must_use]
    pub fn with_expiry(mut self, expires_in: chrono::Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    /// Delays every answer.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<AssumeRoleRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<String, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.mode {
            Mode::Issue {
                access_key_id,
                secret_access_key,
                session_token,
            } => Ok(serde_json::json!({
                "Credentials": {
                    "AccessKeyId": access_key_id,
                    "SecretAccessKey": secret_access_key,
                    "SessionToken": session_token,
                    "Expiration": (now_utc() + self.expires_in).to_rfc3339(),
                },
                "AssumedRoleUser": {
                    "AssumedRoleId": format!("AROATESTROLE:{}", request.session_name),
                    "Arn": format!("{}/{}", request.role_arn, request.session_name),
                },
            })
            .to_string()),
            Mode::Raw(raw) => Ok(raw.clone()),
            Mode::Reject(err) => Err(err.clone()),
        }
    }
}
