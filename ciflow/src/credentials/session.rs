//! The scoped credential session handed to stages.

use crate::utils::{now_utc, Timestamp};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable names injected into credential-requiring steps.
pub const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY_ID";
/// Secret key variable.
pub const SECRET_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
/// Session token variable.
pub const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";
/// Region variables, both spellings.
pub const REGION_VARS: [&str; 2] = ["AWS_DEFAULT_REGION", "AWS_REGION"];

/// Ambient identity variables that would override the scoped session.
pub const AMBIENT_IDENTITY_VARS: [&str; 4] = [
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_ROLE_ARN",
    "AWS_ROLE_SESSION_NAME",
    "AWS_PROFILE",
];

/// The issued key/secret/token triple.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key_id", &redact_key_id(&self.access_key_id))
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Keeps the first four characters of a key id, which identify its type.
fn redact_key_id(key_id: &str) -> String {
    let prefix: String = key_id.chars().take(4).collect();
    format!("{prefix}****")
}

/// A live, time-limited credential set tied to one run.
///
/// Created only by the [`CredentialBroker`](super::CredentialBroker) and
/// shared as `Arc<CredentialSession>`; nothing mutates it after creation.
#[derive(Clone)]
pub struct CredentialSession {
    target_identity: String,
    session_name: String,
    region: String,
    credentials: CredentialSet,
    expires_at: Timestamp,
    created_at: Timestamp,
    artifact_path: PathBuf,
    response_path: PathBuf,
}

impl CredentialSession {
    /// Assembles a session. Used by the broker once the artifact is on disk.
    #[must_use]
    pub(crate) fn new(
        target_identity: String,
        session_name: String,
        region: String,
        credentials: CredentialSet,
        expires_at: Timestamp,
        artifact_path: PathBuf,
        response_path: PathBuf,
    ) -> Self {
        Self {
            target_identity,
            session_name,
            region,
            credentials,
            expires_at,
            created_at: now_utc(),
            artifact_path,
            response_path,
        }
    }

    /// The role that was assumed.
    #[must_use]
    pub fn target_identity(&self) -> &str {
        &self.target_identity
    }

    /// The role session name.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// The region the session is scoped to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The issued triple.
    #[must_use]
    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// When the credentials stop working.
    #[must_use]
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// When the session was established.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Path of the shell-sourceable credential artifact.
    #[must_use]
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Path of the raw identity-service response.
    #[must_use]
    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    /// Returns true once the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_utc())
    }

    /// Returns true if the session is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for CredentialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSession")
            .field("target_identity", &self.target_identity)
            .field("session_name", &self.session_name)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("expires_at", &self.expires_at)
            .field("artifact_path", &self.artifact_path)
            .finish_non_exhaustive()
    }
}
