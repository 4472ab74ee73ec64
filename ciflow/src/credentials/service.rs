//! The identity-service seam and its response format.

use crate::errors::CredentialError;
use async_trait::async_trait;
use serde::Deserialize;

/// One role-assumption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    /// Role ARN to assume.
    pub role_arn: String,
    /// Role session name, unique per run.
    pub session_name: String,
    /// Region for the exchange and the issued session.
    pub region: String,
    /// Requested validity window.
    pub duration_secs: u32,
}

/// Exchanges the base identity for scoped credentials.
///
/// Implementations return the raw JSON response body; the broker persists
/// and parses it.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Performs the exchange.
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<String, CredentialError>;
}

/// `sts assume-role` response body.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AssumeRoleOutput {
    pub credentials: IssuedCredentials,
    #[serde(default)]
    pub assumed_role_user: Option<AssumedRoleUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct IssuedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AssumedRoleUser {
    #[serde(default)]
    pub arn: String,
}
