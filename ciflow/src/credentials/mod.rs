//! Scoped, time-limited cloud credentials for one run.
//!
//! - [`CredentialBroker`] exchanges the base identity for a session and
//!   writes the shell-sourceable artifact
//! - [`CredentialSession`] is the immutable result, shared by `Arc`
//! - [`IdentityService`] is the seam to the cloud identity service

mod broker;
pub mod envfile;
mod service;
mod session;
mod sts;

pub use broker::{
    artifact_paths, validate_target_identity, CredentialBroker, DEFAULT_ACQUIRE_TIMEOUT,
    DEFAULT_DURATION_SECS, MAX_DURATION_SECS, MIN_DURATION_SECS,
};
pub use envfile::{CredentialEnv, EnvFileError, CREDENTIAL_FILE_NAME, RESPONSE_FILE_NAME};
pub use service::{AssumeRoleRequest, IdentityService};
pub use session::{
    CredentialSession, CredentialSet, ACCESS_KEY_VAR, AMBIENT_IDENTITY_VARS, REGION_VARS,
    SECRET_KEY_VAR, SESSION_TOKEN_VAR,
};
pub use sts::{classify_stderr, AwsCliIdentityService};
