//! Credential broker: acquire, load and release scoped sessions.

use super::envfile::{self, CredentialEnv, CREDENTIAL_FILE_NAME, RESPONSE_FILE_NAME};
use super::service::{AssumeRoleOutput, AssumeRoleRequest, IdentityService};
use super::session::{CredentialSession, CredentialSet};
use crate::context::MAX_SESSION_NAME_LEN;
use crate::errors::{CredentialError, CredentialErrorReason};
use crate::utils::{create_private_dir, now_utc, parse_timestamp, remove_file_if_exists, write_private_file};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest validity window the identity service issues.
pub const MIN_DURATION_SECS: u32 = 900;
/// Longest validity window the identity service issues.
pub const MAX_DURATION_SECS: u32 = 43_200;
/// Validity window used when none is configured.
pub const DEFAULT_DURATION_SECS: u32 = 3_600;
/// Bound on a single exchange.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

static ROLE_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/[\w+=,.@/-]+$").expect("role ARN pattern is valid")
});

static SESSION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+=,.@-]+$").expect("session name pattern is valid"));

/// Returns the paths of every artifact the broker writes into `credentials_dir`.
#[must_use]
pub fn artifact_paths(credentials_dir: &Path) -> [PathBuf; 2] {
    [
        credentials_dir.join(CREDENTIAL_FILE_NAME),
        credentials_dir.join(RESPONSE_FILE_NAME),
    ]
}

/// Checks that `target_identity` is a role ARN.
pub fn validate_target_identity(target_identity: &str) -> Result<(), CredentialError> {
    if ROLE_ARN.is_match(target_identity) {
        Ok(())
    } else {
        Err(CredentialError::new(
            CredentialErrorReason::MalformedIdentity,
            format!("'{target_identity}' is not a role ARN"),
        ))
    }
}

fn validate_session_name(session_name: &str) -> Result<(), CredentialError> {
    let len = session_name.len();
    if (2..=MAX_SESSION_NAME_LEN).contains(&len) && SESSION_NAME.is_match(session_name) {
        Ok(())
    } else {
        Err(CredentialError::new(
            CredentialErrorReason::MalformedIdentity,
            format!("'{session_name}' is not a valid role session name"),
        ))
    }
}

fn io_error(context: &str, err: &std::io::Error) -> CredentialError {
    CredentialError::new(CredentialErrorReason::Io, format!("{context}: {err}"))
}

fn malformed(message: impl Into<String>) -> CredentialError {
    CredentialError::new(CredentialErrorReason::MalformedResponse, message)
}

/// Exchanges the base identity for run-scoped credentials.
///
/// The broker is the only component that creates credential artifacts, and
/// [`CredentialBroker::release`] is the only way they are deleted.
#[derive(Clone)]
pub struct CredentialBroker {
    service: Arc<dyn IdentityService>,
    duration_secs: u32,
    timeout: Duration,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("duration_secs", &self.duration_secs)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CredentialBroker {
    /// Creates a broker over `service` with default duration and timeout.
    #[must_use]
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            duration_secs: DEFAULT_DURATION_SECS,
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Sets the requested validity window, clamped to the accepted range.
    #[must_use]
    pub fn with_duration_secs(mut self, secs: u32) -> Self {
        self.duration_secs = secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS);
        self
    }

    /// Sets the bound on the exchange.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The requested validity window.
    #[must_use]
    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    /// Acquires a session and writes its artifact into `credentials_dir`.
    ///
    /// Inputs are validated before the identity service is contacted. On any
    /// failure after the raw response was persisted, the partial artifacts
    /// are removed again.
    pub async fn acquire(
        &self,
        target_identity: &str,
        session_name: &str,
        region: &str,
        credentials_dir: &Path,
    ) -> Result<CredentialSession, CredentialError> {
        validate_target_identity(target_identity)?;
        validate_session_name(session_name)?;
        if region.trim().is_empty() {
            return Err(CredentialError::new(
                CredentialErrorReason::MalformedIdentity,
                "region must not be empty",
            ));
        }

        create_private_dir(credentials_dir).map_err(|e| io_error("creating credential directory", &e))?;

        let request = AssumeRoleRequest {
            role_arn: target_identity.to_string(),
            session_name: session_name.to_string(),
            region: region.to_string(),
            duration_secs: self.duration_secs,
        };

        info!(
            target_identity = %request.role_arn,
            session_name = %request.session_name,
            region = %request.region,
            duration_secs = request.duration_secs,
            "Requesting scoped credentials"
        );

        let raw = match tokio::time::timeout(self.timeout, self.service.assume_role(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CredentialError::new(
                    CredentialErrorReason::Timeout,
                    format!("identity service did not answer within {}s", self.timeout.as_secs()),
                ))
            }
        };

        let [artifact_path, response_path] = artifact_paths(credentials_dir);
        write_private_file(&response_path, raw.as_bytes())
            .map_err(|e| io_error("writing identity response", &e))?;

        match self.materialize(&raw, request, artifact_path.clone(), response_path.clone()) {
            Ok(session) => {
                info!(
                    session_name = %session.session_name(),
                    expires_at = %session.expires_at(),
                    "Credential session established"
                );
                Ok(session)
            }
            Err(err) => {
                for path in [&artifact_path, &response_path] {
                    if let Err(e) = remove_file_if_exists(path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove partial credential artifact");
                    }
                }
                Err(err)
            }
        }
    }

    fn materialize(
        &self,
        raw: &str,
        request: AssumeRoleRequest,
        artifact_path: PathBuf,
        response_path: PathBuf,
    ) -> Result<CredentialSession, CredentialError> {
        // serde messages can echo field values, so only the position is kept.
        let output: AssumeRoleOutput = serde_json::from_str(raw).map_err(|e| {
            malformed(format!(
                "unparseable identity response at line {} column {}",
                e.line(),
                e.column()
            ))
        })?;

        if let Some(user) = &output.assumed_role_user {
            debug!(assumed_role = %user.arn, "Identity service assumed role");
        }

        let issued = output.credentials;
        if issued.access_key_id.is_empty() || issued.secret_access_key.is_empty() || issued.session_token.is_empty() {
            return Err(malformed("identity response is missing part of the credential triple"));
        }

        let expires_at = parse_timestamp(&issued.expiration)
            .map_err(|e| malformed(format!("invalid expiration: {e}")))?;
        if expires_at <= now_utc() {
            return Err(malformed("issued credentials are already expired"));
        }

        let env = CredentialEnv {
            credentials: CredentialSet {
                access_key_id: issued.access_key_id,
                secret_access_key: issued.secret_access_key,
                session_token: issued.session_token,
            },
            region: request.region,
        };
        let text = envfile::render(&env).map_err(|e| malformed(e.to_string()))?;
        write_private_file(&artifact_path, text.as_bytes())
            .map_err(|e| io_error("writing credential artifact", &e))?;

        Ok(CredentialSession::new(
            request.role_arn,
            request.session_name,
            env.region,
            env.credentials,
            expires_at,
            artifact_path,
            response_path,
        ))
    }

    /// Reads a credential artifact back.
    pub fn load(path: &Path) -> Result<CredentialEnv, CredentialError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_error(&format!("reading {}", path.display()), &e))?;
        envfile::parse(&text).map_err(|e| {
            CredentialError::new(CredentialErrorReason::Io, format!("{}: {e}", path.display()))
        })
    }

    /// Deletes the session's artifacts. Missing files are fine.
    ///
    /// Returns how many files were actually removed.
    pub fn release(session: &CredentialSession) -> Result<usize, CredentialError> {
        Self::release_paths(&[session.artifact_path(), session.response_path()])
    }

    /// Deletes every broker artifact under `credentials_dir`, whether or not a
    /// session was ever established.
    pub fn release_dir(credentials_dir: &Path) -> Result<usize, CredentialError> {
        let paths = artifact_paths(credentials_dir);
        Self::release_paths(&[paths[0].as_path(), paths[1].as_path()])
    }

    fn release_paths(paths: &[&Path]) -> Result<usize, CredentialError> {
        let mut removed = 0;
        let mut first_error = None;
        for path in paths {
            match remove_file_if_exists(path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete credential artifact");
                    first_error.get_or_insert_with(|| io_error(&format!("deleting {}", path.display()), &e));
                }
            }
        }
        debug!(removed, "Released credential artifacts");
        first_error.map_or(Ok(removed), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticIdentityService;

    const ROLE: &str = "arn:aws:iam::123456789012:role/ci-etl";

    fn broker(service: StaticIdentityService) -> (CredentialBroker, Arc<StaticIdentityService>) {
        let service = Arc::new(service);
        (CredentialBroker::new(service.clone()), service)
    }

    #[test]
    fn test_validate_target_identity() {
        assert!(validate_target_identity(ROLE).is_ok());
        assert!(validate_target_identity("arn:aws-us-gov:iam::123456789012:role/path/to/ci").is_ok());
        for bad in ["", "ci-role", "arn:aws:iam::12345:role/ci", "arn:aws:iam::123456789012:user/ci"] {
            let err = validate_target_identity(bad).unwrap_err();
            assert_eq!(err.reason, CredentialErrorReason::MalformedIdentity);
        }
    }

    #[tokio::test]
    async fn test_acquire_writes_private_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let creds = dir.path().join("credentials");
        let (broker, service) = broker(StaticIdentityService::issuing("ASIAKEY", "s3cr3t", "tok"));

        let session = broker.acquire(ROLE, "ciflow-7", "us-east-1", &creds).await.unwrap();

        assert_eq!(service.calls(), 1);
        assert_eq!(service.requests()[0].session_name, "ciflow-7");
        assert_eq!(session.artifact_path(), creds.join(CREDENTIAL_FILE_NAME));
        assert!(session.response_path().exists());
        assert!(!session.is_expired());

        let loaded = CredentialBroker::load(session.artifact_path()).unwrap();
        assert_eq!(&loaded.credentials, session.credentials());
        assert_eq!(loaded.region, "us-east-1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(session.artifact_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_malformed_identity_never_calls_service() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, service) = broker(StaticIdentityService::issuing("a", "b", "c"));

        let err = broker.acquire("not-an-arn", "ciflow-1", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::MalformedIdentity);

        let err = broker.acquire(ROLE, "bad name!", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::MalformedIdentity);
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejection_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = broker(StaticIdentityService::rejecting(
            CredentialErrorReason::TrustRejected,
            "not authorized to perform sts:AssumeRole",
        ));

        let err = broker.acquire(ROLE, "ciflow-1", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::TrustRejected);
        for path in artifact_paths(dir.path()) {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_malformed_response_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = broker(StaticIdentityService::responding(r#"{"Credentials": {"AccessKeyId": "x"}}"#));

        let err = broker.acquire(ROLE, "ciflow-1", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::MalformedResponse);
        for path in artifact_paths(dir.path()) {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_expired_issue_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = broker(
            StaticIdentityService::issuing("a", "b", "c").with_expiry(chrono::Duration::seconds(-5)),
        );
        let err = broker.acquire(ROLE, "ciflow-1", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::MalformedResponse);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let service = StaticIdentityService::issuing("a", "b", "c").with_delay(Duration::from_secs(5));
        let broker = CredentialBroker::new(Arc::new(service)).with_timeout(Duration::from_millis(50));

        let err = broker.acquire(ROLE, "ciflow-1", "us-east-1", dir.path()).await.unwrap_err();
        assert_eq!(err.reason, CredentialErrorReason::Timeout);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = broker(StaticIdentityService::issuing("a", "b", "c"));
        let session = broker.acquire(ROLE, "ciflow-1", "us-east-1", dir.path()).await.unwrap();

        assert_eq!(CredentialBroker::release(&session).unwrap(), 2);
        assert_eq!(CredentialBroker::release(&session).unwrap(), 0);
        assert_eq!(CredentialBroker::release_dir(dir.path()).unwrap(), 0);
        assert!(!session.artifact_path().exists());
    }

    #[test]
    fn test_duration_is_clamped() {
        let service = Arc::new(StaticIdentityService::issuing("a", "b", "c"));
        assert_eq!(CredentialBroker::new(service.clone()).with_duration_secs(60).duration_secs(), 900);
        assert_eq!(CredentialBroker::new(service).with_duration_secs(99_999).duration_secs(), 43_200);
    }
}
