//! Install recipes for provisioned capabilities.

use crate::core::Capability;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Default bound on each install command.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Name of the database client driver the SQL test stage needs.
pub const MSSQL_DRIVER_NAME: &str = "ODBC Driver 17 for SQL Server";

/// How to detect and install one capability inside a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecipe {
    /// The capability this recipe provides.
    pub capability: Capability,
    /// Command that exits 0 when the capability is already present.
    pub probe: String,
    /// Install commands, run in order.
    pub steps: Vec<String>,
    /// Variables exported for every install command.
    pub env: Vec<(String, String)>,
    /// Bound on each command.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl InstallRecipe {
    /// Microsoft ODBC Driver 17 for SQL Server on a Debian-family image.
    #[must_use]
    pub fn mssql_odbc17() -> Self {
        Self {
            capability: Capability::SqlDriver,
            probe: format!("odbcinst -q -d -n \"{MSSQL_DRIVER_NAME}\""),
            steps: vec![
                "apt-get update".to_string(),
                "apt-get install -y --no-install-recommends curl gnupg ca-certificates".to_string(),
                "curl -fsSL https://packages.microsoft.com/keys/microsoft.asc \
                 | gpg --dearmor --yes -o /usr/share/keyrings/microsoft-prod.gpg"
                    .to_string(),
                ". /etc/os-release && echo \"deb [arch=amd64,arm64 signed-by=/usr/share/keyrings/microsoft-prod.gpg] \
                 https://packages.microsoft.com/debian/${VERSION_ID%%.*}/prod ${VERSION_CODENAME} main\" \
                 > /etc/apt/sources.list.d/mssql-release.list"
                    .to_string(),
                "apt-get update".to_string(),
                "apt-get install -y msodbcsql17 unixodbc-dev".to_string(),
            ],
            env: vec![
                ("ACCEPT_EULA".to_string(), "Y".to_string()),
                ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
            ],
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    /// Overrides the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stable hash of everything that affects what gets installed.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.capability.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.probe.as_bytes());
        for step in &self.steps {
            hasher.update([0]);
            hasher.update(step.as_bytes());
        }
        for (k, v) in &self.env {
            hasher.update([1]);
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
