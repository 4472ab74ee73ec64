//! Capabilities a stage can require from the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Something a stage needs before its first step can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// A live, unexpired credential session.
    Credentials,
    /// The database client driver installed in the stage's context.
    SqlDriver,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credentials => write!(f, "credentials"),
            Self::SqlDriver => write!(f, "sql-driver"),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credentials" => Ok(Self::Credentials),
            "sql-driver" => Ok(Self::SqlDriver),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

impl Capability {
    /// Returns true if the capability is installed into an execution context.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        matches!(self, Self::SqlDriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse_display() {
        for cap in [Capability::Credentials, Capability::SqlDriver] {
            assert_eq!(cap.to_string().parse::<Capability>().unwrap(), cap);
        }
        assert!("gpu".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_serde_kebab() {
        let json = serde_json::to_string(&Capability::SqlDriver).unwrap();
        assert_eq!(json, r#""sql-driver""#);
        assert!(Capability::SqlDriver.is_provisioned());
        assert!(!Capability::Credentials.is_provisioned());
    }
}
