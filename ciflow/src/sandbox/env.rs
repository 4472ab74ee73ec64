//! Explicit per-step environment.

use crate::credentials::{
    CredentialEnv, ACCESS_KEY_VAR, AMBIENT_IDENTITY_VARS, REGION_VARS, SECRET_KEY_VAR,
    SESSION_TOKEN_VAR,
};
use std::collections::BTreeMap;
use std::fmt;

/// Host variables a step may inherit. Everything else starts empty.
pub const HOST_ALLOW_LIST: [&str; 3] = ["PATH", "HOME", "LANG"];

/// The complete environment a step runs with.
///
/// Execution contexts clear the inherited environment and apply exactly
/// these variables, then unset the names in [`StepEnvironment::unset_names`]
/// inside the context.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StepEnvironment {
    vars: BTreeMap<String, String>,
    unset: Vec<String>,
}

impl StepEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the allow-listed host variables.
    #[must_use]
    pub fn from_host() -> Self {
        let mut env = Self::new();
        for name in HOST_ALLOW_LIST {
            if let Ok(value) = std::env::var(name) {
                env.set(name, value);
            }
        }
        env
    }

    /// Sets a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.unset.retain(|n| n != &name);
        self.vars.insert(name, value.into());
    }

    /// Builder form of [`StepEnvironment::set`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets every pair from `vars`.
    pub fn extend<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    /// Removes a variable and records that the context must unset it.
    pub fn unset(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.vars.remove(&name);
        if !self.unset.contains(&name) {
            self.unset.push(name);
        }
    }

    /// Returns a variable's value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterates variables in name order.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Names that must be removed inside the context.
    #[must_use]
    pub fn unset_names(&self) -> &[String] {
        &self.unset
    }

    /// Number of variables set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true if no variables are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Injects the scoped credentials and strips competing identity sources.
    pub fn inject_credentials(&mut self, credentials: &CredentialEnv) {
        for name in AMBIENT_IDENTITY_VARS {
            self.unset(name);
        }
        self.set(ACCESS_KEY_VAR, credentials.credentials.access_key_id.clone());
        self.set(SECRET_KEY_VAR, credentials.credentials.secret_access_key.clone());
        self.set(SESSION_TOKEN_VAR, credentials.credentials.session_token.clone());
        for name in REGION_VARS {
            self.set(name, credentials.region.clone());
        }
    }

    /// Returns true if credential variables are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.vars.contains_key(ACCESS_KEY_VAR)
    }
}

fn is_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    ["SECRET", "TOKEN", "PASSWORD", "ACCESS_KEY"]
        .iter()
        .any(|marker| upper.contains(marker))
}

impl fmt::Debug for StepEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: BTreeMap<&str, &str> = self
            .vars
            .iter()
            .map(|(k, v)| {
                let value = if is_sensitive(k) { "<redacted>" } else { v.as_str() };
                (k.as_str(), value)
            })
            .collect();
        f.debug_struct("StepEnvironment")
            .field("vars", &shown)
            .field("unset", &self.unset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSet;

    fn creds() -> CredentialEnv {
        CredentialEnv {
            credentials: CredentialSet {
                access_key_id: "ASIAXYZ".into(),
                secret_access_key: "shh".into(),
                session_token: "tok".into(),
            },
            region: "us-east-2".into(),
        }
    }

    #[test]
    fn test_from_host_only_takes_allow_list() {
        let env = StepEnvironment::from_host();
        for (name, _) in env.vars() {
            assert!(HOST_ALLOW_LIST.contains(&name), "unexpected {name}");
        }
    }

    #[test]
    fn test_inject_credentials() {
        let mut env = StepEnvironment::new().with("AWS_PROFILE", "dev");
        env.inject_credentials(&creds());

        assert!(env.has_credentials());
        assert_eq!(env.get("AWS_SESSION_TOKEN"), Some("tok"));
        assert_eq!(env.get("AWS_REGION"), Some("us-east-2"));
        assert_eq!(env.get("AWS_DEFAULT_REGION"), Some("us-east-2"));
        assert_eq!(env.get("AWS_PROFILE"), None);
        assert!(env.unset_names().iter().any(|n| n == "AWS_PROFILE"));
        assert_eq!(env.unset_names().len(), 4);
    }

    #[test]
    fn test_set_after_unset_clears_unset() {
        let mut env = StepEnvironment::new();
        env.unset("A");
        env.set("A", "1");
        assert!(env.unset_names().is_empty());
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_debug_redacts() {
        let mut env = StepEnvironment::new().with("PATH", "/usr/bin");
        env.inject_credentials(&creds());
        let rendered = format!("{env:?}");
        assert!(rendered.contains("/usr/bin"));
        assert!(!rendered.contains("shh"));
        assert!(!rendered.contains("ASIAXYZ"));
        assert!(!rendered.contains("\"tok\""));
    }
}
