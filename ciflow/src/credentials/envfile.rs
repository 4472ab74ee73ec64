//! The shell-sourceable credential artifact.
//!
//! The file first unsets ambient identity variables, then exports the scoped
//! triple and region. Values are single-quoted with POSIX escaping, so the
//! file can be `source`d by a shell and parsed back by [`parse`] without loss.

use super::session::{
    CredentialSet, ACCESS_KEY_VAR, AMBIENT_IDENTITY_VARS, REGION_VARS, SECRET_KEY_VAR,
    SESSION_TOKEN_VAR,
};
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

/// File name of the credential artifact inside the credential directory.
pub const CREDENTIAL_FILE_NAME: &str = "aws-credentials.env";
/// File name of the raw identity-service response.
pub const RESPONSE_FILE_NAME: &str = "assume-role-output.json";

/// Errors reading or writing the credential artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvFileError {
    /// A required variable is absent.
    #[error("credential file is missing {0}")]
    MissingVariable(&'static str),

    /// A line could not be parsed.
    #[error("credential file line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// A value cannot be represented on a single line.
    #[error("value for {0} contains a line break or NUL")]
    UnrepresentableValue(&'static str),
}

/// The contents of a credential artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEnv {
    /// The issued triple.
    pub credentials: CredentialSet,
    /// The region exported under both region variables.
    pub region: String,
}

/// Quotes `value` for POSIX shells.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Renders the artifact text.
pub fn render(env: &CredentialEnv) -> Result<String, EnvFileError> {
    let exports: [(&'static str, &str); 5] = [
        (ACCESS_KEY_VAR, &env.credentials.access_key_id),
        (SECRET_KEY_VAR, &env.credentials.secret_access_key),
        (SESSION_TOKEN_VAR, &env.credentials.session_token),
        (REGION_VARS[0], &env.region),
        (REGION_VARS[1], &env.region),
    ];

    let mut out = String::new();
    for name in AMBIENT_IDENTITY_VARS {
        let _ = writeln!(out, "unset {name}");
    }
    for (name, value) in exports {
        if value.contains(['\n', '\r', '\0']) {
            return Err(EnvFileError::UnrepresentableValue(name));
        }
        let _ = writeln!(out, "export {name}={}", shell_quote(value));
    }
    Ok(out)
}

/// Parses artifact text produced by [`render`].
pub fn parse(contents: &str) -> Result<CredentialEnv, EnvFileError> {
    let mut vars: HashMap<String, String> = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("unset ") {
            continue;
        }

        let assignment = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let (name, raw_value) = assignment.split_once('=').ok_or_else(|| EnvFileError::Malformed {
            line: line_no,
            reason: "expected NAME=VALUE".to_string(),
        })?;

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EnvFileError::Malformed {
                line: line_no,
                reason: format!("invalid variable name '{name}'"),
            });
        }

        let value = unquote(raw_value).map_err(|reason| EnvFileError::Malformed {
            line: line_no,
            reason,
        })?;
        vars.insert(name.to_string(), value);
    }

    let mut take = |name: &'static str| vars.remove(name).ok_or(EnvFileError::MissingVariable(name));
    let credentials = CredentialSet {
        access_key_id: take(ACCESS_KEY_VAR)?,
        secret_access_key: take(SECRET_KEY_VAR)?,
        session_token: take(SESSION_TOKEN_VAR)?,
    };
    let region = match take(REGION_VARS[1]) {
        Ok(region) => region,
        Err(_) => take(REGION_VARS[0])?,
    };

    Ok(CredentialEnv { credentials, region })
}

/// Undoes [`shell_quote`]. Accepts bare words and backslash escapes too.
fn unquote(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(inner) => out.push(inner),
                    None => return Err("unterminated single quote".to_string()),
                }
            },
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => return Err("dangling backslash".to_string()),
            },
            '"' | '$' | '`' => return Err(format!("unsupported shell syntax '{c}'")),
            c if c.is_whitespace() => return Err("unquoted whitespace".to_string()),
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> CredentialEnv {
        CredentialEnv {
            credentials: CredentialSet {
                access_key_id: "ASIAEXAMPLE".into(),
                secret_access_key: "wJal'rXUtn/K7MDENG+bPxRfi".into(),
                session_token: "FwoGZXIvYXdzE$(rm -rf)`x`\"q\"==".into(),
            },
            region: "eu-west-1".into(),
        }
    }

    #[test]
    fn test_render_layout() {
        let text = render(&sample()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "unset AWS_WEB_IDENTITY_TOKEN_FILE");
        assert_eq!(lines[3], "unset AWS_PROFILE");
        assert_eq!(lines[4], "export AWS_ACCESS_KEY_ID='ASIAEXAMPLE'");
        assert_eq!(lines[5], r"export AWS_SECRET_ACCESS_KEY='wJal'\''rXUtn/K7MDENG+bPxRfi'");
        assert_eq!(lines[7], "export AWS_DEFAULT_REGION='eu-west-1'");
        assert_eq!(lines[8], "export AWS_REGION='eu-west-1'");
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let env = sample();
        let parsed = parse(&render(&env).unwrap()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_parse_missing_token() {
        let text = "export AWS_ACCESS_KEY_ID='a'\nexport AWS_SECRET_ACCESS_KEY='b'\nexport AWS_REGION='r'\n";
        assert_eq!(parse(text), Err(EnvFileError::MissingVariable("AWS_SESSION_TOKEN")));
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        let err = parse("export AWS_ACCESS_KEY_ID='abc\n").unwrap_err();
        assert!(matches!(err, EnvFileError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_render_rejects_newline() {
        let mut env = sample();
        env.credentials.session_token = "a\nb".into();
        assert_eq!(
            render(&env),
            Err(EnvFileError::UnrepresentableValue("AWS_SESSION_TOKEN"))
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
