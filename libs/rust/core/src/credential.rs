//! Service-identity credential used to authorize remote artifact fetches.
//!
//! Loaded once at process start from a JSON key file and passed to the
//! remote store by construction. The token never appears in `Debug` output
//! or log lines; only the key's client email is loggable.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::CredentialError;

#[derive(Deserialize)]
struct KeyFile {
    client_email: Option<String>,
    token: Option<String>,
}

pub struct CredentialContext {
    client_email: String,
    token: String,
}

impl CredentialContext {
    /// Reads and validates the key file. Each failure mode maps to a
    /// distinct `CredentialError` variant so startup logs can say exactly
    /// what is wrong without echoing file contents.
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        if !path.exists() {
            return Err(CredentialError::Missing(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(CredentialError::Unreadable)?;
        let key: KeyFile = serde_json::from_str(&raw).map_err(CredentialError::Malformed)?;
        let client_email = key
            .client_email
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::IncompleteKey("client_email"))?;
        let token = key
            .token
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::IncompleteKey("token"))?;
        Ok(Self { client_email, token })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// The bearer secret handed to the remote store. Callers must not log it.
    pub fn bearer(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("client_email", &self.client_email)
            .field("token", &"[redacted]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_key(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_valid_key() {
        let f = write_key(r#"{"client_email":"svc@example.iam","token":"s3cret"}"#);
        let cred = CredentialContext::load(f.path()).unwrap();
        assert_eq!(cred.client_email(), "svc@example.iam");
        assert_eq!(cred.bearer(), "s3cret");
    }

    #[test]
    fn missing_file() {
        let err = CredentialContext::load(Path::new("/nonexistent/key.json")).unwrap_err();
        assert!(matches!(err, CredentialError::Missing(_)));
    }

    #[test]
    fn malformed_json() {
        let f = write_key("not json at all");
        let err = CredentialContext::load(f.path()).unwrap_err();
        assert!(matches!(err, CredentialError::Malformed(_)));
    }

    #[test]
    fn incomplete_key() {
        let f = write_key(r#"{"client_email":"svc@example.iam"}"#);
        let err = CredentialContext::load(f.path()).unwrap_err();
        assert!(matches!(err, CredentialError::IncompleteKey("token")));
    }

    #[test]
    fn debug_redacts_token() {
        let f = write_key(r#"{"client_email":"svc@example.iam","token":"s3cret"}"#);
        let cred = CredentialContext::load(f.path()).unwrap();
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("[redacted]"));
    }
}
