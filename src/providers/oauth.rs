// Discovery of OAuth credentials already written to disk by the provider's
// own CLI tooling. Read-only: nothing here refreshes or rewrites tokens.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub token_type: String,
}

// Parses a credential file, tolerating the shapes different CLIs write:
// either our canonical field names or a bare {"token": "..."} object.
pub fn load_from_file(path: &Path) -> AppResult<OAuthCredentials> {
    let data = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&data)
        .map_err(|e| AppError::Account(format!("unparseable credential file {:?}: {}", path, e)))?;

    let mut creds: OAuthCredentials =
        serde_json::from_value(value.clone()).unwrap_or_default();
    if creds.access_token.is_empty() {
        if let Some(token) = value.get("token").and_then(|t| t.as_str()) {
            creds.access_token = token.to_string();
        }
    }
    Ok(creds)
}

// First readable file with a non-empty access token wins.
pub fn detect_credentials(provider: &str) -> Option<(PathBuf, OAuthCredentials)> {
    let adapter = super::get(provider)?;
    for path in adapter.credential_paths() {
        if let Ok(creds) = load_from_file(&path) {
            if !creds.access_token.is_empty() {
                return Some((path, creds));
            }
        }
    }
    None
}

pub fn detect_all() -> HashMap<&'static str, (PathBuf, OAuthCredentials)> {
    let mut found = HashMap::new();
    for name in super::names() {
        if let Some(hit) = detect_credentials(name) {
            found.insert(name, hit);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_credential_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"access_token":"at-1","refresh_token":"rt-1","token_type":"Bearer"}"#,
        )
        .unwrap();

        let creds = load_from_file(&path).expect("load");
        assert_eq!(creds.access_token, "at-1");
        assert_eq!(creds.refresh_token, "rt-1");
        assert_eq!(creds.token_type, "Bearer");
    }

    #[test]
    fn falls_back_to_bare_token_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"token":"gho_abc"}"#).unwrap();

        let creds = load_from_file(&path).expect("load");
        assert_eq!(creds.access_token, "gho_abc");
    }

    #[test]
    fn rejects_non_json_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "machine github.com login x password y").unwrap();
        assert!(load_from_file(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(load_from_file(Path::new("/nonexistent/credentials.json")).is_err());
    }
}
