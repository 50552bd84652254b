//! Bearer token lifecycle: load from disk, validity check, login, persist.
//!
//! The token is obtained once at pipeline startup and is read-only for the
//! duration of a scan. No mid-scan refresh happens; an expired token makes
//! subsequent API calls classify as transient errors for the operator to
//! catch on the next run.

use crate::config::{Config, Credentials};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Safety margin: a persisted token is only reused if it stays valid for
/// at least this long.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Login realm expected by the intelligence API
const LOGIN_REALM: &str = "intel";

#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials rejected or unexpected login response. Fatal: the system
    /// cannot proceed without a valid token.
    #[error("authentication rejected by server (status {status}): {body}")]
    Rejected { status: u16, body: String },

    /// Login endpoint unreachable. Also fatal.
    #[error("network error during login: {0}")]
    Network(String),

    /// Token file could not be written after a fresh login.
    #[error("failed to persist token: {0}")]
    Storage(String),
}

/// Bearer token plus absolute expiry (epoch seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub expires: i64,
}

impl AuthToken {
    /// True if the token remains valid past the safety margin.
    pub fn is_usable(&self, now: i64) -> bool {
        now < self.expires - EXPIRY_MARGIN_SECS
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    realm: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    expires: i64,
}

/// Load a persisted token, tolerating a missing or corrupt file.
fn load_token_file(path: &Path) -> Option<AuthToken> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<AuthToken>(&content) {
        Ok(token) => Some(token),
        Err(e) => {
            tracing::warn!("Ignoring unparseable token file {:?}: {}", path, e);
            None
        }
    }
}

/// Persist the token as a small JSON file, owner-only on unix.
fn save_token_file(path: &Path, token: &AuthToken) -> Result<(), AuthError> {
    let json = serde_json::to_string(token).map_err(|e| AuthError::Storage(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| AuthError::Storage(e.to_string()))?;
        }
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let mut file = std::io::BufWriter::new(file);
        file.write_all(json.as_bytes())
            .map_err(|e| AuthError::Storage(e.to_string()))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, &json).map_err(|e| AuthError::Storage(e.to_string()))?;
    }

    tracing::debug!("Token saved to {:?}", path);
    Ok(())
}

/// Obtain a usable bearer token.
///
/// Reuses the persisted token when it has more than the safety margin left;
/// otherwise performs a fresh login and rewrites the token file.
pub async fn obtain(
    http: &reqwest::Client,
    cfg: &Config,
    creds: &Credentials,
) -> Result<AuthToken, AuthError> {
    let now = chrono::Utc::now().timestamp();

    if let Some(token) = load_token_file(&cfg.token_path) {
        if token.is_usable(now) {
            tracing::info!("Loaded valid token from file");
            return Ok(token);
        }
        tracing::info!("Persisted token expired or expiring, re-authenticating");
    }

    tracing::info!("Requesting a new authentication token");
    let url = format!("{}/api/v1/login", cfg.api_url);
    let resp = http
        .post(&url)
        .json(&LoginRequest {
            username: &creds.username,
            password: &creds.password,
            realm: LOGIN_REALM,
        })
        .send()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let login: LoginResponse = resp
        .json()
        .await
        .map_err(|e| AuthError::Network(format!("invalid login response: {}", e)))?;

    let token = AuthToken {
        token: login.token,
        expires: login.expires,
    };
    save_token_file(&cfg.token_path, &token)?;
    tracing::info!("Authentication successful, token saved");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usable_respects_margin() {
        let token = AuthToken {
            token: "abc".into(),
            expires: 1_000,
        };
        assert!(token.is_usable(900));
        // Inside the 60-second margin
        assert!(!token.is_usable(941));
        assert!(!token.is_usable(1_000));
        assert!(!token.is_usable(2_000));
    }

    #[test]
    fn token_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let token = AuthToken {
            token: "secret".into(),
            expires: 1_700_000_000,
        };
        save_token_file(&path, &token).unwrap();

        let loaded = load_token_file(&path).unwrap();
        assert_eq!(loaded.token, "secret");
        assert_eq!(loaded.expires, 1_700_000_000);
    }

    #[test]
    fn corrupt_token_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load_token_file(&path).is_none());
    }

    #[test]
    fn missing_token_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_token_file(&dir.path().join("absent.json")).is_none());
    }
}
