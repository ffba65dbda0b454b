//! Local credential handle for the remote store.
//!
//! The token file is produced out-of-band by an interactive consent flow.
//! This module only loads it, refreshes the access token when it is about to
//! expire and writes the refreshed token back. All of that happens under one
//! async mutex, so at most one refresh is ever in flight and concurrent
//! callers wait for its result instead of racing.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::model::{TokenErrorResponse, TokenResponse};
use crate::retry::{RetryPolicy, Retryable};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REQUIRED_FIELDS: [&str; 3] = ["client_id", "client_secret", "refresh_token"];

#[derive(Debug, Error)]
pub enum AuthError {
    /// Local credential material is missing pieces or unreadable.
    #[error("credential configuration error: {0}")]
    Configuration(String),
    /// A human has to re-run the consent flow.
    #[error("authentication required: {0}")]
    Authentication(String),
    #[error("token refresh failed: {0}")]
    Transient(String),
}

impl Retryable for AuthError {
    fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }
}

/// On-disk token artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    #[serde(default)]
    pub token: Option<String>,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, with = "expiry_format")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl StoredToken {
    /// True when there is no usable access token or it expires within `threshold`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        match self.token.as_deref() {
            None | Some("") => true,
            Some(_) => match self.expiry {
                None => false,
                Some(expiry) => expiry - now < threshold,
            },
        }
    }
}

/// Expiry timestamps are written as RFC 3339. Naive timestamps written by
/// other tooling are read as UTC.
mod expiry_format {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

pub struct TokenProvider {
    path: PathBuf,
    http: Client,
    retry: RetryPolicy,
    refresh_threshold: ChronoDuration,
    state: Mutex<Option<StoredToken>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("auction-sync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            path: path.into(),
            http,
            retry: RetryPolicy::new(
                3,
                vec![
                    Duration::from_secs(1),
                    Duration::from_secs(2),
                    Duration::from_secs(4),
                ],
            ),
            refresh_threshold: ChronoDuration::minutes(5),
            state: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return a valid access token, refreshing and persisting it first when needed.
    #[instrument(skip_all)]
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut guard = self.state.lock().await;
        let mut token = match guard.take() {
            Some(token) => token,
            None => load_token_file(&self.path).await?,
        };
        let result = self.ensure_fresh(&mut token).await;
        *guard = Some(token);
        result
    }

    /// Forget the cached access token so the next call refreshes it.
    pub async fn invalidate(&self) {
        if let Some(token) = self.state.lock().await.as_mut() {
            token.token = None;
        }
    }

    async fn ensure_fresh(&self, token: &mut StoredToken) -> Result<String, AuthError> {
        if token.needs_refresh(Utc::now(), self.refresh_threshold) {
            info!("access token expired or expiring soon; refreshing");
            let current: &StoredToken = token;
            let refreshed = self
                .retry
                .run("refresh_token", move || self.request_refresh(current))
                .await
                .map_err(|err| match err {
                    AuthError::Transient(msg) => AuthError::Authentication(format!(
                        "token refresh failed after {} attempts: {}",
                        self.retry.max_attempts(),
                        msg
                    )),
                    other => other,
                })?;
            apply_refresh(token, refreshed, Utc::now());
            if let Err(err) = save_token_file(&self.path, token).await {
                warn!(error = %err, path = %self.path.display(), "failed to persist refreshed token");
            } else {
                info!(expiry = ?token.expiry, "token refreshed and saved");
            }
        } else {
            debug!("access token still valid");
        }
        Ok(token.token.clone().unwrap_or_default())
    }

    async fn request_refresh(&self, token: &StoredToken) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
        ];
        let res = self
            .http
            .post(&token.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::Transient(err.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return res
                .json::<TokenResponse>()
                .await
                .map_err(|err| AuthError::Transient(format!("invalid token response: {}", err)));
        }

        let body = res.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<TokenErrorResponse>(&body).ok();
        if let Some(err) = parsed.as_ref().filter(|e| e.error == "invalid_grant") {
            return Err(AuthError::Authentication(format!(
                "refresh token has expired or been revoked; re-run the consent flow ({})",
                err.error_description.as_deref().unwrap_or("invalid_grant")
            )));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Authentication(format!(
                "token endpoint rejected client credentials: {}",
                body
            )));
        }
        Err(AuthError::Transient(format!("status {}: {}", status, body)))
    }
}

fn apply_refresh(token: &mut StoredToken, refreshed: TokenResponse, now: DateTime<Utc>) {
    token.token = Some(refreshed.access_token);
    token.expiry = Some(now + ChronoDuration::seconds(refreshed.expires_in.unwrap_or(3600)));
    if let Some(rotated) = refreshed.refresh_token.filter(|t| !t.is_empty()) {
        token.refresh_token = rotated;
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub async fn load_token_file(path: &Path) -> Result<StoredToken, AuthError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AuthError::Authentication(format!(
                "{} not found; initial authentication required",
                path.display()
            )))
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(AuthError::Configuration(format!(
                "cannot read {}: permission denied",
                path.display()
            )))
        }
        Err(err) => {
            return Err(AuthError::Configuration(format!(
                "cannot read {}: {}",
                path.display(),
                err
            )))
        }
    };

    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
        AuthError::Configuration(format!(
            "{} is corrupted (invalid JSON); delete it and re-authenticate: {}",
            path.display(),
            err
        ))
    })?;

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| value.get(*field).and_then(|v| v.as_str()).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(AuthError::Configuration(format!(
            "{} is missing required fields: {}",
            path.display(),
            missing.join(", ")
        )));
    }

    serde_json::from_value(value).map_err(|err| {
        AuthError::Configuration(format!("failed to load {}: {}", path.display(), err))
    })
}

/// Write via a temp file and rename, keeping a backup of the previous token.
pub async fn save_token_file(path: &Path, token: &StoredToken) -> std::io::Result<()> {
    if fs::try_exists(path).await.unwrap_or(false) {
        fs::copy(path, sibling(path, ".backup")).await?;
    }
    let json = serde_json::to_string_pretty(token)?;
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expiry: Option<DateTime<Utc>>, access: Option<&str>) -> StoredToken {
        StoredToken {
            token: access.map(str::to_string),
            refresh_token: "refresh".into(),
            token_uri: DEFAULT_TOKEN_URI.into(),
            client_id: "client".into(),
            client_secret: "secret".into(),
            scopes: vec![],
            expiry,
        }
    }

    #[test]
    fn needs_refresh_rules() {
        let now = Utc::now();
        let five = ChronoDuration::minutes(5);
        assert!(token(None, None).needs_refresh(now, five));
        assert!(!token(None, Some("a")).needs_refresh(now, five));
        assert!(token(Some(now + ChronoDuration::minutes(2)), Some("a")).needs_refresh(now, five));
        assert!(!token(Some(now + ChronoDuration::minutes(30)), Some("a")).needs_refresh(now, five));
        assert!(token(Some(now - ChronoDuration::minutes(1)), Some("a")).needs_refresh(now, five));
    }

    #[test]
    fn expiry_accepts_naive_and_rfc3339() {
        let naive = r#"{"refresh_token":"r","client_id":"c","client_secret":"s","expiry":"2024-05-01T10:00:00.123456"}"#;
        let t: StoredToken = serde_json::from_str(naive).unwrap();
        assert_eq!(t.expiry.unwrap().to_rfc3339(), "2024-05-01T10:00:00.123456+00:00");
        assert_eq!(t.token_uri, DEFAULT_TOKEN_URI);

        let zoned = r#"{"refresh_token":"r","client_id":"c","client_secret":"s","expiry":"2024-05-01T14:00:00+04:00"}"#;
        let t: StoredToken = serde_json::from_str(zoned).unwrap();
        assert_eq!(t.expiry.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn apply_refresh_rotates_refresh_token() {
        let now = Utc::now();
        let mut t = token(None, None);
        apply_refresh(
            &mut t,
            TokenResponse {
                access_token: "fresh".into(),
                expires_in: Some(60),
                refresh_token: Some("rotated".into()),
            },
            now,
        );
        assert_eq!(t.token.as_deref(), Some("fresh"));
        assert_eq!(t.refresh_token, "rotated");
        assert_eq!(t.expiry, Some(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/tmp/token.json"), ".backup"),
            PathBuf::from("/tmp/token.json.backup")
        );
    }
}
