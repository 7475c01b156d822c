use crate::error::ManagerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::Path;

pub const ACCESS_TOKEN: &str = "accessToken";
pub const EXPIRES_AT: &str = "expiresAt";
pub const REFRESH_TOKEN: &str = "refreshToken";
pub const PROVIDER: &str = "provider";
pub const AUTH_METHOD: &str = "authMethod";
pub const REGION: &str = "region";
pub const START_URL: &str = "startUrl";
pub const PROFILE_ARN: &str = "profileArn";

/// Kiro's cached auth token. Kept as an ordered field map so that fields
/// this tool does not know about survive every rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(Map<String, Value>);

impl AuthToken {
    pub fn parse(content: &[u8], path: &Path) -> Result<Self, ManagerError> {
        serde_json::from_slice(content).map_err(|source| ManagerError::Malformed {
            what: "auth token",
            path: path.to_path_buf(),
            source,
        })
    }

    #[cfg(test)]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.text(ACCESS_TOKEN)
    }

    pub fn expires_at(&self) -> Option<&str> {
        self.text(EXPIRES_AT)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.text(REFRESH_TOKEN)
    }

    pub fn provider(&self) -> Option<&str> {
        self.text(PROVIDER)
    }

    pub fn auth_method(&self) -> Option<&str> {
        self.text(AUTH_METHOD)
    }

    pub fn region(&self) -> Option<&str> {
        self.text(REGION)
    }

    pub fn start_url(&self) -> Option<&str> {
        self.text(START_URL)
    }

    pub fn profile_arn(&self) -> Option<&str> {
        self.text(PROFILE_ARN)
    }

    /// Replaces only the access token and expiry; every other field is kept
    /// in place.
    pub fn refresh_access(&mut self, access_token: &str, expires_at: &str) {
        self.0
            .insert(ACCESS_TOKEN.to_string(), Value::String(access_token.to_string()));
        self.0
            .insert(EXPIRES_AT.to_string(), Value::String(expires_at.to_string()));
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// A missing or unparsable expiry counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry() {
            Some(expiry) => now >= expiry,
            None => true,
        }
    }

    pub fn to_pretty_json(&self) -> Result<Vec<u8>, ManagerError> {
        Ok(serde_json::to_vec_pretty(&self.0)?)
    }
}

pub fn read_token_file(path: &Path) -> Result<Option<AuthToken>, ManagerError> {
    match fs::read(path) {
        Ok(content) => AuthToken::parse(&content, path).map(Some),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ManagerError::io(format!("read {}", path.display()), err)),
    }
}

/// Display-safe view of a token. Building one never fails: an absent or
/// malformed token yields the empty summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub present: bool,
    pub provider: String,
    pub auth_method: String,
    pub region: String,
    pub start_url: String,
    pub expires_at: String,
    pub expired: bool,
    pub has_refresh_token: bool,
    pub has_profile: bool,
    pub access_token_preview: String,
}

impl TokenSummary {
    pub fn from_token(token: Option<&AuthToken>, now: DateTime<Utc>) -> Self {
        let Some(token) = token else {
            return Self::default();
        };
        let preview = token
            .access_token()
            .map(|access| {
                let head: String = access.chars().take(12).collect();
                if head.len() < access.len() {
                    format!("{head}...")
                } else {
                    head
                }
            })
            .unwrap_or_default();
        Self {
            present: true,
            provider: token.provider().unwrap_or_default().to_string(),
            auth_method: token.auth_method().unwrap_or_default().to_string(),
            region: token.region().unwrap_or_default().to_string(),
            start_url: token.start_url().unwrap_or_default().to_string(),
            expires_at: token.expires_at().unwrap_or_default().to_string(),
            expired: token.is_expired_at(now),
            has_refresh_token: token.refresh_token().is_some(),
            has_profile: token.profile_arn().is_some(),
            access_token_preview: preview,
        }
    }

    pub fn load(path: &Path, now: DateTime<Utc>) -> Self {
        match read_token_file(path) {
            Ok(token) => Self::from_token(token.as_ref(), now),
            Err(err) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable auth token: {err}");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn token(value: Value) -> AuthToken {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn refresh_access_keeps_unknown_fields_and_order() {
        let mut t = token(json!({
            "accessToken": "a1",
            "expiresAt": "2025-01-01T00:00:00Z",
            "refreshToken": "r1",
            "custom": "x",
            "nested": {"k": [1, 2, {"deep": true}]}
        }));
        t.refresh_access("a2", "2025-02-01T00:00:00Z");
        let keys: Vec<&String> = t.fields().keys().collect();
        assert_eq!(
            keys,
            ["accessToken", "expiresAt", "refreshToken", "custom", "nested"]
        );
        assert_eq!(t.access_token(), Some("a2"));
        assert_eq!(t.expires_at(), Some("2025-02-01T00:00:00Z"));
        assert_eq!(t.fields()["nested"], json!({"k": [1, 2, {"deep": true}]}));
    }

    #[test]
    fn expiry_rules() {
        let now = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(token(json!({"expiresAt": "2025-01-01T00:00:00Z"})).is_expired_at(now));
        assert!(!token(json!({"expiresAt": "2025-12-01T00:00:00.000Z"})).is_expired_at(now));
        assert!(token(json!({"expiresAt": "not a date"})).is_expired_at(now));
        assert!(token(json!({})).is_expired_at(now));
    }

    #[test]
    fn summary_of_missing_or_malformed_token_is_empty() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        let missing = dir.path().join("missing.json");
        assert_eq!(TokenSummary::load(&missing, now), TokenSummary::default());

        let malformed = dir.path().join("bad.json");
        for content in ["", "{", "[1,2]", "\"text\"", "null"] {
            fs::write(&malformed, content).unwrap();
            assert_eq!(TokenSummary::load(&malformed, now), TokenSummary::default());
        }
    }

    #[test]
    fn summary_tolerates_wrongly_typed_fields() {
        let t = token(json!({"accessToken": 42, "provider": null, "expiresAt": ["x"]}));
        let summary = TokenSummary::from_token(Some(&t), Utc::now());
        assert!(summary.present);
        assert!(summary.expired);
        assert!(summary.provider.is_empty());
        assert!(summary.access_token_preview.is_empty());
    }

    #[test]
    fn summary_masks_access_token() {
        let t = token(json!({
            "accessToken": "aoaAAAAAGZ-very-long-secret",
            "provider": "Github",
            "authMethod": "social",
            "refreshToken": "r",
            "expiresAt": "2999-01-01T00:00:00Z"
        }));
        let summary = TokenSummary::from_token(Some(&t), Utc::now());
        assert_eq!(summary.access_token_preview, "aoaAAAAAGZ-v...");
        assert_eq!(summary.provider, "Github");
        assert!(!summary.expired);
        assert!(summary.has_refresh_token);
        assert!(!summary.has_profile);
    }
}
