use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bearer credential as issued by the backend's login endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    token: String,

    /// Expiration timestamp, when known.
    expires_at: Option<DateTime<Utc>>,
}

impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential has expired")]
    Expired,

    #[error("credential is empty")]
    Empty,
}

impl Credential {
    /// Opaque bearer token with no known expiry.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Build a credential from a JWT, reading `exp` from the (unverified)
    /// payload. Tokens that are not JWTs are kept with no expiry.
    pub fn from_jwt(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = jwt_expiry(&token);
        if expires_at.is_none() {
            tracing::debug!("bearer token carries no readable exp claim");
        }
        Self { token, expires_at }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        validate_credential(self, now) == Err(CredentialError::Expired)
    }
}

/// Deterministically validate a credential against `now`.
pub fn validate_credential(credential: &Credential, now: DateTime<Utc>) -> Result<(), CredentialError> {
    if credential.token.trim().is_empty() {
        return Err(CredentialError::Empty);
    }
    match credential.expires_at {
        Some(at) if now >= at => Err(CredentialError::Expired),
        _ => Ok(()),
    }
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jwt_with(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn reads_exp_from_jwt_payload() {
        let token = jwt_with(serde_json::json!({ "sub": "u1", "exp": 1_700_000_000 }));
        let credential = Credential::from_jwt(token);
        assert_eq!(
            credential.expires_at(),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn opaque_tokens_have_no_expiry() {
        let credential = Credential::from_jwt("not-a-jwt");
        assert_eq!(credential.expires_at(), None);
        assert!(validate_credential(&credential, Utc::now()).is_ok());
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let credential = Credential::bearer("t").with_expiry(now);
        assert_eq!(validate_credential(&credential, now), Err(CredentialError::Expired));
        assert!(validate_credential(&credential, now - Duration::seconds(1)).is_ok());
    }

    #[test]
    fn blank_tokens_are_rejected() {
        assert_eq!(
            validate_credential(&Credential::bearer("  "), Utc::now()),
            Err(CredentialError::Empty)
        );
    }

    #[test]
    fn debug_output_redacts_the_token() {
        let rendered = format!("{:?}", Credential::bearer("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }
}
