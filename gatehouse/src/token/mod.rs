//! Signed session tokens
//!
//! Tokens are HS256 JWTs carrying the [`User`] and the standard temporal
//! claims. The token ID (`jti`) doubles as the double-submit CSRF value:
//! it is written to a script-readable cookie and must be echoed back in a
//! header whenever the token itself arrives in a cookie.

pub mod service;
pub(crate) mod transport;
pub mod user;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

pub use service::TokenService;
pub use user::{get_user, gravatar_url, hash_id, AuthUser, User};

/// Decoded token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Token ID, also the CSRF value
    #[serde(default)]
    pub jti: String,

    /// Issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,

    /// Audience (site)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aud: String,

    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Subject, the user ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,

    /// Authenticated user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,

    /// Write the token as a browser-session cookie
    #[serde(default, rename = "sess_only", skip_serializing_if = "std::ops::Not::not")]
    pub session_only: bool,

    /// Handshake data; present only on confirmation tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<Handshake>,

    /// Custom claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,

    /// Raw signed token this was decoded from, or signed into
    #[serde(skip)]
    pub token: String,
}

impl Claims {
    /// Whether `exp` lies in the past
    pub fn is_expired(&self) -> bool {
        self.exp < chrono::Utc::now().timestamp()
    }
}

/// Handshake payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

/// Signing secret lookup
///
/// Called with the token audience when per-audience secrets are enabled,
/// otherwise with an empty string. An error or an empty secret fails the
/// signing or verification attempt.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn secret(&self, aud: &str) -> Result<String>;
}

#[async_trait]
impl<F> SecretReader for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    async fn secret(&self, aud: &str) -> Result<String> {
        self(aud)
    }
}

/// One secret for every audience
#[derive(Clone)]
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

#[async_trait]
impl SecretReader for StaticSecret {
    async fn secret(&self, _aud: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Hook applied to claims at issuance
///
/// Expiry, issuer and audience are restored after the hook runs.
pub trait ClaimsUpdater: Send + Sync {
    fn update(&self, claims: Claims) -> Claims;
}

impl<F> ClaimsUpdater for F
where
    F: Fn(Claims) -> Claims + Send + Sync,
{
    fn update(&self, claims: Claims) -> Claims {
        self(claims)
    }
}

/// Source of the audience allow-list
pub trait AudienceReader: Send + Sync {
    fn audiences(&self) -> Result<Vec<String>>;
}

/// Fixed audience allow-list
#[derive(Debug, Clone)]
pub struct StaticAudiences(pub Vec<String>);

impl AudienceReader for StaticAudiences {
    fn audiences(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Post-authentication check; returning false rejects the identity
pub trait Validator: Send + Sync {
    fn validate(&self, token: &str, claims: &Claims) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&str, &Claims) -> bool + Send + Sync,
{
    fn validate(&self, token: &str, claims: &Claims) -> bool {
        self(token, claims)
    }
}

/// Audience claim read from an unverified token
///
/// Only used to pick the verification secret; the token is rejected as
/// malformed when it is not three base64url segments with a JSON payload.
pub(crate) fn peek_audience(token: &str) -> Result<String> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::MalformedToken(
            "expected 3 dot-separated segments".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| Error::MalformedToken(format!("payload is not base64url: {}", e)))?;

    #[derive(Deserialize)]
    struct Peek {
        #[serde(default)]
        aud: String,
    }

    let peek: Peek = serde_json::from_slice(&payload)
        .map_err(|e| Error::MalformedToken(format!("payload is not a claims object: {}", e)))?;
    Ok(peek.aud)
}
