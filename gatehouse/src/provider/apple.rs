//! Sign in with Apple
//!
//! Apple authenticates the client with a short-lived ES256 JWT signed by the
//! developer's private key instead of a static client secret. The signed
//! secret is cached and regenerated once its remaining validity drops below
//! [`SECRET_REFRESH_THRESHOLD_SECS`]. User identity comes from the
//! `id_token`, verified against Apple's published keys.

use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header, encode,
    jwk::{JwkSet, KeyAlgorithm},
    Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use super::oauth::{http_client, OAuthProvider, OAuthTokens};
use crate::config::AppleConfig;
use crate::error::{Error, Result};
use crate::token::{hash_id, User};

const APPLE_ISSUER: &str = "https://appleid.apple.com";

/// Lifetime of a generated client secret (Apple accepts up to six months)
pub const SECRET_LIFETIME_SECS: i64 = 180 * 24 * 3600;

/// Regenerate the client secret when less validity than this remains
pub const SECRET_REFRESH_THRESHOLD_SECS: i64 = 24 * 3600;

/// Loads the `.p8` private key issued by Apple
pub trait PrivateKeyLoader: Send + Sync {
    /// PKCS#8 PEM bytes
    fn load(&self) -> Result<Vec<u8>>;
}

/// Reads the private key from a file
#[derive(Debug, Clone)]
pub struct FilePrivateKeyLoader {
    path: PathBuf,
}

impl FilePrivateKeyLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PrivateKeyLoader for FilePrivateKeyLoader {
    fn load(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| {
            Error::Config(Box::new(figment::Error::from(format!(
                "Failed to read Apple private key '{}': {}",
                self.path.display(),
                e
            ))))
        })
    }
}

/// Apple endpoints
#[derive(Debug, Clone)]
pub struct AppleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub keys_url: String,
}

impl Default for AppleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://appleid.apple.com/auth/authorize".to_string(),
            token_url: "https://appleid.apple.com/auth/token".to_string(),
            keys_url: "https://appleid.apple.com/auth/keys".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientSecretClaims {
    iss: String,
    iat: i64,
    exp: i64,
    aud: String,
    sub: String,
}

#[derive(Debug, Clone)]
struct CachedSecret {
    token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct AppleTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

/// Sign in with Apple provider
pub struct AppleProvider {
    config: AppleConfig,
    redirect_uri: String,
    endpoints: AppleEndpoints,
    key: EncodingKey,
    secret: RwLock<Option<CachedSecret>>,
    secret_lifetime: i64,
    http_client: HttpClient,
}

impl AppleProvider {
    /// Create the provider
    ///
    /// Loads the private key and signs a first client secret; any failure
    /// there is returned so only this provider fails to register.
    pub fn new(
        config: AppleConfig,
        redirect_uri: impl Into<String>,
        loader: &dyn PrivateKeyLoader,
        timeout: Duration,
    ) -> Result<Self> {
        let pem = loader.load()?;
        let key = EncodingKey::from_ec_pem(&pem).map_err(|e| {
            Error::Config(Box::new(figment::Error::from(format!(
                "Invalid Apple private key: {}",
                e
            ))))
        })?;

        let provider = Self {
            config,
            redirect_uri: redirect_uri.into(),
            endpoints: AppleEndpoints::default(),
            key,
            secret: RwLock::new(None),
            secret_lifetime: SECRET_LIFETIME_SECS,
            http_client: http_client(timeout)?,
        };
        provider.client_secret()?;
        Ok(provider)
    }

    pub fn with_endpoints(mut self, endpoints: AppleEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Signed client secret, regenerated near expiry
    fn client_secret(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let fresh = |cached: &CachedSecret| cached.expires_at - now > SECRET_REFRESH_THRESHOLD_SECS;

        {
            let cached = self
                .secret
                .read()
                .map_err(|_| Error::Internal("apple secret lock poisoned".to_string()))?;
            if let Some(cached) = cached.as_ref().filter(|c| fresh(*c)) {
                return Ok(cached.token.clone());
            }
        }

        let mut cached = self
            .secret
            .write()
            .map_err(|_| Error::Internal("apple secret lock poisoned".to_string()))?;
        // another request may have regenerated it meanwhile
        if let Some(current) = cached.as_ref().filter(|c| fresh(*c)) {
            return Ok(current.token.clone());
        }

        let claims = ClientSecretClaims {
            iss: self.config.team_id.clone(),
            iat: now,
            exp: now + self.secret_lifetime,
            aud: APPLE_ISSUER.to_string(),
            sub: self.config.client_id.clone(),
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());

        let token = encode(&header, &claims, &self.key).map_err(|e| {
            Error::Config(Box::new(figment::Error::from(format!(
                "Failed to sign Apple client secret: {}",
                e
            ))))
        })?;

        tracing::debug!(expires_at = claims.exp, "generated apple client secret");
        *cached = Some(CachedSecret {
            token: token.clone(),
            expires_at: claims.exp,
        });
        Ok(token)
    }

    /// Verify an `id_token` against a key set
    fn verify_id_token(&self, id_token: &str, keys: &JwkSet) -> Result<serde_json::Value> {
        let header = decode_header(id_token)
            .map_err(|e| Error::upstream(format!("invalid apple id_token: {}", e)))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::upstream("apple id_token has no kid"))?;
        let jwk = keys
            .find(kid)
            .ok_or_else(|| Error::upstream(format!("unknown apple key {}", kid)))?;

        let algorithm = match jwk.common.key_algorithm {
            Some(KeyAlgorithm::ES256) => Algorithm::ES256,
            _ => Algorithm::RS256,
        };
        if header.alg != algorithm {
            return Err(Error::upstream("apple id_token algorithm does not match key"));
        }

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| Error::upstream(format!("invalid apple key {}: {}", kid, e)))?;
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[self.config.client_id.as_str()]);
        validation.set_issuer(&[APPLE_ISSUER]);

        decode::<serde_json::Value>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::upstream(format!("apple id_token rejected: {}", e)))
    }

    async fn fetch_keys(&self) -> Result<JwkSet> {
        let response = self
            .http_client
            .get(&self.endpoints.keys_url)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("failed to fetch apple keys: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: Some(status.as_u16()),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("invalid apple key set: {}", e)))
    }
}

#[async_trait]
impl OAuthProvider for AppleProvider {
    fn name(&self) -> &str {
        "apple"
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.endpoints.auth_url)
            .map_err(|e| Error::Internal(format!("Invalid apple auth URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("response_mode", &self.config.response_mode)
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", state)
            .append_pair("scope", &self.config.scopes.join(" "));
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        let client_secret = self.client_secret()?;
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::upstream(format!("apple token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: Some(status.as_u16()),
                body,
            });
        }

        let tokens: AppleTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("invalid apple token response: {}", e)))?;

        Ok(OAuthTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
            token_type: tokens.token_type,
            id_token: tokens.id_token,
        })
    }

    async fn fetch_user_info(&self, tokens: &OAuthTokens) -> Result<serde_json::Value> {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| Error::upstream("apple returned no id_token"))?;
        let keys = self.fetch_keys().await?;
        self.verify_id_token(id_token, &keys)
    }

    /// Apple posts the user's name only on the first sign-in, as a JSON `user` field
    fn callback_user_info(&self, params: &HashMap<String, String>, info: &mut serde_json::Value) {
        let Some(raw) = params.get("user") else {
            return;
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(user) if user.is_object() => {
                if let Some(info) = info.as_object_mut() {
                    info.insert("user".to_string(), user);
                }
            }
            _ => tracing::warn!("ignoring malformed apple user field"),
        }
    }

    fn map_user(&self, info: &serde_json::Value) -> Result<User> {
        let sub = info["sub"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::upstream("missing sub in apple id_token"))?;
        let id = hash_id(sub);
        let email = info["email"].as_str().unwrap_or_default();

        let full_name = ["firstName", "lastName"]
            .iter()
            .filter_map(|k| info["user"]["name"][k].as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let name = if !full_name.is_empty() {
            full_name
        } else {
            match email.split_once('@') {
                Some((local, _)) if !local.is_empty() => local.to_string(),
                _ => format!("noname_{}", &id[..8]),
            }
        };

        let mut user = User::new(format!("apple_{}", id), name);
        user.email = email.to_string();
        Ok(user)
    }

    fn uses_form_post(&self) -> bool {
        self.config.response_mode == "form_post"
    }
}
