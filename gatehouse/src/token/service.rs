//! Token issuance, verification and transport

use axum::http::{request::Parts, HeaderMap, HeaderName, HeaderValue, Method};
use chrono::Utc;
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::transport::{self, Cookie};
use super::{
    peek_audience, AudienceReader, Claims, ClaimsUpdater, SecretReader, StaticAudiences, User,
};
use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Where a token was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Query,
    Header,
    Bearer,
    Cookie,
}

/// Creates, signs, verifies and transports session tokens
#[derive(Clone)]
pub struct TokenService {
    config: Arc<AuthConfig>,
    secret_reader: Option<Arc<dyn SecretReader>>,
    claims_updater: Option<Arc<dyn ClaimsUpdater>>,
    audience_reader: Option<Arc<dyn AudienceReader>>,
}

impl TokenService {
    /// Create a token service
    ///
    /// A non-empty `allowed_audiences` in the configuration becomes the
    /// audience allow-list unless [`with_audience_reader`](Self::with_audience_reader)
    /// replaces it.
    pub fn new(config: AuthConfig) -> Self {
        let audience_reader: Option<Arc<dyn AudienceReader>> =
            if config.allowed_audiences.is_empty() {
                None
            } else {
                Some(Arc::new(StaticAudiences(config.allowed_audiences.clone())))
            };

        Self {
            config: Arc::new(config),
            secret_reader: None,
            claims_updater: None,
            audience_reader,
        }
    }

    pub fn with_secret_reader(mut self, reader: impl SecretReader + 'static) -> Self {
        self.secret_reader = Some(Arc::new(reader));
        self
    }

    pub fn with_claims_updater(mut self, updater: impl ClaimsUpdater + 'static) -> Self {
        self.claims_updater = Some(Arc::new(updater));
        self
    }

    pub fn with_audience_reader(mut self, reader: impl AudienceReader + 'static) -> Self {
        self.audience_reader = Some(Arc::new(reader));
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn has_secret_reader(&self) -> bool {
        self.secret_reader.is_some()
    }

    /// Fresh claims for a user signing in for `aud`
    ///
    /// The claims updater runs here; it cannot change expiry, issuer or audience.
    pub fn claims(
        &self,
        mut user: User,
        aud: &str,
        extra: HashMap<String, serde_json::Value>,
    ) -> Claims {
        let now = Utc::now();
        let exp = (now + self.config.token_duration()).timestamp();
        user.audience = aud.to_string();

        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.config.issuer.clone(),
            aud: aud.to_string(),
            iat: (!self.config.disable_iat).then(|| now.timestamp()),
            exp,
            sub: user.id.clone(),
            user: Some(user),
            extra,
            ..Default::default()
        };

        match &self.claims_updater {
            Some(updater) => {
                let mut updated = updater.update(claims.clone());
                updated.exp = claims.exp;
                updated.iss = claims.iss;
                updated.aud = claims.aud;
                updated
            }
            None => claims,
        }
    }

    /// Issue a signed token for a user
    pub async fn issue(
        &self,
        user: User,
        aud: &str,
        extra: HashMap<String, serde_json::Value>,
    ) -> Result<String> {
        let claims = self.claims(user, aud, extra);
        self.token(&claims).await
    }

    /// Sign claims with the secret of their audience
    pub async fn token(&self, claims: &Claims) -> Result<String> {
        let secret = self.secret(&claims.aud).await?;
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| Error::Internal(format!("failed to sign token: {}", e)))
    }

    /// Verify signature, audience and expiry
    ///
    /// An expired token with a valid signature yields [`Error::Expired`]
    /// carrying its claims.
    pub async fn parse(&self, token: &str) -> Result<Claims> {
        let claims = self.verify(token).await?;
        check_expiry(claims)
    }

    /// Signature and audience checks, expiry left to the caller
    async fn verify(&self, token: &str) -> Result<Claims> {
        let aud = peek_audience(token)?;
        decode_header(token).map_err(|e| Error::MalformedToken(format!("invalid header: {}", e)))?;
        let secret = self.secret(&aud).await?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        // header and payload decoded above, so base64 errors here are in the signature
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::MissingRequiredClaim(_) => Error::MalformedToken(e.to_string()),
            _ => Error::BadSignature,
        })?;

        let mut claims = data.claims;
        self.check_audience(&claims.aud)?;
        claims.token = token.to_string();
        Ok(claims)
    }

    fn check_audience(&self, aud: &str) -> Result<()> {
        let Some(reader) = &self.audience_reader else {
            return Ok(());
        };
        let allowed = reader.audiences()?;
        if allowed.iter().any(|a| a == aud) {
            return Ok(());
        }
        Err(Error::AudienceRejected(aud.to_string()))
    }

    async fn secret(&self, aud: &str) -> Result<String> {
        let Some(reader) = &self.secret_reader else {
            tracing::warn!("no secret reader configured, tokens cannot be signed or verified");
            return Err(Error::SecretUnavailable("no secret reader".to_string()));
        };

        let key = if self.config.aud_secrets { aud } else { "" };
        let secret = reader.secret(key).await.map_err(|e| {
            tracing::error!(aud = %key, "secret lookup failed: {}", e);
            Error::SecretUnavailable(format!("lookup for {:?} failed", key))
        })?;

        if secret.is_empty() {
            return Err(Error::SecretUnavailable(format!("empty secret for {:?}", key)));
        }
        Ok(secret)
    }

    /// Sign claims and write the token to the response headers
    ///
    /// Returns the claims with `token` filled in.
    pub async fn set(&self, headers: &mut HeaderMap, mut claims: Claims) -> Result<Claims> {
        claims.token = self.token(&claims).await?;
        self.write(headers, &claims)?;
        Ok(claims)
    }

    /// Write already-signed claims to the response headers
    ///
    /// Cookie mode writes the http-only token cookie plus the readable CSRF
    /// cookie; header mode writes only the token header.
    pub fn write(&self, headers: &mut HeaderMap, claims: &Claims) -> Result<()> {
        if claims.token.is_empty() {
            return Err(Error::Internal("claims are not signed".to_string()));
        }

        if self.config.send_jwt_header {
            let value = HeaderValue::from_str(&claims.token)
                .map_err(|e| Error::Internal(format!("invalid token header: {}", e)))?;
            headers.insert(header_name(&self.config.jwt_header_key)?, value);
            return Ok(());
        }

        let max_age = (!claims.session_only).then_some(self.config.cookie_duration_secs);
        self.write_cookies(headers, &claims.token, &claims.jti, max_age)
    }

    /// Clear the transport (logout)
    pub fn reset(&self, headers: &mut HeaderMap) -> Result<()> {
        if self.config.send_jwt_header {
            headers.insert(
                header_name(&self.config.jwt_header_key)?,
                HeaderValue::from_static(""),
            );
            return Ok(());
        }
        self.write_cookies(headers, "", "", Some(0))
    }

    fn write_cookies(
        &self,
        headers: &mut HeaderMap,
        token: &str,
        xsrf: &str,
        max_age: Option<i64>,
    ) -> Result<()> {
        let jwt_cookie = Cookie {
            name: &self.config.jwt_cookie_name,
            value: token,
            domain: self.config.jwt_cookie_domain.as_deref(),
            max_age,
            http_only: true,
            secure: self.config.secure_cookies,
            same_site: self.config.same_site,
        };
        transport::append_cookie(headers, &jwt_cookie)?;

        let xsrf_cookie = Cookie {
            name: &self.config.xsrf_cookie_name,
            value: xsrf,
            http_only: false,
            ..jwt_cookie
        };
        transport::append_cookie(headers, &xsrf_cookie)
    }

    /// Read and verify the token of an incoming request
    ///
    /// Lookup order is query parameter, token header, bearer authorization,
    /// then cookie. Cookie-borne tokens must be accompanied by the CSRF
    /// header unless the method is ignored. Checks run signature first,
    /// then CSRF, then expiry. A request without any token fails with
    /// [`Error::Unauthorized`].
    pub async fn get(&self, parts: &Parts) -> Result<Claims> {
        let (token, source) = self
            .extract(parts)
            .ok_or_else(|| Error::Unauthorized("token not found".to_string()))?;

        let claims = self.verify(&token).await?;

        if source == TokenSource::Cookie && !self.config.disable_xsrf {
            self.check_xsrf(parts, &claims)?;
        }

        check_expiry(claims)
    }

    fn extract(&self, parts: &Parts) -> Option<(String, TokenSource)> {
        if let Some(token) = transport::query_param(&parts.uri, &self.config.jwt_query) {
            return Some((token, TokenSource::Query));
        }
        if let Some(token) = transport::read_header(&parts.headers, &self.config.jwt_header_key) {
            return Some((token, TokenSource::Header));
        }
        if let Some(token) = transport::bearer_token(&parts.headers) {
            return Some((token, TokenSource::Bearer));
        }
        transport::read_cookie(&parts.headers, &self.config.jwt_cookie_name)
            .map(|token| (token, TokenSource::Cookie))
    }

    fn check_xsrf(&self, parts: &Parts, claims: &Claims) -> Result<()> {
        if self.ignores_xsrf(&parts.method) {
            return Ok(());
        }

        let header = transport::read_header(&parts.headers, &self.config.xsrf_header_key)
            .unwrap_or_default();
        let matches: bool = header.as_bytes().ct_eq(claims.jti.as_bytes()).into();
        if header.is_empty() || !matches {
            return Err(Error::CsrfMismatch);
        }
        Ok(())
    }

    fn ignores_xsrf(&self, method: &Method) -> bool {
        self.config
            .xsrf_ignore_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Re-issue claims with renewed issued-at and expiry
    ///
    /// User, audience, token ID and custom claims carry over. Returns the
    /// claims with `token` filled in.
    pub async fn refresh(&self, claims: &Claims) -> Result<Claims> {
        let now = Utc::now();
        let mut refreshed = Claims {
            iat: (!self.config.disable_iat).then(|| now.timestamp()),
            exp: (now + self.config.token_duration()).timestamp(),
            token: String::new(),
            ..claims.clone()
        };
        refreshed.token = self.token(&refreshed).await?;
        Ok(refreshed)
    }
}

fn check_expiry(claims: Claims) -> Result<Claims> {
    if claims.is_expired() {
        return Err(Error::Expired(Box::new(claims)));
    }
    Ok(claims)
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Internal(format!("invalid header name {:?}: {}", name, e)))
}
