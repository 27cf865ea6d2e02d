//! Identity providers
//!
//! Every provider is one of three kinds: an OAuth2 handshake
//! ([`OAuth2Handler`]), a direct credential check ([`DirectHandler`]) or a
//! send-and-confirm flow ([`VerifyHandler`]). All of them end by issuing a
//! session token through the [`TokenService`](crate::token::TokenService).

pub mod apple;
pub mod direct;
pub mod handshake;
pub mod oauth;
pub mod providers;
pub mod state;
pub mod verify;

use axum::{
    body::to_bytes,
    extract::Request,
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::token::transport;

pub use apple::{AppleEndpoints, AppleProvider, FilePrivateKeyLoader, PrivateKeyLoader};
pub use direct::{CredChecker, DirectHandler, UserIdFunc};
pub use handshake::OAuth2Handler;
pub use oauth::{Endpoints, OAuth2Client, OAuthProvider, OAuthTokens};
pub use state::{generate_state, MemoryStateManager, OAuthStateManager, StateData};
pub use verify::{Sender, VerifyHandler};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// A registered provider
#[derive(Clone)]
pub enum Provider {
    OAuth2(OAuth2Handler),
    Direct(DirectHandler),
    Verify(VerifyHandler),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Provider::OAuth2(handler) => handler.name(),
            Provider::Direct(handler) => handler.name(),
            Provider::Verify(handler) => handler.name(),
        }
    }

    /// Start sign-in: redirect to the provider, check credentials, or send a confirmation
    pub async fn login(&self, request: Request) -> Result<Response> {
        match self {
            Provider::OAuth2(handler) => handler.login(request).await,
            Provider::Direct(handler) => handler.login(request).await,
            Provider::Verify(handler) => handler.login(request).await,
        }
    }

    /// Handshake callback; only OAuth2 providers have one
    pub async fn callback(&self, request: Request) -> Result<Response> {
        match self {
            Provider::OAuth2(handler) => handler.callback(request).await,
            _ => Err(Error::NotFound(format!(
                "provider {} has no callback",
                self.name()
            ))),
        }
    }

    pub fn logout(&self) -> Result<Response> {
        match self {
            Provider::OAuth2(handler) => handler.logout(),
            Provider::Direct(handler) => handler.logout(),
            Provider::Verify(handler) => handler.logout(),
        }
    }
}

/// Sign-in parameters common to every provider
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct LoginParams {
    /// Validated post-sign-in redirect target
    pub from: Option<String>,
    /// Audience
    pub site: String,
    pub session_only: bool,
}

impl LoginParams {
    pub(crate) fn from_params(params: &HashMap<String, String>, base_url: &str) -> Self {
        let from = params
            .get("from")
            .filter(|from| !from.is_empty())
            .and_then(|from| {
                if is_safe_redirect(from, base_url) {
                    Some(from.clone())
                } else {
                    tracing::warn!(from = %from, "ignoring off-site redirect target");
                    None
                }
            });

        Self {
            from,
            site: params.get("site").cloned().unwrap_or_default(),
            session_only: params
                .get("session")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Relative paths, or absolute URLs under the service's own root URL
fn is_safe_redirect(from: &str, base_url: &str) -> bool {
    if from.starts_with('/') {
        return !from.starts_with("//") && !from.starts_with("/\\");
    }
    let base = base_url.trim_end_matches('/');
    !base.is_empty() && (from == base || from.starts_with(&format!("{}/", base)))
}

/// Query parameters merged with a POST body (form or JSON object)
///
/// Body values win over query values.
pub(crate) async fn request_params(request: Request) -> Result<(Parts, HashMap<String, String>)> {
    let (parts, body) = request.into_parts();
    let mut params = transport::query_params(&parts.uri);

    if parts.method != Method::POST {
        return Ok((parts, params));
    }

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::BadRequest(format!("can't read body: {}", e)))?;
    if bytes.is_empty() {
        return Ok((parts, params));
    }

    let is_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        let body: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e)))?;
        params.extend(body.into_iter().map(|(key, value)| match value {
            serde_json::Value::String(s) => (key, s),
            other => (key, other.to_string()),
        }));
    } else {
        let body: HashMap<String, String> = serde_urlencoded::from_bytes(&bytes)
            .map_err(|e| Error::BadRequest(format!("invalid form body: {}", e)))?;
        params.extend(body);
    }

    Ok((parts, params))
}

/// `302 Found` to `location` carrying `headers`
pub(crate) fn redirect(location: &str, headers: HeaderMap) -> Result<Response> {
    let location = HeaderValue::from_str(location)
        .map_err(|e| Error::BadRequest(format!("invalid redirect target: {}", e)))?;

    let mut response = StatusCode::FOUND.into_response();
    response.headers_mut().insert(header::LOCATION, location);
    Ok(with_headers(response, headers))
}

/// Append headers to a response, keeping repeated `Set-Cookie` values
pub(crate) fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    for (name, value) in headers.iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}
