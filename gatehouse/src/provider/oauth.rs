//! OAuth2 provider trait and the shared authorization-code client

use async_trait::async_trait;
use oauth2::{
    basic::{BasicErrorResponse, BasicTokenType},
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, EmptyExtraTokenFields,
    EndpointNotSet, EndpointSet, RedirectUrl, RequestTokenError, Scope, StandardRevocableToken,
    StandardTokenIntrospectionResponse, StandardTokenResponse, TokenResponse, TokenUrl,
};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};
use crate::token::User;

/// Tokens received from a provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Access token from the provider
    pub access_token: String,

    /// Refresh token (if provided)
    pub refresh_token: Option<String>,

    /// Token lifetime in seconds (if provided)
    pub expires_in: Option<i64>,

    /// Token type (usually "Bearer")
    pub token_type: String,

    /// ID token for OIDC providers
    pub id_token: Option<String>,
}

/// An identity provider speaking the authorization-code flow
///
/// Implementations supply the provider endpoints and the mapping from the
/// provider's user-info payload to a [`User`]; the handshake itself lives
/// in [`OAuth2Handler`](super::OAuth2Handler).
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider name, used in routes and as the user ID prefix
    fn name(&self) -> &str;

    /// Authorization URL carrying the client ID, scopes, redirect URI and state
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens>;

    /// Provider user info for the exchanged tokens
    async fn fetch_user_info(&self, tokens: &OAuthTokens) -> Result<serde_json::Value>;

    /// Merge user details that arrive with the callback request into `info`
    fn callback_user_info(&self, _params: &HashMap<String, String>, _info: &mut serde_json::Value) {}

    /// Normalize the user-info payload
    fn map_user(&self, info: &serde_json::Value) -> Result<User>;

    /// Whether the provider posts the callback as a form (`response_mode=form_post`)
    fn uses_form_post(&self) -> bool {
        false
    }
}

/// Type alias for our configured OAuth client
type ConfiguredClient = Client<
    BasicErrorResponse,
    StandardTokenResponse<EmptyExtraTokenFields, BasicTokenType>,
    StandardTokenIntrospectionResponse<EmptyExtraTokenFields, BasicTokenType>,
    StandardRevocableToken,
    BasicErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// Endpoints of an OAuth2 provider
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
}

/// Authorization-code client shared by the built-in providers
#[derive(Clone)]
pub struct OAuth2Client {
    client: ConfiguredClient,
    http_client: HttpClient,
    scopes: Vec<String>,
}

impl OAuth2Client {
    /// Create a client
    ///
    /// Configured scopes replace `default_scopes` when non-empty.
    pub fn new(
        config: &OAuthProviderConfig,
        endpoints: &Endpoints,
        redirect_uri: &str,
        default_scopes: &[&str],
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(endpoints.auth_url.clone())
                    .map_err(|e| Error::BadRequest(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(endpoints.token_url.clone())
                    .map_err(|e| Error::BadRequest(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|e| Error::BadRequest(format!("Invalid redirect URI: {}", e)))?,
            );

        let http_client = http_client(timeout)?;

        let scopes = if config.scopes.is_empty() {
            default_scopes.iter().map(|s| s.to_string()).collect()
        } else {
            config.scopes.clone()
        };

        Ok(Self {
            client,
            http_client,
            scopes,
        })
    }

    pub fn http(&self) -> &HttpClient {
        &self.http_client
    }

    pub fn authorization_url(&self, state: &str) -> String {
        let mut auth_request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()));

        for scope in &self.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }

        let (url, _) = auth_request.url();
        url.to_string()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(exchange_error)?;

        Ok(OAuthTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_in: token_result.expires_in().map(|d| d.as_secs() as i64),
            token_type: "Bearer".to_string(),
            id_token: None,
        })
    }

    /// GET a JSON document with the access token as bearer
    pub async fn get_json(&self, url: &str, access_token: &str) -> Result<serde_json::Value> {
        get_json(&self.http_client, url, access_token).await
    }
}

/// Token endpoint failure as an upstream error
///
/// A standard OAuth2 error body is only ever sent with status 400.
fn exchange_error<RE>(e: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match e {
        RequestTokenError::ServerResponse(resp) => Error::Upstream {
            status: Some(400),
            body: format!("token exchange rejected: {}", resp),
        },
        other => Error::upstream(format!("token exchange failed: {}", other)),
    }
}

/// HTTP client for provider calls; never follows redirects
pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent("gatehouse")
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

pub(crate) async fn get_json(
    http_client: &HttpClient,
    url: &str,
    access_token: &str,
) -> Result<serde_json::Value> {
    let response = http_client
        .get(url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::upstream(format!("request to {} failed: {}", url, e)))?;

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
        .map_err(|e| Error::upstream(format!("invalid JSON from {}: {}", url, e)))
}

/// String field of a user-info payload; numbers are stringified
pub(crate) fn field(info: &serde_json::Value, key: &str) -> Option<String> {
    match info.get(key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Required ID field of a user-info payload
pub(crate) fn required_id(info: &serde_json::Value, key: &str, provider: &str) -> Result<String> {
    field(info, key)
        .ok_or_else(|| Error::upstream(format!("missing {} in {} user info", key, provider)))
}
