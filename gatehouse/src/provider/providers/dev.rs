//! Local development provider and its fake OAuth2 server
//!
//! [`DevAuthServer`] plays the identity provider on a local port: it asks
//! for a user name (or signs in a fixed one), hands out codes and tokens,
//! and serves the user info for them. [`DevProvider`] is the matching
//! client. Never expose either outside development.

use async_trait::async_trait;
use axum::{
    extract::{Form, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::provider::state::generate_state;
use crate::token::{hash_id, transport, User};

/// Default address of the development server
pub const DEFAULT_DEV_ADDR: &str = "127.0.0.1:8084";

const AUTHORIZE_PATH: &str = "/login/oauth/authorize";
const TOKEN_PATH: &str = "/login/oauth/access_token";
const USER_PATH: &str = "/user";

/// Provider configuration pointing at a development server on `addr`
pub fn dev_config(addr: &str) -> OAuthProviderConfig {
    OAuthProviderConfig {
        client_id: "dev".to_string(),
        client_secret: "dev".to_string(),
        redirect_uri: None,
        scopes: vec![],
        authorization_endpoint: Some(format!("http://{}{}", addr, AUTHORIZE_PATH)),
        token_endpoint: Some(format!("http://{}{}", addr, TOKEN_PATH)),
        userinfo_endpoint: Some(format!("http://{}{}", addr, USER_PATH)),
        user_attributes: Default::default(),
    }
}

/// Client for [`DevAuthServer`]
#[derive(Clone)]
pub struct DevProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl DevProvider {
    /// Endpoints missing from `config` default to [`DEFAULT_DEV_ADDR`]
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                &format!("http://{}{}", DEFAULT_DEV_ADDR, AUTHORIZE_PATH),
                &format!("http://{}{}", DEFAULT_DEV_ADDR, TOKEN_PATH),
            ),
            redirect_uri,
            &["user:email"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, &format!("http://{}{}", DEFAULT_DEV_ADDR, USER_PATH)),
        })
    }
}

#[async_trait]
impl OAuthProvider for DevProvider {
    fn name(&self) -> &str {
        "dev"
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(self.client.authorization_url(state))
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        self.client.exchange_code(code).await
    }

    async fn fetch_user_info(&self, tokens: &OAuthTokens) -> Result<serde_json::Value> {
        self.client
            .get_json(&self.userinfo_url, &tokens.access_token)
            .await
    }

    fn map_user(&self, info: &serde_json::Value) -> Result<User> {
        let id = hash_id(&required_id(info, "id", "dev")?);

        let mut user = User::new(format!("dev_{}", id), display_name(info, &["name"], &id));
        user.picture = field(info, "picture").unwrap_or_default();
        user.email = field(info, "email").unwrap_or_default();
        Ok(user)
    }
}

/// Fake OAuth2 authorization server for local development
#[derive(Default)]
pub struct DevAuthServer {
    /// authorization code -> user name
    codes: DashMap<String, String>,
    /// access token -> user name
    tokens: DashMap<String, String>,
    automatic_user: Option<String>,
}

impl DevAuthServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign every request in as `name` without showing the form
    pub fn with_automatic_user(mut self, name: impl Into<String>) -> Self {
        self.automatic_user = Some(name.into());
        self
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(AUTHORIZE_PATH, get(authorize))
            .route(TOKEN_PATH, post(access_token))
            .route(USER_PATH, get(user_info))
            .with_state(self)
    }

    /// Serve on `addr` until the task is dropped
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("dev auth server can't bind {}: {}", addr, e)))?;
        tracing::warn!(%addr, "dev auth server started, for development only");

        axum::serve(listener, Arc::new(self).router())
            .await
            .map_err(|e| Error::Internal(format!("dev auth server failed: {}", e)))
    }
}

async fn authorize(
    State(server): State<Arc<DevAuthServer>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let state = params.get("state").cloned().unwrap_or_default();
    let redirect_uri = params
        .get("redirect_uri")
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| Error::BadRequest("missing redirect_uri".to_string()))?;

    let name = params
        .get("username")
        .filter(|name| !name.trim().is_empty())
        .map(|name| name.trim().to_string())
        .or_else(|| server.automatic_user.clone());

    let Some(name) = name else {
        return Ok(Html(login_form(&state, redirect_uri)).into_response());
    };

    let code = generate_state();
    server.codes.insert(code.clone(), name.clone());
    tracing::debug!(user = %name, "dev auth server issued code");

    let query = serde_urlencoded::to_string([("code", code.as_str()), ("state", state.as_str())])
        .map_err(|e| Error::Internal(format!("failed to encode callback query: {}", e)))?;
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    Ok(Redirect::to(&format!("{}{}{}", redirect_uri, separator, query)).into_response())
}

async fn access_token(
    State(server): State<Arc<DevAuthServer>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let name = params
        .get("code")
        .and_then(|code| server.codes.remove(code))
        .map(|(_, name)| name);

    let Some(name) = name else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid_grant"})),
        )
            .into_response();
    };

    let token = generate_state();
    server.tokens.insert(token.clone(), name);
    Json(serde_json::json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": 3600,
    }))
    .into_response()
}

async fn user_info(State(server): State<Arc<DevAuthServer>>, headers: HeaderMap) -> Response {
    let name = transport::bearer_token(&headers)
        .and_then(|token| server.tokens.get(&token).map(|name| name.value().clone()));

    match name {
        Some(name) => Json(serde_json::json!({
            "id": name,
            "name": name,
            "email": format!("{}@localhost", name),
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn login_form(state: &str, redirect_uri: &str) -> String {
    format!(
        r#"<!doctype html>
<html><body>
<form action="{action}" method="get">
<input type="hidden" name="state" value="{state}">
<input type="hidden" name="redirect_uri" value="{redirect_uri}">
<label>User name <input type="text" name="username" autofocus></label>
<button type="submit">Sign in</button>
</form>
</body></html>"#,
        action = AUTHORIZE_PATH,
        state = escape_attr(state),
        redirect_uri = escape_attr(redirect_uri),
    )
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
