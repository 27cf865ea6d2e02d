//! Send-and-confirm sign-in
//!
//! Step one signs a short-lived confirmation token naming the user and
//! address and hands it to a [`Sender`]. Step two presents that token back
//! (`?token=...`) and receives a session token. Confirmation tokens are not
//! single-use; they stay valid until they expire.

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;

use super::{redirect, request_params, with_headers, LoginParams};
use crate::avatar::{finish_picture, AvatarSaver, NoOpAvatar};
use crate::error::{Error, Result};
use crate::token::transport;
use crate::token::{Claims, Handshake, TokenService, User};

/// Default confirmation message
pub const DEFAULT_TEMPLATE: &str = "Confirmation for {user} {address}, token: {token}";

const ID_SEPARATOR: &str = "::";

/// Delivers confirmation messages out of band (email, chat, ...)
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, address: &str, text: &str) -> Result<()>;
}

#[async_trait]
impl<F> Sender for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    async fn send(&self, address: &str, text: &str) -> Result<()> {
        self(address, text)
    }
}

/// Confirmation-code sign-in
#[derive(Clone)]
pub struct VerifyHandler {
    name: String,
    tokens: TokenService,
    sender: Arc<dyn Sender>,
    template: String,
    avatar: Arc<dyn AvatarSaver>,
}

impl VerifyHandler {
    pub fn new(name: impl Into<String>, tokens: TokenService, sender: Arc<dyn Sender>) -> Self {
        Self {
            name: name.into(),
            tokens,
            sender,
            template: DEFAULT_TEMPLATE.to_string(),
            avatar: Arc::new(NoOpAvatar),
        }
    }

    pub fn with_avatar_saver(mut self, avatar: Arc<dyn AvatarSaver>) -> Self {
        self.avatar = avatar;
        self
    }

    /// Message template with `{user}`, `{address}`, `{token}` and `{site}` placeholders
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a confirmation, or confirm when the request carries `token`
    pub async fn login(&self, request: Request) -> Result<Response> {
        let (parts, params) = request_params(request).await?;

        match params.get("token").filter(|t| !t.is_empty()) {
            Some(token) => self.confirm(token, &parts).await,
            None => self.send_confirmation(&params).await,
        }
    }

    async fn send_confirmation(&self, params: &HashMap<String, String>) -> Result<Response> {
        let user = required(params, "user")?;
        let address = required(params, "address")?;
        if user.contains(ID_SEPARATOR) {
            return Err(Error::BadRequest(format!("user can't contain {}", ID_SEPARATOR)));
        }

        let mut login = LoginParams::from_params(params, &self.tokens.config().url);
        if let Some(aud) = params.get("aud").filter(|a| !a.is_empty()) {
            login.site = aud.clone();
        }

        let config = self.tokens.config();
        let now = chrono::Utc::now();
        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            iss: config.issuer.clone(),
            aud: login.site.clone(),
            iat: (!config.disable_iat).then(|| now.timestamp()),
            exp: now.timestamp() + config.verify_token_ttl_secs,
            session_only: login.session_only,
            handshake: Some(Handshake {
                id: format!("{}{}{}", user, ID_SEPARATOR, address),
                from: login.from.unwrap_or_default(),
            }),
            ..Default::default()
        };
        let token = self.tokens.token(&claims).await?;

        let text = self
            .template
            .replace("{user}", user)
            .replace("{address}", address)
            .replace("{site}", &login.site)
            .replace("{token}", &token);

        self.sender.send(address, &text).await.map_err(|e| {
            tracing::error!(provider = %self.name, "failed to send confirmation: {}", e);
            Error::Delivery(e.to_string())
        })?;

        tracing::info!(provider = %self.name, user = %user, "confirmation sent");
        Ok(Json(serde_json::json!({ "user": user, "address": address })).into_response())
    }

    async fn confirm(&self, token: &str, parts: &Parts) -> Result<Response> {
        let confirmation = self.tokens.parse(token).await?;

        let handshake = confirmation
            .handshake
            .as_ref()
            .ok_or_else(|| Error::Unauthorized("not a confirmation token".to_string()))?;
        let (user_name, address) = handshake
            .id
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| Error::MalformedToken("invalid confirmation id".to_string()))?;

        let mut user = User::new(format!("{}_{}", self.name, address), user_name);
        user.email = address.to_string();
        user.ip = transport::client_ip(parts);
        finish_picture(&mut user, self.avatar.as_ref(), self.tokens.config().use_gravatar).await;

        let mut claims = self.tokens.claims(user, &confirmation.aud, HashMap::new());
        claims.session_only = confirmation.session_only;

        let mut headers = HeaderMap::new();
        let claims = self.tokens.set(&mut headers, claims).await?;
        tracing::info!(provider = %self.name, user = %claims.sub, "user confirmed");

        if !handshake.from.is_empty() {
            return redirect(&handshake.from, headers);
        }
        Ok(with_headers(Json(claims.user).into_response(), headers))
    }

    pub fn logout(&self) -> Result<Response> {
        let mut headers = HeaderMap::new();
        self.tokens.reset(&mut headers)?;
        Ok(with_headers(StatusCode::OK.into_response(), headers))
    }
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest(format!("missing {}", key)))
}
