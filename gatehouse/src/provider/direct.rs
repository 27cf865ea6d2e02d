//! Direct credential sign-in

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
use crate::token::{hash_id, TokenService, User};

/// Checks a user name and password against an external store
#[async_trait]
pub trait CredChecker: Send + Sync {
    async fn check(&self, user: &str, password: &str) -> Result<bool>;
}

#[async_trait]
impl<F> CredChecker for F
where
    F: Fn(&str, &str) -> Result<bool> + Send + Sync,
{
    async fn check(&self, user: &str, password: &str) -> Result<bool> {
        self(user, password)
    }
}

/// Derives the user ID from the user name and request
pub trait UserIdFunc: Send + Sync {
    fn user_id(&self, user: &str, parts: &Parts) -> String;
}

impl<F> UserIdFunc for F
where
    F: Fn(&str, &Parts) -> String + Send + Sync,
{
    fn user_id(&self, user: &str, parts: &Parts) -> String {
        self(user, parts)
    }
}

/// Sign-in by user name and password, no redirects involved
///
/// Accepts `user`, `passwd`, `aud` (or `site`), `session` and `from` from the
/// query string, a form body or a JSON body.
#[derive(Clone)]
pub struct DirectHandler {
    name: String,
    tokens: TokenService,
    checker: Arc<dyn CredChecker>,
    user_id: Option<Arc<dyn UserIdFunc>>,
    avatar: Arc<dyn AvatarSaver>,
}

impl DirectHandler {
    pub fn new(name: impl Into<String>, tokens: TokenService, checker: Arc<dyn CredChecker>) -> Self {
        Self {
            name: name.into(),
            tokens,
            checker,
            user_id: None,
            avatar: Arc::new(NoOpAvatar),
        }
    }

    pub fn with_avatar_saver(mut self, avatar: Arc<dyn AvatarSaver>) -> Self {
        self.avatar = avatar;
        self
    }

    pub fn with_user_id_func(mut self, user_id: Arc<dyn UserIdFunc>) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn login(&self, request: Request) -> Result<Response> {
        let (parts, params) = request_params(request).await?;

        let user_name = params
            .get("user")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::BadRequest("missing user".to_string()))?;
        let password = params.get("passwd").map(String::as_str).unwrap_or_default();

        if !self.checker.check(user_name, password).await? {
            tracing::warn!(provider = %self.name, user = %user_name, "credentials rejected");
            return Err(Error::CredentialRejected);
        }

        let mut login = LoginParams::from_params(&params, &self.tokens.config().url);
        if let Some(aud) = params.get("aud").filter(|a| !a.is_empty()) {
            login.site = aud.clone();
        }

        let id = match &self.user_id {
            Some(user_id) => format!("{}_{}", self.name, user_id.user_id(user_name, &parts)),
            None => format!("{}_{}", self.name, hash_id(user_name)),
        };
        let mut user = User::new(id, user_name.clone());
        user.ip = transport::client_ip(&parts);
        finish_picture(&mut user, self.avatar.as_ref(), self.tokens.config().use_gravatar).await;

        let mut claims = self.tokens.claims(user, &login.site, HashMap::new());
        claims.session_only = login.session_only;

        let mut headers = HeaderMap::new();
        let claims = self.tokens.set(&mut headers, claims).await?;
        tracing::info!(provider = %self.name, user = %claims.sub, "user signed in");

        match login.from {
            Some(from) => redirect(&from, headers),
            None => Ok(with_headers(Json(claims.user).into_response(), headers)),
        }
    }

    pub fn logout(&self) -> Result<Response> {
        let mut headers = HeaderMap::new();
        self.tokens.reset(&mut headers)?;
        Ok(with_headers(StatusCode::OK.into_response(), headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::tests::ProxyAvatar;
    use crate::config::AuthConfig;
    use crate::token::service::tests::service;
    use axum::body::{to_bytes, Body};
    use axum::http::header;

    fn handler() -> DirectHandler {
        let checker = |user: &str, password: &str| -> Result<bool> {
            Ok(user == "bob" && password == "s3cret")
        };
        DirectHandler::new("local", service(AuthConfig::default()), Arc::new(checker))
    }

    async fn body_user(response: Response) -> User {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<User>(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_login_with_query() {
        let response = handler()
            .login(
                Request::get("/auth/local/login?user=bob&passwd=s3cret&aud=site1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);

        let user = body_user(response).await;
        assert_eq!(user.id, format!("local_{}", hash_id("bob")));
        assert_eq!(user.name, "bob");
        assert_eq!(user.audience, "site1");
    }

    #[tokio::test]
    async fn test_login_with_json_body() {
        let response = handler()
            .login(
                Request::post("/auth/local/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"user":"bob","passwd":"s3cret","from":"/home"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/home");
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let result = handler()
            .login(
                Request::get("/auth/local/login?user=bob&passwd=wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(matches!(result, Err(Error::CredentialRejected)));

        let missing = handler()
            .login(Request::get("/auth/local/login").body(Body::empty()).unwrap())
            .await;
        assert!(matches!(missing, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_user_id_func() {
        let id_func = |user: &str, _parts: &Parts| -> String { format!("custom-{}", user) };
        let handler = handler().with_user_id_func(Arc::new(id_func));
        let response = handler
            .login(
                Request::get("/auth/local/login?user=bob&passwd=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_user(response).await.id, "local_custom-bob");
    }

    #[tokio::test]
    async fn test_avatar_saver_and_client_ip() {
        let handler = handler().with_avatar_saver(Arc::new(ProxyAvatar));
        let response = handler
            .login(
                Request::get("/auth/local/login?user=bob&passwd=s3cret")
                    .header("X-Forwarded-For", "203.0.113.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let user = body_user(response).await;
        assert_eq!(user.picture, format!("/avatars/{}.image", user.id));
        assert_eq!(user.ip, "203.0.113.7");
    }
}
