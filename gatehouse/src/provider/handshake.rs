//! Authorization-code handshake shared by all OAuth2 providers
//!
//! `login` issues a fresh state value, binds it to the browser with a
//! short-lived handshake cookie and redirects to the provider. `callback`
//! accepts only that state, exchanges the code, normalizes the user and
//! issues the session token. A state mismatch aborts before any exchange.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::oauth::OAuthProvider;
use super::state::{OAuthStateManager, StateData};
use super::{redirect, request_params, with_headers, LoginParams};
use crate::avatar::{finish_picture, AvatarSaver, NoOpAvatar};
use crate::config::SameSite;
use crate::error::{Error, Result};
use crate::token::transport::{self, Cookie};
use crate::token::{TokenService, User};

/// Handshake engine for one OAuth2 provider
#[derive(Clone)]
pub struct OAuth2Handler {
    provider: Arc<dyn OAuthProvider>,
    tokens: TokenService,
    states: Arc<dyn OAuthStateManager>,
    avatar: Arc<dyn AvatarSaver>,
    user_attributes: HashMap<String, String>,
}

impl OAuth2Handler {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        tokens: TokenService,
        states: Arc<dyn OAuthStateManager>,
    ) -> Self {
        Self {
            provider,
            tokens,
            states,
            avatar: Arc::new(NoOpAvatar),
            user_attributes: HashMap::new(),
        }
    }

    pub fn with_avatar_saver(mut self, avatar: Arc<dyn AvatarSaver>) -> Self {
        self.avatar = avatar;
        self
    }

    /// Copy provider user-info fields into user attributes, `field -> attribute`
    pub fn with_user_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.user_attributes = attributes;
        self
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    /// Redirect to the provider's authorization page
    pub async fn login(&self, request: Request) -> Result<Response> {
        let (_, params) = request_params(request).await?;
        let login = LoginParams::from_params(&params, &self.tokens.config().url);

        let data = StateData {
            provider: self.name().to_string(),
            from: login.from,
            audience: login.site,
            session_only: login.session_only,
            created_at: chrono::Utc::now().timestamp(),
        };
        let state = self.states.create_state(&data).await?;
        let url = self.provider.authorization_url(&state)?;

        let mut headers = HeaderMap::new();
        self.handshake_cookie(&mut headers, &state, Some(self.tokens.config().state_ttl_secs as i64))?;

        tracing::debug!(provider = %self.name(), aud = %data.audience, "redirecting to provider");
        redirect(&url, headers)
    }

    /// Complete the handshake and issue the session token
    pub async fn callback(&self, request: Request) -> Result<Response> {
        let (parts, params) = request_params(request).await?;

        if let Some(error) = params.get("error") {
            let description = params.get("error_description").cloned().unwrap_or_default();
            return Err(Error::upstream(format!("{}: {}", error, description)));
        }

        let state = params.get("state").cloned().unwrap_or_default();
        let cookie = transport::read_cookie(&parts.headers, &self.tokens.config().handshake_cookie_name)
            .unwrap_or_default();
        let bound: bool = state.as_bytes().ct_eq(cookie.as_bytes()).into();
        if state.is_empty() || !bound {
            tracing::warn!(provider = %self.name(), "handshake state does not match cookie");
            return Err(Error::StateMismatch);
        }

        let data = self.states.validate_state(&state).await?;
        if data.provider != self.name() {
            tracing::warn!(provider = %self.name(), state_provider = %data.provider, "state issued for another provider");
            return Err(Error::StateMismatch);
        }

        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::BadRequest("missing code".to_string()))?;

        let provider_tokens = self.provider.exchange_code(code).await?;
        let mut info = self.provider.fetch_user_info(&provider_tokens).await?;
        self.provider.callback_user_info(&params, &mut info);
        let mut user = self.normalize(&info).await?;
        user.ip = transport::client_ip(&parts);

        let mut claims = self.tokens.claims(user, &data.audience, HashMap::new());
        claims.session_only = data.session_only;

        let mut headers = HeaderMap::new();
        let claims = self.tokens.set(&mut headers, claims).await?;
        self.handshake_cookie(&mut headers, "", Some(0))?;

        tracing::info!(provider = %self.name(), user = %claims.sub, aud = %claims.aud, "user signed in");

        match data.from {
            Some(from) => redirect(&from, headers),
            None => Ok(with_headers(Json(claims.user).into_response(), headers)),
        }
    }

    /// Map provider user info to a user, then apply attributes and avatar
    async fn normalize(&self, info: &serde_json::Value) -> Result<User> {
        let mut user = self.provider.map_user(info)?;

        for (field, attribute) in &self.user_attributes {
            if let Some(value) = info.get(field) {
                user.attributes.insert(attribute.clone(), value.clone());
            }
        }

        finish_picture(&mut user, self.avatar.as_ref(), self.tokens.config().use_gravatar).await;
        Ok(user)
    }

    /// Clear the session token
    pub fn logout(&self) -> Result<Response> {
        let mut headers = HeaderMap::new();
        self.tokens.reset(&mut headers)?;
        Ok(with_headers(StatusCode::OK.into_response(), headers))
    }

    fn handshake_cookie(&self, headers: &mut HeaderMap, state: &str, max_age: Option<i64>) -> Result<()> {
        let config = self.tokens.config();
        // a cross-site form post only carries SameSite=None cookies
        let (same_site, secure) = if self.provider.uses_form_post() {
            (SameSite::None, true)
        } else {
            (SameSite::Lax, config.secure_cookies)
        };

        let cookie = Cookie {
            name: &config.handshake_cookie_name,
            value: state,
            domain: None,
            max_age,
            http_only: true,
            secure,
            same_site,
        };
        transport::append_cookie(headers, &cookie)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::provider::oauth::OAuthTokens;
    use crate::provider::state::MemoryStateManager;
    use crate::token::{gravatar_url, hash_id};
    use crate::token::service::tests::{cookies_from, service};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider double that never leaves the process
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub exchanges: AtomicUsize,
        pub fail_exchange: bool,
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn authorization_url(&self, state: &str) -> Result<String> {
            Ok(format!("https://idp.example.com/authorize?state={}", state))
        }

        async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail_exchange {
                return Err(Error::Upstream {
                    status: Some(400),
                    body: "bad_verification_code".to_string(),
                });
            }
            Ok(OAuthTokens {
                access_token: format!("access-{}", code),
                token_type: "Bearer".to_string(),
                ..Default::default()
            })
        }

        async fn fetch_user_info(&self, _tokens: &OAuthTokens) -> Result<serde_json::Value> {
            Ok(serde_json::json!({
                "id": 1234,
                "login": "bob",
                "email": "bob@example.com",
                "plan": "pro"
            }))
        }

        fn map_user(&self, info: &serde_json::Value) -> Result<User> {
            let id = crate::provider::oauth::required_id(info, "id", "fake")?;
            let mut user = User::new(format!("fake_{}", hash_id(&id)), "bob");
            user.email = info["email"].as_str().unwrap_or_default().to_string();
            Ok(user)
        }
    }

    pub(crate) fn handler(provider: Arc<FakeProvider>, config: AuthConfig) -> OAuth2Handler {
        let states = Arc::new(MemoryStateManager::new(Duration::from_secs(600)));
        OAuth2Handler::new(provider, service(config), states)
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn login(handler: &OAuth2Handler, query: &str) -> (String, String) {
        let response = handler
            .login(
                Request::get(format!("/auth/fake/login{}", query))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let state = location(&response).split("state=").nth(1).unwrap().to_string();
        (state, cookies_from(response.headers()))
    }

    #[tokio::test]
    async fn test_login_redirects_with_state_cookie() {
        let handler = handler(Arc::new(FakeProvider::default()), AuthConfig::default());
        let (state, cookies) = login(&handler, "?site=site1").await;
        assert_eq!(state.len(), 43);
        assert_eq!(cookies, format!("HANDSHAKE={}", state));
    }

    #[tokio::test]
    async fn test_callback_issues_token_and_redirects() {
        let provider = Arc::new(FakeProvider::default());
        let handler = handler(provider.clone(), AuthConfig::default())
            .with_user_attributes(HashMap::from([("plan".to_string(), "plan".to_string())]));
        let (state, cookies) = login(&handler, "?site=site1&from=%2Fdashboard&session=1").await;

        let response = handler
            .callback(
                Request::get(format!("/auth/fake/callback?code=c1&state={}", state))
                    .header(header::COOKIE, cookies)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/dashboard");
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 1);

        let set: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(set.iter().any(|c| c.starts_with("HANDSHAKE=;") && c.contains("Max-Age=0")));
        let jwt = set.iter().find(|c| c.starts_with("JWT=")).unwrap();
        assert!(!jwt.contains("Max-Age"), "session-only cookie expected");

        let token = jwt.trim_start_matches("JWT=").split(';').next().unwrap();
        let claims = handler.tokens.parse(token).await.unwrap();
        let user = claims.user.unwrap();
        assert_eq!(user.id, format!("fake_{}", hash_id("1234")));
        assert_eq!(user.str_attr("plan"), "pro");
        assert_eq!(claims.aud, "site1");
    }

    #[tokio::test]
    async fn test_same_user_info_gives_same_id() {
        let provider = Arc::new(FakeProvider::default());
        let handler = handler(provider, AuthConfig::default());

        let mut ids = Vec::new();
        for _ in 0..2 {
            let (state, cookies) = login(&handler, "").await;
            let response = handler
                .callback(
                    Request::get(format!("/auth/fake/callback?code=c&state={}", state))
                        .header(header::COOKIE, cookies)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let user: User = serde_json::from_slice(&body).unwrap();
            ids.push(user.id);
        }
        assert_eq!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_unknown_state_never_exchanges() {
        let provider = Arc::new(FakeProvider::default());
        let handler = handler(provider.clone(), AuthConfig::default());

        let result = handler
            .callback(
                Request::get("/auth/fake/callback?code=c1&state=forged")
                    .header(header::COOKIE, "HANDSHAKE=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(matches!(result, Err(Error::StateMismatch)));
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_without_matching_cookie() {
        let provider = Arc::new(FakeProvider::default());
        let handler = handler(provider.clone(), AuthConfig::default());
        let (state, _) = login(&handler, "").await;

        let result = handler
            .callback(
                Request::get(format!("/auth/fake/callback?code=c1&state={}", state))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(matches!(result, Err(Error::StateMismatch)));
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let handler = handler(Arc::new(FakeProvider::default()), AuthConfig::default());
        let (state, cookies) = login(&handler, "").await;

        let callback = || {
            Request::get(format!("/auth/fake/callback?code=c1&state={}", state))
                .header(header::COOKIE, cookies.clone())
                .body(Body::empty())
                .unwrap()
        };
        assert!(handler.callback(callback()).await.is_ok());
        assert!(matches!(
            handler.callback(callback()).await,
            Err(Error::StateMismatch)
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces() {
        let provider = Arc::new(FakeProvider {
            fail_exchange: true,
            ..Default::default()
        });
        let handler = handler(provider, AuthConfig::default());
        let (state, cookies) = login(&handler, "").await;

        let result = handler
            .callback(
                Request::get(format!("/auth/fake/callback?code=c1&state={}", state))
                    .header(header::COOKIE, cookies)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Upstream { status: Some(400), .. })
        ));
    }

    #[tokio::test]
    async fn test_gravatar_fallback() {
        let handler = handler(
            Arc::new(FakeProvider::default()),
            AuthConfig {
                use_gravatar: true,
                ..Default::default()
            },
        );
        let user = handler
            .normalize(&serde_json::json!({"id": 1, "email": "bob@example.com"}))
            .await
            .unwrap();
        assert_eq!(user.picture, gravatar_url("bob@example.com"));
    }

    #[tokio::test]
    async fn test_provider_error_param() {
        let handler = handler(Arc::new(FakeProvider::default()), AuthConfig::default());
        let result = handler
            .callback(
                Request::get("/auth/fake/callback?error=access_denied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(matches!(result, Err(Error::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_logout_clears_cookies() {
        let handler = handler(Arc::new(FakeProvider::default()), AuthConfig::default());
        let response = handler.logout().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
