//! Service composition and HTTP routes
//!
//! [`Service`] owns the token service, the authenticating middleware and the
//! registered providers. Its [`router`](Service::router) mounts the auth
//! endpoints under the configured prefix (default `/auth`):
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /list` | registered provider names |
//! | `GET /user` | the signed-in user |
//! | `GET /status` | sign-in status |
//! | `GET /logout` | clear the session token |
//! | `/{provider}/login` | start sign-in with a provider |
//! | `/{provider}/callback` | OAuth2 callback (GET or POST) |
//! | `/{provider}/logout` | clear the session token |
//!
//! ```ignore
//! let tokens = TokenService::new(config).with_secret_reader(StaticSecret::new(secret));
//! let mut auth = Service::new(tokens);
//! auth.add_provider("github", &github_config)?;
//!
//! let app = Router::new()
//!     .route("/private", get(private))
//!     .layer(from_fn_with_state(auth.middleware(), Authenticator::auth))
//!     .merge(auth.router());
//! ```

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::avatar::{AvatarSaver, NoOpAvatar};
use crate::config::{AppleConfig, OAuthProviderConfig};
use crate::error::{Error, Result};
use crate::middleware::Authenticator;
use crate::provider::{
    providers, with_headers, AppleProvider, CredChecker, DirectHandler, FilePrivateKeyLoader,
    MemoryStateManager, OAuth2Handler, OAuthProvider, OAuthStateManager, PrivateKeyLoader,
    Provider, Sender, UserIdFunc, VerifyHandler,
};
use crate::token::TokenService;

/// Characters a provider name may not contain (RFC 3986 reserved)
const RESERVED: &[char] = &[
    ':', '/', '?', '#', '[', ']', '@', '!', '$', '&', '\'', '(', ')', '*', '+', ',', ';', '=',
];

/// Auth service: token service, middleware and providers
#[derive(Clone)]
pub struct Service {
    tokens: TokenService,
    authenticator: Authenticator,
    states: Arc<dyn OAuthStateManager>,
    avatar: Arc<dyn AvatarSaver>,
    providers: Vec<Provider>,
}

impl Service {
    /// Create a service without providers
    ///
    /// Configure the token service hooks before calling this; every
    /// provider shares the token service it was registered with.
    pub fn new(tokens: TokenService) -> Self {
        if !tokens.has_secret_reader() {
            tracing::warn!("no secret reader configured, tokens can't be signed or verified");
        }

        let states = Arc::new(MemoryStateManager::new(tokens.config().state_ttl()));
        Self {
            authenticator: Authenticator::new(tokens.clone()),
            tokens,
            states,
            avatar: Arc::new(NoOpAvatar),
            providers: Vec::new(),
        }
    }

    /// Replace the middleware, e.g. to add a validator or a basic-auth checker
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Handshake state store for providers registered afterwards
    pub fn with_state_manager(mut self, states: Arc<dyn OAuthStateManager>) -> Self {
        self.states = states;
        self
    }

    /// Avatar saver for providers registered afterwards
    pub fn with_avatar_saver(mut self, avatar: Arc<dyn AvatarSaver>) -> Self {
        self.avatar = avatar;
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Middleware state for `axum::middleware::from_fn_with_state`
    pub fn middleware(&self) -> Authenticator {
        self.authenticator.clone()
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Result<&Provider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::NotFound(format!("provider {} not found", name)))
    }

    /// Register a built-in OAuth2 provider, or a custom one when the
    /// configuration carries explicit endpoints
    pub fn add_provider(&mut self, name: &str, config: &OAuthProviderConfig) -> Result<()> {
        self.check_name(name)?;
        let redirect_uri = config
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.tokens.config().callback_url(name));
        let provider = providers::build(
            name,
            config,
            &redirect_uri,
            self.tokens.config().http_timeout(),
        )?;

        let handler = self
            .oauth2_handler(provider)
            .with_user_attributes(config.user_attributes.clone());
        self.register(Provider::OAuth2(handler));
        Ok(())
    }

    /// Register any [`OAuthProvider`] implementation
    pub fn add_custom_provider(&mut self, provider: Arc<dyn OAuthProvider>) -> Result<()> {
        self.check_name(provider.name())?;
        let handler = self.oauth2_handler(provider);
        self.register(Provider::OAuth2(handler));
        Ok(())
    }

    /// Register Sign in with Apple
    ///
    /// A key that can't be loaded or used for signing fails this provider
    /// only.
    pub fn add_apple_provider(
        &mut self,
        config: &AppleConfig,
        loader: &dyn PrivateKeyLoader,
    ) -> Result<()> {
        self.check_name("apple")?;
        let provider = AppleProvider::new(
            config.clone(),
            self.tokens.config().callback_url("apple"),
            loader,
            self.tokens.config().http_timeout(),
        )?;

        let handler = self.oauth2_handler(Arc::new(provider));
        self.register(Provider::OAuth2(handler));
        Ok(())
    }

    /// Register the development provider, talking to a
    /// [`DevAuthServer`](crate::provider::providers::DevAuthServer) on `addr`
    pub fn add_dev_provider(&mut self, addr: &str) -> Result<()> {
        self.add_provider("dev", &providers::dev_config(addr))
    }

    pub fn add_direct_provider(&mut self, name: &str, checker: Arc<dyn CredChecker>) -> Result<()> {
        self.check_name(name)?;
        let handler = DirectHandler::new(name, self.tokens.clone(), checker)
            .with_avatar_saver(self.avatar.clone());
        self.register(Provider::Direct(handler));
        Ok(())
    }

    /// Direct provider deriving user IDs with `user_id`
    pub fn add_direct_provider_with_user_id_func(
        &mut self,
        name: &str,
        checker: Arc<dyn CredChecker>,
        user_id: Arc<dyn UserIdFunc>,
    ) -> Result<()> {
        self.check_name(name)?;
        let handler = DirectHandler::new(name, self.tokens.clone(), checker)
            .with_user_id_func(user_id)
            .with_avatar_saver(self.avatar.clone());
        self.register(Provider::Direct(handler));
        Ok(())
    }

    pub fn add_verify_provider(
        &mut self,
        name: &str,
        sender: Arc<dyn Sender>,
        template: &str,
    ) -> Result<()> {
        self.check_name(name)?;
        let handler = VerifyHandler::new(name, self.tokens.clone(), sender)
            .with_template(template)
            .with_avatar_saver(self.avatar.clone());
        self.register(Provider::Verify(handler));
        Ok(())
    }

    /// Register every provider in the configuration
    ///
    /// A provider that fails to register is logged and skipped. Returns the
    /// number of providers registered.
    pub fn add_configured_providers(&mut self) -> usize {
        let config = self.tokens.config().clone();
        let mut names: Vec<&String> = config.providers.keys().collect();
        names.sort();

        let mut registered = 0;
        for name in names {
            match self.add_provider(name, &config.providers[name]) {
                Ok(()) => registered += 1,
                Err(e) => tracing::error!(provider = %name, "failed to register provider: {}", e),
            }
        }

        if let Some(apple) = &config.apple {
            let result = match &apple.private_key_path {
                Some(path) => self.add_apple_provider(apple, &FilePrivateKeyLoader::new(path)),
                None => Err(Error::BadRequest("apple needs private_key_path".to_string())),
            };
            match result {
                Ok(()) => registered += 1,
                Err(e) => tracing::error!(provider = "apple", "failed to register provider: {}", e),
            }
        }
        registered
    }

    /// Auth routes, mounted under the configured prefix
    pub fn router(&self) -> Router {
        let routes = Router::new()
            .route("/list", get(list))
            .route("/user", get(user))
            .route("/status", get(status))
            .route("/logout", get(logout).post(logout))
            .route("/{provider}/login", get(login).post(login))
            .route("/{provider}/callback", get(callback).post(callback))
            .route("/{provider}/logout", get(provider_logout).post(provider_logout))
            .with_state(Arc::new(self.clone()));

        let prefix = self.tokens.config().auth_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            routes
        } else {
            Router::new().nest(prefix, routes)
        }
    }

    fn oauth2_handler(&self, provider: Arc<dyn OAuthProvider>) -> OAuth2Handler {
        OAuth2Handler::new(provider, self.tokens.clone(), self.states.clone())
            .with_avatar_saver(self.avatar.clone())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::BadRequest("provider name is empty".to_string()));
        }
        if let Some(c) = name.chars().find(|c| RESERVED.contains(c) || c.is_whitespace()) {
            return Err(Error::BadRequest(format!(
                "provider name {:?} contains reserved character {:?}",
                name, c
            )));
        }
        if self.providers.iter().any(|p| p.name() == name) {
            return Err(Error::BadRequest(format!("provider {} already registered", name)));
        }
        Ok(())
    }

    fn register(&mut self, provider: Provider) {
        tracing::info!(provider = %provider.name(), "provider registered");
        self.providers.push(provider);
    }
}

async fn list(State(service): State<Arc<Service>>) -> Json<Vec<String>> {
    Json(
        service
            .providers
            .iter()
            .map(|p| p.name().to_string())
            .collect(),
    )
}

async fn user(State(service): State<Arc<Service>>, request: Request) -> Result<Response> {
    let (parts, _) = request.into_parts();
    let claims = service.tokens.get(&parts).await?;
    let user = claims
        .user
        .ok_or_else(|| Error::Unauthorized("token has no user".to_string()))?;
    Ok(Json(user).into_response())
}

async fn status(State(service): State<Arc<Service>>, request: Request) -> Json<serde_json::Value> {
    let (parts, _) = request.into_parts();
    match service.tokens.get(&parts).await {
        Ok(claims) if claims.user.is_some() && claims.handshake.is_none() => {
            let name = claims.user.map(|u| u.name).unwrap_or_default();
            Json(serde_json::json!({ "status": "logged in", "user": name }))
        }
        _ => Json(serde_json::json!({ "status": "not logged in" })),
    }
}

async fn logout(State(service): State<Arc<Service>>) -> Result<Response> {
    let mut headers = HeaderMap::new();
    service.tokens.reset(&mut headers)?;
    Ok(with_headers(StatusCode::OK.into_response(), headers))
}

async fn login(
    State(service): State<Arc<Service>>,
    Path(provider): Path<String>,
    request: Request,
) -> Result<Response> {
    service.provider(&provider)?.login(request).await
}

async fn callback(
    State(service): State<Arc<Service>>,
    Path(provider): Path<String>,
    request: Request,
) -> Result<Response> {
    service.provider(&provider)?.callback(request).await
}

async fn provider_logout(
    State(service): State<Arc<Service>>,
    Path(provider): Path<String>,
) -> Result<Response> {
    service.provider(&provider)?.logout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::avatar::tests::ProxyAvatar;
    use crate::provider::handshake::tests::FakeProvider;
    use crate::token::service::tests::{cookies_from, service};
    use crate::token::User;
    use axum::body::{to_bytes, Body};
    use axum::http::header;
    use tower::ServiceExt;

    fn auth_service() -> Service {
        let mut auth = Service::new(service(AuthConfig::default()));
        let checker = |user: &str, password: &str| -> Result<bool> {
            Ok(user == "bob" && password == "s3cret")
        };
        auth.add_direct_provider("local", Arc::new(checker)).unwrap();
        auth
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(router: &Router, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::get(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_provider_name_validation() {
        let mut auth = auth_service();
        let checker = |_: &str, _: &str| -> Result<bool> { Ok(true) };

        for bad in ["", "a/b", "a?b", "x y", "dev@home"] {
            assert!(matches!(
                auth.add_direct_provider(bad, Arc::new(checker)),
                Err(Error::BadRequest(_))
            ));
        }
        assert!(matches!(
            auth.add_direct_provider("local", Arc::new(checker)),
            Err(Error::BadRequest(_))
        ));
        assert!(auth.add_direct_provider("local-2", Arc::new(checker)).is_ok());
        assert_eq!(auth.providers().len(), 2);
    }

    #[test]
    fn test_failed_provider_leaves_others() {
        let mut auth = auth_service();
        let config = OAuthProviderConfig {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            redirect_uri: Some("https://example.com/auth/gitlab/callback".to_string()),
            scopes: vec![],
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            user_attributes: Default::default(),
        };
        // no endpoints, so not even a custom provider
        let result = auth.add_provider("gitlab", &config);
        assert!(result.is_err());
        assert_eq!(auth.providers().len(), 1);
        assert!(auth.provider("local").is_ok());
    }

    #[test]
    fn test_configured_providers() {
        let mut config = AuthConfig {
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        config.providers.insert(
            "github".to_string(),
            OAuthProviderConfig {
                client_id: "cid".to_string(),
                client_secret: "cs".to_string(),
                redirect_uri: None,
                scopes: vec![],
                authorization_endpoint: None,
                token_endpoint: None,
                userinfo_endpoint: None,
                user_attributes: Default::default(),
            },
        );
        config.apple = Some(AppleConfig {
            client_id: "com.example".to_string(),
            team_id: "T".to_string(),
            key_id: "K".to_string(),
            private_key_path: Some("/nonexistent/key.p8".into()),
            response_mode: "form_post".to_string(),
            scopes: vec![],
        });

        let mut auth = Service::new(service(config));
        // apple fails on the missing key, github still registers
        assert_eq!(auth.add_configured_providers(), 1);
        assert_eq!(auth.providers()[0].name(), "github");
    }

    #[tokio::test]
    async fn test_list_and_unknown_provider() {
        let mut auth = auth_service();
        auth.add_custom_provider(Arc::new(FakeProvider::default()))
            .unwrap();
        let router = auth.router();

        let response = get(&router, "/auth/list", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!(["local", "fake"]));

        let response = get(&router, "/auth/nope/login", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // direct providers have no callback
        let response = get(&router, "/auth/local/callback", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_then_user_and_status() {
        let router = auth_service().router();

        let response = get(&router, "/auth/status", None).await;
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "not logged in"})
        );
        let response = get(&router, "/auth/user", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get(&router, "/auth/local/login?user=bob&passwd=s3cret", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = cookies_from(response.headers());
        let xsrf = cookies
            .split("; ")
            .find_map(|c| c.strip_prefix("XSRF-TOKEN="))
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(
                Request::get("/auth/user")
                    .header(header::COOKIE, &cookies)
                    .header("X-XSRF-TOKEN", &xsrf)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let user: User = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(user.name, "bob");

        // without the XSRF header the cookie is not accepted
        let response = get(&router, "/auth/status", Some(&cookies)).await;
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "not logged in"})
        );

        let response = router
            .clone()
            .oneshot(
                Request::get("/auth/status")
                    .header(header::COOKIE, &cookies)
                    .header("X-XSRF-TOKEN", &xsrf)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "logged in", "user": "bob"})
        );
    }

    #[tokio::test]
    async fn test_logout_clears_cookies() {
        let router = auth_service().router();
        for uri in ["/auth/logout", "/auth/local/logout"] {
            let response = get(&router, uri, None).await;
            assert_eq!(response.status(), StatusCode::OK);
            let cleared: Vec<_> = response
                .headers()
                .get_all(header::SET_COOKIE)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect();
            assert_eq!(cleared.len(), 2);
            assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));
        }
    }

    #[tokio::test]
    async fn test_router_without_prefix() {
        let auth = Service::new(service(AuthConfig {
            auth_prefix: String::new(),
            ..Default::default()
        }));
        let response = get(&auth.router(), "/list", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_service_avatar_saver_reaches_direct_provider() {
        let mut auth = Service::new(service(AuthConfig::default())).with_avatar_saver(Arc::new(ProxyAvatar));
        let checker = |_: &str, _: &str| -> Result<bool> { Ok(true) };
        auth.add_direct_provider("local", Arc::new(checker)).unwrap();
        let router = auth.router();

        let response = get(&router, "/auth/local/login?user=bob&passwd=x", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let user: User = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(user.picture, format!("/avatars/{}.image", user.id));
    }

    #[test]
    fn test_dev_provider_registration() {
        let mut auth = auth_service();
        auth.add_dev_provider("127.0.0.1:9096").unwrap();
        assert!(auth.provider("dev").is_ok());
        assert!(matches!(
            auth.add_dev_provider("127.0.0.1:9096"),
            Err(Error::BadRequest(_))
        ));
    }
}
