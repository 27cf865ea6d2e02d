//! Request-authenticating middleware
//!
//! Use with `axum::middleware::from_fn_with_state`:
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/private", get(handler))
//!     .layer(axum::middleware::from_fn_with_state(authenticator, Authenticator::auth));
//! ```

use axum::{
    extract::{Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::refresh_cache::{MemoryRefreshCache, RefreshCache};
use crate::error::{Error, Result};
use crate::token::{Claims, TokenService, User, Validator};

/// Name and ID of the basic-auth identity
pub const ADMIN_USER: &str = "admin";

/// Basic-auth credential check, replaces the configured admin password
pub trait BasicAuthChecker: Send + Sync {
    fn check(&self, user: &str, passwd: &str) -> Result<bool>;
}

impl<F> BasicAuthChecker for F
where
    F: Fn(&str, &str) -> Result<bool> + Send + Sync,
{
    fn check(&self, user: &str, passwd: &str) -> Result<bool> {
        self(user, passwd)
    }
}

/// Successful authentication
struct Authenticated {
    claims: Claims,
    /// Replacement token to write back to the client
    refreshed: bool,
}

/// Authenticating middleware state
#[derive(Clone)]
pub struct Authenticator {
    tokens: TokenService,
    refresh_cache: Arc<dyn RefreshCache>,
    validator: Option<Arc<dyn Validator>>,
    basic_checker: Option<Arc<dyn BasicAuthChecker>>,
    admin_passwd: Option<String>,
}

impl Authenticator {
    /// Create an authenticator over a token service
    ///
    /// Uses an in-memory refresh cache and the configured admin password.
    pub fn new(tokens: TokenService) -> Self {
        let config = tokens.config();
        let refresh_cache = Arc::new(MemoryRefreshCache::new(config.refresh_cache_ttl()));
        let admin_passwd = config.admin_passwd.clone().filter(|p| !p.is_empty());

        Self {
            tokens,
            refresh_cache,
            validator: None,
            basic_checker: None,
            admin_passwd,
        }
    }

    pub fn with_refresh_cache(mut self, cache: impl RefreshCache + 'static) -> Self {
        self.refresh_cache = Arc::new(cache);
        self
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_basic_auth_checker(mut self, checker: impl BasicAuthChecker + 'static) -> Self {
        self.basic_checker = Some(Arc::new(checker));
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Require an authenticated user
    pub async fn auth(
        State(auth): State<Self>,
        request: Request,
        next: Next,
    ) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let authenticated = auth.authenticate(&parts).await?;
        auth.run(authenticated, parts, body, next).await
    }

    /// Attach the user when one is present, never reject
    pub async fn trace(
        State(auth): State<Self>,
        request: Request,
        next: Next,
    ) -> Result<Response> {
        let (parts, body) = request.into_parts();
        match auth.authenticate(&parts).await {
            Ok(authenticated) => auth.run(authenticated, parts, body, next).await,
            Err(e) => {
                tracing::debug!("anonymous request: {}", e);
                Ok(next.run(Request::from_parts(parts, body)).await)
            }
        }
    }

    /// Require an authenticated admin user
    pub async fn admin_only(
        State(auth): State<Self>,
        request: Request,
        next: Next,
    ) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let authenticated = auth.authenticate(&parts).await?;

        let is_admin = authenticated
            .claims
            .user
            .as_ref()
            .map(User::is_admin)
            .unwrap_or(false);
        if !is_admin {
            return Err(Error::Forbidden("admin only".to_string()));
        }

        auth.run(authenticated, parts, body, next).await
    }

    async fn run(
        &self,
        authenticated: Authenticated,
        mut parts: Parts,
        body: axum::body::Body,
        next: Next,
    ) -> Result<Response> {
        let Authenticated { claims, refreshed } = authenticated;

        let mut cookies = HeaderMap::new();
        if refreshed {
            self.tokens.write(&mut cookies, &claims)?;
        }

        if let Some(user) = claims.user.clone() {
            parts.extensions.insert(user);
        }
        parts.extensions.insert(claims);

        let request = Request::from_parts(parts, body);
        let mut response = next.run(request).await;

        for (name, value) in cookies.iter() {
            response.headers_mut().append(name.clone(), value.clone());
        }
        Ok(response)
    }

    /// Authenticate a request without running it
    ///
    /// Token first; an expired but correctly signed token is refreshed once
    /// per stale token. Without any token, basic auth is tried. A present
    /// but invalid token never falls back to basic auth.
    async fn authenticate(&self, parts: &Parts) -> Result<Authenticated> {
        let (claims, refreshed) = match self.tokens.get(parts).await {
            Ok(claims) => (claims, false),
            Err(Error::Expired(stale)) => (self.refresh(*stale).await?, true),
            Err(Error::Unauthorized(_)) => (self.basic_auth(&parts.headers)?, false),
            Err(e) => {
                tracing::debug!(path = %parts.uri.path(), "token rejected: {}", e);
                return Err(e);
            }
        };

        let Some(user) = claims.user.as_ref() else {
            return Err(Error::Unauthorized("token has no user".to_string()));
        };
        if claims.handshake.is_some() {
            return Err(Error::Unauthorized("handshake token is not a session".to_string()));
        }

        if let Some(validator) = &self.validator {
            if !validator.validate(&claims.token, &claims) {
                tracing::warn!(user = %user.id, "user rejected by validator");
                return Err(Error::Unauthorized("rejected by validator".to_string()));
            }
        }

        Ok(Authenticated { claims, refreshed })
    }

    async fn refresh(&self, stale: Claims) -> Result<Claims> {
        if stale.user.is_none() || stale.handshake.is_some() {
            return Err(Error::Unauthorized("token can't be refreshed".to_string()));
        }

        let slot = self.refresh_cache.slot(&stale.token);
        let refreshed = slot
            .get_or_try_init(|| async {
                tracing::debug!(aud = %stale.aud, jti = %stale.jti, "refreshing expired token");
                self.tokens.refresh(&stale).await
            })
            .await?;
        Ok(refreshed.clone())
    }

    fn basic_auth(&self, headers: &HeaderMap) -> Result<Claims> {
        let (user, passwd) = basic_credentials(headers)
            .ok_or_else(|| Error::Unauthorized("no credentials".to_string()))?;

        let accepted = match (&self.basic_checker, &self.admin_passwd) {
            (Some(checker), _) => checker.check(&user, &passwd)?,
            (None, Some(admin_passwd)) => {
                let passwd_ok: bool = passwd.as_bytes().ct_eq(admin_passwd.as_bytes()).into();
                user == ADMIN_USER && passwd_ok
            }
            (None, None) => false,
        };

        if !accepted {
            tracing::warn!(user = %user, "basic auth rejected");
            return Err(Error::Unauthorized("basic auth rejected".to_string()));
        }

        let mut admin = User::new(ADMIN_USER, ADMIN_USER);
        admin.set_admin(true);
        Ok(Claims {
            sub: admin.id.clone(),
            iss: self.tokens.config().issuer.clone(),
            user: Some(admin),
            ..Default::default()
        })
    }
}

/// `(user, password)` from `Authorization: Basic`
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, passwd) = decoded.split_once(':')?;
    Some((user.to_string(), passwd.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::token::service::tests::{cookies_from, service, SECRET};
    use crate::token::AuthUser;
    use axum::{
        body::{to_bytes, Body},
        http::StatusCode,
        routing::get,
        Router,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn whoami(AuthUser(user): AuthUser) -> String {
        user.id
    }

    fn app(auth: Authenticator) -> Router {
        Router::new()
            .route("/private", get(whoami))
            .layer(axum::middleware::from_fn_with_state(auth, Authenticator::auth))
    }

    fn basic(user: &str, passwd: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, passwd)))
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let tokens = service(AuthConfig::default());
        let token = tokens
            .issue(User::new("u1", "Bob"), "site1", HashMap::new())
            .await
            .unwrap();

        let response = app(Authenticator::new(tokens))
            .oneshot(
                axum::http::Request::get("/private")
                    .header("X-JWT", &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(body_string(response).await, "u1");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = app(Authenticator::new(service(AuthConfig::default())))
            .oneshot(
                axum::http::Request::get("/private")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_token_does_not_fall_back_to_basic() {
        let auth = Authenticator::new(service(AuthConfig {
            admin_passwd: Some("secret".to_string()),
            ..Default::default()
        }));
        let response = app(auth)
            .oneshot(
                axum::http::Request::get("/private?token=bad.token.here")
                    .header(header::AUTHORIZATION, basic("admin", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_basic_auth_admin() {
        let auth = Authenticator::new(service(AuthConfig {
            admin_passwd: Some("secret".to_string()),
            ..Default::default()
        }));

        let ok = app(auth.clone())
            .oneshot(
                axum::http::Request::get("/private")
                    .header(header::AUTHORIZATION, basic("admin", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_string(ok).await, "admin");

        let wrong = app(auth)
            .oneshot(
                axum::http::Request::get("/private")
                    .header(header::AUTHORIZATION, basic("admin", "nope"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_basic_auth_checker_overrides_password() {
        let auth = Authenticator::new(service(AuthConfig {
            admin_passwd: Some("secret".to_string()),
            ..Default::default()
        }))
        .with_basic_auth_checker(|user: &str, passwd: &str| -> Result<bool> {
            Ok(user == "ops" && passwd == "pw")
        });

        assert!(auth.basic_auth(&basic_headers("ops", "pw")).is_ok());
        assert!(auth.basic_auth(&basic_headers("admin", "secret")).is_err());
    }

    fn basic_headers(user: &str, passwd: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, basic(user, passwd).parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_validator_rejects() {
        let tokens = service(AuthConfig::default());
        let token = tokens
            .issue(User::new("banned", "Eve"), "site1", HashMap::new())
            .await
            .unwrap();
        let auth = Authenticator::new(tokens).with_validator(|_: &str, claims: &Claims| {
            claims.user.as_ref().map(|u| u.id != "banned").unwrap_or(false)
        });

        let response = app(auth)
            .oneshot(
                axum::http::Request::get("/private")
                    .header("X-JWT", &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_handshake_token_is_not_a_session() {
        let tokens = service(AuthConfig::default());
        let mut claims = tokens.claims(User::new("u1", "Bob"), "site1", HashMap::new());
        claims.handshake = Some(crate::token::Handshake {
            id: "bob::bob@example.com".to_string(),
            ..Default::default()
        });
        let token = tokens.token(&claims).await.unwrap();

        let response = app(Authenticator::new(tokens))
            .oneshot(
                axum::http::Request::get("/private")
                    .header("X-JWT", &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_cookie_is_refreshed() {
        let tokens = service(AuthConfig::default());
        let mut claims = tokens.claims(User::new("u1", "Bob"), "site1", HashMap::new());
        claims.exp = Utc::now().timestamp() - 5;
        let mut set = HeaderMap::new();
        let stale = tokens.set(&mut set, claims).await.unwrap();

        let response = app(Authenticator::new(tokens.clone()))
            .oneshot(
                axum::http::Request::get("/private")
                    .header(header::COOKIE, cookies_from(&set))
                    .header("X-XSRF-TOKEN", &stale.jti)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let new_cookies = cookies_from(response.headers());
        let new_token = new_cookies
            .split("; ")
            .find_map(|c| c.strip_prefix("JWT="))
            .unwrap()
            .to_string();
        assert_ne!(new_token, stale.token);
        let parsed = tokens.parse(&new_token).await.unwrap();
        assert_eq!(parsed.user.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_concurrent_refresh_happens_once() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        let tokens = crate::token::TokenService::new(AuthConfig::default()).with_secret_reader(
            move |_: &str| -> Result<String> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(SECRET.to_string())
            },
        );

        let mut claims = tokens.claims(User::new("u1", "Bob"), "site1", HashMap::new());
        claims.exp = Utc::now().timestamp() - 5;
        let stale = tokens.token(&claims).await.unwrap();
        lookups.store(0, Ordering::SeqCst);

        let router = app(Authenticator::new(tokens.clone()));
        let requests = (0..10).map(|_| {
            router.clone().oneshot(
                axum::http::Request::get("/private")
                    .header("X-JWT", &stale)
                    .body(Body::empty())
                    .unwrap(),
            )
        });
        let responses = futures::future::join_all(requests).await;

        let mut refreshed = Vec::new();
        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let token = response.headers().get("X-JWT").map(|v| v.to_str().unwrap().to_string());
            let cookie = cookies_from(response.headers());
            refreshed.push(token.unwrap_or(cookie));
        }

        // one lookup per verification plus exactly one for the refresh signature
        assert_eq!(lookups.load(Ordering::SeqCst), 11);
        assert!(refreshed.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_trace_passes_anonymous() {
        let router = Router::new()
            .route(
                "/public",
                get(|request: Request| async move {
                    crate::token::get_user(&request)
                        .map(|u| u.id.clone())
                        .unwrap_or_else(|| "anonymous".to_string())
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Authenticator::new(service(AuthConfig::default())),
                Authenticator::trace,
            ));

        let response = router
            .oneshot(
                axum::http::Request::get("/public")
                    .header("X-JWT", "garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "anonymous");
    }

    #[tokio::test]
    async fn test_admin_only() {
        let tokens = service(AuthConfig::default());
        let token = tokens
            .issue(User::new("u1", "Bob"), "site1", HashMap::new())
            .await
            .unwrap();
        let mut admin = User::new("u2", "Alice");
        admin.set_admin(true);
        let admin_token = tokens.issue(admin, "site1", HashMap::new()).await.unwrap();

        let router = Router::new()
            .route("/admin", get(whoami))
            .layer(axum::middleware::from_fn_with_state(
                Authenticator::new(tokens),
                Authenticator::admin_only,
            ));

        let denied = router
            .clone()
            .oneshot(
                axum::http::Request::get("/admin")
                    .header("X-JWT", &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = router
            .oneshot(
                axum::http::Request::get("/admin")
                    .header("X-JWT", &admin_token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
