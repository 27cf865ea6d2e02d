//! # gatehouse
//!
//! Embeddable authentication for axum services. Signs users in through
//! OAuth2 providers, a direct credential check or a send-and-confirm code,
//! then issues, transports, verifies and refreshes a signed session token.
//!
//! ## Features
//!
//! - **Token service**: HS256 tokens in cookies or headers, per-audience
//!   secrets, double-submit CSRF protection
//! - **Middleware**: required, optional and admin-only authentication with
//!   transparent single-flight refresh and basic-auth fallback
//! - **Providers**: GitHub, Google, Microsoft, Discord, Facebook, Yandex,
//!   Battle.net, Patreon, Apple, a local `dev` provider and custom OAuth2
//!   endpoints, plus direct and verify flows
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatehouse::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AuthConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let tokens = TokenService::new(config).with_secret_reader(StaticSecret::new("secret"));
//!     let mut auth = Service::new(tokens);
//!     auth.add_configured_providers();
//!     auth.add_direct_provider(
//!         "local",
//!         Arc::new(|user: &str, passwd: &str| -> Result<bool> { Ok(user == "dev" && passwd == "dev") }),
//!     )?;
//!
//!     let app = Router::new()
//!         .route("/private", get(|AuthUser(user): AuthUser| async move { user.name }))
//!         .layer(from_fn_with_state(auth.middleware(), Authenticator::auth))
//!         .merge(auth.router());
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
//!         .await
//!         .map_err(|e| Error::Internal(e.to_string()))?;
//!     axum::serve(listener, app)
//!         .await
//!         .map_err(|e| Error::Internal(e.to_string()))
//! }
//! ```

pub mod avatar;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod provider;
pub mod service;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::avatar::{AvatarSaver, NoOpAvatar};
    pub use crate::config::{AppleConfig, AuthConfig, OAuthProviderConfig, SameSite};
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::middleware::{Authenticator, BasicAuthChecker, MemoryRefreshCache, RefreshCache};
    pub use crate::observability::init_tracing;
    pub use crate::provider::{
        CredChecker, FilePrivateKeyLoader, OAuthProvider, PrivateKeyLoader, Provider, Sender,
        UserIdFunc,
    };
    pub use crate::service::Service;
    pub use crate::token::{
        get_user, AudienceReader, AuthUser, Claims, ClaimsUpdater, SecretReader, StaticAudiences,
        StaticSecret, TokenService, User, Validator,
    };

    pub use axum::middleware::from_fn_with_state;
    pub use axum::routing::get;
    pub use axum::Router;
}
