//! Configuration management using Figment
//!
//! Configuration is loaded from the following sources (highest precedence first):
//! 1. Environment variables (prefix: GATEHOUSE_, nested keys separated by `__`)
//! 2. Current working directory: ./gatehouse.toml
//! 3. Default values
//!
//! Signing secrets are never read from configuration, they come from a
//! [`SecretReader`](crate::token::SecretReader).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Token service, middleware and handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Public root URL of the host service, used to build callback URLs
    #[serde(default)]
    pub url: String,

    /// Path the auth router is mounted under (default: "/auth")
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,

    /// Token issuer claim (default: "gatehouse")
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Token lifetime in seconds (default: 900 = 15 min)
    #[serde(default = "default_token_duration")]
    pub token_duration_secs: i64,

    /// Cookie lifetime in seconds (default: 31 days)
    #[serde(default = "default_cookie_duration")]
    pub cookie_duration_secs: i64,

    /// Mark cookies `Secure`
    #[serde(default)]
    pub secure_cookies: bool,

    /// Disable the XSRF double-submit check
    #[serde(default)]
    pub disable_xsrf: bool,

    /// Do not put `iat` into tokens
    #[serde(default)]
    pub disable_iat: bool,

    /// Token cookie name (default: "JWT")
    #[serde(default = "default_jwt_cookie_name")]
    pub jwt_cookie_name: String,

    /// Token cookie domain
    #[serde(default)]
    pub jwt_cookie_domain: Option<String>,

    /// Token header name (default: "X-JWT")
    #[serde(default = "default_jwt_header_key")]
    pub jwt_header_key: String,

    /// XSRF cookie name (default: "XSRF-TOKEN")
    #[serde(default = "default_xsrf_cookie_name")]
    pub xsrf_cookie_name: String,

    /// XSRF header name (default: "X-XSRF-TOKEN")
    #[serde(default = "default_xsrf_header_key")]
    pub xsrf_header_key: String,

    /// HTTP methods that skip the XSRF check
    #[serde(default)]
    pub xsrf_ignore_methods: Vec<String>,

    /// Query parameter carrying a token (default: "token")
    #[serde(default = "default_jwt_query")]
    pub jwt_query: String,

    /// Write tokens to a response header instead of cookies
    #[serde(default)]
    pub send_jwt_header: bool,

    /// SameSite policy for the token cookie
    #[serde(default)]
    pub same_site: SameSite,

    /// Resolve a separate secret per audience
    #[serde(default)]
    pub aud_secrets: bool,

    /// Audience allow-list; empty accepts every audience
    #[serde(default)]
    pub allowed_audiences: Vec<String>,

    /// Fall back to Gravatar when a provider has no picture
    #[serde(default)]
    pub use_gravatar: bool,

    /// Password of the basic-auth `admin` user; disabled when unset
    #[serde(default)]
    pub admin_passwd: Option<String>,

    /// How long refreshed tokens stay cached per stale token (default: 60)
    #[serde(default = "default_refresh_cache_ttl")]
    pub refresh_cache_ttl_secs: u64,

    /// Handshake state lifetime in seconds (default: 600 = 10 min)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Handshake cookie name (default: "HANDSHAKE")
    #[serde(default = "default_handshake_cookie_name")]
    pub handshake_cookie_name: String,

    /// Confirmation token lifetime for the verify flow (default: 1800 = 30 min)
    #[serde(default = "default_verify_token_ttl")]
    pub verify_token_ttl_secs: i64,

    /// Timeout for calls to identity providers (default: 10)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OAuth2 providers keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, OAuthProviderConfig>,

    /// Sign in with Apple
    #[serde(default)]
    pub apple: Option<AppleConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_prefix: default_auth_prefix(),
            issuer: default_issuer(),
            token_duration_secs: default_token_duration(),
            cookie_duration_secs: default_cookie_duration(),
            secure_cookies: false,
            disable_xsrf: false,
            disable_iat: false,
            jwt_cookie_name: default_jwt_cookie_name(),
            jwt_cookie_domain: None,
            jwt_header_key: default_jwt_header_key(),
            xsrf_cookie_name: default_xsrf_cookie_name(),
            xsrf_header_key: default_xsrf_header_key(),
            xsrf_ignore_methods: Vec::new(),
            jwt_query: default_jwt_query(),
            send_jwt_header: false,
            same_site: SameSite::default(),
            aud_secrets: false,
            allowed_audiences: Vec::new(),
            use_gravatar: false,
            admin_passwd: None,
            refresh_cache_ttl_secs: default_refresh_cache_ttl(),
            state_ttl_secs: default_state_ttl(),
            handshake_cookie_name: default_handshake_cookie_name(),
            verify_token_ttl_secs: default_verify_token_ttl(),
            http_timeout_secs: default_http_timeout(),
            log_level: default_log_level(),
            providers: HashMap::new(),
            apple: None,
        }
    }
}

/// Cookie SameSite policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// `SameSite=Lax`
    #[default]
    Lax,
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=None`, browsers require `Secure` with it
    None,
}

impl SameSite {
    /// Cookie attribute value
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Individual OAuth2 provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth client ID
    pub client_id: String,

    /// OAuth client secret
    pub client_secret: String,

    /// Redirect URI; derived from `url` and the provider name when unset
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// OAuth scopes to request; provider defaults when empty
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Authorization endpoint (custom providers)
    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint (custom providers)
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// Userinfo endpoint (custom providers)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Provider user-info field -> user attribute name
    #[serde(default)]
    pub user_attributes: HashMap<String, String>,
}

/// Sign in with Apple configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppleConfig {
    /// Services ID registered with Apple
    pub client_id: String,

    /// Developer team ID
    pub team_id: String,

    /// Private key ID
    pub key_id: String,

    /// Path to the `.p8` private key
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Response mode (default: "form_post")
    #[serde(default = "default_apple_response_mode")]
    pub response_mode: String,

    /// Scopes (default: name, email)
    #[serde(default = "default_apple_scopes")]
    pub scopes: Vec<String>,
}

impl AuthConfig {
    /// Load configuration from defaults, ./gatehouse.toml and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("gatehouse.toml")
    }

    /// Load configuration from a specific file
    ///
    /// Missing files are skipped; environment variables still override.
    pub fn load_from(path: &str) -> Result<Self> {
        tracing::debug!("Loading configuration from: {}", path);
        let config = Figment::new()
            .merge(Serialized::defaults(AuthConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEHOUSE_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Token lifetime
    pub fn token_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_duration_secs)
    }

    /// Refresh cache entry lifetime
    pub fn refresh_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_cache_ttl_secs)
    }

    /// Handshake state lifetime
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    /// Identity provider request timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Callback URL for a provider, `{url}{auth_prefix}/{provider}/callback`
    pub fn callback_url(&self, provider: &str) -> String {
        format!(
            "{}{}/{}/callback",
            self.url.trim_end_matches('/'),
            self.auth_prefix,
            provider
        )
    }
}

// Default value functions

fn default_auth_prefix() -> String {
    "/auth".to_string()
}

fn default_issuer() -> String {
    "gatehouse".to_string()
}

fn default_token_duration() -> i64 {
    900 // 15 minutes
}

fn default_cookie_duration() -> i64 {
    31 * 24 * 3600
}

fn default_jwt_cookie_name() -> String {
    "JWT".to_string()
}

fn default_jwt_header_key() -> String {
    "X-JWT".to_string()
}

fn default_xsrf_cookie_name() -> String {
    "XSRF-TOKEN".to_string()
}

fn default_xsrf_header_key() -> String {
    "X-XSRF-TOKEN".to_string()
}

fn default_jwt_query() -> String {
    "token".to_string()
}

fn default_refresh_cache_ttl() -> u64 {
    60
}

fn default_state_ttl() -> u64 {
    600 // 10 minutes
}

fn default_handshake_cookie_name() -> String {
    "HANDSHAKE".to_string()
}

fn default_verify_token_ttl() -> i64 {
    1800 // 30 minutes
}

fn default_http_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_apple_response_mode() -> String {
    "form_post".to_string()
}

fn default_apple_scopes() -> Vec<String> {
    vec!["name".to_string(), "email".to_string()]
}
