//! Built-in OAuth2 providers
//!
//! GitHub, Google, Microsoft, Discord, Facebook, Yandex, Battle.net and
//! Patreon, a local development provider, plus [`CustomProvider`] for any
//! authorization-code provider configured with explicit endpoints.

pub mod battlenet;
pub mod custom;
pub mod dev;
pub mod discord;
pub mod facebook;
pub mod github;
pub mod google;
pub mod microsoft;
pub mod patreon;
pub mod yandex;

pub use battlenet::BattlenetProvider;
pub use custom::CustomProvider;
pub use dev::{dev_config, DevAuthServer, DevProvider};
pub use discord::DiscordProvider;
pub use facebook::FacebookProvider;
pub use github::GitHubProvider;
pub use google::GoogleProvider;
pub use microsoft::MicrosoftProvider;
pub use patreon::PatreonProvider;
pub use yandex::YandexProvider;

use std::sync::Arc;
use std::time::Duration;

use super::oauth::{field, Endpoints, OAuthProvider};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};

/// Names of the built-in providers
pub const BUILTIN: &[&str] = &[
    "github",
    "google",
    "microsoft",
    "discord",
    "facebook",
    "yandex",
    "battlenet",
    "patreon",
    "dev",
];

/// Build a provider by name
///
/// Unknown names become a [`CustomProvider`] when the configuration carries
/// all three endpoints.
pub fn build(
    name: &str,
    config: &OAuthProviderConfig,
    redirect_uri: &str,
    timeout: Duration,
) -> Result<Arc<dyn OAuthProvider>> {
    let provider: Arc<dyn OAuthProvider> = match name {
        "github" => Arc::new(GitHubProvider::new(config, redirect_uri, timeout)?),
        "google" => Arc::new(GoogleProvider::new(config, redirect_uri, timeout)?),
        "microsoft" => Arc::new(MicrosoftProvider::new(config, redirect_uri, timeout)?),
        "discord" => Arc::new(DiscordProvider::new(config, redirect_uri, timeout)?),
        "facebook" => Arc::new(FacebookProvider::new(config, redirect_uri, timeout)?),
        "yandex" => Arc::new(YandexProvider::new(config, redirect_uri, timeout)?),
        "battlenet" => Arc::new(BattlenetProvider::new(config, redirect_uri, timeout)?),
        "patreon" => Arc::new(PatreonProvider::new(config, redirect_uri, timeout)?),
        "dev" => Arc::new(DevProvider::new(config, redirect_uri, timeout)?),
        _ => Arc::new(CustomProvider::new(name, config, redirect_uri, timeout)?),
    };
    Ok(provider)
}

/// Configured endpoints, falling back to the provider's own
pub(crate) fn endpoints(config: &OAuthProviderConfig, auth_url: &str, token_url: &str) -> Endpoints {
    Endpoints {
        auth_url: config
            .authorization_endpoint
            .clone()
            .unwrap_or_else(|| auth_url.to_string()),
        token_url: config
            .token_endpoint
            .clone()
            .unwrap_or_else(|| token_url.to_string()),
    }
}

pub(crate) fn userinfo_url(config: &OAuthProviderConfig, default: &str) -> String {
    config
        .userinfo_endpoint
        .clone()
        .unwrap_or_else(|| default.to_string())
}

/// First present name field, or a placeholder derived from the hashed ID
pub(crate) fn display_name(info: &serde_json::Value, keys: &[&str], hashed_id: &str) -> String {
    keys.iter()
        .find_map(|key| field(info, key))
        .unwrap_or_else(|| format!("noname_{}", &hashed_id[..8]))
}

pub(crate) fn missing_endpoint(provider: &str, endpoint: &str) -> Error {
    Error::BadRequest(format!("provider {} needs {}", provider, endpoint))
}
