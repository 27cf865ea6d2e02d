//! Discord OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

const CDN: &str = "https://cdn.discordapp.com/avatars";

/// Discord OAuth provider
#[derive(Clone)]
pub struct DiscordProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl DiscordProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://discord.com/oauth2/authorize",
                "https://discord.com/api/oauth2/token",
            ),
            redirect_uri,
            &["identify", "email"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://discord.com/api/users/@me"),
        })
    }
}

#[async_trait]
impl OAuthProvider for DiscordProvider {
    fn name(&self) -> &str {
        "discord"
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
        let discord_id = required_id(info, "id", "discord")?;
        let id = hash_id(&discord_id);

        let mut user = User::new(
            format!("discord_{}", id),
            display_name(info, &["global_name", "username"], &id),
        );
        if let Some(avatar) = field(info, "avatar") {
            user.picture = format!("{}/{}/{}.png", CDN, discord_id, avatar);
        }
        if info["verified"].as_bool().unwrap_or(false) {
            user.email = field(info, "email").unwrap_or_default();
        }
        Ok(user)
    }
}
