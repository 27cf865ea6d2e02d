//! Battle.net OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Battle.net OAuth provider
///
/// Battle.net shares no email or avatar; the BattleTag is the display name.
#[derive(Clone)]
pub struct BattlenetProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl BattlenetProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://oauth.battle.net/authorize",
                "https://oauth.battle.net/token",
            ),
            redirect_uri,
            &["openid"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://oauth.battle.net/userinfo"),
        })
    }
}

#[async_trait]
impl OAuthProvider for BattlenetProvider {
    fn name(&self) -> &str {
        "battlenet"
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
        let id = hash_id(&required_id(info, "id", "battlenet")?);
        Ok(User::new(
            format!("battlenet_{}", id),
            display_name(info, &["battletag"], &id),
        ))
    }
}
