//! Google OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Google OAuth provider
#[derive(Clone)]
pub struct GoogleProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl GoogleProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
            ),
            redirect_uri,
            &["openid", "email", "profile"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://www.googleapis.com/oauth2/v3/userinfo"),
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
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
        let id = hash_id(&required_id(info, "sub", "google")?);

        let mut user = User::new(format!("google_{}", id), display_name(info, &["name"], &id));
        user.picture = field(info, "picture").unwrap_or_default();
        if info["email_verified"].as_bool().unwrap_or(false) {
            user.email = field(info, "email").unwrap_or_default();
        }
        Ok(user)
    }
}
