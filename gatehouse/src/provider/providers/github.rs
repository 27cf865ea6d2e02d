//! GitHub OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// GitHub OAuth provider
#[derive(Clone)]
pub struct GitHubProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl GitHubProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
            ),
            redirect_uri,
            &["read:user", "user:email"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://api.github.com/user"),
        })
    }

    /// Primary verified address, else any verified one
    async fn primary_email(&self, access_token: &str) -> Result<String> {
        let url = format!("{}/emails", self.userinfo_url);
        let emails = self.client.get_json(&url, access_token).await?;
        let emails = emails.as_array().cloned().unwrap_or_default();

        let verified = |email: &&serde_json::Value| email["verified"].as_bool().unwrap_or(false);
        emails
            .iter()
            .filter(verified)
            .find(|email| email["primary"].as_bool().unwrap_or(false))
            .or_else(|| emails.iter().find(verified))
            .and_then(|email| email["email"].as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::upstream("no verified GitHub email"))
    }
}

#[async_trait]
impl OAuthProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(self.client.authorization_url(state))
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        self.client.exchange_code(code).await
    }

    async fn fetch_user_info(&self, tokens: &OAuthTokens) -> Result<serde_json::Value> {
        let mut info = self
            .client
            .get_json(&self.userinfo_url, &tokens.access_token)
            .await?;

        // private addresses are only listed by the emails endpoint
        if info["email"].is_null() {
            match self.primary_email(&tokens.access_token).await {
                Ok(email) => {
                    if let Some(object) = info.as_object_mut() {
                        object.insert("email".to_string(), serde_json::Value::String(email));
                    }
                }
                Err(e) => tracing::debug!(provider = "github", "no email for user: {}", e),
            }
        }
        Ok(info)
    }

    fn map_user(&self, info: &serde_json::Value) -> Result<User> {
        let login = required_id(info, "login", "github")?;
        let id = hash_id(&login);

        let mut user = User::new(
            format!("github_{}", id),
            display_name(info, &["name", "login"], &id),
        );
        user.picture = field(info, "avatar_url").unwrap_or_default();
        user.email = field(info, "email").unwrap_or_default();
        Ok(user)
    }
}
