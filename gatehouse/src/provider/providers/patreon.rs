//! Patreon OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Patreon OAuth provider
///
/// The v2 identity endpoint wraps the user in a JSON:API document: the ID is
/// `data.id` and the profile lives in `data.attributes`.
#[derive(Clone)]
pub struct PatreonProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl PatreonProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://www.patreon.com/oauth2/authorize",
                "https://www.patreon.com/api/oauth2/token",
            ),
            redirect_uri,
            &["identity", "identity[email]"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(
                config,
                "https://www.patreon.com/api/oauth2/v2/identity?fields%5Buser%5D=email,full_name,image_url,is_email_verified",
            ),
        })
    }
}

#[async_trait]
impl OAuthProvider for PatreonProvider {
    fn name(&self) -> &str {
        "patreon"
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
        let data = info
            .get("data")
            .ok_or_else(|| Error::upstream("missing data in patreon user info"))?;
        let id = hash_id(&required_id(data, "id", "patreon")?);
        let attributes = &data["attributes"];

        let mut user = User::new(
            format!("patreon_{}", id),
            display_name(attributes, &["full_name"], &id),
        );
        user.picture = field(attributes, "image_url").unwrap_or_default();
        if attributes["is_email_verified"].as_bool().unwrap_or(false) {
            user.email = field(attributes, "email").unwrap_or_default();
        }
        Ok(user)
    }
}
