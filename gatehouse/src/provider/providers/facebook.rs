//! Facebook OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Facebook OAuth provider
#[derive(Clone)]
pub struct FacebookProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl FacebookProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://www.facebook.com/dialog/oauth",
                "https://graph.facebook.com/oauth/access_token",
            ),
            redirect_uri,
            &["public_profile", "email"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(
                config,
                "https://graph.facebook.com/me?fields=id,name,email,picture",
            ),
        })
    }
}

#[async_trait]
impl OAuthProvider for FacebookProvider {
    fn name(&self) -> &str {
        "facebook"
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
        let id = hash_id(&required_id(info, "id", "facebook")?);

        let mut user = User::new(format!("facebook_{}", id), display_name(info, &["name"], &id));
        // the graph API nests the picture URL under picture.data
        if let Some(url) = info["picture"]["data"]["url"].as_str() {
            user.picture = url.to_string();
        }
        user.email = field(info, "email").unwrap_or_default();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::providers::tests::{config, REDIRECT};

    #[test]
    fn test_map_user() {
        let provider = FacebookProvider::new(&config(), REDIRECT, Duration::from_secs(5)).unwrap();
        let info = serde_json::json!({
            "id": "10158123456789",
            "name": "Bob Smith",
            "email": "bob@example.com",
            "picture": {"data": {"height": 50, "is_silhouette": false, "url": "https://platform-lookaside.fbsbx.com/p.jpg", "width": 50}},
        });
        let user = provider.map_user(&info).unwrap();
        assert_eq!(user.id, format!("facebook_{}", hash_id("10158123456789")));
        assert_eq!(user.name, "Bob Smith");
        assert_eq!(user.picture, "https://platform-lookaside.fbsbx.com/p.jpg");
        assert_eq!(user.email, "bob@example.com");

        let bare = provider.map_user(&serde_json::json!({"id": "1"})).unwrap();
        assert!(bare.name.starts_with("noname_"));
        assert!(bare.picture.is_empty());
        assert!(provider.map_user(&serde_json::json!({"name": "x"})).is_err());
    }
}
