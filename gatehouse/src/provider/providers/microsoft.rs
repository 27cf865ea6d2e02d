//! Microsoft identity platform provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Microsoft OAuth provider (common tenant, Graph `/me`)
#[derive(Clone)]
pub struct MicrosoftProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl MicrosoftProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
                "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            ),
            redirect_uri,
            &["User.Read"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://graph.microsoft.com/v1.0/me"),
        })
    }
}

#[async_trait]
impl OAuthProvider for MicrosoftProvider {
    fn name(&self) -> &str {
        "microsoft"
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
        let id = hash_id(&required_id(info, "id", "microsoft")?);

        let mut user = User::new(
            format!("microsoft_{}", id),
            display_name(info, &["displayName", "userPrincipalName"], &id),
        );
        user.email = field(info, "mail").unwrap_or_default();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::providers::tests::{config, REDIRECT};

    #[test]
    fn test_map_user() {
        let provider = MicrosoftProvider::new(&config(), REDIRECT, Duration::from_secs(5)).unwrap();
        assert!(provider
            .authorization_url("st")
            .unwrap()
            .starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize?"));

        let info = serde_json::json!({
            "id": "87d349ed-44d7-43e1-9a83-5f2406dee5bd",
            "displayName": "Adele Vance",
            "mail": "AdeleV@contoso.com",
            "userPrincipalName": "AdeleV@contoso.com",
        });
        let user = provider.map_user(&info).unwrap();
        assert_eq!(
            user.id,
            format!("microsoft_{}", hash_id("87d349ed-44d7-43e1-9a83-5f2406dee5bd"))
        );
        assert_eq!(user.name, "Adele Vance");
        assert_eq!(user.email, "AdeleV@contoso.com");
    }
}
