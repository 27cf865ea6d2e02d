//! Custom provider for any authorization-code identity provider
//!
//! Uses explicit endpoints instead of discovery. The user ID is taken from
//! `sub`, falling back to `id`.

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, missing_endpoint};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};
use crate::provider::oauth::{field, Endpoints, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

/// Provider configured entirely from [`OAuthProviderConfig`]
#[derive(Clone)]
pub struct CustomProvider {
    name: String,
    client: OAuth2Client,
    userinfo_url: String,
}

impl CustomProvider {
    pub fn new(
        name: impl Into<String>,
        config: &OAuthProviderConfig,
        redirect_uri: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let endpoints = Endpoints {
            auth_url: config
                .authorization_endpoint
                .clone()
                .ok_or_else(|| missing_endpoint(&name, "authorization_endpoint"))?,
            token_url: config
                .token_endpoint
                .clone()
                .ok_or_else(|| missing_endpoint(&name, "token_endpoint"))?,
        };
        let userinfo_url = config
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| missing_endpoint(&name, "userinfo_endpoint"))?;

        let client = OAuth2Client::new(config, &endpoints, redirect_uri, &["openid"], timeout)?;

        Ok(Self {
            name,
            client,
            userinfo_url,
        })
    }
}

#[async_trait]
impl OAuthProvider for CustomProvider {
    fn name(&self) -> &str {
        &self.name
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
        let external_id = field(info, "sub")
            .or_else(|| field(info, "id"))
            .ok_or_else(|| Error::upstream(format!("missing sub in {} user info", self.name)))?;
        let id = hash_id(&external_id);

        let mut user = User::new(
            format!("{}_{}", self.name, id),
            display_name(info, &["name", "preferred_username", "login", "username"], &id),
        );
        user.picture = field(info, "picture")
            .or_else(|| field(info, "avatar_url"))
            .unwrap_or_default();
        user.email = field(info, "email").unwrap_or_default();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::providers::tests::{config, REDIRECT};

    fn provider() -> CustomProvider {
        let config = OAuthProviderConfig {
            authorization_endpoint: Some("https://sso.example.com/authorize".to_string()),
            token_endpoint: Some("https://sso.example.com/token".to_string()),
            userinfo_endpoint: Some("https://sso.example.com/userinfo".to_string()),
            ..config()
        };
        CustomProvider::new("corp", &config, REDIRECT, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_requires_endpoints() {
        let result = CustomProvider::new("corp", &config(), REDIRECT, Duration::from_secs(5));
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_map_user() {
        let provider = provider();
        assert_eq!(provider.name(), "corp");
        assert!(provider
            .authorization_url("st")
            .unwrap()
            .starts_with("https://sso.example.com/authorize?"));

        let user = provider
            .map_user(&serde_json::json!({
                "sub": "u-42",
                "preferred_username": "jdoe",
                "email": "jdoe@example.com",
            }))
            .unwrap();
        assert_eq!(user.id, format!("corp_{}", hash_id("u-42")));
        assert_eq!(user.name, "jdoe");
        assert_eq!(user.email, "jdoe@example.com");

        let numeric = provider.map_user(&serde_json::json!({"id": 42})).unwrap();
        assert_eq!(numeric.id, format!("corp_{}", hash_id("42")));
    }
}
