//! Yandex OAuth provider

use async_trait::async_trait;
use std::time::Duration;

use super::{display_name, endpoints, userinfo_url};
use crate::config::OAuthProviderConfig;
use crate::error::Result;
use crate::provider::oauth::{field, required_id, OAuth2Client, OAuthProvider, OAuthTokens};
use crate::token::{hash_id, User};

const AVATARS: &str = "https://avatars.yandex.net/get-yapic";

/// Yandex OAuth provider
#[derive(Clone)]
pub struct YandexProvider {
    client: OAuth2Client,
    userinfo_url: String,
}

impl YandexProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let client = OAuth2Client::new(
            config,
            &endpoints(
                config,
                "https://oauth.yandex.com/authorize",
                "https://oauth.yandex.com/token",
            ),
            redirect_uri,
            &["login:info", "login:avatar", "login:email"],
            timeout,
        )?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url(config, "https://login.yandex.ru/info?format=json"),
        })
    }
}

#[async_trait]
impl OAuthProvider for YandexProvider {
    fn name(&self) -> &str {
        "yandex"
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
        let id = hash_id(&required_id(info, "id", "yandex")?);

        let mut user = User::new(
            format!("yandex_{}", id),
            display_name(info, &["display_name", "real_name", "login"], &id),
        );
        let empty_avatar = info["is_avatar_empty"].as_bool().unwrap_or(false);
        if let Some(avatar) = field(info, "default_avatar_id").filter(|_| !empty_avatar) {
            user.picture = format!("{}/{}/islands-200", AVATARS, avatar);
        }
        user.email = field(info, "default_email").unwrap_or_default();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::providers::tests::{config, REDIRECT};

    #[test]
    fn test_map_user() {
        let provider = YandexProvider::new(&config(), REDIRECT, Duration::from_secs(5)).unwrap();
        let info = serde_json::json!({
            "id": "1000034426",
            "login": "ivan",
            "display_name": "Ivan",
            "real_name": "Ivan Ivanov",
            "default_email": "ivan@yandex.ru",
            "default_avatar_id": "131652443",
            "is_avatar_empty": false,
        });
        let user = provider.map_user(&info).unwrap();
        assert_eq!(user.id, format!("yandex_{}", hash_id("1000034426")));
        assert_eq!(user.name, "Ivan");
        assert_eq!(user.picture, "https://avatars.yandex.net/get-yapic/131652443/islands-200");
        assert_eq!(user.email, "ivan@yandex.ru");

        let no_avatar = provider
            .map_user(&serde_json::json!({
                "id": "1",
                "login": "petr",
                "default_avatar_id": "0/0-0",
                "is_avatar_empty": true,
            }))
            .unwrap();
        assert_eq!(no_avatar.name, "petr");
        assert!(no_avatar.picture.is_empty());
    }
}
