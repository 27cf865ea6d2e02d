//! Normalized user identity carried inside tokens

use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::Error;

const ADMIN_ATTR: &str = "admin";

/// User identity produced by a provider and embedded in the token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Display name
    #[serde(default)]
    pub name: String,

    /// Provider-qualified unique ID, e.g. `github_<hash>`
    pub id: String,

    /// Avatar URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub picture: String,

    /// Audience (site) the user signed in for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audience: String,

    /// Client address recorded at sign-in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    /// Email, when the provider supplies one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    /// Free-form attributes
    #[serde(default, rename = "attrs", skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,

    /// Role
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
}

impl User {
    /// Create a user with an ID and display name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn set_bool_attr(&mut self, key: impl Into<String>, value: bool) {
        self.attributes
            .insert(key.into(), serde_json::Value::Bool(value));
    }

    pub fn set_str_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn set_slice_attr(&mut self, key: impl Into<String>, values: Vec<String>) {
        let values = values.into_iter().map(serde_json::Value::String).collect();
        self.attributes
            .insert(key.into(), serde_json::Value::Array(values));
    }

    /// Boolean attribute, false when missing or of another type
    pub fn bool_attr(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// String attribute, empty when missing or of another type
    pub fn str_attr(&self, key: &str) -> &str {
        self.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// String-slice attribute; non-string elements are skipped
    pub fn slice_attr(&self, key: &str) -> Vec<String> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_admin(&mut self, admin: bool) {
        self.set_bool_attr(ADMIN_ATTR, admin);
    }

    pub fn is_admin(&self) -> bool {
        self.bool_attr(ADMIN_ATTR)
    }

    pub fn set_role(&mut self, role: impl Into<String>) {
        self.role = role.into();
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

/// Lowercase hex SHA-256 of `value`
///
/// Values that already are a SHA-256 hex digest are returned unchanged so
/// hashing an ID twice is stable.
pub fn hash_id(value: &str) -> String {
    if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return value.to_ascii_lowercase();
    }
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Gravatar URL for an email address
pub fn gravatar_url(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    format!(
        "https://www.gravatar.com/avatar/{:x}",
        Sha256::digest(normalized.as_bytes())
    )
}

/// User attached to the request by the authenticating middleware
pub fn get_user(request: &Request) -> Option<&User> {
    request.extensions().get::<User>()
}

/// Extractor for the authenticated user
///
/// Rejects with 401 when the route is not behind the authenticating
/// middleware or the request carried no identity.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<User>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| Error::Unauthorized("no user on request".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes() {
        let mut user = User::new("github_1", "Bob");
        assert!(!user.is_admin());

        user.set_admin(true);
        user.set_str_attr("team", "core");
        user.set_slice_attr("groups", vec!["a".to_string(), "b".to_string()]);

        assert!(user.is_admin());
        assert_eq!(user.str_attr("team"), "core");
        assert_eq!(user.str_attr("missing"), "");
        assert_eq!(user.slice_attr("groups"), vec!["a", "b"]);
        // type mismatch reads as the zero value
        assert!(!user.bool_attr("team"));
    }

    #[test]
    fn test_hash_id_is_stable() {
        let hashed = hash_id("12345");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hash_id("12345"), hashed);
        assert_eq!(hash_id(&hashed), hashed);
        assert_ne!(hash_id("12346"), hashed);
    }

    #[test]
    fn test_gravatar_normalizes_email() {
        assert_eq!(
            gravatar_url(" Bob@Example.com "),
            gravatar_url("bob@example.com")
        );
        assert!(gravatar_url("bob@example.com").starts_with("https://www.gravatar.com/avatar/"));
    }

    #[test]
    fn test_user_serialization_skips_empty_fields() {
        let user = User::new("u1", "Bob");
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json, serde_json::json!({"name": "Bob", "id": "u1"}));

        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back, user);
    }

    #[tokio::test]
    async fn test_auth_user_extractor() {
        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        assert!(AuthUser::from_request_parts(&mut parts, &()).await.is_err());

        parts.extensions.insert(User::new("u1", "Bob"));
        let AuthUser(user) = AuthUser::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(user.id, "u1");
    }
}
