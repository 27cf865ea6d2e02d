//! Avatar persistence hook

use async_trait::async_trait;

use crate::error::Result;
use crate::token::{gravatar_url, User};

/// Stores or proxies a user's picture after sign-in
///
/// Returning `Some(url)` replaces the user's picture in the issued token.
/// Failures are logged by the caller and never block sign-in.
#[async_trait]
pub trait AvatarSaver: Send + Sync {
    async fn put(&self, user: &User) -> Result<Option<String>>;
}

/// Keeps the provider's picture URL as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAvatar;

#[async_trait]
impl AvatarSaver for NoOpAvatar {
    async fn put(&self, _user: &User) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Picture fallbacks applied to a freshly signed-in user
///
/// Falls back to Gravatar when enabled and the user has an email but no
/// picture, then lets `avatar` replace the picture.
pub(crate) async fn finish_picture(user: &mut User, avatar: &dyn AvatarSaver, use_gravatar: bool) {
    if use_gravatar && user.picture.is_empty() && !user.email.is_empty() {
        user.picture = gravatar_url(&user.email);
    }

    match avatar.put(user).await {
        Ok(Some(picture)) => user.picture = picture,
        Ok(None) => {}
        Err(e) => tracing::warn!(user = %user.id, "failed to save avatar: {}", e),
    }
}
