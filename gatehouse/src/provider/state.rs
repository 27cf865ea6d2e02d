//! Handshake state for the authorization-code flow
//!
//! A state value is created when the browser is redirected to the provider
//! and consumed exactly once when the provider redirects back.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Data stored with a state value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Provider name
    pub provider: String,

    /// Where to send the user after sign-in
    #[serde(default)]
    pub from: Option<String>,

    /// Audience (site) the token is issued for
    #[serde(default)]
    pub audience: String,

    /// Issue a browser-session cookie
    #[serde(default)]
    pub session_only: bool,

    /// When this state was created (Unix timestamp)
    pub created_at: i64,
}

/// Handshake state store
#[async_trait]
pub trait OAuthStateManager: Send + Sync {
    /// Store data under a fresh state value and return the value
    async fn create_state(&self, data: &StateData) -> Result<String>;

    /// Consume a state value
    ///
    /// Fails with [`Error::StateMismatch`] when the value is unknown,
    /// expired or already used.
    async fn validate_state(&self, state: &str) -> Result<StateData>;
}

/// Generate a cryptographically secure random state value
pub fn generate_state() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;

    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// In-memory state store with TTL expiration
///
/// Expired entries are dropped on access and swept once the store reaches
/// `max_entries`. A store that is still full after the sweep refuses new
/// states.
pub struct MemoryStateManager {
    states: DashMap<String, StateData>,
    ttl: Duration,
    max_entries: usize,
}

impl MemoryStateManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
            max_entries: 10_000,
        }
    }

    /// Maximum number of pending handshakes
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn is_live(&self, data: &StateData, now: i64) -> bool {
        now - data.created_at <= self.ttl.as_secs() as i64
    }
}

#[async_trait]
impl OAuthStateManager for MemoryStateManager {
    async fn create_state(&self, data: &StateData) -> Result<String> {
        if self.states.len() >= self.max_entries {
            let now = chrono::Utc::now().timestamp();
            self.states.retain(|_, stored| self.is_live(stored, now));
            if self.states.len() >= self.max_entries {
                tracing::warn!(max = self.max_entries, "handshake state store is full");
                return Err(Error::Unavailable("too many pending sign-ins".to_string()));
            }
        }

        let state = generate_state();
        self.states.insert(state.clone(), data.clone());
        Ok(state)
    }

    async fn validate_state(&self, state: &str) -> Result<StateData> {
        let now = chrono::Utc::now().timestamp();
        match self.states.remove(state) {
            Some((_, data)) if self.is_live(&data, now) => Ok(data),
            Some(_) => {
                tracing::warn!("expired handshake state presented");
                Err(Error::StateMismatch)
            }
            None => Err(Error::StateMismatch),
        }
    }
}
