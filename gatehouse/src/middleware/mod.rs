//! Request authentication middleware

pub mod authenticator;
pub mod refresh_cache;

pub use authenticator::{Authenticator, BasicAuthChecker, ADMIN_USER};
pub use refresh_cache::{MemoryRefreshCache, RefreshCache};
