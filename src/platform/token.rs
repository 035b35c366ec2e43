use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

/// Error type returned by async token providers when token acquisition fails.
#[derive(Debug, Clone)]
pub struct TokenError {
    message: String,
}

impl TokenError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(err: impl Error) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TokenError {}

/// Identity the local cache is partitioned by. Pending writes belong to a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user storage.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_else(|| "anonymous-user".to_string())
    }
}

/// Source of bearer tokens (auth or app check) consumed by the transport.
///
/// `invalidate_token` is called when the backend rejects a request as
/// unauthenticated; the next `get_token` must fetch a fresh token.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait AsyncTokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<Option<String>, TokenError>;

    fn invalidate_token(&self);

    fn current_user(&self) -> User {
        User::unauthenticated()
    }
}

/// Provider used when no credentials are configured.
#[derive(Debug, Default)]
pub struct EmptyTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl AsyncTokenProvider for EmptyTokenProvider {
    async fn get_token(&self) -> Result<Option<String>, TokenError> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

/// Provider handing out a fixed token for a fixed user. Counts invalidations.
#[derive(Debug)]
pub struct StaticTokenProvider {
    user: User,
    token: Mutex<Option<String>>,
    invalidations: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(user: User, token: impl Into<String>) -> Self {
        Self {
            user,
            token: Mutex::new(Some(token.into())),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.lock_token() = Some(token.into());
    }

    fn lock_token(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl AsyncTokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Option<String>, TokenError> {
        Ok(self.lock_token().clone())
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn current_user(&self) -> User {
        self.user.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_counts_invalidations() {
        let provider = StaticTokenProvider::new(User::new("alice"), "token-1");
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("token-1"));
        provider.invalidate_token();
        provider.set_token("token-2");
        assert_eq!(provider.invalidation_count(), 1);
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("token-2"));
        assert_eq!(provider.current_user().uid(), Some("alice"));
    }

    #[test]
    fn unauthenticated_user_key() {
        assert_eq!(User::unauthenticated().to_key(), "anonymous-user");
        assert!(!User::default().is_authenticated());
    }
}
