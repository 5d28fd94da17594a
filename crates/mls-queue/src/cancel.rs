use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Cooperative cancellation flags keyed by build or run id. Workers poll the
/// token at every suspension point; a stop request cancels it and the
/// in-flight phase finishes before the job winds down.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(key.to_string(), token.clone());
        token
    }

    pub async fn get(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(key).cloned()
    }

    /// Returns whether a token existed for the key.
    pub async fn cancel(&self, key: &str) -> bool {
        if let Some(token) = self.tokens.read().await.get(key) {
            token.cancel();
            return true;
        }
        false
    }

    pub async fn remove(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_the_held_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("build_a").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("build_a").await);
        assert!(token.is_cancelled());
        registry.remove("build_a").await;
        assert!(!registry.cancel("build_a").await);
    }
}
