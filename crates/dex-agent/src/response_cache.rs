//! Read-through cache of successful model replies.

use crate::fingerprint::fingerprint;
use dex_core::{CacheStore, CallKind, ChatMessage, ModelReply, ToolDef};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "dex:cache";

/// Per-call-type time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub chat: Duration,
    pub tools: Duration,
    pub summary: Duration,
    pub moderation: Duration,
    pub facts: Duration,
    pub rewrite: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(30 * 60),
            tools: Duration::from_secs(15 * 60),
            summary: Duration::from_secs(60 * 60),
            moderation: Duration::from_secs(30 * 60),
            facts: Duration::from_secs(60 * 60),
            rewrite: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheTtls {
    pub fn for_kind(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Chat => self.chat,
            CallKind::Tools => self.tools,
            CallKind::Summary => self.summary,
            CallKind::Moderation => self.moderation,
            CallKind::Facts => self.facts,
            CallKind::Rewrite => self.rewrite,
        }
    }
}

/// Cache key for one request: `dex:cache:{kind}:{sha256}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    kind: CallKind,
    key: String,
}

impl CacheKey {
    pub fn new(kind: CallKind, messages: &[ChatMessage], tools: &[ToolDef]) -> Self {
        let digest = fingerprint(kind, messages, tools);
        Self {
            kind,
            key: format!("{KEY_PREFIX}:{}:{digest}", kind.tag()),
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

/// Store failures degrade to misses. The cache never fails a request.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttls", &self.ttls)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self { store, ttls }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub async fn get(&self, key: &CacheKey) -> Option<ModelReply> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, kind = %key.kind(), "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(reply) => {
                debug!(kind = %key.kind(), "cache hit");
                Some(reply)
            }
            Err(e) => {
                warn!(error = %e, kind = %key.kind(), "unreadable cache entry, dropping");
                if let Err(e) = self.store.del(key.as_str()).await {
                    debug!(error = %e, "failed to drop unreadable cache entry");
                }
                None
            }
        }
    }

    /// Write a reply. Only call after the upstream call fully succeeded.
    pub async fn set(&self, key: &CacheKey, reply: &ModelReply) {
        let payload = match serde_json::to_string(reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode reply for cache");
                return;
            }
        };
        let ttl = self.ttls.for_kind(key.kind());
        if let Err(e) = self.store.set(key.as_str(), payload, ttl).await {
            warn!(error = %e, kind = %key.kind(), "cache write failed");
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use dex_core::stores::MemoryCacheStore;

    fn key(kind: CallKind) -> CacheKey {
        CacheKey::new(kind, &[ChatMessage::user("hi")], &[])
    }

    #[test]
    fn default_ttls_by_kind() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.for_kind(CallKind::Chat), Duration::from_secs(1800));
        assert_eq!(ttls.for_kind(CallKind::Tools), Duration::from_secs(900));
        assert_eq!(ttls.for_kind(CallKind::Summary), Duration::from_secs(3600));
        assert_eq!(ttls.for_kind(CallKind::Moderation), Duration::from_secs(1800));
    }

    #[test]
    fn key_is_prefixed_with_kind() {
        let k = key(CallKind::Summary);
        assert!(k.as_str().starts_with("dex:cache:summary:"));
    }

    #[tokio::test]
    async fn round_trip_and_miss() {
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), CacheTtls::default());
        assert!(cache.get(&key(CallKind::Chat)).await.is_none());

        cache.set(&key(CallKind::Chat), &ModelReply::text("cached")).await;
        assert_eq!(cache.get(&key(CallKind::Chat)).await.unwrap().text, "cached");
        assert!(cache.get(&key(CallKind::Moderation)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_by_kind_ttl() {
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), CacheTtls::default());
        cache.set(&key(CallKind::Tools), &ModelReply::text("t")).await;
        cache.set(&key(CallKind::Summary), &ModelReply::text("s")).await;

        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        assert!(cache.get(&key(CallKind::Tools)).await.is_none());
        assert!(cache.get(&key(CallKind::Summary)).await.is_some());
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        let k = key(CallKind::Chat);
        store
            .set(k.as_str(), "not json".to_owned(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = ResponseCache::new(store.clone(), CacheTtls::default());
        assert!(cache.get(&k).await.is_none());
        assert!(store.get(k.as_str()).await.unwrap().is_none());
    }
}
