pub mod conversation;
pub mod facts;
pub mod tool_context;

pub use conversation::{ConversationStore, MemoryLimits};
pub use facts::{FactStore, UserMemory};
pub use tool_context::{ToolContextStore, ToolNote};

#[cfg(test)]
pub(crate) mod test_support {
    use dex_agent::{
        CacheTtls, CredentialPool, LanguageModelClient, PoolSettings, ResponseCache, RetryPolicy,
    };
    use dex_core::ModelBackend;
    use dex_core::fakes::ScriptedBackend;
    use dex_core::stores::MemoryCacheStore;
    use std::sync::Arc;

    pub(crate) fn client(backend: &Arc<ScriptedBackend>) -> Arc<LanguageModelClient> {
        let secrets = vec!["secret-0".to_owned()];
        let pool = Arc::new(CredentialPool::new(secrets, PoolSettings::default()));
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), CacheTtls::default());
        Arc::new(
            LanguageModelClient::new(Arc::clone(backend) as Arc<dyn ModelBackend>, pool, cache)
                .with_retry_policy(RetryPolicy::immediate()),
        )
    }
}
