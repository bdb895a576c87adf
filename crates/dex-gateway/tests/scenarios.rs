#![allow(clippy::unwrap_used)]
//! End-to-end behaviour of `Gateway` against scripted collaborators.

use async_trait::async_trait;
use dex_agent::{
    CacheTtls, CredentialPool, LanguageModelClient, PoolSettings, ResponseCache, RetryPolicy,
};
use dex_core::fakes::{FakeTool, ScriptedBackend};
use dex_core::stores::{MemoryCacheStore, MemoryDocumentStore};
use dex_core::tools::ToolTable;
use dex_core::{
    ChatMessage, ConversationState, DocumentStore, GatewayError, ModelBackend, ModelReply,
    PlanTier, Role, ScopeKey, ToolCall, ToolContext, ToolDef, ToolOutput, ToolRegistry,
    UpstreamError,
};
use dex_gateway::agent_loop::REASONING_LIMIT_MESSAGE;
use dex_gateway::tier::default_tiers;
use dex_gateway::{Config, Gateway, GatewayOptions, LoopSettings, TierTable};
use dex_memory::{ConversationStore, MemoryLimits};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn scope() -> ScopeKey {
    ScopeKey::new("acme", "whatsapp", "chat-1")
}

fn options() -> GatewayOptions {
    GatewayOptions {
        learning_enabled: false,
        ..GatewayOptions::default()
    }
}

struct Harness {
    gateway: Gateway,
    client: Arc<LanguageModelClient>,
    docs: Arc<MemoryDocumentStore>,
}

impl Harness {
    fn new(
        backend: &Arc<ScriptedBackend>,
        tools: Arc<dyn ToolRegistry>,
        options: GatewayOptions,
    ) -> Self {
        let pool = Arc::new(CredentialPool::new(vec!["key-a".to_owned()], PoolSettings::default()));
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), CacheTtls::default());
        let backend = Arc::clone(backend) as Arc<dyn ModelBackend>;
        let client = Arc::new(
            LanguageModelClient::new(backend, pool, cache)
                .with_retry_policy(RetryPolicy::immediate()),
        );
        let docs = Arc::new(MemoryDocumentStore::new());
        let gateway = Gateway::new(
            Arc::clone(&client),
            Arc::clone(&docs) as Arc<dyn DocumentStore>,
            tools,
            Arc::new(TierTable::new(&default_tiers(), "starter").unwrap()),
            options,
        );
        Self { gateway, client, docs }
    }

    fn conversations(&self) -> ConversationStore {
        ConversationStore::new(
            Arc::clone(&self.docs) as Arc<dyn DocumentStore>,
            Arc::clone(&self.client),
            MemoryLimits::default(),
        )
    }
}

/// Registry that offers `web_search` and counts every execution.
#[derive(Default)]
struct CountingRegistry {
    executions: AtomicUsize,
}

#[async_trait]
impl ToolRegistry for CountingRegistry {
    fn list(&self) -> Vec<ToolDef> {
        vec![ToolDef::new(
            "web_search",
            "Search the web",
            serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )]
    }

    async fn execute(
        &self,
        _name: &str,
        _arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::success("search results"))
    }
}

#[tokio::test]
async fn full_history_is_summarized_and_pruned() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push(ModelReply::text("Happy to help again"));
    backend.push(ModelReply::text("The user planned a trip to Lisbon and asked about hotels."));
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());
    let store = harness.conversations();

    let mut seeded = ConversationState::empty("u1", scope());
    for i in 0..8 {
        seeded.history.push(ChatMessage::user(format!("question {i}")));
        seeded.history.push(ChatMessage::assistant(format!("answer {i}")));
    }
    assert_eq!(seeded.history.len(), 16);
    store.save(&seeded).await.unwrap();

    harness
        .gateway
        .respond("u1", &scope(), "one more thing", &PlanTier::new("starter"))
        .await
        .unwrap();

    let state = store.load("u1", &scope()).await.unwrap();
    assert!(state.history.len() <= 6);
    assert!(!state.summary.is_empty());
    assert!(state.summary.chars().count() <= MemoryLimits::default().max_summary_length);
    assert_eq!(state.history.last().unwrap().content, "Happy to help again");
}

#[tokio::test]
async fn failed_summary_still_prunes() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push(ModelReply::text("Sure"));
    backend.push_error(UpstreamError::new("bad request").with_status(400));
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());
    let store = harness.conversations();

    let mut seeded = ConversationState::empty("u1", scope());
    for i in 0..15 {
        seeded.history.push(ChatMessage::user(format!("message {i}")));
    }
    store.save(&seeded).await.unwrap();

    harness
        .gateway
        .respond("u1", &scope(), "hello", &PlanTier::new("starter"))
        .await
        .unwrap();

    let state = store.load("u1", &scope()).await.unwrap();
    assert_eq!(state.history.len(), 6);
    assert!(state.summary.is_empty());
}

#[tokio::test(start_paused = true)]
async fn quota_errors_rotate_to_the_next_credential() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_error(UpstreamError::quota("quota exceeded").with_status(429));
    backend.push_error(UpstreamError::quota("quota exceeded").with_status(429));
    backend.push(ModelReply::text("answered on the third key"));

    let mut config = Config::default();
    config.memory.learning_enabled = false;
    let secrets = vec!["key-a".to_owned(), "key-b".to_owned(), "key-c".to_owned()];
    let gateway = Gateway::from_config_with(
        &config,
        secrets,
        Arc::clone(&backend) as Arc<dyn ModelBackend>,
        Arc::new(ToolTable::empty()),
    )
    .unwrap();

    let reply = gateway
        .respond("u1", &scope(), "hi", &PlanTier::new("starter"))
        .await
        .unwrap();
    assert_eq!(reply.text, "answered on the third key");

    let used: Vec<String> = backend.calls().into_iter().map(|c| c.secret).collect();
    assert_eq!(used, ["key-a", "key-b", "key-c"]);

    let pool = gateway.client().pool();
    assert!(pool.is_cooling("cred-0"));
    assert!(pool.is_cooling("cred-1"));
    assert!(!pool.is_cooling("cred-2"));
}

#[tokio::test]
async fn denied_tool_is_never_executed() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push(ModelReply::tool_calls(vec![ToolCall::new(
        "call-1",
        "web_search",
        r#"{"query": "weather"}"#,
    )]));
    backend.push(ModelReply::text("Web search needs the pro plan."));
    let registry = Arc::new(CountingRegistry::default());
    let harness = Harness::new(&backend, Arc::clone(&registry) as Arc<dyn ToolRegistry>, options());

    let reply = harness
        .gateway
        .respond("u1", &scope(), "search the weather", &PlanTier::new("starter"))
        .await
        .unwrap();

    assert_eq!(reply.text, "Web search needs the pro plan.");
    assert_eq!(registry.executions.load(Ordering::SeqCst), 0);

    let calls = backend.calls();
    let second = &calls[1].messages;
    let tool_message = second.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call-1"));
    assert!(tool_message.content.contains("upgrade"));
}

#[tokio::test]
async fn allowed_tool_runs_for_higher_plan() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push(ModelReply::tool_calls(vec![ToolCall::new("call-1", "web_search", "{}")]));
    backend.push(ModelReply::text("Found it."));
    let registry = Arc::new(CountingRegistry::default());
    let harness = Harness::new(&backend, Arc::clone(&registry) as Arc<dyn ToolRegistry>, options());

    harness
        .gateway
        .respond("u1", &scope(), "search", &PlanTier::new("pro"))
        .await
        .unwrap();
    assert_eq!(registry.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn endless_tool_requests_stop_at_the_limit() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_fallback(ModelReply::tool_calls(vec![ToolCall::new("call", "calculator", "{}")]));
    let tools = ToolTable::builder()
        .register(Box::new(FakeTool::new("calculator", "42")))
        .build()
        .unwrap();
    let options = GatewayOptions {
        loop_settings: LoopSettings {
            max_tool_calls: 3,
            ..LoopSettings::default()
        },
        ..options()
    };
    let harness = Harness::new(&backend, Arc::new(tools), options);

    let reply = harness
        .gateway
        .respond("u1", &scope(), "keep going", &PlanTier::new("enterprise"))
        .await
        .unwrap();

    assert_eq!(reply.text, REASONING_LIMIT_MESSAGE);
    assert_eq!(backend.call_count(), 4);
}

#[tokio::test]
async fn identical_request_is_served_from_cache() {
    let backend = Arc::new(ScriptedBackend::replying("Opening hours are 9 to 5"));
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());
    let plan = PlanTier::new("starter");

    let first = harness
        .gateway
        .respond("u1", &scope(), "When are you open?", &plan)
        .await
        .unwrap();
    // A different user with no history sends the same request.
    let second = harness
        .gateway
        .respond("u2", &scope(), "When are you open?", &plan)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn placeholders_survive_spinning() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push(ModelReply::text("Hello Maria, your code is SAVE10"));
    backend.push(ModelReply::text("Hey {{name}}! Use {{code}} at checkout."));
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());
    let original = "Hi {{name}}, offer {{code}}";

    let corrupted = harness.gateway.spin_message(original, "tenant-a").await;
    assert_eq!(corrupted, original);

    let rewritten = harness.gateway.spin_message(original, "tenant-b").await;
    assert!(rewritten.contains("{{name}}"));
    assert!(rewritten.contains("{{code}}"));
}

#[tokio::test]
async fn exhausted_upstream_is_reported_and_not_persisted() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_fallback(ModelReply::text("unused"));
    for _ in 0..2 {
        backend.push_error(UpstreamError::new("service unavailable").with_status(503));
    }
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());

    let err = harness
        .gateway
        .respond("u1", &scope(), "hello", &PlanTier::new("starter"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::UpstreamExhausted { attempts: 2, .. }));
    assert!(!err.user_message().contains("503"));
    let state = harness.conversations().load("u1", &scope()).await.unwrap();
    assert!(state.history.is_empty());
}

#[tokio::test]
async fn validation_errors_skip_the_backend() {
    let backend = Arc::new(ScriptedBackend::new());
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options());

    let err = harness
        .gateway
        .respond("u1", &scope(), "\n\t ", &PlanTier::new("starter"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out() {
    let backend =
        Arc::new(ScriptedBackend::replying("too late").with_delay(Duration::from_secs(200)));
    let options = GatewayOptions {
        timeout: Duration::from_secs(30),
        ..options()
    };
    let harness = Harness::new(&backend, Arc::new(ToolTable::empty()), options);

    let err = harness
        .gateway
        .respond("u1", &scope(), "hello", &PlanTier::new("starter"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(d) if d == Duration::from_secs(30)));
}
