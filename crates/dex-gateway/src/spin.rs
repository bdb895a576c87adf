//! Marketing-copy rewriting that keeps `{{placeholder}}` tokens intact.
//!
//! The model is told to keep the tokens, but the guarantee comes from
//! checking its output: any rewrite that loses a token, invents one, or
//! comes back empty is discarded in favour of the original text.

use dex_agent::LanguageModelClient;
use dex_core::{CallKind, ChatMessage};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{Instrument, debug, info_span, warn};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{[^{}]*\}\}").unwrap_or_else(|_| unreachable!("static pattern"))
});

const SPIN_PROMPT: &str = "You rewrite outbound marketing messages so repeated sends do not \
look identical. Keep the meaning, tone, language and approximate length. Keep every placeholder \
written in double curly braces exactly as it appears, character for character, and do not add \
new ones. Reply with the rewritten message only, without quotes or commentary.";

/// Distinct placeholder tokens in `text`, braces included.
pub fn placeholders(text: &str) -> BTreeSet<&str> {
    PLACEHOLDER.find_iter(text).map(|m| m.as_str()).collect()
}

/// Why a rewrite was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Missing(String),
    Invented(String),
}

/// Check a rewrite against the original's placeholders.
pub fn validate_rewrite(original: &str, rewrite: &str) -> Result<(), Rejection> {
    if rewrite.trim().is_empty() {
        return Err(Rejection::Empty);
    }
    let expected = placeholders(original);
    let found = placeholders(rewrite);
    if let Some(missing) = expected.difference(&found).next() {
        return Err(Rejection::Missing((*missing).to_owned()));
    }
    if let Some(invented) = found.difference(&expected).next() {
        return Err(Rejection::Invented((*invented).to_owned()));
    }
    Ok(())
}

/// Rewrite `content` for `tenant_id`. Returns the original on any failure.
pub async fn spin_message(client: &LanguageModelClient, content: &str, tenant_id: &str) -> String {
    if content.trim().is_empty() {
        return content.to_owned();
    }

    let span = info_span!(
        "spin_message",
        tenant = tenant_id,
        placeholders = placeholders(content).len()
    );

    async {
        let messages = [
            ChatMessage::system(SPIN_PROMPT),
            ChatMessage::user(format!("Sender: {tenant_id}\n\nMessage:\n{content}")),
        ];

        let reply = match client.invoke(CallKind::Rewrite, &messages, &[]).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "rewrite call failed, keeping original");
                return content.to_owned();
            }
        };

        let rewrite = reply.text.trim();
        match validate_rewrite(content, rewrite) {
            Ok(()) => {
                debug!(
                    original_len = content.len(),
                    rewrite_len = rewrite.len(),
                    "message rewritten"
                );
                rewrite.to_owned()
            }
            Err(rejection) => {
                warn!(?rejection, "rewrite rejected, keeping original");
                content.to_owned()
            }
        }
    }
    .instrument(span)
    .await
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use dex_agent::{CacheTtls, CredentialPool, PoolSettings, ResponseCache, RetryPolicy};
    use dex_core::fakes::ScriptedBackend;
    use dex_core::stores::MemoryCacheStore;
    use dex_core::{ModelBackend, UpstreamError};
    use std::sync::Arc;

    const ORIGINAL: &str = "Hi {{name}}, offer {{code}}";

    fn client(backend: &Arc<ScriptedBackend>) -> LanguageModelClient {
        let pool = Arc::new(CredentialPool::new(vec!["k".to_owned()], PoolSettings::default()));
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), CacheTtls::default());
        LanguageModelClient::new(Arc::clone(backend) as Arc<dyn ModelBackend>, pool, cache)
            .with_retry_policy(RetryPolicy::immediate())
    }

    #[test]
    fn finds_placeholders() {
        let found: Vec<&str> = placeholders("{{a}} and {{ b }} and {{a}} but not {c}")
            .into_iter()
            .collect();
        assert_eq!(found, ["{{ b }}", "{{a}}"]);
    }

    #[test]
    fn validation_rules() {
        assert_eq!(validate_rewrite(ORIGINAL, "Hey {{name}}! Use {{code}}."), Ok(()));
        assert_eq!(validate_rewrite(ORIGINAL, "  "), Err(Rejection::Empty));
        assert_eq!(
            validate_rewrite(ORIGINAL, "Hey {{Name}}, use {{code}}"),
            Err(Rejection::Missing("{{name}}".to_owned()))
        );
        assert_eq!(
            validate_rewrite(ORIGINAL, "Hey {{name}}, use {{code}} by {{date}}"),
            Err(Rejection::Invented("{{date}}".to_owned()))
        );
    }

    #[tokio::test]
    async fn good_rewrite_is_returned() {
        let backend = Arc::new(ScriptedBackend::replying("Hello {{name}}! Your code: {{code}}"));
        let out = spin_message(&client(&backend), ORIGINAL, "acme").await;
        assert_eq!(out, "Hello {{name}}! Your code: {{code}}");
        assert!(backend.calls()[0].messages[1].content.contains("acme"));
    }

    #[tokio::test]
    async fn corrupted_rewrite_falls_back_to_original() {
        let backend = Arc::new(ScriptedBackend::replying("Hello Sam! Your code: {{code}}"));
        assert_eq!(spin_message(&client(&backend), ORIGINAL, "acme").await, ORIGINAL);
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_original() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_error(UpstreamError::new("bad").with_status(400));
        assert_eq!(spin_message(&client(&backend), ORIGINAL, "acme").await, ORIGINAL);
    }

    #[tokio::test]
    async fn blank_input_skips_the_model() {
        let backend = Arc::new(ScriptedBackend::new());
        assert_eq!(spin_message(&client(&backend), "   ", "acme").await, "   ");
        assert_eq!(backend.call_count(), 0);
    }
}
