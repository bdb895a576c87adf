//! Cache-first, credential-rotating model invocation.

use crate::classify::{DefaultClassifier, ErrorClass, ErrorClassifier};
use crate::credential_pool::{CredentialPool, FailureKind};
use crate::response_cache::{CacheKey, ResponseCache};
use crate::retry::RetryPolicy;
use dex_core::{
    CallKind, ChatMessage, GatewayError, ModelBackend, ModelReply, ToolDef, UpstreamError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

pub struct LanguageModelClient {
    backend: Arc<dyn ModelBackend>,
    pool: Arc<CredentialPool>,
    cache: ResponseCache,
    classifier: Arc<dyn ErrorClassifier>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LanguageModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelClient")
            .field("backend", &self.backend.name())
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LanguageModelClient {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        pool: Arc<CredentialPool>,
        cache: ResponseCache,
    ) -> Self {
        Self {
            backend,
            pool,
            cache,
            classifier: Arc::new(DefaultClassifier::new()),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Answer from cache, or call the backend with up to `pool size + 1`
    /// attempts, rotating credentials between them. The cache is written
    /// only after a successful call.
    pub async fn invoke(
        &self,
        kind: CallKind,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> Result<ModelReply, GatewayError> {
        let span = info_span!(
            "model_invoke",
            kind = %kind,
            backend = self.backend.name(),
            message_count = messages.len(),
            tool_count = tools.len(),
        );

        async {
            let key = CacheKey::new(kind, messages, tools);
            if let Some(reply) = self.cache.get(&key).await {
                return Ok(reply);
            }

            let max_attempts = self.pool.len() + 1;
            let mut attempts = 0usize;
            let mut transient_retries = 0u32;
            let mut last = String::from("no credential available");

            for slot in 1..=max_attempts {
                if self.pool.all_revoked() {
                    warn!("every credential has been rejected upstream");
                    last = String::from("all credentials rejected");
                    break;
                }

                let Some(lease) = self.pool.acquire() else {
                    warn!(slot, max_attempts, "all credentials cooling down");
                    last = String::from("all credentials cooling down");
                    if slot < max_attempts {
                        tokio::time::sleep(self.retry.quota_delay).await;
                    }
                    continue;
                };

                attempts += 1;
                let outcome = tokio::time::timeout(
                    self.retry.request_timeout,
                    self.backend.invoke(lease.secret(), messages, tools),
                )
                .await;

                let (error, class) = match outcome {
                    Ok(Ok(reply)) => {
                        self.pool.report_success(lease.id());
                        self.cache.set(&key, &reply).await;
                        info!(
                            attempts,
                            credential = lease.id(),
                            finish_reason = ?reply.finish_reason,
                            tool_calls = reply.tool_calls.len(),
                            "model reply"
                        );
                        return Ok(reply);
                    }
                    Ok(Err(error)) => {
                        let class = self.classifier.classify(&error);
                        (error, class)
                    }
                    Err(_elapsed) => (
                        UpstreamError::new(format!(
                            "attempt timed out after {}ms",
                            self.retry.request_timeout.as_millis()
                        )),
                        ErrorClass::Transient,
                    ),
                };

                last = error.to_string();
                warn!(
                    attempt = attempts,
                    max_attempts,
                    credential = lease.id(),
                    class = class.as_str(),
                    status = ?error.status,
                    error = %error.message,
                    "model call failed"
                );

                let delay = match class {
                    ErrorClass::Quota => {
                        self.pool.report_failure(
                            lease.id(),
                            FailureKind::Quota {
                                retry_after: error.retry_after,
                            },
                        );
                        self.retry.quota_delay
                    }
                    ErrorClass::Transient => {
                        self.pool.report_failure(lease.id(), FailureKind::Transient);
                        transient_retries += 1;
                        self.retry.backoff_delay(transient_retries)
                    }
                    ErrorClass::Auth => {
                        self.pool.report_failure(lease.id(), FailureKind::Auth);
                        Duration::ZERO
                    }
                    ErrorClass::BadRequest => {
                        warn!("request rejected as malformed, not retrying");
                        break;
                    }
                };

                if slot < max_attempts && !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis(), "waiting before next attempt");
                    tokio::time::sleep(delay).await;
                }
            }

            warn!(attempts, last = %last, "upstream exhausted");
            Err(GatewayError::UpstreamExhausted { attempts, last })
        }
        .instrument(span)
        .await
    }
}
