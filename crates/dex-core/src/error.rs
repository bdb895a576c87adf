//! Error taxonomy for the request path.
//!
//! Only [`GatewayError`] ever reaches a caller. Tool failures and tier
//! denials are turned into tool-role messages inside the agent loop, and
//! upstream quota/transient failures are absorbed by the retry loop.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a language-model backend for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream error (status {status:?}): {message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
    /// Server-requested delay before the credential is used again.
    pub retry_after: Option<Duration>,
    /// Set when the backend itself knows this was a quota failure.
    pub quota: bool,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
            quota: false,
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            quota: true,
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Errors surfaced to the caller of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or empty input. Never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Every credential was tried and the request still failed.
    #[error("upstream exhausted after {attempts} attempts: {last}")]
    UpstreamExhausted { attempts: usize, last: String },

    /// The end-to-end deadline elapsed; in-flight work was cancelled.
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Conversation or document store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl GatewayError {
    /// Plain-text apology suitable for an end user. Never includes internals.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Validation(reason) => format!("Sorry, I can't work with that: {reason}"),
            GatewayError::Timeout(_) => {
                "Sorry, that took too long to answer. Please try again.".to_owned()
            }
            GatewayError::UpstreamExhausted { .. } | GatewayError::Store(_) => {
                "Sorry, I'm having trouble answering right now. Please try again in a moment."
                    .to_owned()
            }
        }
    }
}
