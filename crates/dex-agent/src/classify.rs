//! Upstream error classification.
//!
//! Backends report failures in their own shapes, so the predicate that
//! decides "quota or not" is pluggable: anything implementing
//! [`ErrorClassifier`], including a plain closure, can be handed to the
//! client.

use dex_core::UpstreamError;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limit or exhausted quota. Rotate and retry after a short delay.
    Quota,
    /// Server-side or network failure. Retry with exponential backoff.
    Transient,
    /// Credential rejected. Revoke it and retry with another one.
    Auth,
    /// The request itself is wrong. Retrying cannot help.
    BadRequest,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::BadRequest => "bad_request",
        }
    }
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &UpstreamError) -> ErrorClass;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&UpstreamError) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &UpstreamError) -> ErrorClass {
        self(error)
    }
}

/// Status code first, then message patterns. Anything unrecognised is
/// treated as transient.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    quota: Regex,
    auth: Regex,
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self {
            quota: Regex::new(r"(?i)quota|rate[ _-]?limit|resource[ _]exhausted|too many requests")
                .unwrap_or_else(|_| unreachable!("static pattern")),
            auth: Regex::new(r"(?i)invalid[ _]api[ _]key|unauthori[sz]ed|permission[ _]denied")
                .unwrap_or_else(|_| unreachable!("static pattern")),
        }
    }
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &UpstreamError) -> ErrorClass {
        if error.quota || error.status == Some(429) || self.quota.is_match(&error.message) {
            return ErrorClass::Quota;
        }
        if matches!(error.status, Some(401 | 403)) || self.auth.is_match(&error.message) {
            return ErrorClass::Auth;
        }
        if matches!(error.status, Some(400 | 404 | 413 | 422)) {
            return ErrorClass::BadRequest;
        }
        ErrorClass::Transient
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: &UpstreamError) -> ErrorClass {
        DefaultClassifier::new().classify(error)
    }

    #[test]
    fn quota_by_flag_status_or_message() {
        assert_eq!(classify(&UpstreamError::quota("x")), ErrorClass::Quota);
        assert_eq!(classify(&UpstreamError::new("x").with_status(429)), ErrorClass::Quota);
        assert_eq!(
            classify(&UpstreamError::new("RESOURCE_EXHAUSTED: daily limit").with_status(500)),
            ErrorClass::Quota
        );
        assert_eq!(classify(&UpstreamError::new("Rate limit reached")), ErrorClass::Quota);
    }

    #[test]
    fn quota_message_wins_over_forbidden_status() {
        let error = UpstreamError::new("Quota exceeded for project").with_status(403);
        assert_eq!(classify(&error), ErrorClass::Quota);
    }

    #[test]
    fn auth_failures() {
        assert_eq!(classify(&UpstreamError::new("nope").with_status(401)), ErrorClass::Auth);
        assert_eq!(classify(&UpstreamError::new("Invalid API key provided")), ErrorClass::Auth);
    }

    #[test]
    fn bad_request_is_not_retried() {
        assert_eq!(
            classify(&UpstreamError::new("bad schema").with_status(400)),
            ErrorClass::BadRequest
        );
    }

    #[test]
    fn unknown_failures_are_transient() {
        assert_eq!(
            classify(&UpstreamError::new("overloaded").with_status(503)),
            ErrorClass::Transient
        );
        assert_eq!(classify(&UpstreamError::new("connection reset")), ErrorClass::Transient);
    }

    #[test]
    fn closures_are_classifiers() {
        let always_quota = |_: &UpstreamError| ErrorClass::Quota;
        assert_eq!(always_quota.classify(&UpstreamError::new("x")), ErrorClass::Quota);
    }
}
