//! Provider failure taxonomy.

use thiserror::Error;

/// Phrases that put a provider error into the content-filter class.
const CONTENT_POLICY_PHRASES: &[&str] = &[
    "content policy",
    "content_policy",
    "safety system",
    "content filter",
    "content_filter",
    "moderation",
    "nsfw",
];

/// Whether a provider message reports a content-policy rejection.
pub fn is_content_policy_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CONTENT_POLICY_PHRASES.iter().any(|p| lower.contains(p))
}

/// How the worker reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Unparseable response: one immediate retry.
    Malformed,
    /// 429, 5xx, network: one retry after a fixed backoff.
    Transient,
    /// Rejected by the provider's safety filter. Never retried.
    ContentPolicy,
    /// Anything else. Never retried.
    Terminal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Malformed | Self::Transient)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited (HTTP 429): {0}")]
    RateLimited(String),

    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    #[error("client error (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    #[error("remote task failed: {0}")]
    PollFailed(String),

    #[error("polling timed out after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("provider returned an empty result")]
    EmptyResult,

    #[error("storage upload failed: {0}")]
    Storage(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// Content-policy phrases win over the status code, so a 400 or 404 that
    /// mentions the content policy is never treated as a plain client error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if is_content_policy_message(&body) {
            return Self::ContentPolicy(body);
        }
        match status {
            429 => Self::RateLimited(body),
            500..=599 => Self::Server { status, body },
            _ => Self::Client { status, body },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedResponse(_) => ErrorClass::Malformed,
            Self::RateLimited(_) | Self::Server { .. } | Self::Network(_) => ErrorClass::Transient,
            Self::ContentPolicy(_) => ErrorClass::ContentPolicy,
            Self::Client { .. }
            | Self::PollFailed(_)
            | Self::PollTimeout { .. }
            | Self::EmptyResult
            | Self::Storage(_)
            | Self::NotConfigured(_)
            | Self::InvalidParams(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_content_policy(&self) -> bool {
        self.class() == ErrorClass::ContentPolicy
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::Network(err.to_string())
    }
}

impl From<crate::Error> for ProviderError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Provider(inner) => inner,
            crate::Error::Storage(msg) => Self::Storage(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(429, "slow down").class(), ErrorClass::Transient);
        assert_eq!(ProviderError::from_status(503, "unavailable").class(), ErrorClass::Transient);
        assert_eq!(ProviderError::from_status(400, "bad prompt").class(), ErrorClass::Terminal);
        assert_eq!(ProviderError::from_status(404, "not found").class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_content_policy_phrase_wins() {
        let err = ProviderError::from_status(404, "Request rejected: Content Policy violation");
        assert!(err.is_content_policy());
        assert!(!err.class().is_retryable());

        let err = ProviderError::from_status(500, "flagged by our safety system");
        assert_eq!(err.class(), ErrorClass::ContentPolicy);
    }

    #[test]
    fn test_malformed_is_retryable() {
        let err = ProviderError::MalformedResponse("expected value at line 1".into());
        assert_eq!(err.class(), ErrorClass::Malformed);
        assert!(err.class().is_retryable());
    }

    #[test]
    fn test_poll_failures_are_terminal() {
        assert_eq!(ProviderError::PollTimeout { attempts: 3 }.class(), ErrorClass::Terminal);
        assert_eq!(ProviderError::EmptyResult.class(), ErrorClass::Terminal);
        assert_eq!(ErrorClass::ContentPolicy.to_string(), "content_policy");
    }
}
