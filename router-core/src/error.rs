//! Error taxonomy for the router.
//!
//! Mirrors the split the wider provider-SDK ecosystem uses: a narrow
//! `ProviderError` for what a transport adapter can observe, and a richer
//! `RouterError` for what the routing/failover layer surfaces to a host.
//! `ErrorCategory` is the classification the Failover Manager drives off;
//! it is deliberately its own small `Copy` enum rather than baked into
//! `ProviderError` so that classification can also run over errors that
//! only ever existed as provider-supplied text (see `classify_message`).

use thiserror::Error;

/// Errors a `Provider` transport can report back to the router.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response format")]
    InvalidResponse,

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Cancelled")]
    Cancelled,
}

/// Errors registering or looking up providers in the `ProviderRegistry`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider already registered: {id}")]
    DuplicateId { id: String },
    #[error("provider not found: {id}")]
    NotFound { id: String },
}

/// Sub-kinds of prettifier failure (spec §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrettifierError {
    #[error("response body exceeds the prettifier's input size cap")]
    InputTooLarge,
    #[error("xml function_calls block failed validation: {reason}")]
    XmlValidation { reason: String },
    #[error("failed to parse response payload: {reason}")]
    Parse { reason: String },
}

/// The taxonomy surfaced by `route()` to a host (spec §7).
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("retries exhausted after {attempts} attempt(s): {last_cause}")]
    RetryExhausted {
        attempts: usize,
        last_cause: ProviderError,
    },

    #[error("no candidate provider could handle this request")]
    NoCandidateProvider,

    #[error("client error: {0}")]
    ClientError(ProviderError),

    #[error("permanent provider error: {0}")]
    PermanentProviderError(ProviderError),

    #[error("request cancelled")]
    Cancelled,

    #[error("prettifier error: {0}")]
    Prettifier(#[from] PrettifierError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Error classification driving Failover Manager behavior (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient, worth retrying against the same or another provider.
    Retryable,
    /// Rate-limited or temporarily unavailable; retry, preferably elsewhere.
    Temporary,
    /// Caller's fault (bad credentials, malformed request); do not retry.
    ClientError,
    /// Durable provider-side failure; do not retry.
    Permanent,
    /// Could not be classified; treated as retryable per spec §9.
    Unknown,
}

impl ErrorCategory {
    /// Whether the Failover Manager should attempt another provider.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorCategory::ClientError | ErrorCategory::Permanent)
    }
}

/// Classify a `ProviderError` for the Failover Manager.
pub fn classify(error: &ProviderError) -> ErrorCategory {
    match error {
        ProviderError::Api { code, message } => classify_message(Some(*code), message),
        ProviderError::RateLimit | ProviderError::QuotaExceeded => ErrorCategory::Temporary,
        ProviderError::ServiceUnavailable => ErrorCategory::Temporary,
        ProviderError::InvalidApiKey => ErrorCategory::ClientError,
        ProviderError::ModelNotFound { .. } => ErrorCategory::ClientError,
        ProviderError::Timeout | ProviderError::NetworkError { .. } => ErrorCategory::Retryable,
        ProviderError::Cancelled => ErrorCategory::Permanent,
        ProviderError::Serialization(_) | ProviderError::InvalidResponse => ErrorCategory::Unknown,
        ProviderError::Configuration { .. } => ErrorCategory::Permanent,
    }
}

/// Classify a raw status code / message pair (spec §4.5), used when a
/// provider only ever reports its failure as text.
pub fn classify_message(status: Option<u16>, message: &str) -> ErrorCategory {
    if let Some(code) = status {
        if (500..600).contains(&code) {
            return ErrorCategory::Retryable;
        }
        if code == 429 {
            return ErrorCategory::Temporary;
        }
        if (400..500).contains(&code) {
            return ErrorCategory::ClientError;
        }
    }

    let lowered = message.to_lowercase();
    const RETRYABLE_SUBSTRINGS: &[&str] = &[
        "timeout",
        "network",
        "connection",
        "econnreset",
        "enotfound",
    ];
    const TEMPORARY_SUBSTRINGS: &[&str] = &[
        "rate limit",
        "too many requests",
        "quota exceeded",
        "service unavailable",
        "maintenance",
        "outage",
    ];
    const CLIENT_SUBSTRINGS: &[&str] = &[
        "unauthorized",
        "forbidden",
        "invalid api key",
        "authentication",
    ];

    if RETRYABLE_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        return ErrorCategory::Retryable;
    }
    if TEMPORARY_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        return ErrorCategory::Temporary;
    }
    if CLIENT_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        return ErrorCategory::ClientError;
    }

    ErrorCategory::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_bands() {
        assert_eq!(classify_message(Some(503), ""), ErrorCategory::Retryable);
        assert_eq!(classify_message(Some(429), ""), ErrorCategory::Temporary);
        assert_eq!(classify_message(Some(401), ""), ErrorCategory::ClientError);
    }

    #[test]
    fn message_substrings() {
        assert_eq!(
            classify_message(None, "Connection timeout while dialing host"),
            ErrorCategory::Retryable
        );
        assert_eq!(
            classify_message(None, "Rate limit exceeded, slow down"),
            ErrorCategory::Temporary
        );
        assert_eq!(
            classify_message(None, "Invalid API key supplied"),
            ErrorCategory::ClientError
        );
        assert_eq!(
            classify_message(None, "something bizarre happened"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn unknown_is_retryable() {
        assert!(ErrorCategory::Unknown.is_retryable());
        assert!(!ErrorCategory::ClientError.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }
}
