//! Shared error type and provider-error classification.
//!
//! The invoker dispatches on error kind rather than exception type: the
//! classification helpers match provider error strings against the known
//! overflow / transient / thought-signature patterns.

/// Shared error type used across all Cadence crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tool executor not implemented: {0}")]
    ToolNotImplemented(String),

    #[error("context overflow unrecoverable: {0}")]
    ContextOverflow(String),

    #[error("provider error (retryable): {0}")]
    ProviderRetryable(String),

    #[error("provider error: {0}")]
    ProviderFatal(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("{0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code for API error objects.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::ToolNotImplemented(_) => "tool_not_implemented",
            Error::ContextOverflow(_) => "context_overflow_unrecoverable",
            Error::ProviderRetryable(_) => "provider_retryable",
            Error::ProviderFatal(_) => "provider_fatal",
            Error::ToolExecution(_) => "tool_execution_failure",
            Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Server(_) => "server_error",
        }
    }
}

/// Whether a provider error message indicates a context window overflow.
pub fn is_overflow_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    [
        "context_length_exceeded",
        "context window",
        "maximum context length",
        "token limit",
        "too many tokens",
        "request too large",
        "content_too_large",
        "content too large",
        "max_tokens",
        "string too long",
        "prompt is too long",
        "input too long",
    ]
    .iter()
    .any(|s| msg.contains(s))
}

/// Whether a provider error is transient and worth retrying with backoff.
/// Covers server errors (5xx), rate limits (429), and availability failures.
pub fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    [
        "500",
        "502",
        "503",
        "504",
        "529",
        "rate limit",
        "rate_limit",
        "429",
        "overloaded",
        "temporarily unavailable",
        "internal server error",
        "service unavailable",
        "resource exhausted",
        "resource_exhausted",
        "deadline exceeded",
    ]
    .iter()
    .any(|s| msg.contains(s))
}

/// Thought-signature validation failures are never retryable: the replayed
/// metadata is what the provider rejects, so backoff cannot succeed.
pub fn is_thought_signature_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("thought signature") && msg.contains("not valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_patterns_match() {
        assert!(is_overflow_message("Error: context_length_exceeded"));
        assert!(is_overflow_message("your prompt is too long for this model"));
        assert!(is_overflow_message("Maximum context length is 128000 tokens"));
        assert!(!is_overflow_message("connection refused"));
    }

    #[test]
    fn retryable_patterns_match() {
        assert!(is_retryable_message("HTTP 503 Service Unavailable"));
        assert!(is_retryable_message("rate limit exceeded, try again"));
        assert!(is_retryable_message("RESOURCE_EXHAUSTED"));
        assert!(!is_retryable_message("invalid api key"));
    }

    #[test]
    fn thought_signature_detection() {
        assert!(is_thought_signature_message(
            "400: Thought signature is not valid for this request"
        ));
        // Retryable classification would also match "400"-free strings, but
        // thought-signature errors must short-circuit backoff.
        assert!(!is_thought_signature_message("thought about it, signature ok"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::InvalidRequest("x".into()).code(), "invalid_request");
        assert_eq!(
            Error::ToolNotImplemented("x".into()).code(),
            "tool_not_implemented"
        );
        assert_eq!(
            Error::ContextOverflow("x".into()).code(),
            "context_overflow_unrecoverable"
        );
        assert_eq!(Error::Server("x".into()).code(), "server_error");
    }
}
