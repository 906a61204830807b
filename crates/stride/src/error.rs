//! Failure taxonomy for LLM-backed agent steps.
//!
//! The controller classifies these by kind, not by type: user-facing
//! provider failures, transient model-output failures it can recover from
//! locally, and context-window exhaustion which has its own recovery path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors an agent step can surface.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LlmError {
    // --- Provider failures surfaced to the user ---
    #[error("authentication with the LLM provider failed: {0}")]
    Authentication(String),

    #[error("LLM provider unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("connection to the LLM provider failed: {0}")]
    ApiConnection(String),

    #[error("LLM provider API error: {0}")]
    Api(String),

    #[error("LLM provider internal server error: {0}")]
    InternalServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited by the LLM provider: {0}")]
    RateLimit(String),

    #[error("LLM request timed out: {0}")]
    Timeout(String),

    // --- Context window ---
    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),

    // --- Transient model output failures ---
    #[error("malformed action: {0}")]
    MalformedAction(String),

    #[error("no action was returned")]
    NoAction,

    #[error("error in LLM response: {0}")]
    Response(String),

    #[error("function call validation failed: {0}")]
    FunctionCallValidation(String),

    #[error("function call does not exist: {0}")]
    FunctionCallNotExists(String),
}

/// Message fragments that identify a context-window failure when the
/// provider library does not wrap it in a typed error.
const CONTEXT_WINDOW_FRAGMENTS: &[&str] = &[
    "contextwindowexceedederror",
    "prompt is too long",
    "input length and `max_tokens` exceed context limit",
];

impl LlmError {
    /// Stable kind name, used when recording `last_error`.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AuthenticationError",
            Self::ServiceUnavailable(_) => "ServiceUnavailableError",
            Self::ApiConnection(_) => "ApiConnectionError",
            Self::Api(_) => "ApiError",
            Self::InternalServer(_) => "InternalServerError",
            Self::BadRequest(_) => "BadRequestError",
            Self::NotFound(_) => "NotFoundError",
            Self::RateLimit(_) => "RateLimitError",
            Self::Timeout(_) => "TimeoutError",
            Self::ContextWindowExceeded(_) => "ContextWindowExceededError",
            Self::MalformedAction(_) => "MalformedActionError",
            Self::NoAction => "NoActionError",
            Self::Response(_) => "ResponseError",
            Self::FunctionCallValidation(_) => "FunctionCallValidationError",
            Self::FunctionCallNotExists(_) => "FunctionCallNotExistsError",
        }
    }

    /// Whether this is a context-window failure, either typed or hidden in
    /// the message of a request-level error. The substring match survives
    /// because upstream libraries do not consistently wrap the failure.
    pub fn looks_like_context_window_error(&self) -> bool {
        if matches!(self, Self::ContextWindowExceeded(_)) {
            return true;
        }
        if !matches!(self, Self::BadRequest(_) | Self::Api(_)) {
            return false;
        }
        let message = self.to_string().to_lowercase();
        CONTEXT_WINDOW_FRAGMENTS
            .iter()
            .any(|fragment| message.contains(fragment))
    }

    /// Transient model-output failures: recovered locally by publishing an
    /// error observation and letting the agent continue.
    pub fn is_transient_output_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedAction(_)
                | Self::NoAction
                | Self::Response(_)
                | Self::FunctionCallValidation(_)
                | Self::FunctionCallNotExists(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Context window detection ───────────────────────────────────────────

    #[test]
    fn typed_context_window_error_is_detected() {
        assert!(LlmError::ContextWindowExceeded("too big".into()).looks_like_context_window_error());
    }

    #[test]
    fn substring_detection_is_case_insensitive() {
        let err = LlmError::BadRequest("Anthropic: Prompt is too long: 250000 tokens".into());
        assert!(err.looks_like_context_window_error());

        let err = LlmError::Api("litellm.ContextWindowExceededError: ...".into());
        assert!(err.looks_like_context_window_error());

        let err =
            LlmError::BadRequest("input length and `max_tokens` exceed context limit".into());
        assert!(err.looks_like_context_window_error());
    }

    #[test]
    fn substring_detection_only_applies_to_request_errors() {
        let err = LlmError::Timeout("prompt is too long".into());
        assert!(!err.looks_like_context_window_error());
    }

    #[test]
    fn unrelated_bad_request_is_not_context_window() {
        let err = LlmError::BadRequest("invalid temperature".into());
        assert!(!err.looks_like_context_window_error());
    }

    // ── Transience ─────────────────────────────────────────────────────────

    #[test]
    fn output_failures_are_transient() {
        assert!(LlmError::NoAction.is_transient_output_error());
        assert!(LlmError::MalformedAction("bad json".into()).is_transient_output_error());
        assert!(LlmError::FunctionCallNotExists("no_such_tool".into()).is_transient_output_error());
        assert!(!LlmError::RateLimit("slow down".into()).is_transient_output_error());
        assert!(!LlmError::Authentication("bad key".into()).is_transient_output_error());
    }

    #[test]
    fn class_names_are_stable() {
        assert_eq!(
            LlmError::Authentication("x".into()).class_name(),
            "AuthenticationError"
        );
        assert_eq!(LlmError::NoAction.class_name(), "NoActionError");
    }
}
