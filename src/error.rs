//! Error types for the inference session layer.
//!
//! Every public facade operation reports failures as a [`SessionError`].
//! Errors are plain data (`Clone + PartialEq`) so a single worker fault can
//! be fanned out to every pending caller.

use std::fmt;
use thiserror::Error;

/// Inference session error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// No background execution context can be created in this environment.
    #[error("Background inference is not available in this environment")]
    UnsupportedEnvironment,

    /// The background context did not report readiness in time.
    #[error("Worker initialization timed out")]
    BringUpTimeout,

    /// The background context failed while starting or crashed afterwards.
    #[error("Worker initialization failed: {0}")]
    BringUpFailure(String),

    /// The load attempt did not complete in time.
    #[error("Model loading timed out")]
    LoadTimeout,

    /// Every precision profile failed, or the runtime reported an error.
    #[error("Model loading failed: {0}")]
    LoadFailure(String),

    /// Generation was requested before a model reached Ready.
    #[error("Model not loaded. Call load_model() first.")]
    NotLoaded,

    /// No completion arrived within the generation deadline.
    #[error("Generation timed out")]
    GenerationTimeout,

    /// The runtime reported an error while generating.
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    /// Input or options rejected before crossing the boundary.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Frame lane closed or a frame could not be encoded/decoded.
    #[error("Worker communication failed: {0}")]
    Channel(String),

    /// The facade was shut down while the request was pending.
    #[error("Inference service stopped")]
    ServiceStopped,
}

impl SessionError {
    /// Check if this error suggests retrying the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BringUpTimeout
                | Self::BringUpFailure(_)
                | Self::LoadTimeout
                | Self::LoadFailure(_)
                | Self::GenerationTimeout
                | Self::Channel(_)
        )
    }

    /// Whether the error came from a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::BringUpTimeout | Self::LoadTimeout | Self::GenerationTimeout
        )
    }

    /// Load failures get a retry affordance in the user interface.
    pub fn offers_retry(&self) -> bool {
        matches!(
            self,
            Self::LoadTimeout | Self::LoadFailure(_) | Self::BringUpTimeout | Self::BringUpFailure(_)
        )
    }

    /// Create a channel error.
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }

    /// Cause text without the variant prefix, for user-facing messages.
    pub fn cause(&self) -> String {
        match self {
            Self::BringUpFailure(msg)
            | Self::LoadFailure(msg)
            | Self::GenerationFailure(msg)
            | Self::InvalidInput(msg)
            | Self::Channel(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// What the user was doing when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    LoadingModel,
    GeneratingAnswer,
    GeneratingQuestion,
    EvaluatingAnswer,
    ProcessingRequest,
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UserAction::LoadingModel => "loading the model",
            UserAction::GeneratingAnswer => "generating an answer",
            UserAction::GeneratingQuestion => "generating a question",
            UserAction::EvaluatingAnswer => "evaluating the answer",
            UserAction::ProcessingRequest => "processing the request",
        };
        f.write_str(text)
    }
}

/// Format an error for display, qualified by the action that failed.
pub fn format_error_message(error: &SessionError, action: UserAction) -> String {
    format!(
        "Sorry, an error occurred while {}: {}. Please try again later.",
        action,
        error.cause()
    )
}

/// Rewrite bare numeric runtime error codes into an actionable message.
pub(crate) fn describe_runtime_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!(
            "Model inference failed. Please reload the model and try again. (code: {})",
            trimmed
        )
    } else {
        raw.to_string()
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_is_retryable() {
        assert!(SessionError::channel("closed").is_retryable());
        assert!(SessionError::LoadFailure("oom".into()).is_retryable());
        assert!(SessionError::GenerationTimeout.is_retryable());

        assert!(!SessionError::NotLoaded.is_retryable());
        assert!(!SessionError::UnsupportedEnvironment.is_retryable());
        assert!(!SessionError::GenerationFailure("bad".into()).is_retryable());
    }

    #[test]
    fn test_retry_affordance_only_for_load_failures() {
        assert!(SessionError::LoadTimeout.offers_retry());
        assert!(SessionError::LoadFailure("x".into()).offers_retry());
        assert!(!SessionError::GenerationTimeout.offers_retry());
        assert!(!SessionError::NotLoaded.offers_retry());
    }

    #[test]
    fn test_format_error_message_is_action_qualified() {
        let err = SessionError::GenerationFailure("context overflow".into());
        let msg = format_error_message(&err, UserAction::GeneratingAnswer);
        assert_eq!(
            msg,
            "Sorry, an error occurred while generating an answer: context overflow. Please try again later."
        );

        let msg = format_error_message(&SessionError::LoadTimeout, UserAction::LoadingModel);
        assert!(msg.contains("while loading the model: Model loading timed out"));
    }

    #[test]
    fn test_numeric_runtime_codes_are_rewritten() {
        assert_eq!(
            describe_runtime_error(" 12345 "),
            "Model inference failed. Please reload the model and try again. (code: 12345)"
        );
        assert_eq!(describe_runtime_error("out of memory"), "out of memory");
        assert_eq!(describe_runtime_error(""), "");
    }
}
