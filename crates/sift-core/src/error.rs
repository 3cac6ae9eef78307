use thiserror::Error;

/// Failure taxonomy for one stage attempt.
///
/// Only [`StageError::TransportUnavailable`] escalates beyond the current
/// candidate; everything else is scoped to one page and one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Another worker holds the stage lock for this page.
    #[error("stage lock already held")]
    LockContention,

    /// The generator endpoint is unreachable (DNS/connect/timeout, or an
    /// error reply without an HTTP status). Aborts the whole batch.
    #[error("generator unreachable: {0}")]
    TransportUnavailable(String),

    /// The generator answered with an HTTP error status.
    #[error("generator HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    /// The generator answered 200 with empty content.
    #[error("generator returned empty content")]
    EmptyResponse,

    /// No JSON object could be recovered from the generator text.
    #[error("no parseable JSON in generator response")]
    InvalidJson,

    /// The recovered object is missing a key the stage requires.
    #[error("required key missing from generator response: {0}")]
    MissingKey(String),

    /// A required key is present but has the wrong shape.
    #[error("generator response has wrong shape: {0}")]
    ShapeError(String),

    /// All attempts for one candidate were consumed without success.
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// Page store or lock store backend failed.
    #[error("store error: {0}")]
    StoreError(String),

    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    ConfigError(String),
}

impl StageError {
    /// True if the same candidate is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::HttpError { .. }
                | StageError::EmptyResponse
                | StageError::InvalidJson
                | StageError::MissingKey(_)
                | StageError::ShapeError(_)
        )
    }

    /// True if the whole batch must stop to avoid hammering a downed
    /// dependency.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::TransportUnavailable(_))
    }
}
