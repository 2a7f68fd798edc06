use thiserror::Error;

/// Errors surfaced by the pruning engine.
///
/// Soft skips (missing index artifact, index disabled by a pending mutation)
/// are not represented here: those paths return the input ranges unchanged
/// and log at debug level.
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("resource limit: {0}")]
    ResourceLimit(String),
    #[error("query timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl SelectError {
    /// True for errors caused by query or engine settings rather than data.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SelectError::Configuration(_))
    }

    /// True when the query was stopped by its deadline or a cancel request.
    pub fn is_interruption(&self) -> bool {
        matches!(self, SelectError::Timeout(_) | SelectError::Cancelled(_))
    }
}

pub type SelectResult<T> = Result<T, SelectError>;
