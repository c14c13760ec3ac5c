use thiserror::Error;

/// Failures of the weight-estimation and forecast-combination core.
///
/// Preprocessing recovers from `DataIntegrity` by dropping rows, estimation
/// aborts only the affected bucket, and query errors go straight back to the
/// caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlendError {
    #[error("Data integrity: {0}")]
    DataIntegrity(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Sampler failed to converge: {0}")]
    Convergence(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

pub type BlendResult<T> = std::result::Result<T, BlendError>;
