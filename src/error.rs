//! Error types for anvil-select
//!
//! ## Table of Contents
//! - **SelectError**: Main error enum covering all selection failure modes
//! - **Result**: Type alias for `Result<T, SelectError>`

use thiserror::Error;

/// Result type alias for selection operations
pub type Result<T> = std::result::Result<T, SelectError>;

/// Main error type for node selection
///
/// Every variant means "no valid selection for this request"; the variants
/// only exist so callers can log a precise reason. On error the candidate
/// map handed to [`eval_nodes`](crate::select::eval_nodes) is cleared.
#[derive(Error, Debug)]
pub enum SelectError {
    /// Malformed evaluation context (bad bounds, mismatched array lengths)
    #[error("invalid selection input: {0}")]
    InvalidInput(String),

    /// A node the job explicitly requires has no usable resources
    #[error("required node {0} has no usable resources")]
    RequiredNodeUnusable(String),

    /// The node-count cap was reached before all required nodes were placed
    #[error("node limit reached before all required nodes were placed")]
    NodeLimit,

    /// Required nodes straddle a switch or block locality boundary
    #[error("required nodes do not share a single {0}")]
    Locality(&'static str),

    /// The required nodes alone exceed the job's CPU ceiling
    #[error("required nodes exceed the job cpu limit")]
    CpuLimit,

    /// The candidate set cannot satisfy the request
    #[error("insufficient resources in candidate nodes")]
    InsufficientResources,
}

impl SelectError {
    /// Create an invalid-input error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a required-node-unusable error
    pub fn required_unusable(node: impl Into<String>) -> Self {
        Self::RequiredNodeUnusable(node.into())
    }
}
