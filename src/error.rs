//! Error types for the crest-solver library
//!
//! Each module defines its own error enum; this module wraps them into a single
//! library-level error so callers can use one result type at the API boundary.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::{core::CoreError, linalg::LinAlgError, optimizer::OptimizerError};
use thiserror::Error;

/// Main result type used throughout the crest-solver library
pub type CrestResult<T> = Result<T, CrestError>;

/// Main error type for the crest-solver library
#[derive(Debug, Clone, Error)]
pub enum CrestError {
    /// Errors from the problem data model (blocks, manifolds, loss functions)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Errors from sparse linear algebra backends
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),

    /// Errors from the minimization loop and its strategies
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

impl CrestError {
    /// Render the full error chain, one source per line.
    pub fn chain(&self) -> String {
        let mut out = format!("{self}");
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(&format!("\n  caused by: {err}"));
            source = err.source();
        }
        out
    }
}
