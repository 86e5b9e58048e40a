//! Problem data model: parameter blocks, residual blocks, manifolds, losses.
//!
//! A [`Program`] owns the parameter and residual blocks of a nonlinear
//! least-squares problem in two ordered arenas; blocks are addressed by
//! integer handles. The [`evaluator::ProgramEvaluator`] turns a program into
//! the residual vector, gradient, and sparse Jacobian consumed by the
//! trust-region loop.

use thiserror::Error;
use tracing::error;

pub mod corrector;
pub mod cost_function;
pub mod evaluator;
pub mod loss_functions;
pub mod manifold;
pub mod parameter_block;
pub mod program;
pub mod residual_block;

pub use corrector::Corrector;
pub use cost_function::CostFunction;
pub use evaluator::{Evaluator, ProgramEvaluator};
pub use loss_functions::{CauchyLoss, HuberLoss, L2Loss, LossFunction};
pub use manifold::{Manifold, SubsetManifold};
pub use parameter_block::{ParameterBlock, ParameterBlockId};
pub use program::Program;
pub use residual_block::{BlockEvaluation, EvaluateScratch, ResidualBlock, ResidualBlockId};

/// Marker value written into evaluation scratch buffers before a cost function
/// runs. A cost function that reports success but leaves this value behind has
/// not written all of its outputs, and the evaluation is treated as failed.
///
/// The value is finite so it passes through arithmetic unchanged, but large
/// enough that no plausible residual or Jacobian entry collides with it.
pub const IMPOSSIBLE_VALUE_SENTINEL: f64 = 1e302;

/// Core-specific error types for the problem data model
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Parameter block construction or mutation failed
    #[error("Parameter block error: {0}")]
    ParameterBlock(String),

    /// Residual block construction failed
    #[error("Residual block error: {0}")]
    ResidualBlock(String),

    /// Loss function parameters are invalid
    #[error("Loss function error: {0}")]
    LossFunction(String),

    /// Manifold attachment or operation failed
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// Mismatched dimensions between blocks, cost functions, or state vectors
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
