//! Sparse linear solvers for the trust-region step computation.

use faer::sparse::SparseColMat;
use faer::Mat;
use thiserror::Error;
use tracing::error;

pub mod cholesky;

pub use cholesky::SparseCholeskySolver;

/// Linear algebra error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic or numeric factorization failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// The system matrix is singular or not positive definite
    #[error("Matrix is singular or not positive definite")]
    SingularMatrix,

    /// Sparse matrix construction from triplets failed
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// Sparse matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
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

    /// Whether a failed solve can be retried with a different regularization,
    /// as opposed to a structural problem with the inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinAlgError::SingularMatrix | LinAlgError::FactorizationFailed(_)
        )
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Direct sparse solver for the (possibly regularized) normal equations.
///
/// Implementations cache the symbolic factorization across calls and assume
/// the sparsity pattern of the Jacobian is constant for the lifetime of a
/// solve. Solvers are stateful and not reentrant; parallel sub-solves must
/// each construct their own instance.
pub trait SparseLinearSolver: Send {
    /// Solve `(J^T J) dx = -J^T r`, returning the step `dx`.
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve `(J^T J + lambda I) dx = -J^T r`, returning the step `dx`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>>;

    /// Gauss-Newton Hessian `J^T J` from the most recent solve.
    fn hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    /// Gradient `J^T r` from the most recent solve.
    fn gradient(&self) -> Option<&Mat<f64>>;
}
