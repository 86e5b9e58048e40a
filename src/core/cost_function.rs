//! User-supplied residual and Jacobian evaluation.

use nalgebra::{DMatrix, DVector, DVectorView};

/// A term of the objective: a residual vector depending on one or more
/// parameter blocks, with analytic Jacobians in ambient coordinates.
///
/// Implementations must be deterministic for a given input and must write
/// every entry of `residuals` (and of `jacobian` when present) before
/// returning `true`. Returning `false` marks the evaluation as failed for the
/// current states; the minimizer treats a failure at a candidate point as a
/// rejected step, not as a fatal error.
pub trait CostFunction: Send + Sync {
    /// Number of rows of the residual vector.
    fn num_residuals(&self) -> usize;

    /// Ambient sizes of the parameter blocks this cost function expects,
    /// in argument order.
    fn parameter_block_sizes(&self) -> Vec<usize>;

    /// Evaluate residuals and, when requested, the Jacobian.
    ///
    /// `parameters` holds one ambient-coordinate view per parameter block, in
    /// the order of `parameter_block_sizes`. `jacobian` (when present) has
    /// `num_residuals` rows and one column group per parameter block, laid out
    /// side by side in the same order; entry `(r, c)` of a group is the
    /// derivative of residual `r` with respect to ambient coordinate `c` of
    /// that block.
    fn evaluate(
        &self,
        parameters: &[DVectorView<f64>],
        residuals: &mut DVector<f64>,
        jacobian: Option<&mut DMatrix<f64>>,
    ) -> bool;
}
