//! Residual block: one cost function bound to its parameter blocks.

use crate::core::corrector::Corrector;
use crate::core::cost_function::CostFunction;
use crate::core::loss_functions::LossFunction;
use crate::core::parameter_block::{ParameterBlock, ParameterBlockId};
use crate::core::IMPOSSIBLE_VALUE_SENTINEL;
use nalgebra::{DMatrix, DVector};

/// Handle to a residual block inside a [`Program`](crate::core::Program).
pub type ResidualBlockId = usize;

/// Scratch buffers for one residual block evaluation.
///
/// Every buffer is pre-filled with [`IMPOSSIBLE_VALUE_SENTINEL`] before the
/// cost function runs; a surviving sentinel after a nominally successful call
/// means the cost function skipped an output, and the evaluation is rejected.
pub struct EvaluateScratch {
    pub(crate) residuals: DVector<f64>,
    pub(crate) jacobian: DMatrix<f64>,
}

impl EvaluateScratch {
    pub fn new(num_residuals: usize, ambient_cols: usize) -> Self {
        EvaluateScratch {
            residuals: DVector::from_element(num_residuals, IMPOSSIBLE_VALUE_SENTINEL),
            jacobian: DMatrix::from_element(num_residuals, ambient_cols, IMPOSSIBLE_VALUE_SENTINEL),
        }
    }

    /// Zero-capacity scratch meant to be reused across blocks; each
    /// evaluation resizes it only when the block shape differs from the
    /// previous one.
    pub fn empty() -> Self {
        EvaluateScratch::new(0, 0)
    }

    fn prepare(&mut self, num_residuals: usize, ambient_cols: usize) {
        if self.residuals.nrows() != num_residuals {
            self.residuals
                .resize_vertically_mut(num_residuals, IMPOSSIBLE_VALUE_SENTINEL);
        }
        if self.jacobian.nrows() != num_residuals || self.jacobian.ncols() != ambient_cols {
            self.jacobian
                .resize_mut(num_residuals, ambient_cols, IMPOSSIBLE_VALUE_SENTINEL);
        }
        self.residuals.fill(IMPOSSIBLE_VALUE_SENTINEL);
        self.jacobian.fill(IMPOSSIBLE_VALUE_SENTINEL);
    }

    // Outputs must be fully written and finite. The sentinel is itself
    // finite, so it is checked explicitly.
    fn residuals_valid(&self) -> bool {
        self.residuals
            .iter()
            .all(|v| v.is_finite() && *v != IMPOSSIBLE_VALUE_SENTINEL)
    }

    fn jacobian_valid(&self) -> bool {
        self.jacobian
            .iter()
            .all(|v| v.is_finite() && *v != IMPOSSIBLE_VALUE_SENTINEL)
    }
}

/// Result of evaluating one residual block at a given state.
pub struct BlockEvaluation {
    /// `0.5 * rho(||r||^2)` with the block's loss applied, `0.5 * ||r||^2`
    /// without one.
    pub cost: f64,
    /// Residual vector, loss-corrected when a loss is attached.
    pub residuals: DVector<f64>,
    /// Tangent-space Jacobian per parameter block, in block argument order.
    /// `None` for constant blocks and when Jacobians were not requested.
    pub jacobians: Vec<Option<DMatrix<f64>>>,
}

/// One term of the objective: a cost function, an optional robust loss, and
/// the ordered parameter blocks it reads.
pub struct ResidualBlock {
    pub(crate) cost_function: Box<dyn CostFunction>,
    pub(crate) loss: Option<Box<dyn LossFunction>>,
    pub(crate) parameter_blocks: Vec<ParameterBlockId>,
    pub(crate) index: usize,
    pub(crate) residual_offset: usize,
}

impl ResidualBlock {
    pub(crate) fn new(
        cost_function: Box<dyn CostFunction>,
        loss: Option<Box<dyn LossFunction>>,
        parameter_blocks: Vec<ParameterBlockId>,
    ) -> Self {
        ResidualBlock {
            cost_function,
            loss,
            parameter_blocks,
            index: 0,
            residual_offset: 0,
        }
    }

    pub fn num_residuals(&self) -> usize {
        self.cost_function.num_residuals()
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    /// Row offset of this block in the assembled residual vector.
    pub fn residual_offset(&self) -> usize {
        self.residual_offset
    }

    /// Width of the scratch Jacobian: ambient sizes of all argument blocks.
    pub fn ambient_cols(&self, blocks: &[ParameterBlock]) -> usize {
        self.parameter_blocks
            .iter()
            .map(|&id| blocks[id].size())
            .sum()
    }

    /// Allocate scratch sized for this block.
    pub fn scratch(&self, blocks: &[ParameterBlock]) -> EvaluateScratch {
        EvaluateScratch::new(self.num_residuals(), self.ambient_cols(blocks))
    }

    /// Number of doubles [`evaluate`](Self::evaluate) needs as scratch for
    /// this block: the residual vector plus the packed ambient Jacobian.
    pub fn num_scratch_doubles_for_evaluate(&self, blocks: &[ParameterBlock]) -> usize {
        self.num_residuals() * (1 + self.ambient_cols(blocks))
    }

    /// Evaluate the block at the packed ambient state vector `state`.
    ///
    /// Block states are read at their `state_offset` within `state`, so the
    /// arena itself is never mutated during evaluation. When
    /// `compute_jacobians` is set, tangent-space Jacobians are produced for
    /// every varying argument block by chaining the ambient Jacobian through
    /// the block's retraction Jacobian.
    ///
    /// Returns `None` when the cost function fails, leaves an output
    /// unwritten, produces a non-finite value, or a retraction Jacobian
    /// cannot be computed. No partial results escape a failed evaluation.
    pub fn evaluate(
        &self,
        blocks: &[ParameterBlock],
        state: &DVector<f64>,
        apply_loss: bool,
        compute_jacobians: bool,
        scratch: &mut EvaluateScratch,
    ) -> Option<BlockEvaluation> {
        scratch.prepare(self.num_residuals(), self.ambient_cols(blocks));

        let parameters: Vec<_> = self
            .parameter_blocks
            .iter()
            .map(|&id| {
                let block = &blocks[id];
                state.rows(block.state_offset, block.size())
            })
            .collect();

        let ok = self.cost_function.evaluate(
            &parameters,
            &mut scratch.residuals,
            if compute_jacobians {
                Some(&mut scratch.jacobian)
            } else {
                None
            },
        );
        if !ok || !scratch.residuals_valid() || (compute_jacobians && !scratch.jacobian_valid()) {
            return None;
        }

        let mut residuals = scratch.residuals.clone();
        let mut jacobians: Vec<Option<DMatrix<f64>>> =
            (0..self.parameter_blocks.len()).map(|_| None).collect();

        if compute_jacobians {
            let mut column_offset = 0;
            for (position, &id) in self.parameter_blocks.iter().enumerate() {
                let block = &blocks[id];
                let size = block.size();
                let tangent_size = block.tangent_size();
                if !block.is_constant() && tangent_size > 0 {
                    let ambient = scratch.jacobian.columns(column_offset, size);
                    let jacobian = if block.manifold().is_some() {
                        let x = state.rows(block.state_offset, size);
                        let mut plus_jacobian = DMatrix::zeros(size, tangent_size);
                        if !block.plus_jacobian(x, &mut plus_jacobian) {
                            return None;
                        }
                        &ambient * plus_jacobian
                    } else {
                        ambient.into_owned()
                    };
                    jacobians[position] = Some(jacobian);
                }
                column_offset += size;
            }
        }

        let squared_norm = residuals.dot(&residuals);
        let mut cost = 0.5 * squared_norm;

        if apply_loss {
            if let Some(loss) = &self.loss {
                let rho = loss.evaluate(squared_norm);
                let corrector = Corrector::new(loss.as_ref(), squared_norm);
                // Jacobians first: the corrector needs the uncorrected
                // residual.
                for jacobian in jacobians.iter_mut().flatten() {
                    corrector.correct_jacobian(&residuals, jacobian);
                }
                corrector.correct_residuals(&mut residuals);
                cost = 0.5 * rho[0];
            }
        }

        Some(BlockEvaluation {
            cost,
            residuals,
            jacobians,
        })
    }
}
