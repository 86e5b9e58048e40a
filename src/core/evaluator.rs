//! Whole-problem evaluation: residual vector, gradient, sparse Jacobian.

use crate::core::program::Program;
use crate::core::residual_block::EvaluateScratch;
use crate::core::{CoreError, CoreResult};
use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::debug;

/// Evaluation interface consumed by the trust-region loop.
///
/// States are packed ambient vectors; deltas, gradients, and Jacobian columns
/// live in the tangent space of the varying blocks. The Jacobian sparsity
/// pattern is fixed for the lifetime of a solve.
pub trait Evaluator {
    /// Ambient dimension of the packed state vector.
    fn num_parameters(&self) -> usize;

    /// Tangent dimension over varying blocks.
    fn num_effective_parameters(&self) -> usize;

    /// Number of residual rows.
    fn num_residuals(&self) -> usize;

    /// Allocate a Jacobian with the problem's sparsity pattern.
    fn create_jacobian(&self) -> CoreResult<SparseColMat<usize, f64>>;

    /// Evaluate cost and any requested derived quantities at `state`.
    ///
    /// Returns false when any residual block fails to evaluate; outputs are
    /// unspecified in that case and must not be consumed.
    fn evaluate(
        &self,
        state: &DVector<f64>,
        cost: &mut f64,
        residuals: Option<&mut Mat<f64>>,
        gradient: Option<&mut Mat<f64>>,
        jacobian: Option<&mut SparseColMat<usize, f64>>,
    ) -> bool;

    /// Retraction of a tangent delta across the whole state vector.
    fn plus(&self, state: &DVector<f64>, delta: &Mat<f64>, state_plus_delta: &mut DVector<f64>)
        -> bool;
}

/// [`Evaluator`] over a [`Program`].
///
/// Residual blocks are evaluated in parallel with rayon and their rows
/// scattered into the assembled outputs; evaluation never mutates the
/// program, so candidate states can be probed freely.
pub struct ProgramEvaluator<'a> {
    program: &'a Program,
}

impl<'a> ProgramEvaluator<'a> {
    pub fn new(program: &'a Program) -> Self {
        ProgramEvaluator { program }
    }
}

impl Evaluator for ProgramEvaluator<'_> {
    fn num_parameters(&self) -> usize {
        self.program.num_parameters()
    }

    fn num_effective_parameters(&self) -> usize {
        self.program.num_effective_parameters()
    }

    fn num_residuals(&self) -> usize {
        self.program.num_residuals()
    }

    fn create_jacobian(&self) -> CoreResult<SparseColMat<usize, f64>> {
        let blocks = self.program.parameter_blocks();
        let mut triplets = Vec::new();
        for residual_block in self.program.residual_blocks() {
            let num_residuals = residual_block.num_residuals();
            for &id in residual_block.parameter_blocks() {
                let block = &blocks[id];
                if block.is_constant() || block.tangent_size() == 0 {
                    continue;
                }
                for c in 0..block.tangent_size() {
                    for r in 0..num_residuals {
                        triplets.push(Triplet::new(
                            residual_block.residual_offset() + r,
                            block.delta_offset + c,
                            0.0,
                        ));
                    }
                }
            }
        }
        SparseColMat::try_new_from_triplets(
            self.num_residuals(),
            self.num_effective_parameters(),
            &triplets,
        )
        .map_err(|e| {
            CoreError::InvalidInput("failed to create Jacobian sparsity pattern".to_string())
                .log_with_source(e)
        })
    }

    fn evaluate(
        &self,
        state: &DVector<f64>,
        cost: &mut f64,
        residuals: Option<&mut Mat<f64>>,
        gradient: Option<&mut Mat<f64>>,
        jacobian: Option<&mut SparseColMat<usize, f64>>,
    ) -> bool {
        let blocks = self.program.parameter_blocks();
        let want_jacobians = gradient.is_some() || jacobian.is_some();

        // Scratch is per rayon worker, not per block: each worker resizes
        // its buffers only when consecutive blocks differ in shape.
        let evaluations: Vec<_> = self
            .program
            .residual_blocks()
            .par_iter()
            .map_init(EvaluateScratch::empty, |scratch, block| {
                block.evaluate(blocks, state, true, want_jacobians, scratch)
            })
            .collect();

        if evaluations.iter().any(Option::is_none) {
            debug!("residual block evaluation failed");
            return false;
        }

        *cost = 0.0;
        for evaluation in evaluations.iter().flatten() {
            *cost += evaluation.cost;
        }

        if let Some(residuals) = residuals {
            for (residual_block, evaluation) in self
                .program
                .residual_blocks()
                .iter()
                .zip(evaluations.iter().map(|e| e.as_ref().unwrap()))
            {
                let offset = residual_block.residual_offset();
                for r in 0..residual_block.num_residuals() {
                    residuals[(offset + r, 0)] = evaluation.residuals[r];
                }
            }
        }

        if let Some(gradient) = gradient {
            for i in 0..self.num_effective_parameters() {
                gradient[(i, 0)] = 0.0;
            }
            for (residual_block, evaluation) in self
                .program
                .residual_blocks()
                .iter()
                .zip(evaluations.iter().map(|e| e.as_ref().unwrap()))
            {
                for (position, &id) in residual_block.parameter_blocks().iter().enumerate() {
                    if let Some(block_jacobian) = &evaluation.jacobians[position] {
                        let delta_offset = blocks[id].delta_offset;
                        for c in 0..block_jacobian.ncols() {
                            let mut sum = 0.0;
                            for r in 0..block_jacobian.nrows() {
                                sum += block_jacobian[(r, c)] * evaluation.residuals[r];
                            }
                            gradient[(delta_offset + c, 0)] += sum;
                        }
                    }
                }
            }
        }

        if let Some(jacobian) = jacobian {
            let mut triplets = Vec::new();
            for (residual_block, evaluation) in self
                .program
                .residual_blocks()
                .iter()
                .zip(evaluations.iter().map(|e| e.as_ref().unwrap()))
            {
                let row_offset = residual_block.residual_offset();
                for (position, &id) in residual_block.parameter_blocks().iter().enumerate() {
                    if let Some(block_jacobian) = &evaluation.jacobians[position] {
                        let delta_offset = blocks[id].delta_offset;
                        for c in 0..block_jacobian.ncols() {
                            for r in 0..block_jacobian.nrows() {
                                triplets.push(Triplet::new(
                                    row_offset + r,
                                    delta_offset + c,
                                    block_jacobian[(r, c)],
                                ));
                            }
                        }
                    }
                }
            }
            match SparseColMat::try_new_from_triplets(
                self.num_residuals(),
                self.num_effective_parameters(),
                &triplets,
            ) {
                Ok(assembled) => *jacobian = assembled,
                Err(e) => {
                    debug!("Jacobian assembly failed: {:?}", e);
                    return false;
                }
            }
        }

        true
    }

    fn plus(
        &self,
        state: &DVector<f64>,
        delta: &Mat<f64>,
        state_plus_delta: &mut DVector<f64>,
    ) -> bool {
        let delta = DVector::from_fn(delta.nrows(), |i, _| delta[(i, 0)]);
        self.program.plus(state, &delta, state_plus_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cost_function::CostFunction;
    use nalgebra::{DMatrix, DVectorView};

    // r0 = 2*x - 1 over block a, r1 = [y0 - y1, y0 + y1] over block b.
    struct ScalarCost;

    impl CostFunction for ScalarCost {
        fn num_residuals(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1]
        }

        fn evaluate(
            &self,
            parameters: &[DVectorView<f64>],
            residuals: &mut DVector<f64>,
            jacobian: Option<&mut DMatrix<f64>>,
        ) -> bool {
            residuals[0] = 2.0 * parameters[0][0] - 1.0;
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 2.0;
            }
            true
        }
    }

    struct PairCost;

    impl CostFunction for PairCost {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![2]
        }

        fn evaluate(
            &self,
            parameters: &[DVectorView<f64>],
            residuals: &mut DVector<f64>,
            jacobian: Option<&mut DMatrix<f64>>,
        ) -> bool {
            residuals[0] = parameters[0][0] - parameters[0][1];
            residuals[1] = parameters[0][0] + parameters[0][1];
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 1.0;
                jac[(0, 1)] = -1.0;
                jac[(1, 0)] = 1.0;
                jac[(1, 1)] = 1.0;
            }
            true
        }
    }

    fn two_block_program() -> Program {
        let mut program = Program::new();
        let a = program.add_parameter_block(DVector::from_vec(vec![1.0]));
        let b = program.add_parameter_block(DVector::from_vec(vec![2.0, 3.0]));
        program
            .add_residual_block(Box::new(ScalarCost), None, &[a])
            .unwrap();
        program
            .add_residual_block(Box::new(PairCost), None, &[b])
            .unwrap();
        program.setup_offsets();
        program
    }

    #[test]
    fn test_cost_and_residual_assembly() {
        let program = two_block_program();
        let evaluator = ProgramEvaluator::new(&program);
        let state = program.state_vector();

        let mut cost = 0.0;
        let mut residuals = Mat::zeros(3, 1);
        assert!(evaluator.evaluate(&state, &mut cost, Some(&mut residuals), None, None));

        // r = [1, -1, 5]
        assert_eq!(residuals[(0, 0)], 1.0);
        assert_eq!(residuals[(1, 0)], -1.0);
        assert_eq!(residuals[(2, 0)], 5.0);
        assert!((cost - 0.5 * 27.0).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_matches_jt_r() {
        let program = two_block_program();
        let evaluator = ProgramEvaluator::new(&program);
        let state = program.state_vector();

        let mut cost = 0.0;
        let mut gradient = Mat::zeros(3, 1);
        assert!(evaluator.evaluate(&state, &mut cost, None, Some(&mut gradient), None));

        // g = J^T r with J = diag(2, [[1,-1],[1,1]]) and r = [1, -1, 5]
        assert!((gradient[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((gradient[(1, 0)] - 4.0).abs() < 1e-12);
        assert!((gradient[(2, 0)] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_jacobian_assembly() {
        let program = two_block_program();
        let evaluator = ProgramEvaluator::new(&program);
        let state = program.state_vector();

        let mut cost = 0.0;
        let mut jacobian = evaluator.create_jacobian().unwrap();
        assert!(evaluator.evaluate(&state, &mut cost, None, None, Some(&mut jacobian)));

        let dense = jacobian.to_dense();
        assert_eq!(dense[(0, 0)], 2.0);
        assert_eq!(dense[(1, 1)], 1.0);
        assert_eq!(dense[(1, 2)], -1.0);
        assert_eq!(dense[(2, 1)], 1.0);
        assert_eq!(dense[(2, 2)], 1.0);
    }

    #[test]
    fn test_constant_block_excluded_from_tangent() {
        let mut program = Program::new();
        let a = program.add_parameter_block(DVector::from_vec(vec![1.0]));
        let b = program.add_parameter_block(DVector::from_vec(vec![2.0, 3.0]));
        program
            .add_residual_block(Box::new(ScalarCost), None, &[a])
            .unwrap();
        program
            .add_residual_block(Box::new(PairCost), None, &[b])
            .unwrap();
        program.parameter_block_mut(a).set_constant();
        program.setup_offsets();

        let evaluator = ProgramEvaluator::new(&program);
        assert_eq!(evaluator.num_effective_parameters(), 2);

        let state = program.state_vector();
        let mut cost = 0.0;
        let mut gradient = Mat::zeros(2, 1);
        assert!(evaluator.evaluate(&state, &mut cost, None, Some(&mut gradient), None));
        assert!((gradient[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((gradient[(1, 0)] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_plus_applies_tangent_delta() {
        let program = two_block_program();
        let evaluator = ProgramEvaluator::new(&program);
        let state = program.state_vector();

        let mut delta = Mat::zeros(3, 1);
        delta[(0, 0)] = 1.0;
        delta[(2, 0)] = -1.0;

        let mut out = DVector::zeros(3);
        assert!(evaluator.plus(&state, &delta, &mut out));
        assert_eq!(out, DVector::from_vec(vec![2.0, 2.0, 2.0]));
    }
}
