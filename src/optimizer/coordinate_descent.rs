//! Block coordinate descent over independent sets of parameter blocks.
//!
//! Used as the inner-iteration refinement of the trust-region loop: after an
//! accepted step, each parameter block is re-optimized against its own
//! residual subset while every other block stays fixed. Blocks that share no
//! residual block are independent and solved in parallel.

use crate::core::{
    CoreError, CoreResult, EvaluateScratch, Evaluator, ParameterBlockId, Program, ResidualBlockId,
};
use crate::linalg::SparseCholeskySolver;
use crate::optimizer::strategy::{LevenbergMarquardtOptions, LevenbergMarquardtStrategy};
use crate::optimizer::trust_region::{TrustRegionMinimizer, TrustRegionOptions};
use crate::optimizer::{OptimizerError, OptimizerResult};
use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::debug;

/// Coordinate descent over a fixed independent-set ordering.
///
/// Refinement is heuristic: per-block sub-solves that fail are skipped and
/// leave that block's state untouched.
pub struct CoordinateDescentMinimizer<'p> {
    program: &'p Program,
    independent_sets: Vec<Vec<ParameterBlockId>>,
    /// Residual blocks touching each parameter block, indexed by block id.
    residual_lists: Vec<Vec<ResidualBlockId>>,
}

impl<'p> CoordinateDescentMinimizer<'p> {
    /// Build a minimizer from an explicit ordering of independent sets.
    ///
    /// Constant and zero-tangent blocks are dropped from the sets. Varying
    /// blocks missing from the ordering are appended as singleton sets. Two
    /// varying blocks of one set must not share a residual block.
    pub fn new(
        program: &'p Program,
        ordering: Vec<Vec<ParameterBlockId>>,
    ) -> OptimizerResult<Self> {
        let num_blocks = program.parameter_blocks().len();
        let eligible = |id: ParameterBlockId| {
            let block = program.parameter_block(id);
            !block.is_constant() && block.tangent_size() > 0
        };

        let mut set_of_block = vec![usize::MAX; num_blocks];
        let mut independent_sets: Vec<Vec<ParameterBlockId>> = Vec::with_capacity(ordering.len());
        for set in ordering {
            let mut kept = Vec::with_capacity(set.len());
            for id in set {
                if id >= num_blocks {
                    return Err(OptimizerError::InvalidOrdering(format!(
                        "ordering names parameter block {id}, program has {num_blocks}"
                    ))
                    .log());
                }
                if set_of_block[id] != usize::MAX {
                    return Err(OptimizerError::InvalidOrdering(format!(
                        "parameter block {id} appears in more than one independent set"
                    ))
                    .log());
                }
                if eligible(id) {
                    set_of_block[id] = independent_sets.len();
                    kept.push(id);
                }
            }
            if !kept.is_empty() {
                independent_sets.push(kept);
            }
        }
        for id in 0..num_blocks {
            if set_of_block[id] == usize::MAX && eligible(id) {
                set_of_block[id] = independent_sets.len();
                independent_sets.push(vec![id]);
            }
        }

        for residual_block in program.residual_blocks() {
            let mut seen: Vec<usize> = residual_block
                .parameter_blocks()
                .iter()
                .map(|&id| set_of_block[id])
                .filter(|&set| set != usize::MAX)
                .collect();
            seen.sort_unstable();
            if seen.windows(2).any(|w| w[0] == w[1]) {
                return Err(OptimizerError::InvalidOrdering(
                    "a residual block links two parameter blocks of one independent set"
                        .to_string(),
                )
                .log());
            }
        }

        let residual_lists = (0..num_blocks)
            .map(|id| program.residual_blocks_for_parameter_block(id))
            .collect();

        Ok(CoordinateDescentMinimizer {
            program,
            independent_sets,
            residual_lists,
        })
    }

    /// Greedy coloring of the residual-sharing graph: blocks sharing a
    /// residual block land in different sets.
    pub fn independent_set_ordering(program: &Program) -> Vec<Vec<ParameterBlockId>> {
        let num_blocks = program.parameter_blocks().len();
        let mut neighbors: Vec<Vec<ParameterBlockId>> = vec![Vec::new(); num_blocks];
        for residual_block in program.residual_blocks() {
            let ids = residual_block.parameter_blocks();
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    if a != b {
                        neighbors[a].push(b);
                        neighbors[b].push(a);
                    }
                }
            }
        }

        let mut color = vec![usize::MAX; num_blocks];
        let mut num_colors = 0;
        for id in 0..num_blocks {
            let block = program.parameter_block(id);
            if block.is_constant() || block.tangent_size() == 0 {
                continue;
            }
            let used: Vec<usize> = neighbors[id]
                .iter()
                .map(|&n| color[n])
                .filter(|&c| c != usize::MAX)
                .collect();
            let mut candidate = 0;
            while used.contains(&candidate) {
                candidate += 1;
            }
            color[id] = candidate;
            num_colors = num_colors.max(candidate + 1);
        }

        let mut sets: Vec<Vec<ParameterBlockId>> = vec![Vec::new(); num_colors];
        for id in 0..num_blocks {
            if color[id] != usize::MAX {
                sets[color[id]].push(id);
            }
        }
        sets
    }

    pub fn independent_sets(&self) -> &[Vec<ParameterBlockId>] {
        &self.independent_sets
    }

    /// Refine `state` in place, one independent set at a time. Sub-solves
    /// within a set run in parallel and never observe each other's updates;
    /// results are written back between sets.
    pub fn minimize(&self, state: &mut DVector<f64>) {
        let inner_options = TrustRegionOptions::default()
            .with_max_iterations(5)
            .with_jacobi_scaling(false);

        for set in &self.independent_sets {
            let snapshot: &DVector<f64> = state;
            let updates: Vec<(ParameterBlockId, Option<DVector<f64>>)> = set
                .par_iter()
                .map(|&id| {
                    let block = self.program.parameter_block(id);
                    let evaluator = BlockSubsetEvaluator::new(
                        self.program,
                        id,
                        &self.residual_lists[id],
                        snapshot,
                    );
                    let mut strategy = LevenbergMarquardtStrategy::new(
                        LevenbergMarquardtOptions::default(),
                        Box::new(SparseCholeskySolver::new()),
                    );
                    let options = inner_options
                        .clone()
                        .with_is_constrained(block.has_bounds());

                    let mut local = snapshot
                        .rows(block.state_offset, block.size())
                        .into_owned();
                    let summary = TrustRegionMinimizer::new(&evaluator, &mut strategy)
                        .minimize(&options, &mut [], &mut local);

                    if summary.termination.is_solution_usable() {
                        (id, Some(local))
                    } else {
                        debug!(
                            "inner solve for parameter block {} failed: {}",
                            id, summary.message
                        );
                        (id, None)
                    }
                })
                .collect();

            for (id, local) in updates {
                if let Some(local) = local {
                    let block = self.program.parameter_block(id);
                    state
                        .rows_mut(block.state_offset, block.size())
                        .copy_from(&local);
                }
            }
        }
    }
}

/// [`Evaluator`] over one parameter block with every other block frozen at a
/// snapshot of the full state. Rows cover only the residual blocks that touch
/// the block.
struct BlockSubsetEvaluator<'a> {
    program: &'a Program,
    block_id: ParameterBlockId,
    residual_ids: &'a [ResidualBlockId],
    snapshot: &'a DVector<f64>,
    /// Local row offset of each residual block in `residual_ids`.
    row_offsets: Vec<usize>,
    num_rows: usize,
}

impl<'a> BlockSubsetEvaluator<'a> {
    fn new(
        program: &'a Program,
        block_id: ParameterBlockId,
        residual_ids: &'a [ResidualBlockId],
        snapshot: &'a DVector<f64>,
    ) -> Self {
        let mut row_offsets = Vec::with_capacity(residual_ids.len());
        let mut num_rows = 0;
        for &rid in residual_ids {
            row_offsets.push(num_rows);
            num_rows += program.residual_blocks()[rid].num_residuals();
        }
        BlockSubsetEvaluator {
            program,
            block_id,
            residual_ids,
            snapshot,
            row_offsets,
            num_rows,
        }
    }

    fn block(&self) -> &crate::core::ParameterBlock {
        self.program.parameter_block(self.block_id)
    }
}

impl Evaluator for BlockSubsetEvaluator<'_> {
    fn num_parameters(&self) -> usize {
        self.block().size()
    }

    fn num_effective_parameters(&self) -> usize {
        self.block().tangent_size()
    }

    fn num_residuals(&self) -> usize {
        self.num_rows
    }

    fn create_jacobian(&self) -> CoreResult<SparseColMat<usize, f64>> {
        let cols = self.num_effective_parameters();
        let mut triplets = Vec::with_capacity(self.num_rows * cols);
        for row in 0..self.num_rows {
            for col in 0..cols {
                triplets.push(Triplet::new(row, col, 0.0));
            }
        }
        SparseColMat::try_new_from_triplets(self.num_rows, cols, &triplets).map_err(|e| {
            CoreError::InvalidInput(format!("unable to create block Jacobian pattern: {e}")).log()
        })
    }

    fn evaluate(
        &self,
        state: &DVector<f64>,
        cost: &mut f64,
        mut residuals: Option<&mut Mat<f64>>,
        mut gradient: Option<&mut Mat<f64>>,
        jacobian: Option<&mut SparseColMat<usize, f64>>,
    ) -> bool {
        let block = self.block();
        if state.len() != block.size() {
            return false;
        }

        // Splice the block's trial state into the frozen snapshot.
        let mut full_state = self.snapshot.clone();
        full_state
            .rows_mut(block.state_offset, block.size())
            .copy_from(state);

        let compute_jacobians = gradient.is_some() || jacobian.is_some();
        let blocks = self.program.parameter_blocks();
        let cols = block.tangent_size();

        if let Some(g) = gradient.as_deref_mut() {
            g.fill(0.0);
        }
        let mut triplets: Vec<Triplet<usize, usize, f64>> =
            Vec::with_capacity(if jacobian.is_some() { self.num_rows * cols } else { 0 });

        *cost = 0.0;
        let mut scratch = EvaluateScratch::empty();
        for (i, &rid) in self.residual_ids.iter().enumerate() {
            let residual_block = &self.program.residual_blocks()[rid];
            let evaluation = match residual_block.evaluate(
                blocks,
                &full_state,
                true,
                compute_jacobians,
                &mut scratch,
            ) {
                Some(evaluation) => evaluation,
                None => return false,
            };

            *cost += evaluation.cost;
            let row_offset = self.row_offsets[i];
            if let Some(r) = residuals.as_deref_mut() {
                for row in 0..evaluation.residuals.len() {
                    r[(row_offset + row, 0)] = evaluation.residuals[row];
                }
            }
            if compute_jacobians {
                for (position, &id) in residual_block.parameter_blocks().iter().enumerate() {
                    if id != self.block_id {
                        continue;
                    }
                    let Some(block_jacobian) = &evaluation.jacobians[position] else {
                        continue;
                    };
                    if let Some(g) = gradient.as_deref_mut() {
                        for col in 0..cols {
                            let mut dot = 0.0;
                            for row in 0..evaluation.residuals.len() {
                                dot += block_jacobian[(row, col)] * evaluation.residuals[row];
                            }
                            g[(col, 0)] += dot;
                        }
                    }
                    if jacobian.is_some() {
                        for row in 0..evaluation.residuals.len() {
                            for col in 0..cols {
                                triplets.push(Triplet::new(
                                    row_offset + row,
                                    col,
                                    block_jacobian[(row, col)],
                                ));
                            }
                        }
                    }
                }
            }
        }

        if let Some(j) = jacobian {
            match SparseColMat::try_new_from_triplets(self.num_rows, cols, &triplets) {
                Ok(matrix) => *j = matrix,
                Err(_) => return false,
            }
        }
        true
    }

    fn plus(&self, state: &DVector<f64>, delta: &Mat<f64>, state_plus_delta: &mut DVector<f64>) -> bool {
        let block = self.block();
        let delta_vector =
            DVector::from_fn(delta.nrows(), |i, _| delta[(i, 0)]);
        block.plus(state.as_view(), delta_vector.as_view(), state_plus_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CostFunction;
    use nalgebra::{DMatrix, DVectorView};

    // r = x - target, one block per residual.
    struct Anchor {
        target: f64,
    }

    impl CostFunction for Anchor {
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
            residuals[0] = parameters[0][0] - self.target;
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 1.0;
            }
            true
        }
    }

    // r = x - y, coupling two blocks.
    struct Coupling;

    impl CostFunction for Coupling {
        fn num_residuals(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1, 1]
        }

        fn evaluate(
            &self,
            parameters: &[DVectorView<f64>],
            residuals: &mut DVector<f64>,
            jacobian: Option<&mut DMatrix<f64>>,
        ) -> bool {
            residuals[0] = parameters[0][0] - parameters[1][0];
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 1.0;
                jac[(0, 1)] = -1.0;
            }
            true
        }
    }

    fn decoupled_program() -> Program {
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        let y = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        program
            .add_residual_block(Box::new(Anchor { target: 2.0 }), None, &[x])
            .unwrap();
        program
            .add_residual_block(Box::new(Anchor { target: -4.0 }), None, &[y])
            .unwrap();
        program.setup_offsets();
        program
    }

    #[test]
    fn test_ordering_groups_decoupled_blocks_together() {
        let program = decoupled_program();
        let ordering = CoordinateDescentMinimizer::independent_set_ordering(&program);
        assert_eq!(ordering.len(), 1);
        assert_eq!(ordering[0], vec![0, 1]);
    }

    #[test]
    fn test_ordering_separates_coupled_blocks() {
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        let y = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        program
            .add_residual_block(Box::new(Coupling), None, &[x, y])
            .unwrap();
        program.setup_offsets();

        let ordering = CoordinateDescentMinimizer::independent_set_ordering(&program);
        assert_eq!(ordering.len(), 2);
        assert_eq!(ordering.iter().map(|s| s.len()).sum::<usize>(), 2);
    }

    #[test]
    fn test_new_rejects_coupled_blocks_in_one_set() {
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        let y = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        program
            .add_residual_block(Box::new(Coupling), None, &[x, y])
            .unwrap();
        program.setup_offsets();

        assert!(CoordinateDescentMinimizer::new(&program, vec![vec![x, y]]).is_err());
    }

    #[test]
    fn test_missing_blocks_appended_as_singletons() {
        let program = decoupled_program();
        let minimizer = CoordinateDescentMinimizer::new(&program, vec![vec![0]]).unwrap();
        assert_eq!(minimizer.independent_sets(), &[vec![0], vec![1]]);
    }

    #[test]
    fn test_constant_blocks_excluded() {
        let mut program = decoupled_program();
        program.parameter_block_mut(1).set_constant();
        program.setup_offsets();

        let ordering = CoordinateDescentMinimizer::independent_set_ordering(&program);
        let minimizer = CoordinateDescentMinimizer::new(&program, ordering).unwrap();
        assert_eq!(minimizer.independent_sets(), &[vec![0]]);
    }

    #[test]
    fn test_minimize_solves_decoupled_blocks_independently() {
        // Each block moves to its own anchor; neither solve disturbs the
        // other even though both run in the same set.
        let program = decoupled_program();
        let ordering = CoordinateDescentMinimizer::independent_set_ordering(&program);
        let minimizer = CoordinateDescentMinimizer::new(&program, ordering).unwrap();

        let mut state = program.state_vector();
        minimizer.minimize(&mut state);

        assert!((state[0] - 2.0).abs() < 1e-6);
        assert!((state[1] + 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_minimize_respects_frozen_neighbor() {
        // x anchored at 2, coupled to y by r = x - y. Solving only x with y
        // frozen at 0 lands at the least-squares balance x = 1.
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        let y = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        program
            .add_residual_block(Box::new(Anchor { target: 2.0 }), None, &[x])
            .unwrap();
        program
            .add_residual_block(Box::new(Coupling), None, &[x, y])
            .unwrap();
        program.parameter_block_mut(y).set_constant();
        program.setup_offsets();

        let ordering = CoordinateDescentMinimizer::independent_set_ordering(&program);
        let minimizer = CoordinateDescentMinimizer::new(&program, ordering).unwrap();

        let mut state = program.state_vector();
        minimizer.minimize(&mut state);

        assert!((state[0] - 1.0).abs() < 1e-6);
        assert_eq!(state[1], 0.0);
    }
}
