//! Projected backtracking line search for bounds-constrained steps.

use crate::core::Evaluator;
use faer::Mat;
use nalgebra::DVector;
use tracing::trace;

/// Armijo backtracking along a trust-region step.
///
/// Used only for constrained problems: the retraction clamps each trial point
/// into the feasible box, so a full step that leaves the box can lose its
/// descent property. The search contracts the step until the projected trial
/// point satisfies the sufficient-decrease condition
/// `f(x + alpha d) <= f(x) + c alpha g^T d`, giving up after `max_steps`
/// contractions or once the step factor drops below `min_step`.
#[derive(Debug, Clone)]
pub struct ProjectedBacktrackingSearch {
    /// Contraction factor per backtracking step
    pub beta: f64,
    /// Smallest step factor worth trying
    pub min_step: f64,
    /// Maximum number of contractions
    pub max_steps: usize,
    /// Armijo sufficient-decrease constant `c`
    pub sufficient_decrease: f64,
}

impl Default for ProjectedBacktrackingSearch {
    fn default() -> Self {
        ProjectedBacktrackingSearch {
            beta: 0.5,
            min_step: 1e-8,
            max_steps: 12,
            sufficient_decrease: 1e-4,
        }
    }
}

impl ProjectedBacktrackingSearch {
    pub fn new(beta: f64, min_step: f64, max_steps: usize) -> Self {
        ProjectedBacktrackingSearch {
            beta,
            min_step,
            max_steps,
            ..ProjectedBacktrackingSearch::default()
        }
    }

    /// Search along `step` from `x`, where `gradient` is the tangent-space
    /// gradient at `x`. Returns the first scaled step whose projected trial
    /// point passes the Armijo test, or `None` when no trial point does; the
    /// caller then keeps the unscaled step.
    pub fn search<E: Evaluator>(
        &self,
        evaluator: &E,
        x: &DVector<f64>,
        step: &Mat<f64>,
        gradient: &Mat<f64>,
        current_cost: f64,
    ) -> Option<Mat<f64>> {
        let mut directional_derivative = 0.0;
        for i in 0..step.nrows() {
            directional_derivative += gradient[(i, 0)] * step[(i, 0)];
        }

        let mut alpha = 1.0;
        let mut trial = DVector::zeros(x.len());

        for _ in 0..=self.max_steps {
            let mut scaled = Mat::zeros(step.nrows(), 1);
            for i in 0..step.nrows() {
                scaled[(i, 0)] = alpha * step[(i, 0)];
            }

            if evaluator.plus(x, &scaled, &mut trial) {
                let sufficient =
                    current_cost + self.sufficient_decrease * alpha * directional_derivative;
                let mut cost = 0.0;
                if evaluator.evaluate(&trial, &mut cost, None, None, None) && cost <= sufficient {
                    trace!("line search accepted step factor {:.3e}", alpha);
                    return Some(scaled);
                }
            }

            alpha *= self.beta;
            if alpha < self.min_step {
                break;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CostFunction, Program, ProgramEvaluator};
    use nalgebra::{DMatrix, DVectorView};

    // r = x, so cost = 0.5 x^2.
    struct Identity;

    impl CostFunction for Identity {
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
            residuals[0] = parameters[0][0];
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 1.0;
            }
            true
        }
    }

    fn identity_program(initial: f64) -> Program {
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![initial]));
        program.add_residual_block(Box::new(Identity), None, &[x]).unwrap();
        program.setup_offsets();
        program
    }

    fn gradient_at(value: f64) -> Mat<f64> {
        // g = J^T r = x for the identity residual.
        let mut gradient = Mat::zeros(1, 1);
        gradient[(0, 0)] = value;
        gradient
    }

    #[test]
    fn test_full_step_accepted_when_it_decreases() {
        let program = identity_program(2.0);
        let evaluator = ProgramEvaluator::new(&program);
        let x = program.state_vector();

        let mut step = Mat::zeros(1, 1);
        step[(0, 0)] = -2.0;

        let search = ProjectedBacktrackingSearch::default();
        let scaled = search
            .search(&evaluator, &x, &step, &gradient_at(2.0), 2.0)
            .unwrap();
        assert_eq!(scaled[(0, 0)], -2.0);
    }

    #[test]
    fn test_overshooting_step_is_contracted() {
        // From x = 1 a step of -8 overshoots: cost(−7) > cost(1). Halving
        // twice gives -2, landing at -1 with equal cost; three halvings give
        // -1, landing at 0.
        let program = identity_program(1.0);
        let evaluator = ProgramEvaluator::new(&program);
        let x = program.state_vector();

        let mut step = Mat::zeros(1, 1);
        step[(0, 0)] = -8.0;

        let search = ProjectedBacktrackingSearch::default();
        let scaled = search
            .search(&evaluator, &x, &step, &gradient_at(1.0), 0.5)
            .unwrap();
        assert!(scaled[(0, 0)].abs() < 8.0);
        let mut trial = DVector::zeros(1);
        assert!(evaluator.plus(&x, &scaled, &mut trial));
        assert!(0.5 * trial[0] * trial[0] < 0.5);
    }

    #[test]
    fn test_no_descent_direction_returns_none() {
        // At the minimum, every step increases the cost.
        let program = identity_program(0.0);
        let evaluator = ProgramEvaluator::new(&program);
        let x = program.state_vector();

        let mut step = Mat::zeros(1, 1);
        step[(0, 0)] = 1.0;

        let search = ProjectedBacktrackingSearch::default();
        assert!(search
            .search(&evaluator, &x, &step, &gradient_at(0.0), 0.0)
            .is_none());
    }

    #[test]
    fn test_marginal_decrease_is_contracted() {
        // From x = 1 a step of -2 + 1e-5 lands near -1 with a decrease of
        // about 1e-5, below the Armijo bound of c * |g^T d| = 2e-4. The
        // search must contract instead of accepting the marginal point.
        let program = identity_program(1.0);
        let evaluator = ProgramEvaluator::new(&program);
        let x = program.state_vector();

        let mut step = Mat::zeros(1, 1);
        step[(0, 0)] = -2.0 + 1e-5;

        let search = ProjectedBacktrackingSearch::default();
        let scaled = search
            .search(&evaluator, &x, &step, &gradient_at(1.0), 0.5)
            .unwrap();
        assert!(scaled[(0, 0)].abs() < 1.5);
    }
}
