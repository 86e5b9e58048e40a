//! Pluggable trust-region step computation.

use crate::linalg::SparseLinearSolver;
use faer::sparse::SparseColMat;
use faer::Mat;
use tracing::debug;

/// Outcome of a strategy's step computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// A step was produced
    Success,
    /// The step could not be computed at the current regularization; the
    /// minimizer should treat the step as invalid and retry with a smaller
    /// radius
    NoConvergence,
    /// The step computation failed structurally and retrying cannot help
    Failure,
}

/// Summary of one `compute_step` call.
#[derive(Debug, Clone, Copy)]
pub struct StrategySummary {
    pub termination: StepStatus,
    /// Linear solver iterations (0 for direct solvers)
    pub num_iterations: usize,
}

/// A trust-region step policy.
///
/// The minimizer calls [`compute_step`](TrustRegionStrategy::compute_step) to
/// obtain a tangent-space step for the current linearization, then reports
/// back whether the step was accepted, rejected, or invalid so the strategy
/// can adapt its region.
pub trait TrustRegionStrategy: Send {
    /// Compute a step for the given (scaled) Jacobian and residuals. `step`
    /// has one row per effective parameter; its content is unspecified
    /// unless the returned status is [`StepStatus::Success`].
    fn compute_step(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        step: &mut Mat<f64>,
    ) -> StrategySummary;

    /// The step was accepted with the given quality (ratio of actual to
    /// model cost decrease).
    fn step_accepted(&mut self, step_quality: f64);

    /// The step was rejected with the given quality.
    fn step_rejected(&mut self, step_quality: f64);

    /// The step was numerically invalid (unsolvable system or non-positive
    /// model cost change).
    fn step_is_invalid(&mut self);

    /// Current trust region radius.
    fn radius(&self) -> f64;
}

/// Configuration for [`LevenbergMarquardtStrategy`].
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtOptions {
    /// Initial trust region radius (default: 1e4)
    pub initial_radius: f64,
    /// Upper bound on the trust region radius (default: 1e32)
    pub max_radius: f64,
}

impl Default for LevenbergMarquardtOptions {
    fn default() -> Self {
        LevenbergMarquardtOptions {
            initial_radius: 1e4,
            max_radius: 1e32,
        }
    }
}

impl LevenbergMarquardtOptions {
    pub fn new() -> Self {
        LevenbergMarquardtOptions::default()
    }

    pub fn with_initial_radius(mut self, initial_radius: f64) -> Self {
        self.initial_radius = initial_radius;
        self
    }

    pub fn with_max_radius(mut self, max_radius: f64) -> Self {
        self.max_radius = max_radius;
        self
    }
}

/// Levenberg-Marquardt regularization as a trust-region policy.
///
/// The radius maps to a damping parameter `lambda = 1 / radius`; the step
/// solves the augmented normal equations `(J^T J + lambda I) dx = -J^T r`.
/// On acceptance the radius grows by the standard `1 / max(1/3, 1 -
/// (2q - 1)^3)` factor; on rejection it shrinks geometrically with a
/// doubling decrease factor, so consecutive rejections back off fast.
pub struct LevenbergMarquardtStrategy {
    options: LevenbergMarquardtOptions,
    linear_solver: Box<dyn SparseLinearSolver>,
    radius: f64,
    decrease_factor: f64,
}

impl LevenbergMarquardtStrategy {
    pub fn new(
        options: LevenbergMarquardtOptions,
        linear_solver: Box<dyn SparseLinearSolver>,
    ) -> Self {
        let radius = options.initial_radius;
        LevenbergMarquardtStrategy {
            options,
            linear_solver,
            radius,
            decrease_factor: 2.0,
        }
    }
}

impl TrustRegionStrategy for LevenbergMarquardtStrategy {
    fn compute_step(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        step: &mut Mat<f64>,
    ) -> StrategySummary {
        let lambda = 1.0 / self.radius;
        match self
            .linear_solver
            .solve_augmented_equation(residuals, jacobian, lambda)
        {
            Ok(dx) => {
                *step = dx;
                StrategySummary {
                    termination: StepStatus::Success,
                    num_iterations: 0,
                }
            }
            Err(e) if e.is_recoverable() => {
                debug!("linear solve failed at lambda {:.3e}: {}", lambda, e);
                StrategySummary {
                    termination: StepStatus::NoConvergence,
                    num_iterations: 0,
                }
            }
            Err(e) => {
                debug!("linear solve failed fatally: {}", e);
                StrategySummary {
                    termination: StepStatus::Failure,
                    num_iterations: 0,
                }
            }
        }
    }

    fn step_accepted(&mut self, step_quality: f64) {
        let factor = (1.0 - (2.0 * step_quality - 1.0).powi(3)).max(1.0 / 3.0);
        self.radius = (self.radius / factor).min(self.options.max_radius);
        self.decrease_factor = 2.0;
    }

    fn step_rejected(&mut self, _step_quality: f64) {
        self.radius /= self.decrease_factor;
        self.decrease_factor *= 2.0;
    }

    fn step_is_invalid(&mut self) {
        self.radius /= self.decrease_factor;
        self.decrease_factor *= 2.0;
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::SparseCholeskySolver;
    use faer::sparse::Triplet;

    fn strategy() -> LevenbergMarquardtStrategy {
        LevenbergMarquardtStrategy::new(
            LevenbergMarquardtOptions::default(),
            Box::new(SparseCholeskySolver::new()),
        )
    }

    #[test]
    fn test_radius_grows_on_good_step() {
        let mut strategy = strategy();
        let before = strategy.radius();
        strategy.step_accepted(1.0);
        // q = 1 gives the maximum growth factor of 3.
        assert!((strategy.radius() - 3.0 * before).abs() < 1e-6);
    }

    #[test]
    fn test_radius_shrinks_geometrically_on_rejections() {
        let mut strategy = strategy();
        let before = strategy.radius();
        strategy.step_rejected(0.0);
        assert!((strategy.radius() - before / 2.0).abs() < 1e-9);
        strategy.step_rejected(0.0);
        assert!((strategy.radius() - before / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_acceptance_resets_decrease_factor() {
        let mut strategy = strategy();
        strategy.step_rejected(0.0);
        strategy.step_rejected(0.0);
        strategy.step_accepted(0.9);
        let before = strategy.radius();
        strategy.step_rejected(0.0);
        assert!((strategy.radius() - before / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_radius_capped_at_max() {
        let mut strategy = LevenbergMarquardtStrategy::new(
            LevenbergMarquardtOptions::default().with_max_radius(1e5),
            Box::new(SparseCholeskySolver::new()),
        );
        strategy.step_accepted(1.0);
        strategy.step_accepted(1.0);
        assert!(strategy.radius() <= 1e5);
    }

    #[test]
    fn test_compute_step_solves_small_system() {
        // J = I, r = [1, 2]: near-undamped step is close to -r.
        let mut strategy = strategy();
        let triplets = vec![Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 1.0)];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets).unwrap();
        let mut residuals = Mat::zeros(2, 1);
        residuals[(0, 0)] = 1.0;
        residuals[(1, 0)] = 2.0;
        let mut step = Mat::zeros(2, 1);

        let summary = strategy.compute_step(&jacobian, &residuals, &mut step);
        assert_eq!(summary.termination, StepStatus::Success);
        assert!((step[(0, 0)] + 1.0).abs() < 1e-3);
        assert!((step[(1, 0)] + 2.0).abs() < 1e-3);
    }
}
