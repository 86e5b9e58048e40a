//! Trust-region minimizer: the outer optimization loop.

use crate::core::{Evaluator, Program, ProgramEvaluator};
use crate::linalg::SparseCholeskySolver;
use crate::optimizer::coordinate_descent::CoordinateDescentMinimizer;
use crate::optimizer::line_search::ProjectedBacktrackingSearch;
use crate::optimizer::step_evaluator::TrustRegionStepEvaluator;
use crate::optimizer::strategy::{
    LevenbergMarquardtOptions, LevenbergMarquardtStrategy, StepStatus, TrustRegionStrategy,
};
use crate::optimizer::{
    CallbackResponse, IterationCallback, IterationStats, IterationSummary, OptimizerError,
    OptimizerResult, SolverSummary, TerminationStatus,
};
use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use nalgebra::DVector;
use std::ops::Mul;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for the trust-region loop.
///
/// All options can be set with the builder pattern:
///
/// ```
/// use crest_solver::optimizer::TrustRegionOptions;
///
/// let options = TrustRegionOptions::new()
///     .with_max_iterations(100)
///     .with_function_tolerance(1e-9)
///     .with_use_nonmonotonic_steps(true);
/// ```
#[derive(Debug, Clone)]
pub struct TrustRegionOptions {
    /// Maximum number of iterations (default: 50)
    pub max_iterations: usize,
    /// Wall-clock budget for the whole solve (default: none)
    pub max_solver_time: Option<Duration>,
    /// Terminate when `|cost_change| <= function_tolerance * cost`
    /// (default: 1e-6)
    pub function_tolerance: f64,
    /// Terminate when the max-norm of the projected gradient drops below
    /// this value (default: 1e-10)
    pub gradient_tolerance: f64,
    /// Terminate when `step_norm <= parameter_tolerance * (x_norm +
    /// parameter_tolerance)` (default: 1e-8)
    pub parameter_tolerance: f64,
    /// Minimum ratio of actual to model cost decrease for a step to be
    /// accepted (default: 1e-3)
    pub min_relative_decrease: f64,
    /// Terminate when the trust region radius shrinks below this value
    /// (default: 1e-32)
    pub min_trust_region_radius: f64,
    /// Give up after this many invalid steps in a row (default: 5)
    pub max_consecutive_invalid_steps: usize,
    /// Allow steps that temporarily increase the objective (default: false)
    pub use_nonmonotonic_steps: bool,
    /// Window for non-monotonic acceptance (default: 5)
    pub max_consecutive_nonmonotonic_steps: usize,
    /// Scale Jacobian columns by `1 / (1 + column_norm)` (default: true)
    pub jacobi_scaling: bool,
    /// Treat the problem as bounds-constrained even if no block carries
    /// bounds (default: false; bounds on any block enable this
    /// automatically)
    pub is_constrained: bool,
    /// Refine accepted candidates with coordinate descent (default: false)
    pub use_inner_iterations: bool,
    /// Disable inner iterations once their relative improvement drops below
    /// this value (default: 1e-3)
    pub inner_iteration_tolerance: f64,
    /// Trust region strategy configuration
    pub strategy: LevenbergMarquardtOptions,
}

impl Default for TrustRegionOptions {
    fn default() -> Self {
        TrustRegionOptions {
            max_iterations: 50,
            max_solver_time: None,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            min_relative_decrease: 1e-3,
            min_trust_region_radius: 1e-32,
            max_consecutive_invalid_steps: 5,
            use_nonmonotonic_steps: false,
            max_consecutive_nonmonotonic_steps: 5,
            jacobi_scaling: true,
            is_constrained: false,
            use_inner_iterations: false,
            inner_iteration_tolerance: 1e-3,
            strategy: LevenbergMarquardtOptions::default(),
        }
    }
}

impl TrustRegionOptions {
    pub fn new() -> Self {
        TrustRegionOptions::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_solver_time(mut self, max_solver_time: Duration) -> Self {
        self.max_solver_time = Some(max_solver_time);
        self
    }

    pub fn with_function_tolerance(mut self, function_tolerance: f64) -> Self {
        self.function_tolerance = function_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_min_relative_decrease(mut self, min_relative_decrease: f64) -> Self {
        self.min_relative_decrease = min_relative_decrease;
        self
    }

    pub fn with_min_trust_region_radius(mut self, min_trust_region_radius: f64) -> Self {
        self.min_trust_region_radius = min_trust_region_radius;
        self
    }

    pub fn with_max_consecutive_invalid_steps(mut self, steps: usize) -> Self {
        self.max_consecutive_invalid_steps = steps;
        self
    }

    pub fn with_use_nonmonotonic_steps(mut self, use_nonmonotonic_steps: bool) -> Self {
        self.use_nonmonotonic_steps = use_nonmonotonic_steps;
        self
    }

    pub fn with_max_consecutive_nonmonotonic_steps(mut self, steps: usize) -> Self {
        self.max_consecutive_nonmonotonic_steps = steps;
        self
    }

    pub fn with_jacobi_scaling(mut self, jacobi_scaling: bool) -> Self {
        self.jacobi_scaling = jacobi_scaling;
        self
    }

    pub fn with_is_constrained(mut self, is_constrained: bool) -> Self {
        self.is_constrained = is_constrained;
        self
    }

    pub fn with_use_inner_iterations(mut self, use_inner_iterations: bool) -> Self {
        self.use_inner_iterations = use_inner_iterations;
        self
    }

    pub fn with_inner_iteration_tolerance(mut self, tolerance: f64) -> Self {
        self.inner_iteration_tolerance = tolerance;
        self
    }

    pub fn with_strategy(mut self, strategy: LevenbergMarquardtOptions) -> Self {
        self.strategy = strategy;
        self
    }
}

// Inner iterations shut off permanently once they stop paying for
// themselves; there is no re-enable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerIterationsPhase {
    Enabled,
    Disabled,
}

/// The trust-region loop over an [`Evaluator`] and a
/// [`TrustRegionStrategy`].
///
/// Fatal conditions never panic and never surface as `Err`: `minimize`
/// always returns a [`SolverSummary`], with
/// [`TerminationStatus::Failure`] and an explanatory message when the loop
/// cannot continue. On return, `parameters` holds the best point found,
/// whatever the termination status.
pub struct TrustRegionMinimizer<'a, E: Evaluator> {
    evaluator: &'a E,
    strategy: &'a mut dyn TrustRegionStrategy,
    inner_iteration_minimizer: Option<&'a CoordinateDescentMinimizer<'a>>,
}

impl<'a, E: Evaluator> TrustRegionMinimizer<'a, E> {
    pub fn new(evaluator: &'a E, strategy: &'a mut dyn TrustRegionStrategy) -> Self {
        TrustRegionMinimizer {
            evaluator,
            strategy,
            inner_iteration_minimizer: None,
        }
    }

    /// Refine accepted candidate points with the given coordinate descent
    /// minimizer.
    pub fn with_inner_iterations(
        mut self,
        inner_iteration_minimizer: &'a CoordinateDescentMinimizer<'a>,
    ) -> Self {
        self.inner_iteration_minimizer = Some(inner_iteration_minimizer);
        self
    }

    /// Run the minimization from the state in `parameters`.
    pub fn minimize(
        &mut self,
        options: &TrustRegionOptions,
        callbacks: &mut [Box<dyn IterationCallback>],
        parameters: &mut DVector<f64>,
    ) -> SolverSummary {
        let start = Instant::now();
        let mut summary = SolverSummary::new();

        let num_effective_parameters = self.evaluator.num_effective_parameters();
        let num_residuals = self.evaluator.num_residuals();

        let mut x = parameters.clone();

        // Iteration zero: project onto the feasible set, then linearize.
        if options.is_constrained {
            let zero_delta = Mat::zeros(num_effective_parameters, 1);
            let mut projected = x.clone();
            if !self.evaluator.plus(&x, &zero_delta, &mut projected) {
                return self.finish(
                    summary,
                    TerminationStatus::Failure,
                    "Unable to project the initial point onto the feasible set.".to_string(),
                    parameters,
                    &x,
                    start,
                );
            }
            x = projected;
        }

        let mut residuals = Mat::zeros(num_residuals, 1);
        let mut gradient = Mat::zeros(num_effective_parameters, 1);
        let mut jacobian = match self.evaluator.create_jacobian() {
            Ok(jacobian) => jacobian,
            Err(e) => {
                return self.finish(
                    summary,
                    TerminationStatus::Failure,
                    format!("Unable to create the Jacobian sparsity pattern: {e}"),
                    parameters,
                    &x,
                    start,
                );
            }
        };

        let mut cost = 0.0;
        if !self.evaluator.evaluate(
            &x,
            &mut cost,
            Some(&mut residuals),
            Some(&mut gradient),
            Some(&mut jacobian),
        ) {
            return self.finish(
                summary,
                TerminationStatus::Failure,
                "Residual and Jacobian evaluation failed at the initial point.".to_string(),
                parameters,
                &x,
                start,
            );
        }
        summary.initial_cost = cost;

        // Column scales are computed once at the initial point and reused
        // for every subsequent linearization.
        let jacobi_scaling = if options.jacobi_scaling {
            match create_jacobi_scaling(&jacobian) {
                Ok(scaling) => Some(scaling),
                Err(e) => {
                    return self.finish(
                        summary,
                        TerminationStatus::Failure,
                        format!("Unable to create the Jacobi scaling matrix: {e}"),
                        parameters,
                        &x,
                        start,
                    );
                }
            }
        } else {
            None
        };
        if let Some(scaling) = &jacobi_scaling {
            let scaled = &jacobian * scaling;
            jacobian = scaled;
        }

        let mut step_evaluator = TrustRegionStepEvaluator::new(
            cost,
            if options.use_nonmonotonic_steps {
                options.max_consecutive_nonmonotonic_steps
            } else {
                0
            },
        );
        let line_search = ProjectedBacktrackingSearch::default();

        let mut minimum_cost = cost;
        let mut x_min = x.clone();
        summary.final_cost = cost;

        let mut inner_phase = if self.inner_iteration_minimizer.is_some() {
            InnerIterationsPhase::Enabled
        } else {
            InnerIterationsPhase::Disabled
        };

        IterationStats::print_header();
        let gradient_max_norm = self.projected_gradient_max_norm(&x, &gradient);
        let mut iteration_summary = IterationSummary {
            iteration: 0,
            step_is_successful: true,
            step_is_valid: true,
            cost,
            cost_change: 0.0,
            gradient_max_norm,
            step_norm: 0.0,
            relative_decrease: 0.0,
            trust_region_radius: self.strategy.radius(),
            cumulative_time: start.elapsed(),
        };
        self.log_iteration(&iteration_summary, 0.0, start);

        if let Some((status, message)) = invoke_callbacks(callbacks, &iteration_summary) {
            return self.finish(summary, status, message, parameters, &x_min, start);
        }
        if gradient_max_norm <= options.gradient_tolerance {
            return self.finish(
                summary,
                TerminationStatus::Convergence,
                format!(
                    "Projected gradient max-norm {gradient_max_norm:.6e} <= {:.6e}",
                    options.gradient_tolerance
                ),
                parameters,
                &x_min,
                start,
            );
        }

        let mut num_consecutive_invalid_steps = 0;
        let mut iteration = 0;

        loop {
            if let Some(budget) = options.max_solver_time {
                if start.elapsed() >= budget {
                    return self.finish(
                        summary,
                        TerminationStatus::NoConvergence,
                        format!("Maximum solver time of {:.3}s reached.", budget.as_secs_f64()),
                        parameters,
                        &x_min,
                        start,
                    );
                }
            }
            if iteration >= options.max_iterations {
                return self.finish(
                    summary,
                    TerminationStatus::NoConvergence,
                    format!("Maximum number of iterations ({}) reached.", options.max_iterations),
                    parameters,
                    &x_min,
                    start,
                );
            }
            iteration += 1;
            summary.num_iterations = iteration;
            let iteration_start = Instant::now();

            // Step computation in the scaled tangent space.
            let mut scaled_step = Mat::zeros(num_effective_parameters, 1);
            let strategy_summary =
                self.strategy
                    .compute_step(&jacobian, &residuals, &mut scaled_step);

            if strategy_summary.termination == StepStatus::Failure {
                return self.finish(
                    summary,
                    TerminationStatus::Failure,
                    "Trust region strategy failed fatally while computing a step.".to_string(),
                    parameters,
                    &x_min,
                    start,
                );
            }

            // Model decrease predicted by the linearization. The scaled
            // Jacobian applied to the scaled step equals the unscaled
            // product, so no unscaling is needed here.
            let mut model_cost_change = f64::NEG_INFINITY;
            let mut step_is_valid = strategy_summary.termination == StepStatus::Success;
            if step_is_valid {
                model_cost_change =
                    compute_model_cost_change(&jacobian, &residuals, &scaled_step);
                // Strict positivity: steps whose model decrease is zero or
                // negative (including round-off negatives) are invalid.
                step_is_valid = model_cost_change > 0.0;
            }

            if !step_is_valid {
                num_consecutive_invalid_steps += 1;
                if num_consecutive_invalid_steps >= options.max_consecutive_invalid_steps {
                    return self.finish(
                        summary,
                        TerminationStatus::Failure,
                        format!(
                            "Number of consecutive invalid steps reached {}.",
                            num_consecutive_invalid_steps
                        ),
                        parameters,
                        &x_min,
                        start,
                    );
                }
                self.strategy.step_is_invalid();
                debug!(
                    "invalid step at iteration {} (model cost change {:.6e})",
                    iteration, model_cost_change
                );

                summary.num_unsuccessful_steps += 1;
                iteration_summary = IterationSummary {
                    iteration,
                    step_is_successful: false,
                    step_is_valid: false,
                    cost,
                    cost_change: 0.0,
                    gradient_max_norm: iteration_summary.gradient_max_norm,
                    step_norm: 0.0,
                    relative_decrease: 0.0,
                    trust_region_radius: self.strategy.radius(),
                    cumulative_time: start.elapsed(),
                };
                self.log_iteration(
                    &iteration_summary,
                    iteration_start.elapsed().as_secs_f64() * 1e3,
                    start,
                );
                if let Some((status, message)) = invoke_callbacks(callbacks, &iteration_summary) {
                    return self.finish(summary, status, message, parameters, &x_min, start);
                }
                continue;
            }
            num_consecutive_invalid_steps = 0;

            // Unscale before using the step as a tangent delta.
            let mut step = match &jacobi_scaling {
                Some(scaling) => scaling.as_ref().mul(&scaled_step),
                None => scaled_step.clone(),
            };

            // For constrained problems the retraction clamps trial points
            // into the box, which can destroy the descent property of the
            // full step; backtrack when that helps. A failed search keeps
            // the unscaled step.
            if options.is_constrained {
                if let Some(better) = line_search.search(self.evaluator, &x, &step, &gradient, cost)
                {
                    step = better;
                }
            }

            // Candidate evaluation. Failures are not fatal: an infinite
            // candidate cost sends the step through the normal rejection
            // path.
            let mut x_candidate = x.clone();
            let mut candidate_cost = f64::INFINITY;
            if self.evaluator.plus(&x, &step, &mut x_candidate) {
                let mut evaluated = 0.0;
                if self
                    .evaluator
                    .evaluate(&x_candidate, &mut evaluated, None, None, None)
                {
                    if evaluated.is_finite() {
                        candidate_cost = evaluated;
                    }
                } else {
                    warn!("candidate point evaluation failed, rejecting step");
                }
            } else {
                warn!("retraction failed for trust region step, rejecting step");
            }

            // Inner iterations refine the candidate and fold their
            // improvement into the model decrease.
            let mut inner_iterations_were_useful = false;
            if inner_phase == InnerIterationsPhase::Enabled && candidate_cost.is_finite() {
                if let Some(inner_minimizer) = self.inner_iteration_minimizer {
                    let cost_before_inner = candidate_cost;
                    let mut refined = x_candidate.clone();
                    inner_minimizer.minimize(&mut refined);

                    let mut refined_cost = 0.0;
                    if self
                        .evaluator
                        .evaluate(&refined, &mut refined_cost, None, None, None)
                        && refined_cost < candidate_cost
                    {
                        inner_iterations_were_useful = refined_cost < cost;
                        model_cost_change += candidate_cost - refined_cost;
                        x_candidate = refined;
                        candidate_cost = refined_cost;
                    }

                    let relative_progress = (cost_before_inner - candidate_cost)
                        / cost_before_inner.max(f64::MIN_POSITIVE);
                    if relative_progress < options.inner_iteration_tolerance {
                        inner_phase = InnerIterationsPhase::Disabled;
                        debug!(
                            "disabling inner iterations: relative progress {:.3e} below {:.3e}",
                            relative_progress, options.inner_iteration_tolerance
                        );
                    }
                }
            }

            let relative_decrease = step_evaluator.step_quality(candidate_cost, model_cost_change);
            let step_is_successful = inner_iterations_were_useful
                || relative_decrease > options.min_relative_decrease;

            let previous_cost = cost;
            let step_norm = (&x_candidate - &x).norm();
            let cost_change = previous_cost - candidate_cost;
            let x_norm = x.norm();

            if step_is_successful {
                summary.num_successful_steps += 1;
                self.strategy.step_accepted(relative_decrease);
                step_evaluator.step_accepted(candidate_cost, model_cost_change);

                x = x_candidate;
                cost = candidate_cost;
                if cost < minimum_cost {
                    minimum_cost = cost;
                    summary.final_cost = minimum_cost;
                    x_min = x.clone();
                }

                let mut reevaluated_cost = 0.0;
                if !self.evaluator.evaluate(
                    &x,
                    &mut reevaluated_cost,
                    Some(&mut residuals),
                    Some(&mut gradient),
                    Some(&mut jacobian),
                ) {
                    return self.finish(
                        summary,
                        TerminationStatus::Failure,
                        "Residual and Jacobian evaluation failed after an accepted step."
                            .to_string(),
                        parameters,
                        &x_min,
                        start,
                    );
                }
                if let Some(scaling) = &jacobi_scaling {
                    let scaled = &jacobian * scaling;
                    jacobian = scaled;
                }
            } else {
                summary.num_unsuccessful_steps += 1;
                self.strategy.step_rejected(relative_decrease);
            }

            let gradient_max_norm = self.projected_gradient_max_norm(&x, &gradient);
            iteration_summary = IterationSummary {
                iteration,
                step_is_successful,
                step_is_valid: true,
                cost,
                cost_change,
                gradient_max_norm,
                step_norm,
                relative_decrease,
                trust_region_radius: self.strategy.radius(),
                cumulative_time: start.elapsed(),
            };
            self.log_iteration(
                &iteration_summary,
                iteration_start.elapsed().as_secs_f64() * 1e3,
                start,
            );
            if let Some((status, message)) = invoke_callbacks(callbacks, &iteration_summary) {
                return self.finish(summary, status, message, parameters, &x_min, start);
            }

            // Convergence checks. Parameter and function tolerances apply to
            // every finite candidate; the gradient check only after an
            // accepted step, the radius check only after a rejection.
            if candidate_cost.is_finite() {
                if step_norm <= options.parameter_tolerance * (x_norm + options.parameter_tolerance)
                {
                    return self.finish(
                        summary,
                        TerminationStatus::Convergence,
                        format!(
                            "Step norm {step_norm:.6e} <= {:.6e} * (x norm + {:.6e})",
                            options.parameter_tolerance, options.parameter_tolerance
                        ),
                        parameters,
                        &x_min,
                        start,
                    );
                }
                if cost_change.abs() <= options.function_tolerance * previous_cost {
                    return self.finish(
                        summary,
                        TerminationStatus::Convergence,
                        format!(
                            "Cost change {:.6e} <= {:.6e} * cost",
                            cost_change.abs(),
                            options.function_tolerance
                        ),
                        parameters,
                        &x_min,
                        start,
                    );
                }
            }
            if step_is_successful {
                if gradient_max_norm <= options.gradient_tolerance {
                    return self.finish(
                        summary,
                        TerminationStatus::Convergence,
                        format!(
                            "Projected gradient max-norm {gradient_max_norm:.6e} <= {:.6e}",
                            options.gradient_tolerance
                        ),
                        parameters,
                        &x_min,
                        start,
                    );
                }
            } else if self.strategy.radius() < options.min_trust_region_radius {
                return self.finish(
                    summary,
                    TerminationStatus::Convergence,
                    format!(
                        "Trust region radius {:.6e} fell below {:.6e}",
                        self.strategy.radius(),
                        options.min_trust_region_radius
                    ),
                    parameters,
                    &x_min,
                    start,
                );
            }
        }
    }

    fn finish(
        &self,
        mut summary: SolverSummary,
        termination: TerminationStatus,
        message: String,
        parameters: &mut DVector<f64>,
        x_min: &DVector<f64>,
        start: Instant,
    ) -> SolverSummary {
        summary.termination = termination;
        summary.message = message;
        summary.total_time = start.elapsed();
        *parameters = x_min.clone();
        summary
    }

    /// Max-norm of `x - Plus(x, -gradient)`, the first-order measure of how
    /// far `x` is from a stationary point of the constrained problem.
    fn projected_gradient_max_norm(&self, x: &DVector<f64>, gradient: &Mat<f64>) -> f64 {
        let mut negative_gradient = Mat::zeros(gradient.nrows(), 1);
        for i in 0..gradient.nrows() {
            negative_gradient[(i, 0)] = -gradient[(i, 0)];
        }
        let mut x_plus = x.clone();
        if !self.evaluator.plus(x, &negative_gradient, &mut x_plus) {
            return f64::INFINITY;
        }
        let mut max_norm: f64 = 0.0;
        for i in 0..x.len() {
            max_norm = max_norm.max((x[i] - x_plus[i]).abs());
        }
        max_norm
    }

    fn log_iteration(&self, summary: &IterationSummary, iter_time_ms: f64, start: Instant) {
        IterationStats {
            iteration: summary.iteration,
            cost: summary.cost,
            cost_change: summary.cost_change,
            gradient_norm: summary.gradient_max_norm,
            step_norm: summary.step_norm,
            tr_ratio: summary.relative_decrease,
            tr_radius: summary.trust_region_radius,
            iter_time_ms,
            total_time_ms: start.elapsed().as_secs_f64() * 1e3,
            accepted: summary.step_is_successful,
        }
        .print_line();
    }
}

fn invoke_callbacks(
    callbacks: &mut [Box<dyn IterationCallback>],
    summary: &IterationSummary,
) -> Option<(TerminationStatus, String)> {
    for callback in callbacks.iter_mut() {
        match callback.call(summary) {
            CallbackResponse::Continue => {}
            CallbackResponse::TerminateSuccessfully => {
                return Some((
                    TerminationStatus::UserSuccess,
                    "Terminated by user callback.".to_string(),
                ));
            }
            CallbackResponse::Abort => {
                return Some((
                    TerminationStatus::UserAbort,
                    "Aborted by user callback.".to_string(),
                ));
            }
        }
    }
    None
}

/// Decrease of the quadratic model along `step`: `-(J s)^T (r + J s / 2)`.
///
/// Positive for any step that improves the model; the minimizer treats a
/// zero or negative value as an invalid step.
fn compute_model_cost_change(
    jacobian: &SparseColMat<usize, f64>,
    residuals: &Mat<f64>,
    step: &Mat<f64>,
) -> f64 {
    let model_residuals = jacobian.as_ref().mul(step);
    let mut decrease = 0.0;
    for i in 0..model_residuals.nrows() {
        let jstep = model_residuals[(i, 0)];
        decrease -= jstep * (residuals[(i, 0)] + jstep / 2.0);
    }
    decrease
}

/// Column scaling `1 / (1 + ||column||)` as a sparse diagonal matrix.
fn create_jacobi_scaling(
    jacobian: &SparseColMat<usize, f64>,
) -> OptimizerResult<SparseColMat<usize, f64>> {
    let cols = jacobian.ncols();
    let mut column_squared_norms = vec![0.0; cols];
    for triplet in jacobian.triplet_iter() {
        column_squared_norms[triplet.col] += triplet.val * triplet.val;
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = column_squared_norms
        .iter()
        .enumerate()
        .map(|(c, &squared_norm)| Triplet::new(c, c, 1.0 / (1.0 + squared_norm.sqrt())))
        .collect();

    SparseColMat::try_new_from_triplets(cols, cols, &triplets)
        .map_err(|e| OptimizerError::JacobiScalingCreation(e.to_string()).log_with_source(e))
}

/// Top-level solver: wires a program, evaluator, strategy, and optional
/// inner-iteration minimizer together.
pub struct TrustRegionSolver {
    options: TrustRegionOptions,
    callbacks: Vec<Box<dyn IterationCallback>>,
}

impl TrustRegionSolver {
    pub fn new(options: TrustRegionOptions) -> Self {
        TrustRegionSolver {
            options,
            callbacks: Vec::new(),
        }
    }

    /// Register a callback invoked at every iteration boundary.
    pub fn add_callback(&mut self, callback: Box<dyn IterationCallback>) {
        self.callbacks.push(callback);
    }

    /// Minimize the program in place. Block states hold the best point found
    /// on return; inspect the summary's termination status before trusting
    /// them.
    pub fn solve(&mut self, program: &mut Program) -> OptimizerResult<SolverSummary> {
        if program.residual_blocks().is_empty() {
            return Err(OptimizerError::NoResidualBlocks.log());
        }
        program.setup_offsets();
        if program.num_effective_parameters() == 0 {
            return Err(OptimizerError::EmptyProblem.log());
        }

        let mut options = self.options.clone();
        options.is_constrained = options.is_constrained || program.has_bounds();
        info!(
            "solving program with {} parameters ({} effective), {} residuals",
            program.num_parameters(),
            program.num_effective_parameters(),
            program.num_residuals()
        );

        let mut x = program.state_vector();
        let summary = {
            let evaluator = ProgramEvaluator::new(program);
            let mut strategy = LevenbergMarquardtStrategy::new(
                options.strategy.clone(),
                Box::new(SparseCholeskySolver::new()),
            );
            let inner_minimizer;
            let mut minimizer = TrustRegionMinimizer::new(&evaluator, &mut strategy);
            if options.use_inner_iterations {
                let ordering = CoordinateDescentMinimizer::independent_set_ordering(program);
                inner_minimizer = CoordinateDescentMinimizer::new(program, ordering)?;
                minimizer = minimizer.with_inner_iterations(&inner_minimizer);
            }
            minimizer.minimize(&options, &mut self.callbacks, &mut x)
        };
        program.set_state_vector(&x)?;

        info!("{}", summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CostFunction;
    use crate::optimizer::strategy::StrategySummary;
    use nalgebra::{DMatrix, DVectorView};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // r = x - 3.
    struct Shifted;

    impl CostFunction for Shifted {
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
            residuals[0] = parameters[0][0] - 3.0;
            if let Some(jac) = jacobian {
                jac[(0, 0)] = 1.0;
            }
            true
        }
    }

    fn shifted_program(initial: f64) -> Program {
        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![initial]));
        program.add_residual_block(Box::new(Shifted), None, &[x]).unwrap();
        program
    }

    #[test]
    fn test_converges_on_linear_problem() {
        let mut program = shifted_program(0.0);
        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        let summary = solver.solve(&mut program).unwrap();

        assert_eq!(summary.termination, TerminationStatus::Convergence);
        assert!((program.parameter_block(0).state()[0] - 3.0).abs() < 1e-6);
        assert!(summary.final_cost < summary.initial_cost);
    }

    #[test]
    fn test_converges_immediately_near_optimum() {
        // Starting within 1e-7 of the optimum, one tiny step suffices.
        let mut program = shifted_program(3.0000001);
        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        let summary = solver.solve(&mut program).unwrap();

        assert_eq!(summary.termination, TerminationStatus::Convergence);
        assert!(summary.num_iterations <= 2);
    }

    #[test]
    fn test_model_cost_change_matches_quadratic_model() {
        // -(J s)^T (r + J s / 2) equals 0.5||r||^2 - 0.5||r + J s||^2 for
        // every sign combination of Jacobian, residual, and step.
        for &j in &[1.0, -2.0] {
            for &r in &[3.0, -3.0, 0.5] {
                for &s in &[1.5, -1.5] {
                    let triplets = vec![Triplet::new(0, 0, j), Triplet::new(1, 1, 2.0 * j)];
                    let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets).unwrap();
                    let mut residuals = Mat::zeros(2, 1);
                    residuals[(0, 0)] = r;
                    residuals[(1, 0)] = -r;
                    let mut step = Mat::zeros(2, 1);
                    step[(0, 0)] = s;
                    step[(1, 0)] = s / 2.0;

                    let change = compute_model_cost_change(&jacobian, &residuals, &step);
                    let r0 = r + j * s;
                    let r1 = -r + j * s;
                    let before = 0.5 * (2.0 * r * r);
                    let after = 0.5 * (r0 * r0 + r1 * r1);
                    assert!((change - (before - after)).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_model_cost_change_sign_follows_step_direction() {
        // J = 1, r = -3: the Gauss-Newton step s = 3 gains 4.5, its
        // reverse loses the same amount plus the curvature term.
        let triplets = vec![Triplet::new(0, 0, 1.0)];
        let jacobian = SparseColMat::try_new_from_triplets(1, 1, &triplets).unwrap();
        let mut residuals = Mat::zeros(1, 1);
        residuals[(0, 0)] = -3.0;

        let mut step = Mat::zeros(1, 1);
        step[(0, 0)] = 3.0;
        assert!((compute_model_cost_change(&jacobian, &residuals, &step) - 4.5).abs() < 1e-12);

        step[(0, 0)] = -3.0;
        assert!(compute_model_cost_change(&jacobian, &residuals, &step) < 0.0);

        step[(0, 0)] = 0.0;
        assert_eq!(compute_model_cost_change(&jacobian, &residuals, &step), 0.0);
    }

    #[test]
    fn test_jacobi_scaling_formula() {
        // Column norms 2 and 0 give scales 1/3 and 1.
        let triplets = vec![Triplet::new(0, 0, 2.0), Triplet::new(0, 1, 0.0)];
        let jacobian = SparseColMat::try_new_from_triplets(1, 2, &triplets).unwrap();
        let scaling = create_jacobi_scaling(&jacobian).unwrap().to_dense();
        assert!((scaling[(0, 0)] - 1.0 / 3.0).abs() < 1e-12);
        assert!((scaling[(1, 1)] - 1.0).abs() < 1e-12);
    }

    // Strategy stub that never produces a valid step.
    struct AlwaysInvalid {
        compute_calls: Arc<AtomicUsize>,
        invalid_notifications: Arc<AtomicUsize>,
    }

    impl TrustRegionStrategy for AlwaysInvalid {
        fn compute_step(
            &mut self,
            _jacobian: &SparseColMat<usize, f64>,
            _residuals: &Mat<f64>,
            _step: &mut Mat<f64>,
        ) -> StrategySummary {
            self.compute_calls.fetch_add(1, Ordering::SeqCst);
            StrategySummary {
                termination: StepStatus::NoConvergence,
                num_iterations: 0,
            }
        }

        fn step_accepted(&mut self, _step_quality: f64) {}

        fn step_rejected(&mut self, _step_quality: f64) {}

        fn step_is_invalid(&mut self) {
            self.invalid_notifications.fetch_add(1, Ordering::SeqCst);
        }

        fn radius(&self) -> f64 {
            1.0
        }
    }

    #[test]
    fn test_invalid_step_exhaustion_fails() {
        let mut program = shifted_program(0.0);
        program.setup_offsets();
        let evaluator = ProgramEvaluator::new(&program);

        let compute_calls = Arc::new(AtomicUsize::new(0));
        let invalid_notifications = Arc::new(AtomicUsize::new(0));
        let mut strategy = AlwaysInvalid {
            compute_calls: compute_calls.clone(),
            invalid_notifications: invalid_notifications.clone(),
        };

        let options = TrustRegionOptions::default().with_max_consecutive_invalid_steps(5);
        let mut minimizer = TrustRegionMinimizer::new(&evaluator, &mut strategy);
        let mut x = program.state_vector();
        let summary = minimizer.minimize(&options, &mut [], &mut x);

        assert_eq!(summary.termination, TerminationStatus::Failure);
        assert!(summary.message.contains("5"));
        assert_eq!(compute_calls.load(Ordering::SeqCst), 5);
        assert_eq!(invalid_notifications.load(Ordering::SeqCst), 4);
        // The iterate is untouched.
        assert_eq!(x[0], 0.0);
    }

    #[test]
    fn test_callback_abort() {
        let mut program = shifted_program(0.0);
        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        solver.add_callback(Box::new(|summary: &IterationSummary| {
            if summary.iteration == 0 {
                CallbackResponse::Abort
            } else {
                CallbackResponse::Continue
            }
        }));
        let summary = solver.solve(&mut program).unwrap();
        assert_eq!(summary.termination, TerminationStatus::UserAbort);
        assert!(!summary.termination.is_solution_usable());
    }

    #[test]
    fn test_callback_terminate_successfully() {
        let mut program = shifted_program(0.0);
        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        solver.add_callback(Box::new(|summary: &IterationSummary| {
            if summary.iteration >= 1 {
                CallbackResponse::TerminateSuccessfully
            } else {
                CallbackResponse::Continue
            }
        }));
        let summary = solver.solve(&mut program).unwrap();
        assert_eq!(summary.termination, TerminationStatus::UserSuccess);
        assert!(summary.termination.is_solution_usable());
    }

    #[test]
    fn test_max_iterations_reports_no_convergence() {
        // A zero iteration budget exits immediately after iteration zero.
        let mut program = shifted_program(0.0);
        let mut solver =
            TrustRegionSolver::new(TrustRegionOptions::default().with_max_iterations(0));
        let summary = solver.solve(&mut program).unwrap();
        assert_eq!(summary.termination, TerminationStatus::NoConvergence);
        assert!(summary.termination.is_solution_usable());
    }

    #[test]
    fn test_empty_problem_rejected() {
        let mut program = Program::new();
        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        assert!(solver.solve(&mut program).is_err());
    }

    #[test]
    fn test_bounds_limit_solution() {
        // Minimize (x - 5)^2 subject to x <= 1.
        struct FarShifted;

        impl CostFunction for FarShifted {
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
                residuals[0] = parameters[0][0] - 5.0;
                if let Some(jac) = jacobian {
                    jac[(0, 0)] = 1.0;
                }
                true
            }
        }

        let mut program = Program::new();
        let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
        program
            .parameter_block_mut(x)
            .set_bounds(
                DVector::from_vec(vec![-1.0]),
                DVector::from_vec(vec![1.0]),
            )
            .unwrap();
        program
            .add_residual_block(Box::new(FarShifted), None, &[x])
            .unwrap();

        let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
        let summary = solver.solve(&mut program).unwrap();

        assert!(summary.termination.is_solution_usable());
        assert!((program.parameter_block(x).state()[0] - 1.0).abs() < 1e-6);
    }
}
