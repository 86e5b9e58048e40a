//! Trust-region minimization of nonlinear least-squares problems.
//!
//! [`TrustRegionSolver`] is the user entry point; it wires a
//! [`ProgramEvaluator`](crate::core::ProgramEvaluator), a
//! [`TrustRegionStrategy`](strategy::TrustRegionStrategy), and optionally a
//! [`CoordinateDescentMinimizer`](coordinate_descent::CoordinateDescentMinimizer)
//! into the [`TrustRegionMinimizer`](trust_region::TrustRegionMinimizer) loop.

use crate::core::CoreError;
use crate::linalg::LinAlgError;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

pub mod coordinate_descent;
pub mod line_search;
pub mod step_evaluator;
pub mod strategy;
pub mod trust_region;

pub use coordinate_descent::CoordinateDescentMinimizer;
pub use line_search::ProjectedBacktrackingSearch;
pub use step_evaluator::TrustRegionStepEvaluator;
pub use strategy::{
    LevenbergMarquardtOptions, LevenbergMarquardtStrategy, StepStatus, StrategySummary,
    TrustRegionStrategy,
};
pub use trust_region::{TrustRegionMinimizer, TrustRegionOptions, TrustRegionSolver};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Problem has no varying parameters to optimize
    #[error("Problem has no parameters to optimize")]
    EmptyProblem,

    /// Problem has no residual blocks
    #[error("Problem has no residual blocks")]
    NoResidualBlocks,

    /// An inner-iteration ordering is not a valid independent-set partition
    #[error("Invalid inner iteration ordering: {0}")]
    InvalidOrdering(String),

    /// Jacobi scaling matrix creation failed
    #[error("Failed to create Jacobi scaling matrix: {0}")]
    JacobiScalingCreation(String),

    /// Errors from the problem data model
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Errors from the sparse linear algebra backend
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),
}

impl OptimizerError {
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

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Why the minimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    /// A convergence criterion was met
    Convergence,
    /// An iteration or time budget was exhausted
    NoConvergence,
    /// The minimizer cannot make progress; the solution may be arbitrarily bad
    Failure,
    /// A user callback requested successful termination
    UserSuccess,
    /// A user callback requested an abort
    UserAbort,
}

impl TerminationStatus {
    /// Whether the final parameters are meaningful. True for everything
    /// except [`Failure`](TerminationStatus::Failure) and
    /// [`UserAbort`](TerminationStatus::UserAbort).
    pub fn is_solution_usable(&self) -> bool {
        matches!(
            self,
            TerminationStatus::Convergence
                | TerminationStatus::NoConvergence
                | TerminationStatus::UserSuccess
        )
    }
}

impl Display for TerminationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationStatus::Convergence => write!(f, "Convergence"),
            TerminationStatus::NoConvergence => write!(f, "No convergence"),
            TerminationStatus::Failure => write!(f, "Failure"),
            TerminationStatus::UserSuccess => write!(f, "User success"),
            TerminationStatus::UserAbort => write!(f, "User abort"),
        }
    }
}

/// Response of an [`IterationCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResponse {
    /// Keep iterating
    Continue,
    /// Stop with [`TerminationStatus::UserSuccess`]
    TerminateSuccessfully,
    /// Stop with [`TerminationStatus::UserAbort`]
    Abort,
}

/// Per-iteration snapshot delivered to callbacks and logged at debug level.
#[derive(Debug, Clone)]
pub struct IterationSummary {
    /// Iteration number (0 is the initial evaluation)
    pub iteration: usize,
    /// Whether the step decreased the objective; always true for iteration 0
    pub step_is_successful: bool,
    /// Whether the step passed validity checks
    pub step_is_valid: bool,
    /// Objective value after this iteration
    pub cost: f64,
    /// Decrease from the previous accepted cost (0 for iteration 0)
    pub cost_change: f64,
    /// Infinity norm of the projected gradient
    pub gradient_max_norm: f64,
    /// Ambient-space norm of the applied step
    pub step_norm: f64,
    /// Ratio of actual to model cost decrease
    pub relative_decrease: f64,
    /// Trust region radius after strategy feedback
    pub trust_region_radius: f64,
    /// Wall time since the start of the solve
    pub cumulative_time: Duration,
}

/// Observes the minimizer at iteration boundaries.
///
/// Callbacks are invoked after iteration 0 and after every subsequent
/// iteration, successful or not. The minimizer never terminates mid-iteration
/// on a callback's behalf.
pub trait IterationCallback: Send {
    fn call(&mut self, summary: &IterationSummary) -> CallbackResponse;
}

impl<F> IterationCallback for F
where
    F: FnMut(&IterationSummary) -> CallbackResponse + Send,
{
    fn call(&mut self, summary: &IterationSummary) -> CallbackResponse {
        self(summary)
    }
}

/// Final report of a solve.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub termination: TerminationStatus,
    /// Human-readable reason, including the triggering quantity
    pub message: String,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Total iterations, including invalid and rejected steps
    pub num_iterations: usize,
    pub num_successful_steps: usize,
    pub num_unsuccessful_steps: usize,
    pub total_time: Duration,
}

impl SolverSummary {
    pub(crate) fn new() -> Self {
        SolverSummary {
            termination: TerminationStatus::Failure,
            message: "Minimizer did not run".to_string(),
            initial_cost: f64::INFINITY,
            final_cost: f64::INFINITY,
            num_iterations: 0,
            num_successful_steps: 0,
            num_unsuccessful_steps: 0,
            total_time: Duration::ZERO,
        }
    }
}

impl Display for SolverSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Termination:       {} ({})", self.termination, self.message)?;
        writeln!(f, "Initial cost:      {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:        {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Iterations:        {} ({} successful, {} unsuccessful)",
            self.num_iterations, self.num_successful_steps, self.num_unsuccessful_steps
        )?;
        write!(f, "Total time:        {:.3}ms", self.total_time.as_secs_f64() * 1e3)
    }
}

/// Per-iteration statistics table logged at debug level, one line per
/// iteration in a Ceres-style layout.
#[derive(Debug, Clone)]
pub(crate) struct IterationStats {
    pub iteration: usize,
    pub cost: f64,
    pub cost_change: f64,
    pub gradient_norm: f64,
    pub step_norm: f64,
    pub tr_ratio: f64,
    pub tr_radius: f64,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
    pub accepted: bool,
}

impl IterationStats {
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "iter_time",
            "total_time",
            "status"
        );
    }

    pub fn print_line(&self) {
        let status = if self.iteration == 0 {
            "-"
        } else if self.accepted {
            "ok"
        } else {
            "rej"
        };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.tr_ratio,
            self.tr_radius,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}
