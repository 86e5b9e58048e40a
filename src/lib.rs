//! crest-solver: trust-region nonlinear least-squares minimization.
//!
//! The crate minimizes objectives of the form `0.5 * sum_i rho_i(||r_i(x)||^2)`
//! where each residual vector `r_i` depends on a small set of parameter blocks,
//! each block optionally living on a manifold and optionally box-constrained.
//!
//! The main entry point is [`optimizer::TrustRegionSolver`], which drives a
//! Levenberg-Marquardt trust-region loop over a [`core::Program`]:
//!
//! ```
//! use crest_solver::core::{CostFunction, Program};
//! use crest_solver::optimizer::{TrustRegionOptions, TrustRegionSolver};
//! use nalgebra::{DMatrix, DVector, DVectorView};
//!
//! // Single residual r(x) = x - 3.
//! struct Shifted;
//!
//! impl CostFunction for Shifted {
//!     fn num_residuals(&self) -> usize {
//!         1
//!     }
//!
//!     fn parameter_block_sizes(&self) -> Vec<usize> {
//!         vec![1]
//!     }
//!
//!     fn evaluate(
//!         &self,
//!         parameters: &[DVectorView<f64>],
//!         residuals: &mut DVector<f64>,
//!         jacobian: Option<&mut DMatrix<f64>>,
//!     ) -> bool {
//!         residuals[0] = parameters[0][0] - 3.0;
//!         if let Some(jac) = jacobian {
//!             jac[(0, 0)] = 1.0;
//!         }
//!         true
//!     }
//! }
//!
//! let mut program = Program::new();
//! let x = program.add_parameter_block(DVector::from_vec(vec![0.0]));
//! program
//!     .add_residual_block(Box::new(Shifted), None, &[x])
//!     .unwrap();
//!
//! let mut solver = TrustRegionSolver::new(TrustRegionOptions::default());
//! let summary = solver.solve(&mut program).unwrap();
//!
//! assert!(summary.termination.is_solution_usable());
//! assert!((program.parameter_block(x).state()[0] - 3.0).abs() < 1e-6);
//! ```

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod optimizer;

pub use error::{CrestError, CrestResult};
pub use logger::{init_logger, init_logger_with_level};
