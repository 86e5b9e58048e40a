//! Corrector algorithm for applying robust loss functions.
//!
//! Given a residual `r` with squared norm `s = ||r||^2` and a loss rho(s), the
//! corrector rescales the residual and Jacobian of a block so the optimizer
//! solves an equivalent reweighted least squares problem:
//!
//! ```text
//! r_hat = sqrt(rho') / (1 - alpha) * r
//! J_hat = sqrt(rho') * (J - alpha / s * r r^T J)
//! ```
//!
//! where alpha solves `0.5 alpha^2 - alpha - s rho''/rho' = 0`, i.e.
//! `alpha = 1 - sqrt(1 + 2 s rho''/rho')`. With this choice `||r_hat||^2`
//! matches rho(s) to second order and the Gauss-Newton approximation of the
//! robustified Hessian stays positive semidefinite.
//!
//! Reference: Triggs et al., "Bundle Adjustment - A Modern Synthesis" (1999).

use crate::core::loss_functions::LossFunction;
use nalgebra::{DMatrix, DVector};

/// Precomputed scaling factors for one residual block evaluation.
///
/// Instantiated once per block per iteration; `correct_jacobian` must be
/// called with the uncorrected residual, so Jacobians are corrected before
/// the residual itself.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Build a corrector by evaluating `loss_function` at squared norm
    /// `sq_norm`.
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let rho = loss_function.evaluate(sq_norm);
        let rho_1 = rho[1];
        let rho_2 = rho[2];
        let sqrt_rho1 = rho_1.sqrt();

        // Common case: no curvature correction needed. This also covers the
        // zero-residual block, where the rank-1 term is undefined.
        if sq_norm == 0.0 || rho_2 <= 0.0 {
            return Corrector {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * sq_norm * rho_2 / rho_1;
        let alpha = 1.0 - d.sqrt();

        Corrector {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Correct one Jacobian block in place. `residual` must be the
    /// uncorrected residual vector.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }

        // J_hat = sqrt(rho') * (J - alpha/s * r r^T J)
        let r_rtj = residual * residual.transpose() * jacobian.clone();
        *jacobian = (jacobian.clone() - r_rtj * self.alpha_sq_norm) * self.sqrt_rho1;
    }

    /// Correct the residual vector in place.
    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}
