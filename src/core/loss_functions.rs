//! Robust loss functions for outlier rejection.
//!
//! In standard least squares the cost of a residual block is `||r||^2`. With a
//! robust loss function rho(s) the cost becomes `rho(||r||^2)`, which caps the
//! influence of outlier measurements. Losses are applied through the
//! [`Corrector`](crate::core::Corrector) algorithm, which reweights residuals
//! and Jacobians so the optimizer solves an equivalent reweighted least
//! squares problem.

use crate::core::{CoreError, CoreResult};

/// Trait for robust loss functions.
///
/// `evaluate` returns `[rho(s), rho'(s), rho''(s)]` for `s = ||r||^2`.
/// Implementations must satisfy rho(0) = 0, rho'(0) = 1 and keep rho'(s) > 0
/// for all s >= 0; the corrector divides by rho'(s).
pub trait LossFunction: Send + Sync {
    /// Evaluate the loss and its first two derivatives at squared norm `s`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

// Guards rho'(s) away from zero for redescending losses.
const MIN_RHO_PRIME: f64 = f64::EPSILON;

/// Standard least squares. rho(s) = s, no robustness.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Loss;

impl L2Loss {
    pub fn new() -> Self {
        L2Loss
    }
}

impl LossFunction for L2Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic for `s <= delta^2`, linear beyond.
///
/// ```text
/// rho(s) = s                          s <= delta^2
/// rho(s) = 2 delta sqrt(s) - delta^2  s >  delta^2
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    delta: f64,
    delta_squared: f64,
}

impl HuberLoss {
    /// Create a Huber loss with transition point `delta` (must be positive and
    /// finite).
    pub fn new(delta: f64) -> CoreResult<Self> {
        if !delta.is_finite() || delta <= 0.0 {
            return Err(CoreError::LossFunction(format!(
                "Huber delta must be positive and finite, got {delta}"
            ))
            .log());
        }
        Ok(HuberLoss {
            delta,
            delta_squared: delta * delta,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.delta_squared {
            let r = s.sqrt();
            let rho_1 = (self.delta / r).max(MIN_RHO_PRIME);
            [2.0 * self.delta * r - self.delta_squared, rho_1, -rho_1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy (Lorentzian) loss: rho(s) = c^2 log(1 + s / c^2).
///
/// Downweights large residuals much more aggressively than Huber.
#[derive(Debug, Clone, Copy)]
pub struct CauchyLoss {
    scale_squared: f64,
    inv_scale_squared: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with scale `c` (must be positive and finite).
    pub fn new(scale: f64) -> CoreResult<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(CoreError::LossFunction(format!(
                "Cauchy scale must be positive and finite, got {scale}"
            ))
            .log());
        }
        let scale_squared = scale * scale;
        Ok(CauchyLoss {
            scale_squared,
            inv_scale_squared: 1.0 / scale_squared,
        })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale_squared;
        let inv = (1.0 / sum).max(MIN_RHO_PRIME);
        [
            self.scale_squared * sum.ln(),
            inv,
            -self.inv_scale_squared * inv * inv,
        ]
    }
}
