//! Parameter block: one optimization variable with optional manifold and
//! box constraints.

use crate::core::manifold::Manifold;
use crate::core::{CoreError, CoreResult};
use nalgebra::{DMatrix, DVector, DVectorView};

/// Handle to a parameter block inside a [`Program`](crate::core::Program)
/// arena. Handles are assigned in insertion order and are stable for the
/// lifetime of the program.
pub type ParameterBlockId = usize;

/// Offset value of a block that does not participate in the tangent space.
pub(crate) const UNSET_OFFSET: usize = usize::MAX;

/// One optimization variable.
///
/// A block owns its ambient state vector. Its tangent space is either the
/// ambient space (Euclidean block) or the tangent space of an attached
/// [`Manifold`]. Optional per-coordinate bounds are enforced by clamping
/// after every retraction, so `plus` with a zero delta is exactly the box
/// projection of the input.
pub struct ParameterBlock {
    state: DVector<f64>,
    manifold: Option<Box<dyn Manifold>>,
    lower_bounds: Option<DVector<f64>>,
    upper_bounds: Option<DVector<f64>>,
    constant: bool,

    // Assigned by Program::setup_offsets. UNSET_OFFSET while inactive.
    pub(crate) index: usize,
    pub(crate) state_offset: usize,
    pub(crate) delta_offset: usize,
}

impl ParameterBlock {
    pub fn new(state: DVector<f64>) -> Self {
        ParameterBlock {
            state,
            manifold: None,
            lower_bounds: None,
            upper_bounds: None,
            constant: false,
            index: UNSET_OFFSET,
            state_offset: UNSET_OFFSET,
            delta_offset: UNSET_OFFSET,
        }
    }

    /// Ambient dimension.
    pub fn size(&self) -> usize {
        self.state.len()
    }

    /// Tangent dimension: the manifold's tangent size, or the ambient size
    /// for Euclidean blocks. Always `<= size()`.
    pub fn tangent_size(&self) -> usize {
        match &self.manifold {
            Some(manifold) => manifold.tangent_size(),
            None => self.size(),
        }
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    pub fn set_state(&mut self, state: DVector<f64>) -> CoreResult<()> {
        if state.len() != self.size() {
            return Err(CoreError::DimensionMismatch(format!(
                "state has length {}, block has size {}",
                state.len(),
                self.size()
            ))
            .log());
        }
        self.state = state;
        Ok(())
    }

    /// Attach a manifold. Its ambient size must match the block size and its
    /// tangent size must not exceed it.
    pub fn set_manifold(&mut self, manifold: Box<dyn Manifold>) -> CoreResult<()> {
        if manifold.ambient_size() != self.size() {
            return Err(CoreError::Manifold(format!(
                "manifold ambient size {} does not match block size {}",
                manifold.ambient_size(),
                self.size()
            ))
            .log());
        }
        if manifold.tangent_size() > manifold.ambient_size() {
            return Err(CoreError::Manifold(format!(
                "manifold tangent size {} exceeds ambient size {}",
                manifold.tangent_size(),
                manifold.ambient_size()
            ))
            .log());
        }
        self.manifold = Some(manifold);
        Ok(())
    }

    pub fn manifold(&self) -> Option<&dyn Manifold> {
        self.manifold.as_deref()
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn set_constant(&mut self) {
        self.constant = true;
    }

    pub fn set_varying(&mut self) {
        self.constant = false;
    }

    /// Set per-coordinate bounds. Each lower bound must not exceed the
    /// corresponding upper bound; infinite entries disable the bound for that
    /// coordinate.
    pub fn set_bounds(&mut self, lower: DVector<f64>, upper: DVector<f64>) -> CoreResult<()> {
        if lower.len() != self.size() || upper.len() != self.size() {
            return Err(CoreError::DimensionMismatch(format!(
                "bounds have lengths {}/{}, block has size {}",
                lower.len(),
                upper.len(),
                self.size()
            ))
            .log());
        }
        for i in 0..self.size() {
            if lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i] {
                return Err(CoreError::InvalidInput(format!(
                    "invalid bounds [{}, {}] for coordinate {i}",
                    lower[i], upper[i]
                ))
                .log());
            }
        }
        self.lower_bounds = Some(lower);
        self.upper_bounds = Some(upper);
        Ok(())
    }

    pub fn has_bounds(&self) -> bool {
        self.lower_bounds.is_some()
    }

    /// Clamp a state vector into the feasible box.
    pub fn project(&self, x: &mut DVector<f64>) {
        if let (Some(lower), Some(upper)) = (&self.lower_bounds, &self.upper_bounds) {
            for i in 0..x.len() {
                x[i] = x[i].clamp(lower[i], upper[i]);
            }
        }
    }

    /// Retraction followed by box projection.
    ///
    /// `delta` has tangent dimension, `x` and `x_plus_delta` ambient
    /// dimension. Returns false if the manifold retraction fails.
    pub fn plus(
        &self,
        x: DVectorView<f64>,
        delta: DVectorView<f64>,
        x_plus_delta: &mut DVector<f64>,
    ) -> bool {
        match &self.manifold {
            Some(manifold) => {
                if !manifold.plus(x, delta, x_plus_delta) {
                    return false;
                }
            }
            None => {
                if x.len() != x_plus_delta.len() || delta.len() != x.len() {
                    return false;
                }
                for i in 0..x.len() {
                    x_plus_delta[i] = x[i] + delta[i];
                }
            }
        }
        self.project(x_plus_delta);
        true
    }

    /// Jacobian of the retraction at zero delta, `size() x tangent_size()`.
    /// Identity for Euclidean blocks.
    pub fn plus_jacobian(&self, x: DVectorView<f64>, jacobian: &mut DMatrix<f64>) -> bool {
        match &self.manifold {
            Some(manifold) => manifold.plus_jacobian(x, jacobian),
            None => {
                if jacobian.nrows() != self.size() || jacobian.ncols() != self.size() {
                    return false;
                }
                jacobian.fill_with_identity();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifold::SubsetManifold;

    #[test]
    fn test_euclidean_plus() {
        let block = ParameterBlock::new(DVector::from_vec(vec![1.0, 2.0]));
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let delta = DVector::from_vec(vec![0.5, -0.5]);
        let mut out = DVector::zeros(2);

        assert!(block.plus(x.as_view(), delta.as_view(), &mut out));
        assert_eq!(out, DVector::from_vec(vec![1.5, 1.5]));
    }

    #[test]
    fn test_plus_clamps_to_bounds() {
        let mut block = ParameterBlock::new(DVector::from_vec(vec![0.0]));
        block
            .set_bounds(
                DVector::from_vec(vec![-1.0]),
                DVector::from_vec(vec![1.0]),
            )
            .unwrap();

        let x = DVector::from_vec(vec![0.0]);
        let mut out = DVector::zeros(1);

        let up = DVector::from_vec(vec![5.0]);
        assert!(block.plus(x.as_view(), up.as_view(), &mut out));
        assert_eq!(out[0], 1.0);

        let down = DVector::from_vec(vec![-5.0]);
        assert!(block.plus(x.as_view(), down.as_view(), &mut out));
        assert_eq!(out[0], -1.0);
    }

    #[test]
    fn test_plus_zero_delta_projects_infeasible_point() {
        let mut block = ParameterBlock::new(DVector::from_vec(vec![0.0]));
        block
            .set_bounds(
                DVector::from_vec(vec![-1.0]),
                DVector::from_vec(vec![1.0]),
            )
            .unwrap();

        let x = DVector::from_vec(vec![3.0]);
        let delta = DVector::zeros(1);
        let mut out = DVector::zeros(1);

        assert!(block.plus(x.as_view(), delta.as_view(), &mut out));
        assert_eq!(out[0], 1.0);

        // Idempotent on the projection.
        let mut again = DVector::zeros(1);
        assert!(block.plus(out.as_view(), delta.as_view(), &mut again));
        assert_eq!(again, out);
    }

    #[test]
    fn test_tangent_size_with_manifold() {
        let mut block = ParameterBlock::new(DVector::from_vec(vec![1.0, 2.0, 3.0]));
        block
            .set_manifold(Box::new(SubsetManifold::new(3, &[2])))
            .unwrap();
        assert_eq!(block.size(), 3);
        assert_eq!(block.tangent_size(), 2);
    }

    #[test]
    fn test_manifold_size_mismatch_rejected() {
        let mut block = ParameterBlock::new(DVector::from_vec(vec![1.0, 2.0]));
        assert!(block
            .set_manifold(Box::new(SubsetManifold::new(3, &[])))
            .is_err());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let mut block = ParameterBlock::new(DVector::from_vec(vec![0.0]));
        assert!(block
            .set_bounds(DVector::from_vec(vec![2.0]), DVector::from_vec(vec![1.0]))
            .is_err());
        assert!(block
            .set_bounds(
                DVector::from_vec(vec![f64::NAN]),
                DVector::from_vec(vec![1.0])
            )
            .is_err());
    }

    #[test]
    fn test_plus_jacobian_identity_for_euclidean() {
        let block = ParameterBlock::new(DVector::from_vec(vec![1.0, 2.0]));
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let mut jacobian = DMatrix::zeros(2, 2);
        assert!(block.plus_jacobian(x.as_view(), &mut jacobian));
        assert_eq!(jacobian, DMatrix::identity(2, 2));
    }
}
