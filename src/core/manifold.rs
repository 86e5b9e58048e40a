//! Manifold abstraction for parameter blocks with non-Euclidean structure.

use nalgebra::{DMatrix, DVector, DVectorView};

/// Local parameterization of a parameter block.
///
/// A manifold maps a tangent-space increment `delta` of dimension
/// [`tangent_size`](Manifold::tangent_size) onto the ambient representation of
/// dimension [`ambient_size`](Manifold::ambient_size). The tangent size must
/// never exceed the ambient size; a tangent size of zero makes the block
/// effectively constant.
pub trait Manifold: Send + Sync {
    /// Dimension of the ambient representation.
    fn ambient_size(&self) -> usize;

    /// Dimension of the tangent space.
    fn tangent_size(&self) -> usize;

    /// Retraction: `x_plus_delta = Plus(x, delta)`.
    ///
    /// Must satisfy `Plus(x, 0) == x`. Returns false when the operation is
    /// undefined for the given input.
    fn plus(
        &self,
        x: DVectorView<f64>,
        delta: DVectorView<f64>,
        x_plus_delta: &mut DVector<f64>,
    ) -> bool;

    /// Jacobian of `Plus(x, delta)` with respect to `delta` at `delta = 0`,
    /// with `ambient_size` rows and `tangent_size` columns.
    fn plus_jacobian(&self, x: DVectorView<f64>, jacobian: &mut DMatrix<f64>) -> bool;
}

/// Holds a fixed subset of a block's coordinates constant.
///
/// The tangent space is spanned by the non-constant coordinates in their
/// ambient order.
#[derive(Debug, Clone)]
pub struct SubsetManifold {
    ambient_size: usize,
    // Sorted ambient indices that stay fixed.
    constant_indices: Vec<usize>,
}

impl SubsetManifold {
    /// Create a subset manifold of size `ambient_size` holding
    /// `constant_indices` fixed. Indices are deduplicated; out-of-range
    /// indices are ignored.
    pub fn new(ambient_size: usize, constant_indices: &[usize]) -> Self {
        let mut indices: Vec<usize> = constant_indices
            .iter()
            .copied()
            .filter(|&i| i < ambient_size)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        SubsetManifold {
            ambient_size,
            constant_indices: indices,
        }
    }

    fn is_constant(&self, index: usize) -> bool {
        self.constant_indices.binary_search(&index).is_ok()
    }
}

impl Manifold for SubsetManifold {
    fn ambient_size(&self) -> usize {
        self.ambient_size
    }

    fn tangent_size(&self) -> usize {
        self.ambient_size - self.constant_indices.len()
    }

    fn plus(
        &self,
        x: DVectorView<f64>,
        delta: DVectorView<f64>,
        x_plus_delta: &mut DVector<f64>,
    ) -> bool {
        if x.len() != self.ambient_size
            || delta.len() != self.tangent_size()
            || x_plus_delta.len() != self.ambient_size
        {
            return false;
        }
        let mut tangent_index = 0;
        for i in 0..self.ambient_size {
            if self.is_constant(i) {
                x_plus_delta[i] = x[i];
            } else {
                x_plus_delta[i] = x[i] + delta[tangent_index];
                tangent_index += 1;
            }
        }
        true
    }

    fn plus_jacobian(&self, x: DVectorView<f64>, jacobian: &mut DMatrix<f64>) -> bool {
        if x.len() != self.ambient_size
            || jacobian.nrows() != self.ambient_size
            || jacobian.ncols() != self.tangent_size()
        {
            return false;
        }
        jacobian.fill(0.0);
        let mut tangent_index = 0;
        for i in 0..self.ambient_size {
            if !self.is_constant(i) {
                jacobian[(i, tangent_index)] = 1.0;
                tangent_index += 1;
            }
        }
        true
    }
}
