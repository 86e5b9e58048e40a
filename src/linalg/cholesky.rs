//! Sparse Cholesky (LLT) solver for the normal equations.

use faer::{
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
    Mat, Side,
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Direct solver based on faer's sparse LLT decomposition.
///
/// The symbolic factorization is computed on the first solve and reused for
/// every later call; the caller guarantees a constant sparsity pattern.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    hessian: Option<SparseColMat<usize, f64>>,
    gradient: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver::default()
    }

    fn form_normal_equations(
        &self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        let jt = jacobian.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobian.as_ref());
        let gradient = jacobian.as_ref().transpose().mul(residuals);
        Ok((hessian, gradient))
    }

    fn symbolic(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicLlt<usize>> {
        if let Some(cached) = &self.symbolic_factorization {
            // SymbolicLlt is reference-counted, so clone() is cheap.
            return Ok(cached.clone());
        }
        let symbolic = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(symbolic.clone());
        Ok(symbolic)
    }

    fn factorize_and_solve(
        &mut self,
        system: &SparseColMat<usize, f64>,
        gradient: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let symbolic = self.symbolic(system)?;
        let cholesky = Llt::try_new_with_symbolic(symbolic, system.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;
        Ok(cholesky.solve(-gradient))
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = self.form_normal_equations(residuals, jacobian)?;
        let dx = self.factorize_and_solve(&hessian, &gradient)?;
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        Ok(dx)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = self.form_normal_equations(residuals, jacobian)?;

        let n = jacobian.ncols();
        let mut lambda_triplets = Vec::with_capacity(n);
        for i in 0..n {
            lambda_triplets.push(Triplet::new(i, i, lambda));
        }
        let lambda_i = SparseColMat::try_new_from_triplets(n, n, &lambda_triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("failed to create lambda*I matrix".to_string())
                .log_with_source(e)
        })?;
        let augmented = &hessian + lambda_i;

        let dx = self.factorize_and_solve(&augmented, &gradient)?;
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        Ok(dx)
    }

    fn hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }
}
