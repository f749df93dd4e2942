use super::LinearSolver;
use crate::error::{IsdfError, Result};
use nalgebra::{ComplexField, DMatrix};
use num_complex::Complex64;

/// Dense solver built on nalgebra's Cholesky and symmetric eigen routines.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseSolver;

fn check_system<T: nalgebra::Scalar>(a: &DMatrix<T>, b: &DMatrix<T>, block: &str) -> Result<()> {
    if a.nrows() != a.ncols() || a.nrows() != b.nrows() {
        return Err(IsdfError::DimensionMismatch(format!(
            "system {}: lhs {:?} incompatible with rhs {:?}",
            block,
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

fn cholesky_solve<T: ComplexField>(a: &DMatrix<T>, b: &DMatrix<T>, block: &str) -> Result<DMatrix<T>> {
    check_system(a, b, block)?;
    let chol = a.clone().cholesky().ok_or_else(|| IsdfError::SolveFailure {
        block: block.to_string(),
        reason: "matrix is not positive definite".to_string(),
    })?;
    Ok(chol.solve(b))
}

impl LinearSolver for DenseSolver {
    fn solve_real_spd(&self, a: &DMatrix<f64>, b: &DMatrix<f64>, block: &str) -> Result<DMatrix<f64>> {
        cholesky_solve(a, b, block)
    }

    fn solve_hermitian(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        cholesky_solve(a, b, block)
    }

    fn solve_hermitian_eigen(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        cutoff: f64,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        check_system(a, b, block)?;
        let eig = a.clone().symmetric_eigen();
        let emax = eig.eigenvalues.iter().fold(0.0f64, |m, e| m.max(e.abs()));
        let keep: Vec<usize> = (0..eig.eigenvalues.len())
            .filter(|&i| eig.eigenvalues[i] > cutoff * emax)
            .collect();
        if keep.is_empty() {
            return Err(IsdfError::SolveFailure {
                block: block.to_string(),
                reason: "no eigenvalue above the cutoff".to_string(),
            });
        }

        let h = eig.eigenvectors.select_columns(keep.iter());
        let mut projected = h.adjoint() * b;
        for (row, &i) in keep.iter().enumerate() {
            let inv = 1.0 / eig.eigenvalues[i];
            projected.row_mut(row).iter_mut().for_each(|z| *z *= inv);
        }
        Ok(h * projected)
    }
}
