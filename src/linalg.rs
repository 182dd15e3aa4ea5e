//! Thin bridge between `ndarray` storage and `faer` dense factorizations.
//!
//! Representations keep their state in ndarray containers; the few dense
//! factorizations the engine needs (Cholesky of the joint precision and a
//! self-adjoint eigendecomposition for diagnostics) run through faer.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn array_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    let (rows, cols) = array.dim();
    Mat::from_fn(rows, cols, |i, j| array[[i, j]])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

fn ensure_square<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Result<(), FaerLinalgError> {
    let (rows, cols) = array.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    Ok(())
}

pub trait FaerEigh {
    /// Eigenvalues (ascending) and eigenvectors of a symmetric matrix.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        ensure_square(self)?;
        let mat = array_to_mat(self);
        let eigen = mat
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
    dim: usize,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_mat = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solved = self.factor.solve(rhs_mat.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| solved[(i, 0)])
    }

    pub fn inverse(&self) -> Array2<f64> {
        let identity = Mat::<f64>::identity(self.dim, self.dim);
        let inv = mat_to_array(self.factor.solve(identity.as_ref()).as_ref());
        symmetrize(inv)
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        ensure_square(self)?;
        let mat = array_to_mat(self);
        let factor = mat.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor {
            factor,
            dim: self.nrows(),
        })
    }
}

/// Averages a matrix with its transpose; solves leave tiny asymmetry behind.
pub fn symmetrize(mut matrix: Array2<f64>) -> Array2<f64> {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
    matrix
}

/// Smallest eigenvalue of a symmetric matrix.
pub fn min_eigenvalue<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<f64, FaerLinalgError> {
    let (values, _) = matrix.eigh(Side::Lower)?;
    Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
}
