//! Small dense linear algebra kernels for symmetric matrices.
//!
//! Everything here operates on `ndarray` arrays and stays O(n³) with plain
//! loops; the matrices involved (channel or component counts) are at most a
//! few hundred rows.
use anyhow::Result;
use ndarray::{Array1, Array2};

use crate::error::PipelineError;

/// Eigendecomposition of a symmetric matrix by the cyclic Jacobi method.
///
/// Returns `(eigenvalues, eigenvectors)` sorted by descending eigenvalue,
/// eigenvectors as columns.
pub fn sym_eig(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(PipelineError::shape(format!(
            "sym_eig needs a square matrix, got {}x{}",
            n,
            a.ncols()
        )));
    }
    let mut m = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _sweep in 0..100 {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += m[[p, q]] * m[[p, q]];
            }
        }
        if off < 1e-24 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = m[[p, q]];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let app = m[[p, p]];
                let aqq = m[[q, q]];
                let theta = (aqq - app) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| m[[j, j]].partial_cmp(&m[[i, i]]).unwrap_or(std::cmp::Ordering::Equal));

    let mut vals = Array1::zeros(n);
    let mut vecs = Array2::zeros((n, n));
    for (col, &i) in order.iter().enumerate() {
        vals[col] = m[[i, i]];
        for row in 0..n {
            vecs[[row, col]] = v[[row, i]];
        }
    }
    Ok((vals, vecs))
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(PipelineError::shape(format!(
            "cholesky needs a square matrix, got {}x{}",
            n,
            a.ncols()
        )));
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(PipelineError::shape(format!(
                        "matrix not positive definite at pivot {i} ({sum})"
                    )));
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Solve `A X = B` given the lower Cholesky factor `L` of `A`.
pub fn cho_solve(l: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let m = b.ncols();
    let mut x = b.clone();
    // Forward substitution: L Y = B.
    for col in 0..m {
        for i in 0..n {
            let mut sum = x[[i, col]];
            for k in 0..i {
                sum -= l[[i, k]] * x[[k, col]];
            }
            x[[i, col]] = sum / l[[i, i]];
        }
        // Back substitution: Lᵀ X = Y.
        for i in (0..n).rev() {
            let mut sum = x[[i, col]];
            for k in i + 1..n {
                sum -= l[[k, i]] * x[[k, col]];
            }
            x[[i, col]] = sum / l[[i, i]];
        }
    }
    x
}

/// Inverse of a symmetric positive-definite matrix via Cholesky.
pub fn inv_spd(a: &Array2<f64>) -> Result<Array2<f64>> {
    let l = cholesky(a)?;
    Ok(cho_solve(&l, &Array2::eye(a.nrows())))
}

/// Moore-Penrose pseudoinverse of a symmetric matrix, dropping eigenvalues
/// below `rtol * max_eigenvalue`.
pub fn pinv_sym(a: &Array2<f64>, rtol: f64) -> Result<Array2<f64>> {
    let (vals, vecs) = sym_eig(a)?;
    let n = a.nrows();
    let cutoff = vals.iter().fold(0.0_f64, |m, &v| m.max(v.abs())) * rtol;
    let mut out = Array2::<f64>::zeros((n, n));
    for k in 0..n {
        if vals[k].abs() <= cutoff {
            continue;
        }
        let inv = 1.0 / vals[k];
        for i in 0..n {
            for j in 0..n {
                out[[i, j]] += vecs[[i, k]] * inv * vecs[[j, k]];
            }
        }
    }
    Ok(out)
}

/// Symmetric inverse square root `A^{-1/2}`, for decorrelation steps.
pub fn inv_sqrt_sym(a: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = sym_eig(a)?;
    let n = a.nrows();
    let mut out = Array2::<f64>::zeros((n, n));
    for k in 0..n {
        if vals[k] <= 0.0 {
            return Err(PipelineError::shape(format!(
                "inv_sqrt_sym: non-positive eigenvalue {}",
                vals[k]
            )));
        }
        let w = 1.0 / vals[k].sqrt();
        for i in 0..n {
            for j in 0..n {
                out[[i, j]] += vecs[[i, k]] * w * vecs[[j, k]];
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn eig_recovers_diagonal() {
        let a = array![[3.0, 0.0], [0.0, 1.0]];
        let (vals, vecs) = sym_eig(&a).unwrap();
        approx::assert_abs_diff_eq!(vals[0], 3.0, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(vals[1], 1.0, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(vecs[[0, 0]].abs(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn eig_reconstructs_matrix() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let (vals, vecs) = sym_eig(&a).unwrap();
        let mut recon = Array2::<f64>::zeros((3, 3));
        for k in 0..3 {
            for i in 0..3 {
                for j in 0..3 {
                    recon[[i, j]] += vecs[[i, k]] * vals[k] * vecs[[j, k]];
                }
            }
        }
        for i in 0..3 {
            for j in 0..3 {
                approx::assert_abs_diff_eq!(recon[[i, j]], a[[i, j]], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn cholesky_solve_identity() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = inv_spd(&a).unwrap();
        let prod = a.dot(&inv);
        approx::assert_abs_diff_eq!(prod[[0, 0]], 1.0, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(prod[[0, 1]], 0.0, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(prod[[1, 1]], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&a).is_err());
    }

    #[test]
    fn inv_sqrt_squares_to_inverse() {
        let a = array![[2.0, 0.3], [0.3, 1.5]];
        let s = inv_sqrt_sym(&a).unwrap();
        let prod = s.dot(&a).dot(&s);
        approx::assert_abs_diff_eq!(prod[[0, 0]], 1.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(prod[[1, 0]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn pinv_handles_rank_deficiency() {
        // Rank-1 matrix: pinv must satisfy A pinv(A) A = A.
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let p = pinv_sym(&a, 1e-12).unwrap();
        let back = a.dot(&p).dot(&a);
        approx::assert_abs_diff_eq!(back[[0, 0]], 1.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(back[[1, 1]], 1.0, epsilon = 1e-9);
    }
}
