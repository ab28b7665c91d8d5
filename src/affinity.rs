//! Perplexity-calibrated affinities.
//!
//! Each row of the squared-distance matrix is converted to a conditional
//! Gaussian distribution over its neighbors by binary-searching the
//! precision beta until the row entropy hits `ln(perplexity)`, then the
//! conditional matrix is symmetrized into the sparse P consumed by the
//! positive gradient.

use ndarray::ArrayView2;
use rayon::prelude::*;
use sprs::{CsMat, TriMat};

use crate::types::{DaedalusError, Result, EPSILON};

/// Entropy tolerance of the beta search.
pub const PERPLEXITY_TOLERANCE: f64 = 1e-8;

/// Beta search iteration cap. Hitting it is not an error; the row keeps the
/// last beta (best effort).
pub const MAX_PERPLEXITY_ITER: usize = 200;

// ─────────────────────────────────────────────────────────────
//  Per-row calibration
// ─────────────────────────────────────────────────────────────

/// Binary-search the precision for one row of squared distances and write
/// the normalized conditional distribution into `p_out`.
///
/// Entropy is H = ln(sum p) + beta * sum(d p) / sum(p), the Shannon entropy
/// of the normalized row. H decreases monotonically in beta, so the bracket
/// doubles outward until both bounds exist and bisects afterwards.
fn calibrate_row(dists: &[f64], target_entropy: f64, tolerance: f64, p_out: &mut [f64]) {
    let mut beta = 1.0;
    let mut lower = f64::NEG_INFINITY;
    let mut upper = f64::INFINITY;

    for _ in 0..MAX_PERPLEXITY_ITER {
        let mut sum_p = 0.0;
        let mut sum_dp = 0.0;
        for (p, &d) in p_out.iter_mut().zip(dists) {
            *p = (-d * beta).exp();
            sum_p += *p;
            sum_dp += d * *p;
        }
        // A saturated exponent underflows the whole row; entropy is -inf.
        let entropy = if sum_p > 0.0 {
            sum_p.ln() + beta * sum_dp / sum_p
        } else {
            f64::NEG_INFINITY
        };

        let diff = entropy - target_entropy;
        if diff.abs() <= tolerance {
            break;
        }
        if diff > 0.0 {
            // Too flat: beta is too small.
            lower = beta;
            beta = if upper.is_finite() { (beta + upper) / 2.0 } else { beta * 2.0 };
        } else {
            upper = beta;
            beta = if lower.is_finite() { (beta + lower) / 2.0 } else { beta / 2.0 };
        }
    }

    let sum_p: f64 = p_out.iter().sum();
    let norm = 1.0 / (sum_p + EPSILON);
    for p in p_out.iter_mut() {
        *p *= norm;
    }
}

// ─────────────────────────────────────────────────────────────
//  Matrix assembly
// ─────────────────────────────────────────────────────────────

/// Calibrate every row of a squared-distance matrix into a conditional
/// affinity matrix of shape `n_rows x n_cols`, CSR.
///
/// `distances` and `indices` are parallel N x k matrices: row i holds the
/// squared distances to, and the column indices of, the neighbors of point
/// i. Rows are calibrated independently in parallel. When `exclude_self`
/// is set, entries whose column index equals the row index are dropped
/// before calibration.
pub fn conditional_affinities(
    distances: &ArrayView2<'_, f64>,
    indices: &ArrayView2<'_, usize>,
    n_cols: usize,
    perplexity: f64,
    tolerance: f64,
    exclude_self: bool,
    pool: &rayon::ThreadPool,
) -> Result<CsMat<f64>> {
    let n = distances.nrows();
    if indices.dim() != distances.dim() {
        return Err(DaedalusError::InvalidInput(format!(
            "neighbor index shape {:?} does not match distance shape {:?}",
            indices.dim(),
            distances.dim()
        )));
    }
    if let Some(&bad) = distances.iter().find(|d| !d.is_finite() || **d < 0.0) {
        return Err(DaedalusError::InvalidInput(format!(
            "distances must be finite and nonnegative, found {bad}"
        )));
    }
    if let Some(&bad) = indices.iter().find(|j| **j >= n_cols) {
        return Err(DaedalusError::InvalidInput(format!(
            "neighbor index {bad} out of range for {n_cols} columns"
        )));
    }

    let target_entropy = perplexity.ln();

    let rows: Vec<(Vec<usize>, Vec<f64>)> = pool.install(|| {
        (0..n)
            .into_par_iter()
            .map(|i| {
                let mut cols = Vec::with_capacity(distances.ncols());
                let mut dists = Vec::with_capacity(distances.ncols());
                for (&j, &d) in indices.row(i).iter().zip(distances.row(i)) {
                    if exclude_self && j == i {
                        continue;
                    }
                    cols.push(j);
                    dists.push(d);
                }
                let mut p = vec![0.0; dists.len()];
                if !p.is_empty() {
                    calibrate_row(&dists, target_entropy, tolerance, &mut p);
                }
                (cols, p)
            })
            .collect()
    });

    let mut tri = TriMat::new((n, n_cols));
    for (i, (cols, p)) in rows.iter().enumerate() {
        for (&j, &v) in cols.iter().zip(p) {
            tri.add_triplet(i, j, v);
        }
    }
    Ok(tri.to_csr())
}

/// Symmetrize a conditional matrix: P <- (P + P^T) / (2N).
///
/// Both triangles are stored explicitly so the positive gradient iterates
/// each row cache-friendly. Every row then sums to roughly 1/N and the
/// whole matrix to 1.
pub fn symmetrize(p: &CsMat<f64>) -> CsMat<f64> {
    let n = p.rows() as f64;
    let pt = p.transpose_view().to_csr();
    let sum = &pt + p;
    sum.map(|v| v / (2.0 * n))
}

/// Normalize a conditional matrix so its entries sum to 1. Used on the
/// transform path, where the reference side of the matrix is fixed and no
/// symmetrization applies.
pub fn normalize_total(p: &CsMat<f64>) -> CsMat<f64> {
    let total: f64 = p.data().iter().sum();
    p.map(|v| v / (total + EPSILON))
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
