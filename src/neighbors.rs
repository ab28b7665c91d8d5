//! Minimal contract with the nearest-neighbor collaborator, plus a parallel
//! exact brute-force search so `fit` works without an external index.

use ndarray::{Array2, ArrayView2, Zip};

use crate::types::{DaedalusError, Result};

/// k nearest neighbors of each query row: column-aligned index and
/// Euclidean-distance matrices, both N x k.
///
/// This is the shape an external (exact or approximate) index must produce;
/// [`exact_neighbors`] is the built-in exact producer.
#[derive(Clone, Debug)]
pub struct NearestNeighbors {
    pub indices: Array2<usize>,
    pub distances: Array2<f64>,
}

/// Exact k-nearest-neighbor search of `x` against itself, excluding each
/// point from its own neighborhood. O(N^2 D), parallel over queries.
pub fn exact_neighbors(
    x: &ArrayView2<'_, f64>,
    k: usize,
    pool: &rayon::ThreadPool,
) -> Result<NearestNeighbors> {
    cross_neighbors(x, x, k, true, pool)
}

/// Exact k-nearest-neighbor search of `queries` against `corpus`.
///
/// `exclude_diagonal` skips corpus row j for query row i when i == j; only
/// meaningful when `queries` and `corpus` are the same matrix.
pub fn cross_neighbors(
    queries: &ArrayView2<'_, f64>,
    corpus: &ArrayView2<'_, f64>,
    k: usize,
    exclude_diagonal: bool,
    pool: &rayon::ThreadPool,
) -> Result<NearestNeighbors> {
    let n = queries.nrows();
    let m = corpus.nrows();
    if queries.ncols() != corpus.ncols() {
        return Err(DaedalusError::InvalidInput(format!(
            "query dimensionality {} does not match corpus dimensionality {}",
            queries.ncols(),
            corpus.ncols()
        )));
    }
    let available = if exclude_diagonal { m.saturating_sub(1) } else { m };
    if k == 0 || k > available {
        return Err(DaedalusError::InvalidInput(format!(
            "cannot select {k} neighbors from {available} candidate points"
        )));
    }

    let mut indices = Array2::<usize>::zeros((n, k));
    let mut distances = Array2::<f64>::zeros((n, k));

    pool.install(|| {
        Zip::indexed(indices.rows_mut())
            .and(distances.rows_mut())
            .par_for_each(|i, mut idx_row, mut dist_row| {
                let q = queries.row(i);
                let mut candidates: Vec<(f64, usize)> = Vec::with_capacity(m);
                for (j, c) in corpus.rows().into_iter().enumerate() {
                    if exclude_diagonal && j == i {
                        continue;
                    }
                    let mut d2 = 0.0;
                    for (a, b) in q.iter().zip(c.iter()) {
                        let diff = a - b;
                        d2 += diff * diff;
                    }
                    candidates.push((d2, j));
                }
                candidates
                    .select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
                candidates.truncate(k);
                candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
                for (slot, (d2, j)) in candidates.into_iter().enumerate() {
                    idx_row[slot] = j;
                    dist_row[slot] = d2.sqrt();
                }
            });
    });

    Ok(NearestNeighbors { indices, distances })
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
