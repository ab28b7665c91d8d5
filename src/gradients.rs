//! Attractive and repulsive gradient engines.
//!
//! The positive engine sums attraction over the sparse neighbor lists; the
//! negative engines approximate the dense repulsion, either through a
//! quadtree (Barnes-Hut) or through FFT interpolation. Within an
//! iteration the negative engine runs first and owns the gradient buffer;
//! the positive engine adds on top.

use ndarray::{Array1, Array2, ArrayView2, Zip};
use sprs::CsMat;

use crate::fft::{Fft1D, Fft2D};
use crate::quadtree::QuadTree;
use crate::types::{Result, EPSILON};

/// KL bookkeeping from a positive-gradient pass. The reported divergence is
/// `unnormalized_kl + sum_p * ln(Z)` once the partition function is known.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositiveStats {
    pub unnormalized_kl: f64,
    pub sum_p: f64,
}

/// Student-t similarity for one squared distance, raised to (dof+1)/2 when
/// dof differs from the classical choice.
#[inline]
fn student_t(dist_sq: f64, dof: f64, exponent: f64) -> f64 {
    let q = dof / (dof + dist_sq);
    if dof != 1.0 {
        q.powf(exponent)
    } else {
        q
    }
}

// ─────────────────────────────────────────────────────────────
//  Positive (attractive) engine
// ─────────────────────────────────────────────────────────────

/// Add the attractive force sum_j P_ij q_ij (y_i - y_j) into each gradient
/// row. Parallel over rows: each worker reads P and the embeddings and
/// writes only its own gradient row plus its own KL slots, so the result
/// does not depend on the thread count.
///
/// `reference` is the matrix the column indices of `affinities` point
/// into; it equals `embedding` during `fit` and the frozen reference
/// during `transform`. `exaggeration` scales the force term only; the KL
/// accumulation always uses the raw P so the trace stays comparable
/// across phases.
pub fn positive_gradient(
    affinities: &CsMat<f64>,
    embedding: &ArrayView2<'_, f64>,
    reference: &ArrayView2<'_, f64>,
    gradient: &mut Array2<f64>,
    dof: f64,
    exaggeration: f64,
    eval_error: bool,
    pool: &rayon::ThreadPool,
) -> PositiveStats {
    let n = embedding.nrows();
    let d = embedding.ncols();
    let exponent = (dof + 1.0) / 2.0;

    let mut kl_parts = Array1::<f64>::zeros(n);
    let mut p_parts = Array1::<f64>::zeros(n);

    pool.install(|| {
        Zip::indexed(gradient.rows_mut())
            .and(embedding.rows())
            .and(&mut kl_parts)
            .and(&mut p_parts)
            .par_for_each(|i, mut grad, y, kl_i, p_i| {
                let row = match affinities.outer_view(i) {
                    Some(row) => row,
                    None => return,
                };
                let mut diff = [0.0f64; 2];
                for (j, &pij) in row.iter() {
                    let yj = reference.row(j);
                    let mut dist_sq = 0.0;
                    for a in 0..d {
                        diff[a] = y[a] - yj[a];
                        dist_sq += diff[a] * diff[a];
                    }
                    let q = student_t(dist_sq, dof, exponent);
                    let w = exaggeration * pij * q;
                    for a in 0..d {
                        grad[a] += w * diff[a];
                    }
                    if eval_error && pij > 0.0 {
                        *kl_i += pij * (pij / (q + EPSILON)).ln();
                        *p_i += pij;
                    }
                }
            });
    });

    PositiveStats { unnormalized_kl: kl_parts.sum(), sum_p: p_parts.sum() }
}

// ─────────────────────────────────────────────────────────────
//  Negative (repulsive) engine — Barnes-Hut
// ─────────────────────────────────────────────────────────────

/// Accumulate the repulsive term for every target through the quadtree and
/// return the partition function Z.
///
/// Each worker writes its own gradient row and its own slot of the
/// per-point partial-sum array; Z is reduced serially afterwards and the
/// whole buffer rescaled by -1 / (Z + EPSILON), so the buffer must hold
/// only this engine's output when called.
pub fn negative_gradient_bh(
    tree: &QuadTree,
    targets: &ArrayView2<'_, f64>,
    gradient: &mut Array2<f64>,
    theta: f64,
    dof: f64,
    pool: &rayon::ThreadPool,
) -> f64 {
    let d = targets.ncols();
    let exponent = (dof + 1.0) / 2.0;
    let mut z_parts = Array1::<f64>::zeros(targets.nrows());

    pool.install(|| {
        Zip::from(gradient.rows_mut())
            .and(targets.rows())
            .and(&mut z_parts)
            .par_for_each(|mut grad, y, z_i| {
                let q = [y[0], if d > 1 { y[1] } else { 0.0 }];
                tree.summarize(&q, theta, |diff, dist_sq, mass| {
                    let kernel = dof / (dof + dist_sq);
                    let qp = if dof != 1.0 { kernel.powf(exponent) } else { kernel };
                    *z_i += mass * qp;
                    let w = mass * qp * kernel;
                    for a in 0..d {
                        grad[a] += w * diff[a];
                    }
                });
            });
    });

    let z = z_parts.sum();
    let norm = -1.0 / (z + EPSILON);
    gradient.mapv_inplace(|g| g * norm);
    z
}

// ─────────────────────────────────────────────────────────────
//  Engine selection
// ─────────────────────────────────────────────────────────────

/// Repulsive-force engine held by the optimizer. One uniform entry point;
/// the FFT variants keep their own FFT planners across iterations.
pub enum NegativeGradient {
    BarnesHut { theta: f64 },
    Fft1D(Fft1D),
    Fft2D(Fft2D),
}

impl NegativeGradient {
    /// Compute the repulsive gradient of `targets` against the field of
    /// `sources` (sources must contain the targets) and return Z. The
    /// buffer receives `-repulsion / (Z + EPSILON)`, ready for the
    /// positive engine to add onto.
    pub fn compute(
        &mut self,
        sources: &ArrayView2<'_, f64>,
        targets: &ArrayView2<'_, f64>,
        gradient: &mut Array2<f64>,
        dof: f64,
        pool: &rayon::ThreadPool,
    ) -> Result<f64> {
        match self {
            Self::BarnesHut { theta } => {
                let tree = QuadTree::build(sources);
                Ok(negative_gradient_bh(&tree, targets, gradient, *theta, dof, pool))
            }
            Self::Fft1D(engine) => engine.compute(sources, targets, gradient, pool),
            Self::Fft2D(engine) => engine.compute(sources, targets, gradient, pool),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use sprs::TriMat;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn random_embedding(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.gen_range(-4.0..4.0))
    }

    fn dense_uniform_affinities(n: usize) -> CsMat<f64> {
        let mut tri = TriMat::new((n, n));
        let v = 1.0 / (n * (n - 1)) as f64;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    tri.add_triplet(i, j, v);
                }
            }
        }
        tri.to_csr()
    }

    #[test]
    fn positive_gradient_matches_direct_sum() {
        let n = 12;
        let emb = random_embedding(n, 2, 1);
        let p = dense_uniform_affinities(n);
        let mut grad = Array2::zeros((n, 2));
        positive_gradient(&p, &emb.view(), &emb.view(), &mut grad, 1.0, 1.0, false, &pool());

        for i in 0..n {
            let mut expect = [0.0, 0.0];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let dx = emb[[i, 0]] - emb[[j, 0]];
                let dy = emb[[i, 1]] - emb[[j, 1]];
                let q = 1.0 / (1.0 + dx * dx + dy * dy);
                let pij = 1.0 / (n * (n - 1)) as f64;
                expect[0] += pij * q * dx;
                expect[1] += pij * q * dy;
            }
            assert!((grad[[i, 0]] - expect[0]).abs() < 1e-12);
            assert!((grad[[i, 1]] - expect[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn positive_gradient_is_thread_count_invariant() {
        let n = 64;
        let emb = random_embedding(n, 2, 5);
        let p = dense_uniform_affinities(n);

        let mut grad_1 = Array2::zeros((n, 2));
        let pool_1 = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        positive_gradient(&p, &emb.view(), &emb.view(), &mut grad_1, 1.0, 1.0, true, &pool_1);

        let mut grad_4 = Array2::zeros((n, 2));
        let pool_4 = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        positive_gradient(&p, &emb.view(), &emb.view(), &mut grad_4, 1.0, 1.0, true, &pool_4);

        for (a, b) in grad_1.iter().zip(grad_4.iter()) {
            assert!((a - b).abs() <= 1e-8 * a.abs().max(1.0));
        }
    }

    #[test]
    fn bh_theta_zero_matches_direct_repulsion() {
        let n = 60;
        let emb = random_embedding(n, 2, 9);
        let mut engine = NegativeGradient::BarnesHut { theta: 0.0 };
        let mut grad = Array2::zeros((n, 2));
        let z = engine
            .compute(&emb.view(), &emb.view(), &mut grad, 1.0, &pool())
            .unwrap();

        let mut z_direct = 0.0;
        for i in 0..n {
            let mut num = [0.0, 0.0];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let dx = emb[[i, 0]] - emb[[j, 0]];
                let dy = emb[[i, 1]] - emb[[j, 1]];
                let q = 1.0 / (1.0 + dx * dx + dy * dy);
                z_direct += q;
                num[0] += q * q * dx;
                num[1] += q * q * dy;
            }
            let gx = -num[0] / (z + EPSILON);
            let gy = -num[1] / (z + EPSILON);
            assert!((grad[[i, 0]] - gx).abs() < 1e-9);
            assert!((grad[[i, 1]] - gy).abs() < 1e-9);
        }
        assert!((z - z_direct).abs() / z_direct < 1e-12);
    }

    #[test]
    fn bh_default_theta_stays_close_to_exact() {
        let n = 500;
        let emb = random_embedding(n, 2, 13);
        let p = pool();

        let mut exact = Array2::zeros((n, 2));
        NegativeGradient::BarnesHut { theta: 0.0 }
            .compute(&emb.view(), &emb.view(), &mut exact, 1.0, &p)
            .unwrap();
        let mut approx = Array2::zeros((n, 2));
        NegativeGradient::BarnesHut { theta: 0.5 }
            .compute(&emb.view(), &emb.view(), &mut approx, 1.0, &p)
            .unwrap();

        let num: f64 = exact
            .iter()
            .zip(approx.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        let den: f64 = exact.iter().map(|a| a * a).sum();
        assert!(
            (num / den).sqrt() < 0.05,
            "relative L2 error {} too large",
            (num / den).sqrt()
        );
    }

    #[test]
    fn coincident_embedding_has_zero_gradient() {
        let n = 20;
        let emb = Array2::zeros((n, 2));
        let p = dense_uniform_affinities(n);
        let mut grad = Array2::zeros((n, 2));

        let z = NegativeGradient::BarnesHut { theta: 0.5 }
            .compute(&emb.view(), &emb.view(), &mut grad, 1.0, &pool())
            .unwrap();
        positive_gradient(&p, &emb.view(), &emb.view(), &mut grad, 1.0, 1.0, false, &pool());

        assert!(grad.iter().all(|&g| g == 0.0));
        // every pair interacts at distance zero
        assert!((z - (n * (n - 1)) as f64).abs() < 1e-9);
    }
}
