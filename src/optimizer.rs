//! Momentum gradient descent with per-coordinate gain adaptation.
//!
//! The descent runs in phases (early exaggeration, then the normal
//! schedule); the update vector and gains carry across the phase switch.
//! Observers are dispatched at iteration boundaries with the live
//! embedding in a consistent post-step state, and the chain short-circuits
//! on the first `Stop`.

use ndarray::{Array2, ArrayView2, Axis, Zip};
use sprs::CsMat;

use crate::gradients::{positive_gradient, NegativeGradient};
use crate::types::{DaedalusError, IterationDecision, Observer, Result, EPSILON};

const MIN_GAIN: f64 = 0.01;

/// One stretch of iterations with fixed momentum and exaggeration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Phase {
    pub n_iter: usize,
    pub momentum: f64,
    pub exaggeration: f64,
}

/// Descent parameters shared by both phases.
pub(crate) struct DescentConfig<'a> {
    pub learning_rate: f64,
    pub dof: f64,
    pub callbacks_every_iters: usize,
    /// Subtract column means after each step. Off during `transform`,
    /// which must keep the reference frame fixed.
    pub recenter: bool,
    /// Frozen reference points (`transform` mode): they attract through
    /// the affinity columns and repel as part of the source field, but
    /// never receive gradient.
    pub reference: Option<ArrayView2<'a, f64>>,
}

#[derive(Clone, Copy, Debug)]
pub struct RunStats {
    /// Iterations actually executed; smaller than requested when an
    /// observer stopped the run.
    pub iterations: usize,
    /// KL divergence at the last evaluation point.
    pub kl_divergence: f64,
}

/// Drive the embedding through every phase. The embedding is mutated in
/// place; gradient, update and gain buffers live for the whole run.
pub(crate) fn gradient_descent(
    embedding: &mut Array2<f64>,
    affinities: &CsMat<f64>,
    engine: &mut NegativeGradient,
    phases: &[Phase],
    cfg: &DescentConfig<'_>,
    pool: &rayon::ThreadPool,
    observers: &mut [Box<dyn Observer + '_>],
) -> Result<RunStats> {
    let (n, d) = embedding.dim();
    let total: usize = phases.iter().map(|p| p.n_iter).sum();

    let mut gradient = Array2::<f64>::zeros((n, d));
    let mut update = Array2::<f64>::zeros((n, d));
    let mut gains = Array2::<f64>::from_elem((n, d), 1.0);
    let mut iteration = 0usize;
    let mut last_kl = f64::NAN;

    // In transform mode the source field is reference + moving points,
    // rebuilt each iteration into a single buffer.
    let n_ref = cfg.reference.map_or(0, |r| r.nrows());
    let mut sources = cfg.reference.map(|r| {
        let mut buf = Array2::<f64>::zeros((n_ref + n, d));
        buf.slice_mut(ndarray::s![..n_ref, ..]).assign(&r);
        buf
    });

    for phase in phases {
        log::debug!(
            "descent phase: {} iterations, momentum {}, exaggeration {}",
            phase.n_iter,
            phase.momentum,
            phase.exaggeration
        );
        for _ in 0..phase.n_iter {
            let completing = iteration + 1;
            let observers_due = !observers.is_empty()
                && cfg.callbacks_every_iters > 0
                && completing % cfg.callbacks_every_iters == 0;
            let eval_error = observers_due || completing == total;

            gradient.fill(0.0);

            // Repulsion first: it owns the buffer and normalizes by Z.
            let z = match &mut sources {
                Some(buf) => {
                    buf.slice_mut(ndarray::s![n_ref.., ..]).assign(embedding);
                    engine.compute(&buf.view(), &embedding.view(), &mut gradient, cfg.dof, pool)?
                }
                None => {
                    let view = embedding.view();
                    engine.compute(&view, &view, &mut gradient, cfg.dof, pool)?
                }
            };

            let stats = match cfg.reference {
                Some(reference) => positive_gradient(
                    affinities,
                    &embedding.view(),
                    &reference,
                    &mut gradient,
                    cfg.dof,
                    phase.exaggeration,
                    eval_error,
                    pool,
                ),
                None => {
                    let view = embedding.view();
                    positive_gradient(
                        affinities,
                        &view,
                        &view,
                        &mut gradient,
                        cfg.dof,
                        phase.exaggeration,
                        eval_error,
                        pool,
                    )
                }
            };

            gradient.mapv_inplace(|g| 4.0 * g);

            if gradient.iter().any(|g| !g.is_finite()) {
                return Err(DaedalusError::NumericalFailure {
                    iteration: completing,
                    message: "gradient contains NaN or Inf".into(),
                });
            }

            // Gains adapt on the sign agreement between the fresh gradient
            // and the previous update, floored at MIN_GAIN.
            Zip::from(&mut gains).and(&update).and(&gradient).for_each(|gain, &u, &g| {
                *gain = if (g > 0.0) == (u > 0.0) { *gain * 0.8 } else { *gain + 0.2 };
                if *gain < MIN_GAIN {
                    *gain = MIN_GAIN;
                }
            });
            Zip::from(&mut update).and(&gains).and(&gradient).for_each(|u, &gain, &g| {
                *u = phase.momentum * *u - cfg.learning_rate * gain * g;
            });
            *embedding += &update;

            if cfg.recenter {
                if let Some(mean) = embedding.mean_axis(Axis(0)) {
                    *embedding -= &mean;
                }
            }

            iteration = completing;

            if eval_error {
                last_kl = stats.unnormalized_kl + stats.sum_p * (z + EPSILON).ln();
                if !last_kl.is_finite() {
                    return Err(DaedalusError::NumericalFailure {
                        iteration,
                        message: format!("KL divergence is {last_kl}"),
                    });
                }
                log::debug!("iteration {iteration}: kl = {last_kl:.6}");
            }

            if observers_due {
                let view = embedding.view();
                for observer in observers.iter_mut() {
                    if observer.on_iteration(iteration, last_kl, &view)
                        == IterationDecision::Stop
                    {
                        log::info!("observer stopped the run at iteration {iteration}");
                        return Ok(RunStats { iterations: iteration, kl_divergence: last_kl });
                    }
                }
            }
        }
    }

    Ok(RunStats { iterations: iteration, kl_divergence: last_kl })
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
