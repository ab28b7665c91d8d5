//! Public facade: validate options, wire neighbors into affinities, run the
//! descent, and keep enough state around to embed new points later.

use ndarray::{Array2, ArrayView2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::affinity::{
    conditional_affinities, normalize_total, symmetrize, PERPLEXITY_TOLERANCE,
};
use crate::fft::{Fft1D, Fft2D, FftParams};
use crate::gradients::NegativeGradient;
use crate::neighbors::{cross_neighbors, exact_neighbors, NearestNeighbors};
use crate::optimizer::{gradient_descent, DescentConfig, Phase};
use crate::types::{
    DaedalusError, NegativeGradientMethod, NeighborMethod, Observer, Result, TsneOptions,
};

/// t-SNE runner. Construct once from validated options, then call
/// [`fit`](Tsne::fit) per dataset.
pub struct Tsne {
    options: TsneOptions,
}

impl Tsne {
    pub fn new(options: TsneOptions) -> Result<Self> {
        validate_options(&options)?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &TsneOptions {
        &self.options
    }

    /// Embed `x` (N x D) with neighbors found by the built-in exact search
    /// and a seeded random initialization.
    pub fn fit(&self, x: &ArrayView2<'_, f64>) -> Result<FittedTsne> {
        self.fit_with(x, None, None, &mut [])
    }

    /// Embed `x`, optionally with precomputed neighbors (required for
    /// [`NeighborMethod::Approx`]), an initial embedding, and a chain of
    /// observers.
    pub fn fit_with(
        &self,
        x: &ArrayView2<'_, f64>,
        neighbors: Option<NearestNeighbors>,
        init: Option<Array2<f64>>,
        observers: &mut [Box<dyn Observer + '_>],
    ) -> Result<FittedTsne> {
        let options = &self.options;
        let n = x.nrows();
        let d = options.n_components;
        validate_data(x)?;
        if let Some(init) = &init {
            if init.dim() != (n, d) {
                return Err(DaedalusError::InvalidInput(format!(
                    "init shape {:?} does not match ({n}, {d})",
                    init.dim()
                )));
            }
            if init.iter().any(|v| !v.is_finite()) {
                return Err(DaedalusError::InvalidInput(
                    "init contains non-finite values".into(),
                ));
            }
        }

        // A single point has nothing to optimize against.
        if n == 1 {
            let embedding = init.unwrap_or_else(|| Array2::zeros((1, d)));
            return Ok(FittedTsne {
                embedding,
                data: x.to_owned(),
                options: options.clone(),
                iterations: 0,
                kl_divergence: 0.0,
            });
        }

        if options.perplexity * 3.0 >= n as f64 {
            return Err(DaedalusError::InvalidInput(format!(
                "perplexity {} requires at least {} points, got {n}",
                options.perplexity,
                (options.perplexity * 3.0).ceil() as usize + 1
            )));
        }

        let pool = build_pool(options.n_jobs)?;
        log::info!(
            "fitting {n} points into {d} dimensions ({:?}, perplexity {})",
            options.negative_gradient_method,
            options.perplexity
        );

        let neighbors = match neighbors {
            Some(nn) => {
                if nn.indices.nrows() != n || nn.indices.dim() != nn.distances.dim() {
                    return Err(DaedalusError::InvalidInput(format!(
                        "neighbor shapes {:?} / {:?} do not match {n} input rows",
                        nn.indices.dim(),
                        nn.distances.dim()
                    )));
                }
                nn
            }
            None => match options.neighbors {
                NeighborMethod::Exact => {
                    let k = neighbor_count(options.perplexity, n - 1);
                    exact_neighbors(x, k, &pool)?
                }
                NeighborMethod::Approx => {
                    return Err(DaedalusError::Configuration(
                        "approximate neighbor search is delegated to an external index; \
                         pass its output as precomputed neighbors"
                            .into(),
                    ))
                }
            },
        };

        let squared = neighbors.distances.mapv(|v| v * v);
        let conditional = conditional_affinities(
            &squared.view(),
            &neighbors.indices.view(),
            n,
            options.perplexity,
            PERPLEXITY_TOLERANCE,
            true,
            &pool,
        )?;
        let affinities = symmetrize(&conditional);

        let mut embedding =
            init.unwrap_or_else(|| random_init(n, d, options.random_state));
        let mut engine = negative_engine(options);
        let learning_rate = resolve_learning_rate(options, n);

        let early = options.early_exaggeration_iter.min(options.n_iter);
        let phases = [
            Phase {
                n_iter: early,
                momentum: options.initial_momentum,
                exaggeration: options.early_exaggeration,
            },
            Phase {
                n_iter: options.n_iter - early,
                momentum: options.final_momentum,
                exaggeration: 1.0,
            },
        ];
        let cfg = DescentConfig {
            learning_rate,
            dof: options.dof,
            callbacks_every_iters: options.callbacks_every_iters,
            recenter: true,
            reference: None,
        };
        let stats = gradient_descent(
            &mut embedding,
            &affinities,
            &mut engine,
            &phases,
            &cfg,
            &pool,
            observers,
        )?;
        log::info!(
            "finished after {} iterations, kl = {:.6}",
            stats.iterations,
            stats.kl_divergence
        );

        Ok(FittedTsne {
            embedding,
            data: x.to_owned(),
            options: options.clone(),
            iterations: stats.iterations,
            kl_divergence: stats.kl_divergence,
        })
    }
}

/// A finished embedding plus the state needed to place new points into it.
pub struct FittedTsne {
    embedding: Array2<f64>,
    data: Array2<f64>,
    options: TsneOptions,
    iterations: usize,
    kl_divergence: f64,
}

impl FittedTsne {
    pub fn embedding(&self) -> ArrayView2<'_, f64> {
        self.embedding.view()
    }

    pub fn into_embedding(self) -> Array2<f64> {
        self.embedding
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn kl_divergence(&self) -> f64 {
        self.kl_divergence
    }

    /// Optimize new rows against the frozen reference embedding.
    pub fn transform(&self, x_new: &ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.transform_with(x_new, &mut [])
    }

    /// Like [`transform`](Self::transform) with an observer chain.
    ///
    /// New points attract toward their calibrated reference neighbors and
    /// repel against reference and new points alike; the reference never
    /// moves and no recentering is applied, so the frame stays put.
    pub fn transform_with(
        &self,
        x_new: &ArrayView2<'_, f64>,
        observers: &mut [Box<dyn Observer + '_>],
    ) -> Result<Array2<f64>> {
        let options = &self.options;
        let m = x_new.nrows();
        let n_ref = self.data.nrows();
        let d = options.n_components;
        validate_data(x_new)?;
        if x_new.ncols() != self.data.ncols() {
            return Err(DaedalusError::InvalidInput(format!(
                "new rows have {} features, the fitted data has {}",
                x_new.ncols(),
                self.data.ncols()
            )));
        }
        if options.perplexity * 3.0 >= n_ref as f64 {
            return Err(DaedalusError::InvalidInput(format!(
                "perplexity {} too large for {n_ref} reference points",
                options.perplexity
            )));
        }

        let pool = build_pool(options.n_jobs)?;
        let k = neighbor_count(options.perplexity, n_ref);
        let neighbors = cross_neighbors(x_new, &self.data.view(), k, false, &pool)?;
        let squared = neighbors.distances.mapv(|v| v * v);
        let conditional = conditional_affinities(
            &squared.view(),
            &neighbors.indices.view(),
            n_ref,
            options.perplexity,
            PERPLEXITY_TOLERANCE,
            false,
            &pool,
        )?;

        // Start every new point at the affinity-weighted mean of its
        // reference neighbors, then let the descent refine locally.
        let mut embedding = Array2::<f64>::zeros((m, d));
        for (i, row) in conditional.outer_iterator().enumerate() {
            for (j, &p) in row.iter() {
                for a in 0..d {
                    embedding[[i, a]] += p * self.embedding[[j, a]];
                }
            }
        }

        let affinities = normalize_total(&conditional);
        let mut engine = negative_engine(options);
        let phases = [Phase {
            n_iter: options.n_iter,
            momentum: options.final_momentum,
            exaggeration: 1.0,
        }];
        let cfg = DescentConfig {
            learning_rate: resolve_learning_rate(options, m),
            dof: options.dof,
            callbacks_every_iters: options.callbacks_every_iters,
            recenter: false,
            reference: Some(self.embedding.view()),
        };
        gradient_descent(
            &mut embedding,
            &affinities,
            &mut engine,
            &phases,
            &cfg,
            &pool,
            observers,
        )?;
        Ok(embedding)
    }
}

// ─────────────────────────────────────────────────────────────
//  Wiring helpers
// ─────────────────────────────────────────────────────────────

fn validate_options(options: &TsneOptions) -> Result<()> {
    fn bad(msg: String) -> Result<()> {
        Err(DaedalusError::Configuration(msg))
    }
    if !(options.perplexity > 0.0) {
        return bad(format!("perplexity must be positive, got {}", options.perplexity));
    }
    if let Some(lr) = options.learning_rate {
        if !(lr > 0.0) {
            return bad(format!("learning_rate must be positive, got {lr}"));
        }
    }
    if options.early_exaggeration_iter > options.n_iter {
        return bad(format!(
            "early_exaggeration_iter {} exceeds n_iter {}",
            options.early_exaggeration_iter, options.n_iter
        ));
    }
    if !(options.early_exaggeration >= 1.0) {
        return bad(format!(
            "early_exaggeration must be at least 1, got {}",
            options.early_exaggeration
        ));
    }
    for (name, m) in [
        ("initial_momentum", options.initial_momentum),
        ("final_momentum", options.final_momentum),
    ] {
        if !(0.0..1.0).contains(&m) {
            return bad(format!("{name} must lie in [0, 1), got {m}"));
        }
    }
    if options.n_components == 0 || options.n_components > 2 {
        return bad(format!(
            "n_components must be 1 or 2, got {}",
            options.n_components
        ));
    }
    if !(options.theta >= 0.0) {
        return bad(format!("theta must be nonnegative, got {}", options.theta));
    }
    if !(options.dof > 0.0) {
        return bad(format!("dof must be positive, got {}", options.dof));
    }
    if options.negative_gradient_method == NegativeGradientMethod::InterpolationFft {
        if options.dof != 1.0 {
            return bad(format!(
                "the FFT gradient supports dof = 1 only, got {}; use BarnesHut",
                options.dof
            ));
        }
        if options.n_interpolation_points == 0 {
            return bad("n_interpolation_points must be at least 1".into());
        }
        if options.min_num_intervals == 0 {
            return bad("min_num_intervals must be at least 1".into());
        }
        if !(options.ints_per_interval > 0.0) {
            return bad(format!(
                "ints_per_interval must be positive, got {}",
                options.ints_per_interval
            ));
        }
    }
    Ok(())
}

fn validate_data(x: &ArrayView2<'_, f64>) -> Result<()> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(DaedalusError::InvalidInput("input is empty".into()));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(DaedalusError::InvalidInput(
            "input contains non-finite values".into(),
        ));
    }
    Ok(())
}

/// Small-variance Gaussian start, seeded for reproducibility when a
/// random state is given.
fn random_init(n: usize, d: usize, seed: Option<u64>) -> Array2<f64> {
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };
    Array2::from_shape_fn((n, d), |_| {
        let v: f64 = rng.sample(StandardNormal);
        1e-4 * v
    })
}

/// Standard heuristic: three neighbors per unit of perplexity, capped by
/// the candidate count.
fn neighbor_count(perplexity: f64, available: usize) -> usize {
    (((3.0 * perplexity) as usize).max(1)).min(available)
}

fn resolve_learning_rate(options: &TsneOptions, n: usize) -> f64 {
    options.learning_rate.unwrap_or_else(|| (n as f64 / 12.0).max(200.0))
}

fn negative_engine(options: &TsneOptions) -> NegativeGradient {
    match options.negative_gradient_method {
        NegativeGradientMethod::BarnesHut => {
            NegativeGradient::BarnesHut { theta: options.theta }
        }
        NegativeGradientMethod::InterpolationFft => {
            let params = FftParams {
                n_interpolation_points: options.n_interpolation_points,
                min_num_intervals: options.min_num_intervals,
                ints_per_interval: options.ints_per_interval,
            };
            if options.n_components == 1 {
                NegativeGradient::Fft1D(Fft1D::new(params))
            } else {
                NegativeGradient::Fft2D(Fft2D::new(params))
            }
        }
    }
}

/// Positive `n_jobs` pins the count, 0 takes every core, negative leaves
/// |n| cores free.
fn build_pool(n_jobs: isize) -> Result<rayon::ThreadPool> {
    let cores = std::thread::available_parallelism().map(|c| c.get()).unwrap_or(1);
    let threads = if n_jobs > 0 {
        n_jobs as usize
    } else {
        cores.saturating_sub(n_jobs.unsigned_abs()).max(1)
    };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| DaedalusError::ResourceFailure(format!("thread pool setup: {e}")))
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IterationDecision;
    use ndarray::Array2;
    use rand_chacha::ChaCha8Rng;

    fn options(n_iter: usize) -> TsneOptions {
        TsneOptions {
            perplexity: 10.0,
            n_iter,
            early_exaggeration_iter: n_iter / 3,
            n_jobs: 2,
            random_state: Some(42),
            ..TsneOptions::default()
        }
    }

    #[test]
    fn rejects_bad_configurations() {
        let bad = TsneOptions { perplexity: -1.0, ..TsneOptions::default() };
        assert!(matches!(Tsne::new(bad), Err(DaedalusError::Configuration(_))));

        let bad = TsneOptions { n_components: 3, ..TsneOptions::default() };
        assert!(matches!(Tsne::new(bad), Err(DaedalusError::Configuration(_))));

        let bad = TsneOptions {
            negative_gradient_method: NegativeGradientMethod::InterpolationFft,
            dof: 2.0,
            ..TsneOptions::default()
        };
        assert!(matches!(Tsne::new(bad), Err(DaedalusError::Configuration(_))));
    }

    #[test]
    fn rejects_bad_inputs() {
        let tsne = Tsne::new(options(50)).unwrap();

        let empty = Array2::<f64>::zeros((0, 4));
        assert!(matches!(
            tsne.fit(&empty.view()),
            Err(DaedalusError::InvalidInput(_))
        ));

        let mut x = Array2::<f64>::zeros((40, 4));
        x[[3, 1]] = f64::NAN;
        assert!(matches!(tsne.fit(&x.view()), Err(DaedalusError::InvalidInput(_))));

        // 20 points cannot support perplexity 10
        let x = Array2::<f64>::zeros((20, 4));
        assert!(matches!(tsne.fit(&x.view()), Err(DaedalusError::InvalidInput(_))));
    }

    #[test]
    fn approx_without_neighbors_is_a_configuration_error() {
        let opts = TsneOptions {
            neighbors: NeighborMethod::Approx,
            ..options(50)
        };
        let tsne = Tsne::new(opts).unwrap();
        let x = Array2::<f64>::zeros((100, 4));
        assert!(matches!(
            tsne.fit(&x.view()),
            Err(DaedalusError::Configuration(_))
        ));
    }

    #[test]
    fn single_point_returns_initialization() {
        let tsne = Tsne::new(options(50)).unwrap();
        let x = Array2::<f64>::zeros((1, 8));
        let init = ndarray::array![[3.0, -2.0]];
        let fitted = tsne
            .fit_with(&x.view(), None, Some(init.clone()), &mut [])
            .unwrap();
        assert_eq!(fitted.embedding(), init.view());
        assert_eq!(fitted.iterations(), 0);
    }

    #[test]
    fn fixed_seed_reproduces_the_embedding() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let x = Array2::from_shape_fn((80, 6), |_| rng.gen_range(-1.0..1.0));

        let opts = TsneOptions { n_jobs: 1, ..options(100) };
        let a = Tsne::new(opts.clone()).unwrap().fit(&x.view()).unwrap();
        let b = Tsne::new(opts).unwrap().fit(&x.view()).unwrap();
        assert_eq!(a.embedding(), b.embedding());
    }

    #[test]
    fn observer_stop_is_reflected_in_iterations() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let x = Array2::from_shape_fn((90, 6), |_| rng.gen_range(-1.0..1.0));
        let tsne = Tsne::new(options(400)).unwrap();
        let mut observers: Vec<Box<dyn Observer + '_>> = vec![Box::new(
            |iteration: usize, _: f64, _: &ArrayView2<'_, f64>| {
                if iteration >= 100 {
                    IterationDecision::Stop
                } else {
                    IterationDecision::Continue
                }
            },
        )];
        let fitted = tsne.fit_with(&x.view(), None, None, &mut observers).unwrap();
        assert_eq!(fitted.iterations(), 100);
    }
}
