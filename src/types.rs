//! Shared types: the crate error, run options, and the observer capability.

use ndarray::ArrayView2;
use thiserror::Error;

/// Guard added to every denominator that could reach zero.
pub const EPSILON: f64 = f64::EPSILON;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DaedalusError>;

/// Errors surfaced by `fit` / `transform`.
///
/// Parallel workers never panic; anything that goes wrong inside a kernel is
/// carried back to the coordinator and returned as one of these.
#[derive(Debug, Error)]
pub enum DaedalusError {
    /// Malformed caller data: empty or non-finite input, shape mismatches,
    /// a perplexity the dataset cannot support.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The descent produced a non-finite gradient or KL divergence.
    #[error("numerical failure at iteration {iteration}: {message}")]
    NumericalFailure { iteration: usize, message: String },

    /// An allocation or thread-pool setup failed.
    #[error("resource failure: {0}")]
    ResourceFailure(String),

    /// An option combination outside the allowed set.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Which approximation computes the repulsive forces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegativeGradientMethod {
    /// Quadtree summarization, O(N log N). Works for any `dof`.
    BarnesHut,
    /// Polynomial interpolation onto a grid convolved via FFT, O(N).
    /// Requires `dof == 1`.
    InterpolationFft,
}

/// How nearest neighbors are obtained when none are supplied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborMethod {
    /// Built-in parallel brute-force search.
    Exact,
    /// An approximate index is an external collaborator; selecting this
    /// without precomputed neighbors is a configuration error.
    Approx,
}

/// Options for a t-SNE run.
///
/// Plain struct with public fields; construct with struct-update syntax
/// against `Default` and pass to [`Tsne::new`](crate::Tsne::new), which
/// validates the combination once.
#[derive(Clone, Debug)]
pub struct TsneOptions {
    /// Target exp-entropy of each affinity row.
    pub perplexity: f64,
    /// Step size. `None` resolves to `max(200, N / 12)` at fit time.
    pub learning_rate: Option<f64>,
    /// Total iterations, early-exaggeration phase included.
    pub n_iter: usize,
    /// Iterations spent with exaggerated affinities.
    pub early_exaggeration_iter: usize,
    /// Multiplier applied to P during the early phase.
    pub early_exaggeration: f64,
    /// Momentum during the early phase.
    pub initial_momentum: f64,
    /// Momentum after the early phase ends.
    pub final_momentum: f64,
    /// Embedding dimensionality, 1 or 2.
    pub n_components: usize,
    pub negative_gradient_method: NegativeGradientMethod,
    /// Barnes-Hut acceptance threshold; 0 degenerates to the exact sum.
    pub theta: f64,
    /// Lagrange nodes per grid cell on the FFT path.
    pub n_interpolation_points: usize,
    /// Lower bound on grid cells per axis.
    pub min_num_intervals: usize,
    /// Embedding-space length covered by one grid cell.
    pub ints_per_interval: f64,
    /// Degrees of freedom of the Student-t kernel.
    pub dof: f64,
    /// Thread count: positive = exact, 0 = all cores, negative = all but |n|.
    pub n_jobs: isize,
    /// Observers run every this many iterations.
    pub callbacks_every_iters: usize,
    pub neighbors: NeighborMethod,
    /// Seed for the random initialization; `None` draws from entropy.
    pub random_state: Option<u64>,
}

impl Default for TsneOptions {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            learning_rate: None,
            n_iter: 750,
            early_exaggeration_iter: 250,
            early_exaggeration: 12.0,
            initial_momentum: 0.5,
            final_momentum: 0.8,
            n_components: 2,
            negative_gradient_method: NegativeGradientMethod::BarnesHut,
            theta: 0.5,
            n_interpolation_points: 3,
            min_num_intervals: 10,
            ints_per_interval: 1.0,
            dof: 1.0,
            n_jobs: 0,
            callbacks_every_iters: 50,
            neighbors: NeighborMethod::Exact,
            random_state: None,
        }
    }
}

/// Verdict returned by an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationDecision {
    Continue,
    Stop,
}

/// Capability handed to the optimizer to watch or steer a run.
///
/// Called at iteration boundaries with the live embedding in a consistent
/// post-step state; copy it out if you need to keep it. Observers are
/// chained in order and the chain short-circuits on the first `Stop`.
pub trait Observer {
    fn on_iteration(
        &mut self,
        iteration: usize,
        kl_divergence: f64,
        embedding: &ArrayView2<'_, f64>,
    ) -> IterationDecision;
}

/// Blanket impl so plain closures can be passed as observers.
impl<F> Observer for F
where
    F: FnMut(usize, f64, &ArrayView2<'_, f64>) -> IterationDecision,
{
    fn on_iteration(
        &mut self,
        iteration: usize,
        kl_divergence: f64,
        embedding: &ArrayView2<'_, f64>,
    ) -> IterationDecision {
        self(iteration, kl_divergence, embedding)
    }
}
