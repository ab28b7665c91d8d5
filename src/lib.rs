//! Barnes-Hut and FFT-interpolation t-SNE.
//!
//! High-dimensional points come in, a 1-D or 2-D embedding that preserves
//! local neighborhoods comes out. Pairwise distances are calibrated into a
//! sparse affinity matrix per point (perplexity search), then a momentum
//! descent balances sparse attraction against an approximated dense
//! repulsion, computed either through a quadtree (Barnes-Hut) or through
//! polynomial interpolation and FFT convolution.
//!
//! ```no_run
//! use daedalus::{Tsne, TsneOptions};
//! use ndarray::Array2;
//!
//! let x = Array2::<f64>::zeros((1000, 50));
//! let tsne = Tsne::new(TsneOptions { perplexity: 30.0, ..Default::default() })?;
//! let fitted = tsne.fit(&x.view())?;
//! let embedding = fitted.embedding();
//! # Ok::<(), daedalus::DaedalusError>(())
//! ```

pub mod affinity;
pub mod fft;
pub mod gradients;
pub mod neighbors;
pub mod optimizer;
pub mod quadtree;
pub mod tsne;
pub mod types;

pub use crate::neighbors::NearestNeighbors;
pub use crate::tsne::{FittedTsne, Tsne};
pub use crate::types::{
    DaedalusError, IterationDecision, NegativeGradientMethod, NeighborMethod, Observer,
    Result, TsneOptions,
};
