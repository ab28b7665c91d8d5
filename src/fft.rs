//! FFT-accelerated repulsion.
//!
//! Point charges are interpolated onto a uniform grid with Lagrange
//! polynomials, convolved with the squared Cauchy kernel on a circulant
//! embedding of the grid, and interpolated back. The whole pass is O(N)
//! in the number of points, independent of how spread out the embedding
//! is. Both engines own their FFT planner so plans are cached across
//! iterations; the identity behind the charge decomposition holds only
//! for dof = 1, which the facade enforces.

use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::types::{DaedalusError, Result, EPSILON};

/// Grid-resolution knobs shared by the 1-D and 2-D engines.
#[derive(Clone, Copy, Debug)]
pub struct FftParams {
    /// Lagrange nodes per grid cell; accuracy improves at cubic cost.
    pub n_interpolation_points: usize,
    /// Lower bound on cells per axis.
    pub min_num_intervals: usize,
    /// Embedding-space length covered by one cell.
    pub ints_per_interval: f64,
}

impl Default for FftParams {
    fn default() -> Self {
        Self { n_interpolation_points: 3, min_num_intervals: 10, ints_per_interval: 1.0 }
    }
}

/// Squared Cauchy kernel (1 + d^2)^-2. Convolving charges {1, y, y^2}
/// with it yields both the gradient numerator and, through the
/// (1 + d^2) * K2 = K1 identity, the partition function.
#[inline]
fn squared_cauchy(dist_sq: f64) -> f64 {
    let v = 1.0 / (1.0 + dist_sq);
    v * v
}

fn complex_buffer(len: usize) -> Result<Vec<Complex64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        DaedalusError::ResourceFailure(format!("fft buffer of {len} bins: {e}"))
    })?;
    v.resize(len, Complex64::new(0.0, 0.0));
    Ok(v)
}

fn real_buffer(len: usize) -> Result<Vec<f64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        DaedalusError::ResourceFailure(format!("fft buffer of {len} bins: {e}"))
    })?;
    v.resize(len, 0.0);
    Ok(v)
}

// ─────────────────────────────────────────────────────────────
//  Lagrange interpolation
// ─────────────────────────────────────────────────────────────

/// Node positions (2k+1)/(2n) on the unit cell and the per-node basis
/// denominators prod_{j != k} (x_k - x_j).
fn lagrange_nodes(n: usize) -> (Vec<f64>, Vec<f64>) {
    let nodes: Vec<f64> = (0..n).map(|k| (2 * k + 1) as f64 / (2 * n) as f64).collect();
    let denoms = nodes
        .iter()
        .enumerate()
        .map(|(k, &xk)| {
            nodes
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != k)
                .map(|(_, &xj)| xk - xj)
                .product()
        })
        .collect();
    (nodes, denoms)
}

/// Basis values phi_k(y) for a point at relative cell position y in [0, 1].
fn lagrange_weights(nodes: &[f64], denoms: &[f64], y: f64, out: &mut [f64]) {
    for k in 0..nodes.len() {
        let mut num = 1.0;
        for (j, &xj) in nodes.iter().enumerate() {
            if j != k {
                num *= y - xj;
            }
        }
        out[k] = num / denoms[k];
    }
}

/// Cell index and relative position of a coordinate on the grid.
#[inline]
fn locate(y: f64, origin: f64, box_width: f64, n_boxes: usize) -> (usize, f64) {
    let cell = (((y - origin) / box_width) as usize).min(n_boxes - 1);
    let rel = ((y - origin - cell as f64 * box_width) / box_width).clamp(0.0, 1.0);
    (cell, rel)
}

struct Grid {
    origin: [f64; 2],
    box_width: f64,
    n_boxes: usize,
}

/// Equal cells per axis over the source bounding box; the longer span
/// wins in 2-D so cells stay square.
fn build_grid(sources: &ArrayView2<'_, f64>, dim: usize, params: &FftParams) -> Grid {
    let mut lo = [f64::MAX; 2];
    let mut hi = [f64::MIN; 2];
    for row in sources.rows() {
        for a in 0..dim {
            lo[a] = lo[a].min(row[a]);
            hi[a] = hi[a].max(row[a]);
        }
    }
    let mut span: f64 = 0.0;
    for a in 0..dim {
        span = span.max(hi[a] - lo[a]);
    }
    let span = span.max(1e-12);
    let n_boxes = ((span / params.ints_per_interval).ceil() as usize)
        .max(params.min_num_intervals);
    Grid {
        origin: [lo[0], lo[1]],
        box_width: span / n_boxes as f64,
        n_boxes,
    }
}

// ─────────────────────────────────────────────────────────────
//  1-D engine
// ─────────────────────────────────────────────────────────────

pub struct Fft1D {
    params: FftParams,
    planner: FftPlanner<f64>,
}

impl Fft1D {
    pub fn new(params: FftParams) -> Self {
        Self { params, planner: FftPlanner::new() }
    }

    pub fn compute(
        &mut self,
        sources: &ArrayView2<'_, f64>,
        targets: &ArrayView2<'_, f64>,
        gradient: &mut Array2<f64>,
        pool: &rayon::ThreadPool,
    ) -> Result<f64> {
        const N_TERMS: usize = 3;
        let n_interp = self.params.n_interpolation_points;
        let grid = build_grid(sources, 1, &self.params);
        let m = grid.n_boxes * n_interp;
        let n_fft = 2 * m;
        let h = grid.box_width / n_interp as f64;
        let (nodes, denoms) = lagrange_nodes(n_interp);

        // Spread charges {1, y, y^2} onto the grid.
        let mut w = real_buffer(m * N_TERMS)?;
        let mut phi = vec![0.0; n_interp];
        for row in sources.rows() {
            let y = row[0];
            let (cell, rel) = locate(y, grid.origin[0], grid.box_width, grid.n_boxes);
            lagrange_weights(&nodes, &denoms, rel, &mut phi);
            for k in 0..n_interp {
                let node = (cell * n_interp + k) * N_TERMS;
                let f = phi[k];
                w[node] += f;
                w[node + 1] += f * y;
                w[node + 2] += f * y * y;
            }
        }

        // Kernel on the doubly-sized circulant grid, transformed once.
        let fft = self.planner.plan_fft_forward(n_fft);
        let ifft = self.planner.plan_fft_inverse(n_fft);
        let mut kernel = complex_buffer(n_fft)?;
        for i in 0..=m {
            let d = i as f64 * h;
            let v = squared_cauchy(d * d);
            kernel[i] = Complex64::new(v, 0.0);
            if i > 0 && i < m {
                kernel[n_fft - i] = Complex64::new(v, 0.0);
            }
        }
        fft.process(&mut kernel);

        let pot = convolve_terms(&kernel, m, n_fft, N_TERMS, &fft, &ifft, pool, |buf, t| {
            for node in 0..m {
                buf[node] = Complex64::new(w[node * N_TERMS + t], 0.0);
            }
        })?;

        // Gather potentials and fold into Z and the gradient numerator.
        let mut z = 0.0;
        for (i, row) in targets.rows().into_iter().enumerate() {
            let y = row[0];
            let (cell, rel) = locate(y, grid.origin[0], grid.box_width, grid.n_boxes);
            lagrange_weights(&nodes, &denoms, rel, &mut phi);
            let mut p = [0.0; N_TERMS];
            for k in 0..n_interp {
                let node = cell * n_interp + k;
                for (t, pt) in p.iter_mut().enumerate() {
                    *pt += phi[k] * pot[t][node];
                }
            }
            z += (1.0 + y * y) * p[0] - 2.0 * y * p[1] + p[2];
            gradient[[i, 0]] = y * p[0] - p[1];
        }
        z -= targets.nrows() as f64;

        let norm = -1.0 / (z + EPSILON);
        gradient.mapv_inplace(|g| g * norm);
        Ok(z)
    }
}

// ─────────────────────────────────────────────────────────────
//  2-D engine
// ─────────────────────────────────────────────────────────────

pub struct Fft2D {
    params: FftParams,
    planner: FftPlanner<f64>,
}

impl Fft2D {
    pub fn new(params: FftParams) -> Self {
        Self { params, planner: FftPlanner::new() }
    }

    pub fn compute(
        &mut self,
        sources: &ArrayView2<'_, f64>,
        targets: &ArrayView2<'_, f64>,
        gradient: &mut Array2<f64>,
        pool: &rayon::ThreadPool,
    ) -> Result<f64> {
        const N_TERMS: usize = 4;
        let n_interp = self.params.n_interpolation_points;
        let grid = build_grid(sources, 2, &self.params);
        let m = grid.n_boxes * n_interp;
        let n_fft = 2 * m;
        let h = grid.box_width / n_interp as f64;
        let (nodes, denoms) = lagrange_nodes(n_interp);

        // Spread charges {1, y1, y2, y1^2 + y2^2}.
        let mut w = real_buffer(m * m * N_TERMS)?;
        let mut phi_x = vec![0.0; n_interp];
        let mut phi_y = vec![0.0; n_interp];
        for row in sources.rows() {
            let (y1, y2) = (row[0], row[1]);
            let (cx, rx) = locate(y1, grid.origin[0], grid.box_width, grid.n_boxes);
            let (cy, ry) = locate(y2, grid.origin[1], grid.box_width, grid.n_boxes);
            lagrange_weights(&nodes, &denoms, rx, &mut phi_x);
            lagrange_weights(&nodes, &denoms, ry, &mut phi_y);
            let r2 = y1 * y1 + y2 * y2;
            for kx in 0..n_interp {
                let ix = cx * n_interp + kx;
                for ky in 0..n_interp {
                    let iy = cy * n_interp + ky;
                    let f = phi_x[kx] * phi_y[ky];
                    let node = (ix * m + iy) * N_TERMS;
                    w[node] += f;
                    w[node + 1] += f * y1;
                    w[node + 2] += f * y2;
                    w[node + 3] += f * r2;
                }
            }
        }

        // Kernel symmetrized across the four quadrants of the circulant
        // embedding, transformed once.
        let fft = self.planner.plan_fft_forward(n_fft);
        let ifft = self.planner.plan_fft_inverse(n_fft);
        let mut kernel = complex_buffer(n_fft * n_fft)?;
        for i in 0..=m {
            for j in 0..=m {
                let di = i as f64 * h;
                let dj = j as f64 * h;
                let v = Complex64::new(squared_cauchy(di * di + dj * dj), 0.0);
                kernel[i * n_fft + j] = v;
                if i > 0 && i < m {
                    kernel[(n_fft - i) * n_fft + j] = v;
                }
                if j > 0 && j < m {
                    kernel[i * n_fft + (n_fft - j)] = v;
                }
                if i > 0 && i < m && j > 0 && j < m {
                    kernel[(n_fft - i) * n_fft + (n_fft - j)] = v;
                }
            }
        }
        fft_2d(&mut kernel, &fft, n_fft);

        let pot = convolve_terms_2d(&w, &kernel, m, n_fft, N_TERMS, &fft, &ifft, pool)?;

        // Gather and combine.
        let mut z = 0.0;
        for (i, row) in targets.rows().into_iter().enumerate() {
            let (y1, y2) = (row[0], row[1]);
            let (cx, rx) = locate(y1, grid.origin[0], grid.box_width, grid.n_boxes);
            let (cy, ry) = locate(y2, grid.origin[1], grid.box_width, grid.n_boxes);
            lagrange_weights(&nodes, &denoms, rx, &mut phi_x);
            lagrange_weights(&nodes, &denoms, ry, &mut phi_y);
            let mut p = [0.0; N_TERMS];
            for kx in 0..n_interp {
                let ix = cx * n_interp + kx;
                for ky in 0..n_interp {
                    let iy = cy * n_interp + ky;
                    let f = phi_x[kx] * phi_y[ky];
                    let node = ix * m + iy;
                    for (t, pt) in p.iter_mut().enumerate() {
                        *pt += f * pot[t][node];
                    }
                }
            }
            z += (1.0 + y1 * y1 + y2 * y2) * p[0] - 2.0 * (y1 * p[1] + y2 * p[2]) + p[3];
            gradient[[i, 0]] = y1 * p[0] - p[1];
            gradient[[i, 1]] = y2 * p[0] - p[2];
        }
        z -= targets.nrows() as f64;

        let norm = -1.0 / (z + EPSILON);
        gradient.mapv_inplace(|g| g * norm);
        Ok(z)
    }
}

// ─────────────────────────────────────────────────────────────
//  Shared transform plumbing
// ─────────────────────────────────────────────────────────────

fn transpose_square(data: &mut [Complex64], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Full 2-D transform as rows, transpose, rows, transpose. `plan.process`
/// runs one transform per `n`-sized chunk, covering all rows in one call.
fn fft_2d(data: &mut [Complex64], plan: &Arc<dyn Fft<f64>>, n: usize) {
    plan.process(data);
    transpose_square(data, n);
    plan.process(data);
    transpose_square(data, n);
}

/// Convolve every charge term with the transformed kernel, in parallel
/// over terms. The Hadamard product is a whole complex multiply into the
/// charge buffer; the kernel buffer is never written.
#[allow(clippy::too_many_arguments)]
fn convolve_terms<F>(
    kernel: &[Complex64],
    m: usize,
    n_fft: usize,
    n_terms: usize,
    fft: &Arc<dyn Fft<f64>>,
    ifft: &Arc<dyn Fft<f64>>,
    pool: &rayon::ThreadPool,
    fill: F,
) -> Result<Vec<Vec<f64>>>
where
    F: Fn(&mut [Complex64], usize) + Sync,
{
    pool.install(|| {
        (0..n_terms)
            .into_par_iter()
            .map(|t| {
                let mut buf = complex_buffer(n_fft)?;
                fill(&mut buf, t);
                fft.process(&mut buf);
                for (b, k) in buf.iter_mut().zip(kernel) {
                    *b *= *k;
                }
                ifft.process(&mut buf);
                let scale = 1.0 / n_fft as f64;
                Ok((0..m).map(|node| buf[node].re * scale).collect())
            })
            .collect()
    })
}

#[allow(clippy::too_many_arguments)]
fn convolve_terms_2d(
    w: &[f64],
    kernel: &[Complex64],
    m: usize,
    n_fft: usize,
    n_terms: usize,
    fft: &Arc<dyn Fft<f64>>,
    ifft: &Arc<dyn Fft<f64>>,
    pool: &rayon::ThreadPool,
) -> Result<Vec<Vec<f64>>> {
    pool.install(|| {
        (0..n_terms)
            .into_par_iter()
            .map(|t| {
                let mut buf = complex_buffer(n_fft * n_fft)?;
                for ix in 0..m {
                    for iy in 0..m {
                        buf[ix * n_fft + iy] =
                            Complex64::new(w[(ix * m + iy) * n_terms + t], 0.0);
                    }
                }
                fft_2d(&mut buf, fft, n_fft);
                for (b, k) in buf.iter_mut().zip(kernel) {
                    *b *= *k;
                }
                fft_2d(&mut buf, ifft, n_fft);
                let scale = 1.0 / (n_fft * n_fft) as f64;
                let mut pot = real_buffer(m * m)?;
                for ix in 0..m {
                    for iy in 0..m {
                        pot[ix * m + iy] = buf[ix * n_fft + iy].re * scale;
                    }
                }
                Ok(pot)
            })
            .collect()
    })
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
