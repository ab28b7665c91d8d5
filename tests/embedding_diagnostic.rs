//! Diagnostic tests for the embedding pipeline.
//!
//! Run with:   cargo test --release --test embedding_diagnostic -- --nocapture
//!
//! These tests embed synthetic Gaussian blobs with both repulsion engines,
//! print per-checkpoint KL traces so convergence behaviour is visible, and
//! assert that well-separated clusters stay separated in the embedding.

use std::cell::RefCell;

use daedalus::{
    FittedTsne, IterationDecision, NegativeGradientMethod, Observer, Tsne, TsneOptions,
};
use ndarray::{Array2, ArrayView2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Isotropic Gaussian blobs around the given centers; returns the stacked
/// data and a label per row.
fn gaussian_blobs(
    centers: &[Vec<f64>],
    n_per_blob: usize,
    std: f64,
    rng: &mut ChaCha8Rng,
) -> (Array2<f64>, Vec<usize>) {
    let dim = centers[0].len();
    let n = centers.len() * n_per_blob;
    let mut data = Array2::zeros((n, dim));
    let mut labels = Vec::with_capacity(n);
    for (c, center) in centers.iter().enumerate() {
        for i in 0..n_per_blob {
            let row = c * n_per_blob + i;
            for a in 0..dim {
                let noise: f64 = rng.sample(StandardNormal);
                data[[row, a]] = center[a] + std * noise;
            }
            labels.push(c);
        }
    }
    (data, labels)
}

/// Mean silhouette coefficient of an embedding under known labels.
fn silhouette(embedding: &ArrayView2<'_, f64>, labels: &[usize]) -> f64 {
    let n = embedding.nrows();
    let n_clusters = labels.iter().max().unwrap() + 1;
    let mut total = 0.0;
    for i in 0..n {
        let mut dist_sum = vec![0.0; n_clusters];
        let mut count = vec![0usize; n_clusters];
        for j in 0..n {
            if i == j {
                continue;
            }
            let mut d2 = 0.0;
            for a in 0..embedding.ncols() {
                let diff = embedding[[i, a]] - embedding[[j, a]];
                d2 += diff * diff;
            }
            dist_sum[labels[j]] += d2.sqrt();
            count[labels[j]] += 1;
        }
        let own = labels[i];
        let a = dist_sum[own] / count[own].max(1) as f64;
        let b = (0..n_clusters)
            .filter(|&c| c != own && count[c] > 0)
            .map(|c| dist_sum[c] / count[c] as f64)
            .fold(f64::INFINITY, f64::min);
        total += (b - a) / a.max(b);
    }
    total / n as f64
}

fn relative_l2(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> f64 {
    let num: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    let den: f64 = a.iter().map(|x| x * x).sum();
    (num / den).sqrt()
}

fn print_run(label: &str, fitted: &FittedTsne, trace: &[(usize, f64)]) {
    eprintln!("\n┌── {label}");
    eprintln!("│  iterations: {}", fitted.iterations());
    eprintln!("│  final kl:   {:.6}", fitted.kl_divergence());
    eprintln!("│  kl trace ({} checkpoints):", trace.len());
    for &(iter, kl) in trace {
        eprintln!("│    [{iter:>4}] {kl:.6}");
    }
    eprintln!("└──");
}

/// Observer that records (iteration, kl) checkpoints.
fn tracing_observer(trace: &RefCell<Vec<(usize, f64)>>) -> Box<dyn Observer + '_> {
    Box::new(|iteration: usize, kl: f64, _: &ArrayView2<'_, f64>| {
        trace.borrow_mut().push((iteration, kl));
        IterationDecision::Continue
    })
}

fn blob_options(method: NegativeGradientMethod, n_iter: usize) -> TsneOptions {
    TsneOptions {
        perplexity: 30.0,
        n_iter,
        early_exaggeration_iter: n_iter.min(250),
        negative_gradient_method: method,
        n_jobs: 2,
        random_state: Some(1234),
        ..TsneOptions::default()
    }
}

// ─────────────────────────────────────────────────────────────
//  Test: two Gaussian blobs in R^50 — Barnes-Hut engine
// ─────────────────────────────────────────────────────────────

#[test]
fn two_blobs_separate_with_barnes_hut() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let centers = vec![vec![0.0; 50], {
        let mut c = vec![0.0; 50];
        c.iter_mut().for_each(|v| *v = 10.0 / (50f64).sqrt());
        c
    }];
    let (data, labels) = gaussian_blobs(&centers, 150, 1.0, &mut rng);

    let tsne = Tsne::new(blob_options(NegativeGradientMethod::BarnesHut, 500)).unwrap();
    let trace = RefCell::new(Vec::new());
    let mut observers = vec![tracing_observer(&trace)];
    let fitted = tsne.fit_with(&data.view(), None, None, &mut observers).unwrap();
    drop(observers);

    let trace = trace.into_inner();
    print_run("two blobs R^50, Barnes-Hut", &fitted, &trace);

    assert!(fitted.kl_divergence().is_finite());
    // KL after exaggeration ends must not exceed the first checkpoint of
    // the normal phase.
    let post: Vec<f64> =
        trace.iter().filter(|(it, _)| *it > 250).map(|&(_, kl)| kl).collect();
    assert!(post.len() >= 2);
    assert!(
        post.last().unwrap() <= post.first().unwrap(),
        "kl should not increase after exaggeration: {post:?}"
    );

    let score = silhouette(&fitted.embedding(), &labels);
    eprintln!("  silhouette: {score:.3}");
    assert!(score > 0.5, "silhouette {score} too low for separated blobs");
}

// ─────────────────────────────────────────────────────────────
//  Test: same blobs — FFT interpolation engine
// ─────────────────────────────────────────────────────────────

#[test]
fn two_blobs_separate_with_fft() {
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let centers = vec![vec![0.0; 30], vec![2.0; 30]];
    let (data, labels) = gaussian_blobs(&centers, 125, 0.5, &mut rng);

    let tsne =
        Tsne::new(blob_options(NegativeGradientMethod::InterpolationFft, 300)).unwrap();
    let trace = RefCell::new(Vec::new());
    let mut observers = vec![tracing_observer(&trace)];
    let fitted = tsne.fit_with(&data.view(), None, None, &mut observers).unwrap();
    drop(observers);

    print_run("two blobs R^30, FFT", &fitted, &trace.into_inner());

    assert!(fitted.kl_divergence().is_finite());
    let score = silhouette(&fitted.embedding(), &labels);
    eprintln!("  silhouette: {score:.3}");
    assert!(score > 0.5, "silhouette {score} too low for separated blobs");
}

// ─────────────────────────────────────────────────────────────
//  Test: exact vs default theta
// ─────────────────────────────────────────────────────────────

/// theta = 0 degenerates Barnes-Hut to the exact O(N^2) sum; the default
/// approximation must land on an embedding of the same quality.
#[test]
fn default_theta_tracks_the_exact_sum() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let centers = vec![vec![0.0; 10], vec![4.0; 10]];
    let (data, labels) = gaussian_blobs(&centers, 100, 0.8, &mut rng);

    let mut exact_opts = blob_options(NegativeGradientMethod::BarnesHut, 300);
    exact_opts.theta = 0.0;
    let exact = Tsne::new(exact_opts).unwrap().fit(&data.view()).unwrap();

    let approx = Tsne::new(blob_options(NegativeGradientMethod::BarnesHut, 300))
        .unwrap()
        .fit(&data.view())
        .unwrap();

    let drift = relative_l2(&exact.embedding(), &approx.embedding());
    let kl_drift = (exact.kl_divergence() - approx.kl_divergence()).abs()
        / exact.kl_divergence();
    eprintln!("\n  theta drift: embedding L2 {drift:.4}, kl {kl_drift:.4}");

    assert!(kl_drift < 0.05, "kl divergence drift {kl_drift} too large");
    let s_exact = silhouette(&exact.embedding(), &labels);
    let s_approx = silhouette(&approx.embedding(), &labels);
    assert!(s_exact > 0.5 && s_approx > 0.5, "{s_exact} / {s_approx}");
}

// ─────────────────────────────────────────────────────────────
//  Test: transform onto a frozen embedding
// ─────────────────────────────────────────────────────────────

#[test]
fn transform_lands_held_out_points_in_their_cluster() {
    let mut rng = ChaCha8Rng::seed_from_u64(10);
    let centers = vec![vec![0.0; 20], vec![5.0; 20]];
    let (train, train_labels) = gaussian_blobs(&centers, 120, 0.7, &mut rng);
    let (held_out, held_labels) = gaussian_blobs(&centers, 20, 0.7, &mut rng);

    let tsne = Tsne::new(blob_options(NegativeGradientMethod::BarnesHut, 400)).unwrap();
    let fitted = tsne.fit(&train.view()).unwrap();
    let new_embedding = fitted.transform(&held_out.view()).unwrap();

    // Reference cluster centroids in embedding space.
    let emb = fitted.embedding();
    let mut centroids = [[0.0f64; 2]; 2];
    let mut counts = [0usize; 2];
    for (i, &label) in train_labels.iter().enumerate() {
        centroids[label][0] += emb[[i, 0]];
        centroids[label][1] += emb[[i, 1]];
        counts[label] += 1;
    }
    for c in 0..2 {
        centroids[c][0] /= counts[c] as f64;
        centroids[c][1] /= counts[c] as f64;
    }

    let mut correct = 0;
    for (i, &label) in held_labels.iter().enumerate() {
        let d = |c: usize| {
            let dx = new_embedding[[i, 0]] - centroids[c][0];
            let dy = new_embedding[[i, 1]] - centroids[c][1];
            dx * dx + dy * dy
        };
        if d(label) < d(1 - label) {
            correct += 1;
        }
    }
    eprintln!("\n  transform: {correct}/{} held-out points placed correctly", held_labels.len());
    assert!(
        correct * 100 >= held_labels.len() * 90,
        "only {correct}/{} held-out points near their own cluster",
        held_labels.len()
    );
}

// ─────────────────────────────────────────────────────────────
//  Test: 1-D embedding through the FFT engine
// ─────────────────────────────────────────────────────────────

#[test]
fn one_dimensional_fft_embedding_separates_blobs() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let centers = vec![vec![0.0; 15], vec![6.0; 15]];
    let (data, labels) = gaussian_blobs(&centers, 100, 0.6, &mut rng);

    let mut opts = blob_options(NegativeGradientMethod::InterpolationFft, 300);
    opts.n_components = 1;
    let fitted = Tsne::new(opts).unwrap().fit(&data.view()).unwrap();

    assert!(fitted.kl_divergence().is_finite());
    let emb = fitted.embedding();
    let mean = |label: usize| {
        let vals: Vec<f64> = labels
            .iter()
            .enumerate()
            .filter(|&(_, &l)| l == label)
            .map(|(i, _)| emb[[i, 0]])
            .collect();
        let m: f64 = vals.iter().sum::<f64>() / vals.len() as f64;
        let var: f64 =
            vals.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / vals.len() as f64;
        (m, var.sqrt())
    };
    let (m0, s0) = mean(0);
    let (m1, s1) = mean(1);
    eprintln!("\n  1-D blobs: {m0:.3}±{s0:.3} vs {m1:.3}±{s1:.3}");
    assert!(
        (m0 - m1).abs() > 2.0 * (s0 + s1),
        "1-D clusters overlap: {m0}±{s0} vs {m1}±{s1}"
    );
}
