//! Cyclic loess normalization.
//!
//! Removes intensity-dependent bias between reporter channels. Unlike a
//! single scaling factor, the loess approach fits a smooth curve of the
//! between-channel log-ratio (M) against average log-intensity (A) and
//! subtracts it, so distortions that vary with signal strength are
//! straightened out. Channels are adjusted pairwise and the whole cycle is
//! repeated until the panel converges on its consensus.
//!
//! # Algorithm
//!
//! All work happens in log2 space; missing cells are NaN and pass through
//! untouched.
//!
//! 1. For every channel pair (i, j), take the rows observed in both.
//! 2. Compute per-row M = log_i - log_j and A = (log_i + log_j) / 2.
//! 3. Fit a weighted local-linear curve m(A) with tricube weights over the
//!    nearest `span` fraction of points.
//! 4. Move the pair toward each other: log_i -= m/2, log_j += m/2.
//! 5. Repeat the full cycle `iterations` times.
//!
//! Pairs with fewer complete rows than `min_pairs` are skipped and counted.
//!
//! # Reference
//!
//! Ballman KV, Grill DE, Oberg AL, Therneau TM. Faster cyclic loess:
//! normalizing RNA arrays via linear models. Bioinformatics
//! 20(16):2778-2786 (2004).

use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Configuration for cyclic loess normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoessConfig {
    /// Fraction of points in each local fit (default: 0.7).
    pub span: f64,
    /// Full pairwise cycles to run (default: 3).
    pub iterations: usize,
    /// Minimum rows observed in both channels for a pair to be adjusted.
    pub min_pairs: usize,
}

impl Default for LoessConfig {
    fn default() -> Self {
        Self {
            span: 0.7,
            iterations: 3,
            min_pairs: 10,
        }
    }
}

impl LoessConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.span > 0.0 && self.span <= 1.0) {
            return Err(QuantError::Configuration(format!(
                "loess span must lie in (0, 1], got {}",
                self.span
            )));
        }
        if self.iterations == 0 {
            return Err(QuantError::Configuration(
                "loess iterations must be at least 1".to_string(),
            ));
        }
        if self.min_pairs < 2 {
            return Err(QuantError::Configuration(
                "loess min_pairs must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of cyclic loess normalization.
#[derive(Debug, Clone)]
pub struct LoessMatrix {
    matrix: ReporterMatrix,
    /// Channel pairs skipped per cycle for having too few complete rows.
    n_skipped_pairs: usize,
    /// Total channel pairs per cycle.
    n_pairs: usize,
}

impl LoessMatrix {
    #[inline]
    pub fn matrix(&self) -> &ReporterMatrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> ReporterMatrix {
        self.matrix
    }

    #[inline]
    pub fn n_skipped_pairs(&self) -> usize {
        self.n_skipped_pairs
    }

    #[inline]
    pub fn n_pairs(&self) -> usize {
        self.n_pairs
    }
}

/// Apply cyclic loess normalization with default parameters.
pub fn norm_loess(matrix: &ReporterMatrix) -> Result<LoessMatrix> {
    norm_loess_with_config(matrix, &LoessConfig::default())
}

/// Apply cyclic loess normalization with custom configuration.
pub fn norm_loess_with_config(
    matrix: &ReporterMatrix,
    config: &LoessConfig,
) -> Result<LoessMatrix> {
    config.validate()?;
    let n_rows = matrix.n_rows();
    let n_channels = matrix.n_channels();
    if n_rows == 0 || n_channels == 0 {
        return Err(QuantError::EmptyData(
            "cannot normalize an empty matrix".to_string(),
        ));
    }
    if n_channels < 2 {
        return Err(QuantError::Configuration(
            "cyclic loess requires at least 2 channels".to_string(),
        ));
    }

    let mut log = matrix.to_log2();
    let n_pairs = n_channels * (n_channels - 1) / 2;
    let mut n_skipped_pairs = 0usize;

    for cycle in 0..config.iterations {
        for i in 0..n_channels {
            for j in (i + 1)..n_channels {
                // rows observed in both channels
                let complete: Vec<usize> = (0..n_rows)
                    .filter(|&r| log[(r, i)].is_finite() && log[(r, j)].is_finite())
                    .collect();
                if complete.len() < config.min_pairs {
                    // the missing pattern never changes between cycles, so
                    // count and warn on the first one only
                    if cycle == 0 {
                        n_skipped_pairs += 1;
                        warn!(
                            "skipping loess for channels {} and {}: only {} complete rows",
                            matrix.channels()[i],
                            matrix.channels()[j],
                            complete.len()
                        );
                    }
                    continue;
                }

                let a: Vec<f64> = complete
                    .iter()
                    .map(|&r| 0.5 * (log[(r, i)] + log[(r, j)]))
                    .collect();
                let m: Vec<f64> = complete.iter().map(|&r| log[(r, i)] - log[(r, j)]).collect();
                let fitted = lowess_fit(&a, &m, config.span);
                for (k, &r) in complete.iter().enumerate() {
                    let half = 0.5 * fitted[k];
                    log[(r, i)] -= half;
                    log[(r, j)] += half;
                }
            }
        }
    }

    let normalized = ReporterMatrix::from_log2(
        &log,
        matrix.row_ids().to_vec(),
        matrix.channels().to_vec(),
    )?;
    Ok(LoessMatrix {
        matrix: normalized,
        n_skipped_pairs,
        n_pairs,
    })
}

/// Weighted local-linear smoother with tricube weights.
///
/// Fits y ~ x at each point using the nearest `span` fraction of points,
/// skipping fits closer than 1% of the x-range to the previous one and
/// interpolating between the fitted anchors instead. Returns fitted values
/// aligned with the input order.
pub(crate) fn lowess_fit(x: &[f64], y: &[f64], span: f64) -> Vec<f64> {
    let n = x.len();
    debug_assert_eq!(n, y.len());
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![y[0]];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&p, &q| x[p].partial_cmp(&x[q]).unwrap_or(std::cmp::Ordering::Equal));
    let xs: Vec<f64> = order.iter().map(|&p| x[p]).collect();
    let ys: Vec<f64> = order.iter().map(|&p| y[p]).collect();

    let q = ((span * n as f64).ceil() as usize).clamp(2, n);
    let delta = 0.01 * (xs[n - 1] - xs[0]).max(0.0);

    // fitted values in sorted order; NaN marks points left for interpolation
    let mut fitted = vec![f64::NAN; n];
    let mut lo = 0usize;
    let mut last_anchor: Option<usize> = None;
    for t in 0..n {
        let is_anchor = match last_anchor {
            None => true,
            Some(prev) => xs[t] - xs[prev] > delta || t == n - 1,
        };
        if !is_anchor {
            continue;
        }

        // slide the window of q nearest neighbors rightward
        while lo + q < n && xs[t] - xs[lo] > xs[lo + q] - xs[t] {
            lo += 1;
        }
        let hi = lo + q;
        let dmax = (xs[t] - xs[lo]).max(xs[hi - 1] - xs[t]);

        let mut w_sum = 0.0;
        let mut wx = 0.0;
        let mut wy = 0.0;
        let mut wxx = 0.0;
        let mut wxy = 0.0;
        for k in lo..hi {
            let w = if dmax > 0.0 {
                let d = ((xs[k] - xs[t]).abs() / dmax).min(1.0);
                let tri = 1.0 - d * d * d;
                tri * tri * tri
            } else {
                1.0
            };
            let xc = xs[k] - xs[t];
            w_sum += w;
            wx += w * xc;
            wy += w * ys[k];
            wxx += w * xc * xc;
            wxy += w * xc * ys[k];
        }
        let denom = w_sum * wxx - wx * wx;
        fitted[t] = if denom.abs() > 1e-12 * w_sum.max(1.0) {
            let slope = (w_sum * wxy - wx * wy) / denom;
            // centered at xs[t], the intercept is the fitted value
            (wy - slope * wx) / w_sum
        } else {
            wy / w_sum
        };
        last_anchor = Some(t);
    }

    // interpolate the skipped points between anchors
    let mut prev = 0usize;
    for t in 1..n {
        if fitted[t].is_nan() {
            continue;
        }
        if t > prev + 1 {
            let dx = xs[t] - xs[prev];
            for s in (prev + 1)..t {
                fitted[s] = if dx > 0.0 {
                    let frac = (xs[s] - xs[prev]) / dx;
                    fitted[prev] + frac * (fitted[t] - fitted[prev])
                } else {
                    fitted[prev]
                };
            }
        }
        prev = t;
    }

    // scatter back to input order
    let mut out = vec![0.0; n];
    for (sorted_pos, &orig) in order.iter().enumerate() {
        out[orig] = fitted[sorted_pos];
    }
    out
}
