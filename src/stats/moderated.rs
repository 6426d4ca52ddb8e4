//! Moderated two-group comparison.
//!
//! # Algorithm
//!
//! Each feature row is fit with a group-means model (one indicator column
//! per group, no intercept) on log2 intensities of the two compared groups.
//! With a blocking factor, a consensus within-block correlation is estimated
//! first — per-row intraclass correlations of the group-mean residuals,
//! pooled on the atanh scale — and each row is then refit by generalized
//! least squares under `V = (1-rho)*I + rho*B`, where `B` marks same-block
//! pairs. Residual variances are moderated across rows by empirical Bayes
//! shrinkage toward a common prior, and each contrast is tested with a
//! moderated t statistic on `df_residual + df_prior` degrees of freedom.
//!
//! Rows where a group has no observations cannot be contrasted and yield NaN
//! statistics, not an error.
//!
//! # Reference
//!
//! Smyth (2004). Linear models and empirical Bayes methods for assessing
//! differential expression in microarray experiments. Stat Appl Genet Mol
//! Biol 3, Article 3.
//!
//! Smyth, Michaud & Scott (2005). Use of within-array replicate spots for
//! assessing differential expression in microarray experiments.
//! Bioinformatics 21(9), 2067-2075.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

use crate::config::{ChannelConfig, ComparisonConfig};
use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};
use crate::stats::bh::adjust_bh;
use crate::stats::eb::squeeze_var;
use crate::stats::group_channels;

/// Moderated test outcome for a single feature row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratedRow {
    /// Feature identifier.
    pub feature_id: String,
    /// log2 fold change, group A minus group B.
    pub log2_fc: f64,
    /// Moderated t statistic.
    pub t_statistic: f64,
    /// Raw p-value (two-sided).
    pub p_value: f64,
    /// BH-adjusted p-value.
    pub q_value: f64,
    /// Residual degrees of freedom for this row.
    pub df_residual: f64,
    /// Posterior (moderated) residual variance.
    pub var_posterior: f64,
}

/// Moderated comparison results for every row of a matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratedResult {
    /// Per-row results in matrix row order.
    pub results: Vec<ModeratedRow>,
    /// Contrast label, `"<group_a> vs <group_b>"`.
    pub comparison: String,
    /// Prior degrees of freedom from the variance moderation.
    pub df_prior: f64,
    /// Prior variance from the variance moderation.
    pub var_prior: f64,
    /// Consensus within-block correlation, when blocking was applied.
    pub block_correlation: Option<f64>,
    /// Rows with too few observations to test.
    pub n_unfit: usize,
}

impl ModeratedResult {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Raw p-values in row order.
    pub fn p_values(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.p_value).collect()
    }

    /// Adjusted p-values in row order.
    pub fn q_values(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.q_value).collect()
    }

    /// log2 fold changes in row order.
    pub fn log2_fold_changes(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.log2_fc).collect()
    }

    /// Get the result for a specific feature.
    pub fn get_feature(&self, feature_id: &str) -> Option<&ModeratedRow> {
        self.results.iter().find(|r| r.feature_id == feature_id)
    }

    /// Count rows significant at the given adjusted level.
    pub fn n_significant(&self, alpha: f64) -> usize {
        self.results.iter().filter(|r| r.q_value < alpha).count()
    }
}

/// Observed values of one row, restricted to the compared channels.
struct RowData {
    y: Vec<f64>,
    in_a: Vec<bool>,
    block: Vec<usize>,
    n_a: usize,
    n_b: usize,
}

/// Per-row fit before variance moderation.
struct RowEstimate {
    lfc: f64,
    stdev_unscaled: f64,
    s2: f64,
    df: f64,
}

impl RowEstimate {
    fn unfit() -> Self {
        RowEstimate {
            lfc: f64::NAN,
            stdev_unscaled: f64::NAN,
            s2: f64::NAN,
            df: 0.0,
        }
    }
}

fn collect_row(
    log2: &DMatrix<f64>,
    row: usize,
    a_idx: &[usize],
    b_idx: &[usize],
    block_of: Option<&[usize]>,
) -> RowData {
    let mut data = RowData {
        y: Vec::new(),
        in_a: Vec::new(),
        block: Vec::new(),
        n_a: 0,
        n_b: 0,
    };
    for (idx, is_a) in [(a_idx, true), (b_idx, false)] {
        for &c in idx {
            let v = log2[(row, c)];
            if v.is_finite() {
                data.y.push(v);
                data.in_a.push(is_a);
                // without blocking every observation is its own block
                data.block.push(block_of.map_or(c, |b| b[c]));
                if is_a {
                    data.n_a += 1;
                } else {
                    data.n_b += 1;
                }
            }
        }
    }
    data
}

/// Ordinary least squares for the group-means model: closed form.
fn ols_row(data: &RowData) -> RowEstimate {
    if data.n_a == 0 || data.n_b == 0 {
        return RowEstimate::unfit();
    }
    let (mut sum_a, mut sum_b) = (0.0, 0.0);
    for (y, &in_a) in data.y.iter().zip(&data.in_a) {
        if in_a {
            sum_a += y;
        } else {
            sum_b += y;
        }
    }
    let mean_a = sum_a / data.n_a as f64;
    let mean_b = sum_b / data.n_b as f64;

    let rss: f64 = data
        .y
        .iter()
        .zip(&data.in_a)
        .map(|(y, &in_a)| {
            let fitted = if in_a { mean_a } else { mean_b };
            (y - fitted).powi(2)
        })
        .sum();
    let df = (data.n_a + data.n_b) as f64 - 2.0;

    RowEstimate {
        lfc: mean_a - mean_b,
        stdev_unscaled: (1.0 / data.n_a as f64 + 1.0 / data.n_b as f64).sqrt(),
        s2: if df >= 1.0 { rss / df } else { f64::NAN },
        df: df.max(0.0),
    }
}

/// Generalized least squares under the block correlation structure.
fn gls_row(data: &RowData, rho: f64) -> RowEstimate {
    if data.n_a == 0 || data.n_b == 0 {
        return RowEstimate::unfit();
    }
    let n = data.y.len();

    let v = DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            1.0
        } else if data.block[i] == data.block[j] {
            rho
        } else {
            0.0
        }
    });
    let x = DMatrix::from_fn(n, 2, |i, j| {
        if (j == 0) == data.in_a[i] {
            1.0
        } else {
            0.0
        }
    });
    let y = DVector::from_column_slice(&data.y);

    let v_chol = match v.cholesky() {
        Some(c) => c,
        None => return RowEstimate::unfit(),
    };
    let v_inv_x = v_chol.solve(&x);
    let v_inv_y = v_chol.solve(&y);
    let xtvinvx = x.transpose() * &v_inv_x;
    let xtvinvx_inv = match xtvinvx.try_inverse() {
        Some(inv) => inv,
        None => return RowEstimate::unfit(),
    };
    let beta = &xtvinvx_inv * (x.transpose() * &v_inv_y);

    let residuals = &y - &x * &beta;
    let v_inv_r = v_chol.solve(&residuals);
    let rss = residuals.dot(&v_inv_r);
    let df = n as f64 - 2.0;

    // contrast c = (1, -1): Var = c' (X'V^-1X)^-1 c
    let u2 = xtvinvx_inv[(0, 0)] + xtvinvx_inv[(1, 1)] - 2.0 * xtvinvx_inv[(0, 1)];
    if u2 <= 0.0 {
        return RowEstimate::unfit();
    }

    RowEstimate {
        lfc: beta[0] - beta[1],
        stdev_unscaled: u2.sqrt(),
        s2: if df >= 1.0 { rss / df } else { f64::NAN },
        df: df.max(0.0),
    }
}

/// Intraclass correlation of one row's group-mean residuals across blocks.
fn row_block_icc(
    log2: &DMatrix<f64>,
    row: usize,
    a_idx: &[usize],
    b_idx: &[usize],
    block_of: &[usize],
) -> Option<f64> {
    let mut by_block: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for idx in [a_idx, b_idx] {
        let observed: Vec<(usize, f64)> = idx
            .iter()
            .map(|&c| (block_of[c], log2[(row, c)]))
            .filter(|(_, v)| v.is_finite())
            .collect();
        if observed.is_empty() {
            continue;
        }
        let mean = observed.iter().map(|(_, v)| v).sum::<f64>() / observed.len() as f64;
        for (block, v) in observed {
            by_block.entry(block).or_default().push(v - mean);
        }
    }

    let k = by_block.len();
    let n: usize = by_block.values().map(|v| v.len()).sum();
    if k < 2 || n <= k {
        return None;
    }

    let grand = by_block.values().flatten().sum::<f64>() / n as f64;
    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    let mut sum_sq_sizes = 0.0;
    for group in by_block.values() {
        let mean = group.iter().sum::<f64>() / group.len() as f64;
        ss_between += group.len() as f64 * (mean - grand).powi(2);
        ss_within += group.iter().map(|r| (r - mean).powi(2)).sum::<f64>();
        sum_sq_sizes += (group.len() * group.len()) as f64;
    }
    let ms_between = ss_between / (k - 1) as f64;
    let ms_within = ss_within / (n - k) as f64;
    // average block size, adjusted for imbalance
    let n0 = (n as f64 - sum_sq_sizes / n as f64) / (k - 1) as f64;

    if ms_within > 0.0 {
        Some((ms_between - ms_within) / (ms_between + (n0 - 1.0) * ms_within))
    } else if ms_between > 0.0 {
        Some(1.0)
    } else {
        None
    }
}

/// Consensus within-block correlation: per-row ICCs pooled on the atanh
/// scale. `None` when no row has enough block structure to estimate one.
fn consensus_correlation(
    log2: &DMatrix<f64>,
    a_idx: &[usize],
    b_idx: &[usize],
    block_of: &[usize],
) -> Option<f64> {
    let z: Vec<f64> = (0..log2.nrows())
        .into_par_iter()
        .filter_map(|row| row_block_icc(log2, row, a_idx, b_idx, block_of))
        .map(|icc| icc.clamp(-0.99, 0.99).atanh())
        .collect();
    if z.is_empty() {
        None
    } else {
        Some((z.iter().sum::<f64>() / z.len() as f64).tanh())
    }
}

/// Moderated two-group test of log2 intensity for every row.
///
/// `matrix` holds intensities in linear space with zero meaning missing; the
/// log2 transform happens internally. An unknown group name in `comparison`
/// fails with [`QuantError::Configuration`]. With `use_blocking`, the
/// channel blocking factor from `channels` enters the model through the
/// consensus correlation; when no row supports an estimate the test falls
/// back to the unblocked fit with a warning.
pub fn test_moderated(
    matrix: &ReporterMatrix,
    channels: &ChannelConfig,
    comparison: &ComparisonConfig,
    use_blocking: bool,
) -> Result<ModeratedResult> {
    if comparison.group_a == comparison.group_b {
        return Err(QuantError::Configuration(format!(
            "cannot compare group '{}' against itself",
            comparison.group_a
        )));
    }
    let a_idx = group_channels(channels, &comparison.group_a)?;
    let b_idx = group_channels(channels, &comparison.group_b)?;

    let block_of: Option<Vec<usize>> = if use_blocking {
        let labels = channels.blocks.as_ref().ok_or_else(|| {
            QuantError::Configuration(
                "blocking requested but no blocks are configured".to_string(),
            )
        })?;
        if labels.len() != channels.n_channels() {
            return Err(QuantError::Configuration(format!(
                "expected {} block labels, got {}",
                channels.n_channels(),
                labels.len()
            )));
        }
        let mut seen: Vec<&str> = Vec::new();
        Some(
            labels
                .iter()
                .map(|b| match seen.iter().position(|s| s == b) {
                    Some(i) => i,
                    None => {
                        seen.push(b);
                        seen.len() - 1
                    }
                })
                .collect(),
        )
    } else {
        None
    };

    let log2 = matrix.to_log2();

    let rho = match &block_of {
        Some(blocks) => match consensus_correlation(&log2, &a_idx, &b_idx, blocks) {
            Some(rho) => {
                // keep V positive definite for the largest block
                let mut counts: HashMap<usize, usize> = HashMap::new();
                for &c in a_idx.iter().chain(&b_idx) {
                    *counts.entry(blocks[c]).or_insert(0) += 1;
                }
                let largest = counts.values().copied().max().unwrap_or(1);
                let lower = if largest > 1 {
                    (-1.0 / (largest as f64 - 1.0) + 0.05).min(0.0)
                } else {
                    -0.95
                };
                let rho = rho.clamp(lower, 0.99);
                log::info!(
                    "consensus within-block correlation for {} vs {}: {:.4}",
                    comparison.group_a,
                    comparison.group_b,
                    rho
                );
                Some(rho)
            }
            None => {
                log::warn!(
                    "no rows support a within-block correlation estimate; \
                     fitting {} vs {} without blocking",
                    comparison.group_a,
                    comparison.group_b
                );
                None
            }
        },
        None => None,
    };

    let estimates: Vec<RowEstimate> = (0..matrix.n_rows())
        .into_par_iter()
        .map(|row| {
            let data = collect_row(&log2, row, &a_idx, &b_idx, block_of.as_deref());
            match rho {
                Some(rho) => gls_row(&data, rho),
                None => ols_row(&data),
            }
        })
        .collect();

    let s2: Vec<f64> = estimates.iter().map(|e| e.s2).collect();
    let df: Vec<f64> = estimates.iter().map(|e| e.df).collect();
    let prior = squeeze_var(&s2, &df)?;
    // total information bound for the moderated degrees of freedom
    let df_sum: f64 = df.iter().filter(|d| **d >= 1.0).sum();

    let mut p_values = Vec::with_capacity(estimates.len());
    let mut t_statistics = Vec::with_capacity(estimates.len());
    for (estimate, &var_post) in estimates.iter().zip(&prior.var_post) {
        let usable = estimate.lfc.is_finite()
            && estimate.stdev_unscaled > 0.0
            && var_post.is_finite()
            && var_post > 0.0;
        if !usable {
            t_statistics.push(f64::NAN);
            p_values.push(f64::NAN);
            continue;
        }
        let t = estimate.lfc / (estimate.stdev_unscaled * var_post.sqrt());
        let df_total = (estimate.df + prior.df_prior).min(df_sum);
        let p = if !t.is_finite() || df_total <= 0.0 {
            f64::NAN
        } else if df_total.is_finite() {
            let t_dist = StudentsT::new(0.0, 1.0, df_total).unwrap();
            2.0 * (1.0 - t_dist.cdf(t.abs()))
        } else {
            let normal = Normal::new(0.0, 1.0).unwrap();
            2.0 * (1.0 - normal.cdf(t.abs()))
        };
        t_statistics.push(t);
        p_values.push(p);
    }

    let q_values = adjust_bh(&p_values);
    let n_unfit = p_values.iter().filter(|p| p.is_nan()).count();
    let results = matrix
        .row_ids()
        .iter()
        .enumerate()
        .map(|(i, id)| ModeratedRow {
            feature_id: id.clone(),
            log2_fc: estimates[i].lfc,
            t_statistic: t_statistics[i],
            p_value: p_values[i],
            q_value: q_values[i],
            df_residual: estimates[i].df,
            var_posterior: prior.var_post[i],
        })
        .collect();

    Ok(ModeratedResult {
        results,
        comparison: format!("{} vs {}", comparison.group_a, comparison.group_b),
        df_prior: prior.df_prior,
        var_prior: prior.var_prior,
        block_correlation: rho,
        n_unfit,
    })
}
