//! Size-factor normalization (median-of-ratios).
//!
//! Treats each channel like a sequencing library: every channel gets one
//! scaling factor estimated as the median ratio to a per-row geometric-mean
//! reference. Intensities are first mapped onto a rounded log2 grid so the
//! count-style estimator behaves on continuous reporter data, and the grid
//! is inverted after scaling.
//!
//! Factor vectors can be persisted and reused so a companion table from the
//! same experiment (e.g. sites next to proteins) is scaled identically.
//!
//! # Algorithm
//!
//! 1. Map intensities to pseudo-counts `k = round(log2(x + 1) * 1000)`;
//!    missing (zero) stays zero.
//! 2. Over rows observed in every channel that has any signal, compute each
//!    channel's `log k` deviation from the row's mean `log k`.
//! 3. The channel factor is `exp(median deviation)`. Channels with no
//!    signal at all get a NaN factor and are left unscaled.
//! 4. Scale `k` by the factor and invert the grid: `x' = 2^(k'/1000) - 1`.
//!
//! # Reference
//!
//! Anders S, Huber W. Differential expression analysis for sequence count
//! data. Genome Biology 11, R106 (2010).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::warn;

use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};
use crate::normalize::median::median_finite;

/// Map an intensity onto the pseudo-count grid.
#[inline]
fn to_k(x: f64) -> f64 {
    ((x + 1.0).log2() * 1000.0).round()
}

/// Invert the pseudo-count grid.
#[inline]
fn from_k(k: f64) -> f64 {
    (k / 1000.0).exp2() - 1.0
}

/// Per-channel scaling factors, estimable or loaded from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeFactors {
    channels: Vec<String>,
    factors: Vec<f64>,
    /// Rows observed in every estimable channel (zero when loaded).
    n_reference_rows: usize,
}

impl SizeFactors {
    pub fn new(channels: Vec<String>, factors: Vec<f64>) -> Result<Self> {
        if channels.len() != factors.len() {
            return Err(QuantError::DimensionMismatch {
                expected: channels.len(),
                actual: factors.len(),
            });
        }
        Ok(Self {
            channels,
            factors,
            n_reference_rows: 0,
        })
    }

    #[inline]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    #[inline]
    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    #[inline]
    pub fn n_reference_rows(&self) -> usize {
        self.n_reference_rows
    }

    /// Load persisted factors from a two-column TSV (channel, factor).
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        // header
        lines
            .next()
            .ok_or_else(|| QuantError::EmptyData("empty size factor file".to_string()))??;

        let mut channels = Vec::new();
        let mut factors = Vec::new();
        for (row, line_result) in lines.enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 2 {
                return Err(QuantError::DimensionMismatch {
                    expected: 2,
                    actual: fields.len(),
                });
            }
            channels.push(fields[0].trim().to_string());
            let raw = fields[1].trim();
            let factor = if raw.eq_ignore_ascii_case("na") || raw.eq_ignore_ascii_case("nan") {
                f64::NAN
            } else {
                raw.parse().map_err(|_| QuantError::InvalidValue {
                    value: raw.to_string(),
                    row,
                    column: "size_factor".to_string(),
                })?
            };
            factors.push(factor);
        }
        if channels.is_empty() {
            return Err(QuantError::EmptyData(
                "no factors in size factor file".to_string(),
            ));
        }
        Self::new(channels, factors)
    }

    /// Persist factors for reuse on a companion table.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "channel\tsize_factor")?;
        for (channel, factor) in self.channels.iter().zip(&self.factors) {
            if factor.is_finite() {
                writeln!(writer, "{}\t{}", channel, factor)?;
            } else {
                writeln!(writer, "{}\tNA", channel)?;
            }
        }
        Ok(())
    }
}

/// Result of size-factor normalization.
#[derive(Debug, Clone)]
pub struct SizeFactorMatrix {
    matrix: ReporterMatrix,
    factors: SizeFactors,
    reused: bool,
}

impl SizeFactorMatrix {
    #[inline]
    pub fn matrix(&self) -> &ReporterMatrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> ReporterMatrix {
        self.matrix
    }

    #[inline]
    pub fn factors(&self) -> &SizeFactors {
        &self.factors
    }

    /// True when the factors came from a persisted vector instead of being
    /// estimated on this matrix.
    #[inline]
    pub fn reused(&self) -> bool {
        self.reused
    }
}

/// Estimate median-of-ratios factors for every channel with signal.
pub fn estimate_size_factors(matrix: &ReporterMatrix) -> Result<SizeFactors> {
    let n_rows = matrix.n_rows();
    let n_channels = matrix.n_channels();
    if n_rows == 0 || n_channels == 0 {
        return Err(QuantError::EmptyData(
            "cannot estimate size factors on an empty matrix".to_string(),
        ));
    }

    let k = |r: usize, c: usize| to_k(matrix.get(r, c));
    let observed: Vec<bool> = (0..n_channels)
        .map(|c| (0..n_rows).any(|r| k(r, c) > 0.0))
        .collect();
    if !observed.iter().any(|&o| o) {
        return Err(QuantError::EmptyData(
            "no observed intensities in any channel".to_string(),
        ));
    }

    let mut deviations: Vec<Vec<f64>> = vec![Vec::new(); n_channels];
    let mut n_reference_rows = 0usize;
    for r in 0..n_rows {
        let complete = (0..n_channels).all(|c| !observed[c] || k(r, c) > 0.0);
        if !complete {
            continue;
        }
        n_reference_rows += 1;
        let logs: Vec<(usize, f64)> = (0..n_channels)
            .filter(|&c| observed[c])
            .map(|c| (c, k(r, c).ln()))
            .collect();
        let reference = logs.iter().map(|(_, l)| l).sum::<f64>() / logs.len() as f64;
        for (c, l) in logs {
            deviations[c].push(l - reference);
        }
    }
    if n_reference_rows == 0 {
        return Err(QuantError::Numerical(
            "no rows are observed in every channel with signal; cannot estimate size factors"
                .to_string(),
        ));
    }

    let factors: Vec<f64> = deviations
        .iter()
        .enumerate()
        .map(|(c, devs)| {
            if observed[c] {
                median_finite(devs.iter().copied()).exp()
            } else {
                f64::NAN
            }
        })
        .collect();
    let mut result = SizeFactors::new(matrix.channels().to_vec(), factors)?;
    result.n_reference_rows = n_reference_rows;
    Ok(result)
}

/// Estimate factors on this matrix and apply them.
pub fn norm_size_factor(matrix: &ReporterMatrix) -> Result<SizeFactorMatrix> {
    let factors = estimate_size_factors(matrix)?;
    apply_size_factors(matrix, factors, false)
}

/// Apply a previously estimated (or persisted) factor vector.
pub fn norm_size_factor_with(
    matrix: &ReporterMatrix,
    factors: &SizeFactors,
) -> Result<SizeFactorMatrix> {
    apply_size_factors(matrix, factors.clone(), true)
}

fn apply_size_factors(
    matrix: &ReporterMatrix,
    factors: SizeFactors,
    reused: bool,
) -> Result<SizeFactorMatrix> {
    if factors.channels() != matrix.channels() {
        return Err(QuantError::Configuration(format!(
            "size factor channels {:?} do not match reporter channels {:?}",
            factors.channels(),
            matrix.channels()
        )));
    }

    for (c, factor) in factors.factors().iter().enumerate() {
        if !(factor.is_finite() && *factor > 0.0) {
            warn!(
                "channel {} has no usable size factor; left unnormalized",
                matrix.channels()[c]
            );
        }
    }

    let data = nalgebra::DMatrix::from_fn(matrix.n_rows(), matrix.n_channels(), |r, c| {
        let x = matrix.get(r, c);
        if x <= 0.0 {
            return 0.0;
        }
        let s = factors.factors()[c];
        if s.is_finite() && s > 0.0 {
            from_k(to_k(x) / s).max(0.0)
        } else {
            x
        }
    });
    let normalized = ReporterMatrix::new(
        data,
        matrix.row_ids().to_vec(),
        matrix.channels().to_vec(),
    )?;
    Ok(SizeFactorMatrix {
        matrix: normalized,
        factors,
        reused,
    })
}
