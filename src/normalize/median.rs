//! Median centering normalization.
//!
//! The simplest channel-level correction: shift each channel in log2 space
//! so that every channel's median matches the median of all channel medians.
//! Robust, fast, and blind to intensity-dependent bias; use cyclic loess
//! when that matters.

use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};
use log::warn;

/// Result of median centering.
#[derive(Debug, Clone)]
pub struct MedianMatrix {
    matrix: ReporterMatrix,
    /// Log2 shift applied per channel (NaN for channels with no signal).
    shifts: Vec<f64>,
    /// The consensus log2 median the channels were pulled to.
    grand_median: f64,
}

impl MedianMatrix {
    #[inline]
    pub fn matrix(&self) -> &ReporterMatrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> ReporterMatrix {
        self.matrix
    }

    #[inline]
    pub fn shifts(&self) -> &[f64] {
        &self.shifts
    }

    #[inline]
    pub fn grand_median(&self) -> f64 {
        self.grand_median
    }
}

/// Median of the finite values, NaN when none remain.
pub(crate) fn median_finite(values: impl Iterator<Item = f64>) -> f64 {
    let mut finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = finite.len();
    if n % 2 == 1 {
        finite[n / 2]
    } else {
        0.5 * (finite[n / 2 - 1] + finite[n / 2])
    }
}

/// Center every channel's log2 median on the grand median.
///
/// Channels without any observed intensity cannot be centered; they are
/// warned about and passed through unchanged. Missing cells stay missing.
pub fn norm_median(matrix: &ReporterMatrix) -> Result<MedianMatrix> {
    let n_rows = matrix.n_rows();
    let n_channels = matrix.n_channels();
    if n_rows == 0 || n_channels == 0 {
        return Err(QuantError::EmptyData(
            "cannot normalize an empty matrix".to_string(),
        ));
    }

    let mut log = matrix.to_log2();
    let channel_medians: Vec<f64> = (0..n_channels)
        .map(|c| median_finite((0..n_rows).map(|r| log[(r, c)])))
        .collect();
    for (c, m) in channel_medians.iter().enumerate() {
        if m.is_nan() {
            warn!(
                "channel {} has no observed intensities; left unnormalized",
                matrix.channels()[c]
            );
        }
    }

    let grand_median = median_finite(channel_medians.iter().copied());
    let shifts: Vec<f64> = channel_medians
        .iter()
        .map(|&m| {
            if m.is_finite() && grand_median.is_finite() {
                grand_median - m
            } else {
                f64::NAN
            }
        })
        .collect();

    for c in 0..n_channels {
        if !shifts[c].is_finite() {
            continue;
        }
        for r in 0..n_rows {
            if log[(r, c)].is_finite() {
                log[(r, c)] += shifts[c];
            }
        }
    }

    let normalized = ReporterMatrix::from_log2(
        &log,
        matrix.row_ids().to_vec(),
        matrix.channels().to_vec(),
    )?;
    Ok(MedianMatrix {
        matrix: normalized,
        shifts,
        grand_median,
    })
}
