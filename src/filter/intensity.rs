//! Low-intensity feature filtering.
//!
//! The magnitude summary is the mean of the three largest log2 reporter
//! intensities in a row (fewer if fewer channels are observed). Averaging the
//! top of the row instead of the whole row keeps the summary stable under
//! channel dropout.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TableKind;
use crate::data::FeatureTable;
use crate::error::{QuantError, Result};

/// Cutoff applied to each row's top-3 mean log2 intensity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityCutoff {
    /// Fixed threshold in log2 intensity units.
    Absolute(f64),
    /// Threshold at this quantile of the table's own summaries.
    Quantile(f64),
}

impl IntensityCutoff {
    /// Conventional default per table granularity: protein summaries must
    /// reach log2 intensity 0, site tables drop their dimmest percentile.
    pub fn default_for(kind: TableKind) -> Self {
        match kind {
            TableKind::Protein => IntensityCutoff::Absolute(0.0),
            TableKind::Site => IntensityCutoff::Quantile(0.01),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            IntensityCutoff::Absolute(x) if !x.is_finite() => Err(QuantError::Configuration(
                "absolute intensity cutoff must be finite".to_string(),
            )),
            IntensityCutoff::Quantile(q) if !(q > 0.0 && q < 1.0) => {
                Err(QuantError::Configuration(format!(
                    "quantile intensity cutoff must be in (0, 1), got {}",
                    q
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Mean of the up-to-three largest log2 values over observed channels.
/// NaN when the row has no observed values.
pub(crate) fn top3_mean_log2(values: &[f64]) -> f64 {
    let mut logs: Vec<f64> = values
        .iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| v.log2())
        .collect();
    if logs.is_empty() {
        return f64::NAN;
    }
    logs.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top = &logs[..logs.len().min(3)];
    top.iter().sum::<f64>() / top.len() as f64
}

/// Linear-interpolation quantile of ascending-sorted values.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Stage 6: drop features whose top-3 mean log2 corrected intensity falls
/// below the cutoff.
///
/// Rows with no observed corrected values have an undefined summary and are
/// always dropped. A quantile cutoff is resolved once against the finite
/// summaries of this table; the resolved threshold then acts as a fixed
/// predicate.
pub fn filter_intensity(table: &FeatureTable, cutoff: IntensityCutoff) -> Result<Vec<usize>> {
    cutoff.validate()?;

    let summaries: Vec<f64> = table
        .records()
        .par_iter()
        .map(|r| top3_mean_log2(&r.corrected))
        .collect();

    let threshold = match cutoff {
        IntensityCutoff::Absolute(x) => x,
        IntensityCutoff::Quantile(q) => {
            let mut finite: Vec<f64> = summaries
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if finite.is_empty() {
                return Ok(Vec::new());
            }
            finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            quantile_sorted(&finite, q)
        }
    };
    log::debug!(
        "intensity cutoff resolved to log2 = {:.4} ({:?})",
        threshold,
        cutoff
    );

    Ok(summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite() && **s >= threshold)
        .map(|(i, _)| i)
        .collect())
}
