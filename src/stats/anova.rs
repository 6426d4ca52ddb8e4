//! One-way ANOVA across channel groups.
//!
//! # Algorithm
//!
//! For each feature row, log2 intensities are partitioned by group label and
//! the classical F statistic is formed from the between- and within-group
//! mean squares:
//!
//! ```text
//! F = [SS_between / (k - 1)] / [SS_within / (N - k)]
//! ```
//!
//! where `k` counts the groups with at least one observation in the row and
//! `N` the total observations. Rows without two populated groups, or without
//! a positive residual degree of freedom, cannot be fit and yield NaN
//! statistics rather than an error. P-values come from the F distribution
//! and are Benjamini-Hochberg adjusted across all fit rows.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::config::ChannelConfig;
use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};
use crate::stats::bh::adjust_bh;
use crate::stats::group_channels;

/// ANOVA outcome for a single feature row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnovaRow {
    /// Feature identifier.
    pub feature_id: String,
    /// F statistic; NaN when the model could not be fit.
    pub f_statistic: f64,
    /// Raw p-value.
    pub p_value: f64,
    /// BH-adjusted p-value.
    pub q_value: f64,
    /// Numerator degrees of freedom (k - 1).
    pub df_between: f64,
    /// Denominator degrees of freedom (N - k).
    pub df_within: f64,
}

/// One-way ANOVA results for every row of a matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnovaResult {
    /// Per-row results in matrix row order.
    pub results: Vec<AnovaRow>,
    /// Group labels included in the model.
    pub groups: Vec<String>,
    /// Rows with too few observations to fit.
    pub n_unfit: usize,
}

impl AnovaResult {
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

    /// Get the result for a specific feature.
    pub fn get_feature(&self, feature_id: &str) -> Option<&AnovaRow> {
        self.results.iter().find(|r| r.feature_id == feature_id)
    }

    /// Count rows significant at the given adjusted level.
    pub fn n_significant(&self, alpha: f64) -> usize {
        self.results.iter().filter(|r| r.q_value < alpha).count()
    }
}

/// Per-row F test outcome before identifiers are attached.
struct RowFit {
    f_statistic: f64,
    p_value: f64,
    df_between: f64,
    df_within: f64,
}

fn fit_row(observations: &[Vec<f64>]) -> RowFit {
    let populated: Vec<&Vec<f64>> = observations.iter().filter(|g| !g.is_empty()).collect();
    let k = populated.len();
    let n: usize = populated.iter().map(|g| g.len()).sum();

    let unfit = RowFit {
        f_statistic: f64::NAN,
        p_value: f64::NAN,
        df_between: f64::NAN,
        df_within: f64::NAN,
    };
    if k < 2 || n <= k {
        return unfit;
    }

    let grand_mean = populated.iter().flat_map(|g| g.iter()).sum::<f64>() / n as f64;
    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    for group in &populated {
        let mean = group.iter().sum::<f64>() / group.len() as f64;
        ss_between += group.len() as f64 * (mean - grand_mean).powi(2);
        ss_within += group.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    }

    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    let ms_between = ss_between / df_between;
    let ms_within = ss_within / df_within;

    let (f_statistic, p_value) = if ms_within > 0.0 {
        let f = ms_between / ms_within;
        let dist = FisherSnedecor::new(df_between, df_within).unwrap();
        (f, 1.0 - dist.cdf(f))
    } else if ms_between > 0.0 {
        // groups separate perfectly with zero residual scatter
        (f64::INFINITY, 0.0)
    } else {
        return unfit;
    };

    RowFit {
        f_statistic,
        p_value,
        df_between,
        df_within,
    }
}

/// One-way ANOVA of log2 intensity against group label for every row.
///
/// `matrix` holds intensities in linear space with zero meaning missing; the
/// log2 transform happens internally. `groups` restricts the model to a
/// subset of group labels; `None` uses every group in `channels`. An unknown
/// group name fails with [`QuantError::Configuration`].
pub fn test_anova(
    matrix: &ReporterMatrix,
    channels: &ChannelConfig,
    groups: Option<&[String]>,
) -> Result<AnovaResult> {
    let group_labels: Vec<String> = match groups {
        Some(subset) => subset.to_vec(),
        None => channels.unique_groups(),
    };
    if group_labels.len() < 2 {
        return Err(QuantError::Configuration(format!(
            "ANOVA needs at least two groups, got {:?}",
            group_labels
        )));
    }
    let members: Vec<Vec<usize>> = group_labels
        .iter()
        .map(|g| group_channels(channels, g))
        .collect::<Result<_>>()?;

    let log2 = matrix.to_log2();
    let fits: Vec<RowFit> = (0..matrix.n_rows())
        .into_par_iter()
        .map(|row| {
            let observations: Vec<Vec<f64>> = members
                .iter()
                .map(|idx| {
                    idx.iter()
                        .map(|&c| log2[(row, c)])
                        .filter(|v| v.is_finite())
                        .collect()
                })
                .collect();
            fit_row(&observations)
        })
        .collect();

    let q_values = adjust_bh(&fits.iter().map(|f| f.p_value).collect::<Vec<_>>());
    let n_unfit = fits.iter().filter(|f| f.p_value.is_nan()).count();
    let results = matrix
        .row_ids()
        .iter()
        .zip(fits)
        .zip(q_values)
        .map(|((id, fit), q_value)| AnovaRow {
            feature_id: id.clone(),
            f_statistic: fit.f_statistic,
            p_value: fit.p_value,
            q_value,
            df_between: fit.df_between,
            df_within: fit.df_within,
        })
        .collect();

    Ok(AnovaResult {
        results,
        groups: group_labels,
        n_unfit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn six_channel_config() -> ChannelConfig {
        ChannelConfig {
            labels: (126..132).map(|i| i.to_string()).collect(),
            samples: (1..=6).map(|i| format!("s{}", i)).collect(),
            groups: vec![
                "a".into(),
                "a".into(),
                "a".into(),
                "b".into(),
                "b".into(),
                "b".into(),
            ],
            blocks: None,
        }
    }

    fn matrix(rows: &[(&str, [f64; 6])]) -> ReporterMatrix {
        let flat: Vec<f64> = rows.iter().flat_map(|(_, v)| v.iter().copied()).collect();
        ReporterMatrix::new(
            DMatrix::from_row_slice(rows.len(), 6, &flat),
            rows.iter().map(|(id, _)| id.to_string()).collect(),
            six_channel_config().labels.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_f_statistic_known_value() {
        // log2 values: group a = [1, 2, 3], group b = [4, 5, 6]
        // SS_between = 13.5, SS_within = 4, df = (1, 4), F = 13.5
        let m = matrix(&[("P1", [2.0, 4.0, 8.0, 16.0, 32.0, 64.0])]);
        let result = test_anova(&m, &six_channel_config(), None).unwrap();

        let row = &result.results[0];
        assert_relative_eq!(row.f_statistic, 13.5, epsilon = 1e-10);
        assert_relative_eq!(row.df_between, 1.0, epsilon = 1e-12);
        assert_relative_eq!(row.df_within, 4.0, epsilon = 1e-12);
        // F(1,4) upper tail at 13.5 is roughly 0.021
        assert!(row.p_value > 0.01 && row.p_value < 0.05);
        assert_eq!(result.n_unfit, 0);
    }

    #[test]
    fn test_no_group_difference() {
        let m = matrix(&[("P1", [8.0, 8.0, 8.0, 8.0, 8.0, 8.0])]);
        let result = test_anova(&m, &six_channel_config(), None).unwrap();
        // identical values everywhere: nothing to test
        assert!(result.results[0].p_value.is_nan());
        assert_eq!(result.n_unfit, 1);
    }

    #[test]
    fn test_missing_values_reduce_df() {
        // group b has a single observation; fit survives on df_within = 2
        let m = matrix(&[("P1", [2.0, 4.0, 8.0, 16.0, 0.0, 0.0])]);
        let result = test_anova(&m, &six_channel_config(), None).unwrap();
        let row = &result.results[0];
        assert!(row.p_value.is_finite());
        assert_relative_eq!(row.df_within, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unfit_rows_get_nan_not_error() {
        let m = matrix(&[
            ("ONE_GROUP", [2.0, 4.0, 8.0, 0.0, 0.0, 0.0]),
            ("ALL_MISSING", [0.0; 6]),
            ("OK", [2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        ]);
        let result = test_anova(&m, &six_channel_config(), None).unwrap();
        assert!(result.results[0].p_value.is_nan());
        assert!(result.results[1].p_value.is_nan());
        assert!(result.results[2].p_value.is_finite());
        assert_eq!(result.n_unfit, 2);
        // BH ran over the single fit row only
        assert_relative_eq!(
            result.results[2].q_value,
            result.results[2].p_value,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_group_subset() {
        let mut config = six_channel_config();
        config.groups = vec![
            "a".into(),
            "a".into(),
            "b".into(),
            "b".into(),
            "c".into(),
            "c".into(),
        ];
        let m = matrix(&[("P1", [2.0, 4.0, 8.0, 16.0, 32.0, 64.0])]);

        let all = test_anova(&m, &config, None).unwrap();
        assert_eq!(all.groups.len(), 3);

        let subset: Vec<String> = vec!["a".into(), "c".into()];
        let two = test_anova(&m, &config, Some(&subset)).unwrap();
        assert_eq!(two.groups, subset);
        // restricted model sees 4 observations in 2 groups
        assert_relative_eq!(two.results[0].df_within, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_group_is_configuration_error() {
        let m = matrix(&[("P1", [2.0, 4.0, 8.0, 16.0, 32.0, 64.0])]);
        let subset: Vec<String> = vec!["a".into(), "nope".into()];
        let err = test_anova(&m, &six_channel_config(), Some(&subset)).unwrap_err();
        assert!(matches!(err, QuantError::Configuration(_)));
    }

    #[test]
    fn test_single_group_rejected() {
        let m = matrix(&[("P1", [2.0, 4.0, 8.0, 16.0, 32.0, 64.0])]);
        let subset: Vec<String> = vec!["a".into()];
        assert!(test_anova(&m, &six_channel_config(), Some(&subset)).is_err());
    }
}
