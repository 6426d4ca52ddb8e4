//! Empirical Bayes variance moderation.
//!
//! # Algorithm
//!
//! Residual variances from thousands of per-feature linear models are noisy
//! individually but share a common scale. Moment matching on log s² fits a
//! scaled-F prior (prior variance `s0²` with `d0` degrees of freedom); each
//! row's variance is then squeezed toward the prior:
//!
//! ```text
//! s²_post = (d0 * s0² + df * s²) / (d0 + df)
//! ```
//!
//! The matching uses `E[log s²] = log σ² + ψ(df/2) − log(df/2)` and
//! `Var[log s²] = ψ'(df/2) + ψ'(d0/2)`, with ψ the digamma and ψ' the
//! trigamma function. Excess variance of the corrected log s² beyond the
//! sampling component determines `d0`; when there is no excess the prior is
//! effectively infinite and every posterior collapses to `s0²`.
//!
//! # Reference
//!
//! Smyth (2004). Linear models and empirical Bayes methods for assessing
//! differential expression in microarray experiments. Stat Appl Genet Mol
//! Biol 3, Article 3.

use statrs::function::gamma::digamma;

use crate::error::{QuantError, Result};

/// Fitted variance prior plus squeezed per-row variances.
#[derive(Debug, Clone)]
pub struct VarPrior {
    /// Prior degrees of freedom `d0`; infinite when log-variances show no
    /// excess scatter.
    pub df_prior: f64,
    /// Prior variance `s0²`.
    pub var_prior: f64,
    /// Posterior variance per row; NaN where the input was unusable.
    pub var_post: Vec<f64>,
}

/// Trigamma function ψ'(x) for x > 0.
///
/// Recurrence ψ'(x) = ψ'(x+1) + 1/x² walks the argument above 6, where the
/// asymptotic expansion in Bernoulli numbers is accurate to ~1e-12.
pub(crate) fn trigamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    // 1/x + 1/(2x²) + 1/(6x³) − 1/(30x⁵) + 1/(42x⁷) − 1/(30x⁹)
    let series = inv
        + inv2 / 2.0
        + inv2 * inv * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)));
    acc + series
}

/// Inverse of the trigamma function: the y > 0 with ψ'(y) = x.
///
/// ψ' is strictly decreasing on (0, ∞), so bisection over a generous bracket
/// converges unconditionally.
pub(crate) fn trigamma_inverse(x: f64) -> f64 {
    const LO: f64 = 1e-6;
    const HI: f64 = 1e7;
    if !x.is_finite() || x >= trigamma(LO) {
        return LO;
    }
    if x <= trigamma(HI) {
        return HI;
    }
    let (mut lo, mut hi) = (LO, HI);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if trigamma(mid) > x {
            lo = mid;
        } else {
            hi = mid;
        }
        if (hi - lo) < 1e-12 * lo.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Fit the variance prior and squeeze each row's variance toward it.
///
/// Rows enter the prior fit only when their variance is positive and finite
/// and their degrees of freedom are at least one. Rows with non-positive
/// variance but valid df are still squeezed (pulled toward the prior); rows
/// without valid df come back NaN.
pub fn squeeze_var(variances: &[f64], df: &[f64]) -> Result<VarPrior> {
    if variances.len() != df.len() {
        return Err(QuantError::DimensionMismatch {
            expected: variances.len(),
            actual: df.len(),
        });
    }

    let usable: Vec<usize> = (0..variances.len())
        .filter(|&i| variances[i].is_finite() && variances[i] > 0.0 && df[i] >= 1.0)
        .collect();
    if usable.is_empty() {
        return Err(QuantError::Numerical(
            "no residual variances available to moderate".to_string(),
        ));
    }

    // corrected log-variances: e = log s² − ψ(df/2) + log(df/2)
    let e: Vec<f64> = usable
        .iter()
        .map(|&i| variances[i].ln() - digamma(df[i] / 2.0) + (df[i] / 2.0).ln())
        .collect();
    let n = e.len();
    let e_mean = e.iter().sum::<f64>() / n as f64;
    let e_var = if n > 1 {
        e.iter().map(|v| (v - e_mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    let sampling = usable
        .iter()
        .map(|&i| trigamma(df[i] / 2.0))
        .sum::<f64>()
        / n as f64;

    let excess = e_var - sampling;
    let (df_prior, var_prior) = if excess > 0.0 {
        let d0 = 2.0 * trigamma_inverse(excess);
        let s0 = (e_mean + digamma(d0 / 2.0) - (d0 / 2.0).ln()).exp();
        (d0, s0)
    } else {
        (f64::INFINITY, e_mean.exp())
    };

    let var_post = variances
        .iter()
        .zip(df)
        .map(|(&s2, &d)| {
            if !(d >= 1.0) {
                f64::NAN
            } else if df_prior.is_infinite() {
                var_prior
            } else {
                let s2 = if s2.is_finite() && s2 > 0.0 { s2 } else { 0.0 };
                (df_prior * var_prior + d * s2) / (df_prior + d)
            }
        })
        .collect();

    Ok(VarPrior {
        df_prior,
        var_prior,
        var_post,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_trigamma_known_values() {
        assert_relative_eq!(trigamma(1.0), PI * PI / 6.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(0.5), PI * PI / 2.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(2.0), PI * PI / 6.0 - 1.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(10.0), 0.105166335681686, epsilon = 1e-10);
    }

    #[test]
    fn test_trigamma_inverse_round_trip() {
        for &y in &[0.05, 0.5, 1.0, 2.5, 17.0] {
            let x = trigamma(y);
            assert_relative_eq!(trigamma_inverse(x), y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_identical_variances_give_infinite_prior() {
        let s2 = vec![1.0; 4];
        let df = vec![4.0; 4];
        let prior = squeeze_var(&s2, &df).unwrap();
        assert!(prior.df_prior.is_infinite());
        // s0² = exp(−ψ(2) + ln 2) ≈ 1.31044 per the Jensen correction
        assert_relative_eq!(prior.var_prior, 1.31044, epsilon = 1e-4);
        for v in &prior.var_post {
            assert_relative_eq!(*v, prior.var_prior, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_scattered_variances_give_finite_prior() {
        let s2 = vec![0.1, 1.0, 10.0, 0.2, 5.0];
        let df = vec![4.0; 5];
        let prior = squeeze_var(&s2, &df).unwrap();
        assert!(prior.df_prior.is_finite());
        assert!(prior.df_prior > 0.0);

        // squeezing preserves order and pulls toward the prior
        for (i, (&raw, &post)) in s2.iter().zip(&prior.var_post).enumerate() {
            let (lo, hi) = if raw < prior.var_prior {
                (raw, prior.var_prior)
            } else {
                (prior.var_prior, raw)
            };
            assert!(
                post >= lo - 1e-12 && post <= hi + 1e-12,
                "row {}: {} not between {} and {}",
                i,
                post,
                lo,
                hi
            );
        }
    }

    #[test]
    fn test_invalid_rows_come_back_nan() {
        let s2 = vec![1.0, 2.0, f64::NAN, 1.5];
        let df = vec![4.0, 0.0, 4.0, 4.0];
        let prior = squeeze_var(&s2, &df).unwrap();
        assert!(prior.var_post[0].is_finite());
        assert!(prior.var_post[1].is_nan()); // df = 0
        assert!(prior.var_post[3].is_finite());
    }

    #[test]
    fn test_all_unusable_is_an_error() {
        let err = squeeze_var(&[f64::NAN, 0.0], &[4.0, 0.0]).unwrap_err();
        assert!(matches!(err, QuantError::Numerical(_)));
    }
}
