//! Dense reporter-ion intensity matrix.

use crate::error::{QuantError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;

/// A dense matrix of reporter-ion intensities.
///
/// Rows represent quantified entities (PSMs or features), columns represent
/// isobaric channels. Zero encodes a missing observation throughout the
/// pipeline; negative values never survive a constructor-validated matrix
/// because every producer clamps at zero.
#[derive(Debug, Clone)]
pub struct ReporterMatrix {
    /// Intensities (rows x channels).
    data: DMatrix<f64>,
    /// Row identifiers.
    row_ids: Vec<String>,
    /// Channel labels (column names).
    channels: Vec<String>,
}

impl ReporterMatrix {
    /// Create a new ReporterMatrix from a dense matrix and identifiers.
    pub fn new(data: DMatrix<f64>, row_ids: Vec<String>, channels: Vec<String>) -> Result<Self> {
        if data.nrows() != row_ids.len() {
            return Err(QuantError::DimensionMismatch {
                expected: data.nrows(),
                actual: row_ids.len(),
            });
        }
        if data.ncols() != channels.len() {
            return Err(QuantError::DimensionMismatch {
                expected: data.ncols(),
                actual: channels.len(),
            });
        }
        Ok(Self {
            data,
            row_ids,
            channels,
        })
    }

    /// Number of rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of channels (columns).
    #[inline]
    pub fn n_channels(&self) -> usize {
        self.data.ncols()
    }

    /// Intensity at (row, channel). Zero means missing.
    #[inline]
    pub fn get(&self, row: usize, channel: usize) -> f64 {
        self.data[(row, channel)]
    }

    /// Row identifiers.
    #[inline]
    pub fn row_ids(&self) -> &[String] {
        &self.row_ids
    }

    /// Channel labels.
    #[inline]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// The underlying dense matrix.
    #[inline]
    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Consume and return the underlying dense matrix.
    pub fn into_data(self) -> DMatrix<f64> {
        self.data
    }

    /// One row as a dense vector.
    pub fn row_dense(&self, row: usize) -> Vec<f64> {
        self.data.row(row).iter().copied().collect()
    }

    /// Sum of a row's intensities. Missing cells are zero, so they do not
    /// contribute.
    #[inline]
    pub fn row_sum(&self, row: usize) -> f64 {
        self.data.row(row).sum()
    }

    /// Number of observed (non-zero, finite) cells in a row.
    pub fn n_observed(&self, row: usize) -> usize {
        self.data
            .row(row)
            .iter()
            .filter(|v| v.is_finite() && **v > 0.0)
            .count()
    }

    /// Per-channel totals across all rows.
    pub fn channel_sums(&self) -> Vec<f64> {
        (0..self.n_channels())
            .map(|c| self.data.column(c).sum())
            .collect()
    }

    /// Log2-transform into a working matrix where missing (zero or
    /// non-positive) cells become NaN.
    pub fn to_log2(&self) -> DMatrix<f64> {
        let (nrows, ncols) = self.data.shape();
        let values: Vec<f64> = (0..nrows)
            .into_par_iter()
            .flat_map_iter(|row| {
                (0..ncols).map(move |col| {
                    let v = self.data[(row, col)];
                    if v.is_finite() && v > 0.0 {
                        v.log2()
                    } else {
                        f64::NAN
                    }
                })
            })
            .collect();
        DMatrix::from_fn(nrows, ncols, |r, c| values[r * ncols + c])
    }

    /// Rebuild from a log2-space working matrix: finite cells are
    /// exponentiated back, NaN cells return to the zero missing encoding.
    pub fn from_log2(
        log_data: &DMatrix<f64>,
        row_ids: Vec<String>,
        channels: Vec<String>,
    ) -> Result<Self> {
        let data = DMatrix::from_fn(log_data.nrows(), log_data.ncols(), |r, c| {
            let v = log_data[(r, c)];
            if v.is_finite() {
                v.exp2()
            } else {
                0.0
            }
        });
        Self::new(data, row_ids, channels)
    }

    /// Subset to the given rows, preserving order of `indices`.
    pub fn subset_rows(&self, indices: &[usize]) -> Result<Self> {
        for &row in indices {
            if row >= self.n_rows() {
                return Err(QuantError::Pipeline(format!(
                    "row index {} out of bounds for {} rows",
                    row,
                    self.n_rows()
                )));
            }
        }
        let data = DMatrix::from_fn(indices.len(), self.n_channels(), |r, c| {
            self.data[(indices[r], c)]
        });
        let row_ids = indices.iter().map(|&i| self.row_ids[i].clone()).collect();
        Self::new(data, row_ids, self.channels.clone())
    }
}
