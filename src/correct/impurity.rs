//! Isotope impurity correction for isobaric reporter channels.
//!
//! Reagent channels leak a small, lot-specific fraction of their signal into
//! neighboring channels. Given the vendor's impurity matrix, the observed
//! intensities are a linear mix of the true per-channel signals, and the
//! correction solves that linear system once per row.
//!
//! # Algorithm
//!
//! For an impurity matrix P where `P[i][j]` is the fraction of channel i's
//! signal detected in channel j, an observed row m relates to the true
//! signal c by `transpose(P) * c = m`. The engine inverts `transpose(P)`
//! once at construction and computes `c = inverse(transpose(P)) * m` per
//! row. Unmixed values below zero are clamped to zero, and any cell whose
//! observed input sat below the detection floor stays zero.
//!
//! # Reference
//!
//! Gatto L, Lilley KS (2012). MSnbase - an R/Bioconductor package for
//! isobaric tagged mass spectrometry data visualization, processing and
//! quantitation. Bioinformatics 28(2):288-289.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::data::ReporterMatrix;
use crate::error::{QuantError, Result};

/// Observed intensities below this value are considered unquantified; the
/// correction never manufactures signal for them.
const DETECTION_FLOOR: f64 = 1.0;

/// A validated impurity matrix with its precomputed unmixing inverse.
#[derive(Debug, Clone)]
pub struct ImpurityMatrix {
    channels: Vec<String>,
    /// The vendor matrix P (source channel x detected channel).
    matrix: DMatrix<f64>,
    /// `inverse(transpose(P))`, computed once.
    unmix: DMatrix<f64>,
}

impl ImpurityMatrix {
    /// Validate a matrix and precompute its unmixing inverse.
    pub fn new(matrix: DMatrix<f64>, channels: Vec<String>) -> Result<Self> {
        let n = channels.len();
        if matrix.nrows() != matrix.ncols() {
            return Err(QuantError::Configuration(format!(
                "impurity matrix must be square, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if matrix.nrows() != n {
            return Err(QuantError::DimensionMismatch {
                expected: n,
                actual: matrix.nrows(),
            });
        }
        for value in matrix.iter() {
            if !value.is_finite() || *value < 0.0 {
                return Err(QuantError::Configuration(format!(
                    "impurity fractions must be finite and non-negative, got {}",
                    value
                )));
            }
        }
        let unmix = matrix.transpose().try_inverse().ok_or_else(|| {
            QuantError::Configuration(
                "impurity matrix is singular and cannot be inverted".to_string(),
            )
        })?;
        Ok(Self {
            channels,
            matrix,
            unmix,
        })
    }

    /// Load an impurity matrix from a TSV file.
    ///
    /// Expected format:
    /// - First row: header with channel labels (first cell is ignored)
    /// - Subsequent rows: channel label followed by impurity fractions,
    ///   in the same channel order as the header
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| QuantError::EmptyData("empty impurity matrix file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(QuantError::EmptyData(
                "impurity matrix must have at least one channel".to_string(),
            ));
        }
        let channels: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();
        let n = channels.len();

        let mut values = Vec::with_capacity(n * n);
        let mut row_labels = Vec::with_capacity(n);
        for (row_idx, line_result) in lines.enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != n + 1 {
                return Err(QuantError::DimensionMismatch {
                    expected: n + 1,
                    actual: fields.len(),
                });
            }
            row_labels.push(fields[0].trim().to_string());
            for (col_idx, raw) in fields[1..].iter().enumerate() {
                let value: f64 = raw.trim().parse().map_err(|_| QuantError::InvalidValue {
                    value: raw.to_string(),
                    row: row_idx,
                    column: channels[col_idx].clone(),
                })?;
                values.push(value);
            }
        }
        if row_labels != channels {
            return Err(QuantError::Configuration(format!(
                "impurity matrix row labels {:?} do not match header channels {:?}",
                row_labels, channels
            )));
        }

        let matrix = DMatrix::from_row_slice(n, n, &values);
        Self::new(matrix, channels)
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// The vendor matrix as given.
    #[inline]
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}

/// Result of applying impurity correction to a reporter matrix.
#[derive(Debug, Clone)]
pub struct CorrectedMatrix {
    matrix: ReporterMatrix,
    n_clamped: usize,
    n_suppressed: usize,
}

impl CorrectedMatrix {
    /// The corrected intensities.
    #[inline]
    pub fn matrix(&self) -> &ReporterMatrix {
        &self.matrix
    }

    /// Consume and return the corrected intensities.
    pub fn into_matrix(self) -> ReporterMatrix {
        self.matrix
    }

    /// Cells whose unmixed value fell below zero and was clamped.
    #[inline]
    pub fn n_clamped(&self) -> usize {
        self.n_clamped
    }

    /// Cells zeroed because their observed input sat below the detection
    /// floor.
    #[inline]
    pub fn n_suppressed(&self) -> usize {
        self.n_suppressed
    }
}

/// Unmix reporter intensities through a validated impurity matrix.
///
/// Rows are independent and processed in parallel. Missing observations
/// (zero) enter the linear system as zero and can never gain signal from
/// the correction.
pub fn correct_impurities(
    matrix: &ReporterMatrix,
    impurity: &ImpurityMatrix,
) -> Result<CorrectedMatrix> {
    if matrix.channels() != impurity.channels() {
        return Err(QuantError::Configuration(format!(
            "impurity matrix channels {:?} do not match reporter channels {:?}",
            impurity.channels(),
            matrix.channels()
        )));
    }

    let n_channels = matrix.n_channels();
    let rows: Vec<(Vec<f64>, usize, usize)> = (0..matrix.n_rows())
        .into_par_iter()
        .map(|row| {
            let observed = DVector::from_vec(matrix.row_dense(row));
            let unmixed = &impurity.unmix * &observed;
            let mut out = vec![0.0; n_channels];
            let mut n_clamped = 0;
            let mut n_suppressed = 0;
            for c in 0..n_channels {
                if observed[c] < DETECTION_FLOOR {
                    if unmixed[c] > 0.0 {
                        n_suppressed += 1;
                    }
                    continue;
                }
                if unmixed[c] < 0.0 {
                    n_clamped += 1;
                    continue;
                }
                out[c] = unmixed[c];
            }
            (out, n_clamped, n_suppressed)
        })
        .collect();

    let mut n_clamped = 0;
    let mut n_suppressed = 0;
    for (_, clamped, suppressed) in &rows {
        n_clamped += clamped;
        n_suppressed += suppressed;
    }
    let data = DMatrix::from_fn(matrix.n_rows(), n_channels, |r, c| rows[r].0[c]);
    let corrected = ReporterMatrix::new(
        data,
        matrix.row_ids().to_vec(),
        matrix.channels().to_vec(),
    )?;
    Ok(CorrectedMatrix {
        matrix: corrected,
        n_clamped,
        n_suppressed,
    })
}
