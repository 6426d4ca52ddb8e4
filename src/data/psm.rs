//! PSM-level evidence table.
//!
//! Loads the spectrum-to-peptide match table that carries per-PSM reporter
//! intensities in two channel sets (as measured, and with the upstream
//! interference correction applied), together with the spectrum quality
//! metrics consumed by aggregation.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use crate::config::{ChannelConfig, ColumnConfig};
use crate::data::parse::{parse_intensity, parse_metric};
use crate::data::{ChannelSet, ReporterMatrix};
use crate::error::{QuantError, Result};

/// A single peptide-spectrum match with its reporter measurements.
#[derive(Debug, Clone)]
pub struct PsmRecord {
    pub id: String,
    /// Reporter intensities as measured. Zero means missing.
    pub intensity: Vec<f64>,
    /// Reporter intensities after upstream interference correction.
    pub corrected: Vec<f64>,
    /// Estimated interference level of the precursor window.
    pub interference: f64,
    /// Precursor purity fraction.
    pub purity: f64,
    /// Minimum observed MS2 intensity for this spectrum, used as the
    /// substitution floor.
    pub min_ms2_intensity: f64,
}

/// A table of PSMs indexed by identifier.
#[derive(Debug, Clone)]
pub struct PsmTable {
    records: Vec<PsmRecord>,
    channels: Vec<String>,
    index: HashMap<String, usize>,
    has_min_ms2: bool,
}

/// Resolved header positions for one channel set.
fn reporter_positions(
    headers: &[String],
    pattern: &str,
    channels: &ChannelConfig,
    table: &str,
) -> Result<Vec<usize>> {
    let re = Regex::new(pattern)
        .map_err(|e| QuantError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))?;
    let mut positions = vec![None; channels.n_channels()];
    for (idx, header) in headers.iter().enumerate() {
        if let Some(caps) = re.captures(header) {
            let label = caps
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default();
            if let Some(slot) = channels.labels.iter().position(|l| l == label) {
                positions[slot] = Some(idx);
            }
        }
    }
    positions
        .into_iter()
        .enumerate()
        .map(|(slot, pos)| {
            pos.ok_or_else(|| QuantError::MissingColumn {
                column: format!(
                    "reporter channel '{}' (pattern '{}')",
                    channels.labels[slot], pattern
                ),
                table: table.to_string(),
            })
        })
        .collect()
}

/// Exact-name column lookup.
fn named_position(headers: &[String], name: &str, table: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| QuantError::MissingColumn {
            column: name.to_string(),
            table: table.to_string(),
        })
}

impl PsmTable {
    /// Build a table from records. Record vectors must match the channel
    /// count and identifiers must be unique.
    pub fn from_records(records: Vec<PsmRecord>, channels: Vec<String>) -> Result<Self> {
        let n = channels.len();
        let mut index = HashMap::with_capacity(records.len());
        for (row, rec) in records.iter().enumerate() {
            if rec.intensity.len() != n || rec.corrected.len() != n {
                return Err(QuantError::DimensionMismatch {
                    expected: n,
                    actual: rec.intensity.len().min(rec.corrected.len()),
                });
            }
            if index.insert(rec.id.clone(), row).is_some() {
                return Err(QuantError::InvalidValue {
                    value: rec.id.clone(),
                    row,
                    column: "id".to_string(),
                });
            }
        }
        Ok(Self {
            records,
            channels,
            index,
            has_min_ms2: true,
        })
    }

    /// Load a PSM table from a TSV file using the configured column layout.
    pub fn from_tsv<P: AsRef<Path>>(
        path: P,
        columns: &ColumnConfig,
        channels: &ChannelConfig,
    ) -> Result<Self> {
        const TABLE: &str = "PSM table";
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path.as_ref())?;
        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();

        let plain = reporter_positions(&headers, &columns.reporter, channels, TABLE)?;
        let corrected = reporter_positions(&headers, &columns.reporter_corrected, channels, TABLE)?;
        let idx_id = named_position(&headers, &columns.psm_id, TABLE)?;
        let idx_interference = named_position(&headers, &columns.interference, TABLE)?;
        let idx_purity = named_position(&headers, &columns.purity, TABLE)?;
        let idx_min_ms2 = headers.iter().position(|h| h == &columns.min_ms2_intensity);

        let mut records = Vec::new();
        let mut index = HashMap::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            let field = |idx: usize| record.get(idx).unwrap_or("");

            let parse_set = |positions: &[usize]| -> Result<Vec<f64>> {
                positions
                    .iter()
                    .map(|&idx| {
                        parse_intensity(field(idx)).ok_or_else(|| QuantError::InvalidValue {
                            value: field(idx).to_string(),
                            row,
                            column: headers[idx].clone(),
                        })
                    })
                    .collect()
            };
            let parse_quality = |idx: usize| -> Result<f64> {
                parse_metric(field(idx)).ok_or_else(|| QuantError::InvalidValue {
                    value: field(idx).to_string(),
                    row,
                    column: headers[idx].clone(),
                })
            };

            let id = field(idx_id).trim().to_string();
            if id.is_empty() {
                return Err(QuantError::InvalidValue {
                    value: String::new(),
                    row,
                    column: columns.psm_id.clone(),
                });
            }
            let psm = PsmRecord {
                id: id.clone(),
                intensity: parse_set(&plain)?,
                corrected: parse_set(&corrected)?,
                interference: parse_quality(idx_interference)?,
                purity: parse_quality(idx_purity)?,
                min_ms2_intensity: match idx_min_ms2 {
                    Some(idx) => {
                        let v = parse_quality(idx)?;
                        if v.is_finite() {
                            v.max(0.0)
                        } else {
                            0.0
                        }
                    }
                    None => 0.0,
                },
            };
            if index.insert(id.clone(), records.len()).is_some() {
                return Err(QuantError::InvalidValue {
                    value: id,
                    row,
                    column: columns.psm_id.clone(),
                });
            }
            records.push(psm);
        }

        if records.is_empty() {
            return Err(QuantError::EmptyData(format!("no rows in {}", TABLE)));
        }
        Ok(Self {
            records,
            channels: channels.labels.clone(),
            index,
            has_min_ms2: idx_min_ms2.is_some(),
        })
    }

    #[inline]
    pub fn n_psms(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    #[inline]
    pub fn records(&self) -> &[PsmRecord] {
        &self.records
    }

    /// Whether the source table carried the minimum MS2 intensity column.
    #[inline]
    pub fn has_min_ms2(&self) -> bool {
        self.has_min_ms2
    }

    /// Look up a PSM by identifier.
    pub fn get(&self, id: &str) -> Option<&PsmRecord> {
        self.index.get(id).map(|&row| &self.records[row])
    }

    /// Drop PSMs whose purity fraction falls below `min_purity`. PSMs with
    /// an unknown (NaN) purity are retained. Returns the surviving table
    /// and the number of rows removed.
    pub fn filter_by_purity(self, min_purity: f64) -> (PsmTable, usize) {
        let n_before = self.records.len();
        let kept: Vec<PsmRecord> = self
            .records
            .into_iter()
            .filter(|r| !(r.purity < min_purity))
            .collect();
        let n_removed = n_before - kept.len();
        let mut index = HashMap::with_capacity(kept.len());
        for (row, rec) in kept.iter().enumerate() {
            index.insert(rec.id.clone(), row);
        }
        (
            PsmTable {
                records: kept,
                channels: self.channels,
                index,
                has_min_ms2: self.has_min_ms2,
            },
            n_removed,
        )
    }

    /// Extract one channel set as a reporter matrix, rows in table order.
    pub fn reporter_matrix(&self, set: ChannelSet) -> Result<ReporterMatrix> {
        let n = self.channels.len();
        let data = nalgebra::DMatrix::from_fn(self.records.len(), n, |r, c| match set {
            ChannelSet::Plain => self.records[r].intensity[c],
            ChannelSet::Corrected => self.records[r].corrected[c],
        });
        let row_ids = self.records.iter().map(|r| r.id.clone()).collect();
        ReporterMatrix::new(data, row_ids, self.channels.clone())
    }

    /// Write one channel set back from a reporter matrix of the same shape.
    pub fn set_reporter_matrix(&mut self, set: ChannelSet, matrix: &ReporterMatrix) -> Result<()> {
        if matrix.n_rows() != self.records.len() {
            return Err(QuantError::DimensionMismatch {
                expected: self.records.len(),
                actual: matrix.n_rows(),
            });
        }
        if matrix.n_channels() != self.channels.len() {
            return Err(QuantError::DimensionMismatch {
                expected: self.channels.len(),
                actual: matrix.n_channels(),
            });
        }
        for (r, rec) in self.records.iter_mut().enumerate() {
            let target = match set {
                ChannelSet::Plain => &mut rec.intensity,
                ChannelSet::Corrected => &mut rec.corrected,
            };
            for (c, value) in target.iter_mut().enumerate() {
                *value = matrix.get(r, c);
            }
        }
        Ok(())
    }
}
