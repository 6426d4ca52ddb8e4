//! Feature tables: protein groups and modification sites.
//!
//! A feature table starts as identification metadata plus PSM references;
//! its reporter intensity slots are filled by aggregation, not read from the
//! source file. Site tables additionally carry native per-multiplicity
//! reporter columns (`...___1`, `...___2`, ...) that replace the aggregated
//! sums once the table is expanded to one row per modification state.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{ChannelConfig, ColumnConfig, TableKind};
use crate::data::fasta::GeneExtractor;
use crate::data::parse::{parse_count, parse_flag, parse_intensity, parse_metric, split_ids};
use crate::data::{ChannelSet, ReporterMatrix};
use crate::error::{QuantError, Result};

/// Reporter intensities for one modification state of a site row.
#[derive(Debug, Clone)]
pub struct SiteState {
    /// Modification multiplicity (1, 2, 3...).
    pub mod_count: u32,
    pub intensity: Vec<f64>,
    pub corrected: Vec<f64>,
}

/// One quantifiable feature (protein group or modification site).
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    pub id: String,
    pub gene: String,
    pub contaminant: bool,
    pub reverse: bool,
    pub only_by_site: bool,
    pub score: f64,
    pub razor_unique_peptides: u32,
    /// Identifiers of the PSMs supporting this feature.
    pub psm_ids: Vec<String>,
    /// Modification multiplicity after site-state expansion.
    pub mod_count: Option<u32>,
    /// Native per-state reporter columns, drained by expansion.
    pub site_states: Vec<SiteState>,
    /// Reporter intensities (as-measured channel set). Zero means missing.
    pub intensity: Vec<f64>,
    /// Reporter intensities (interference-corrected channel set).
    pub corrected: Vec<f64>,
    /// Abundance-weighted estimated interference level.
    pub interference: f64,
    /// Abundance-weighted precursor purity fraction.
    pub purity: f64,
    /// True once at least one referenced PSM survived upstream screening.
    pub quantified: bool,
}

impl FeatureRecord {
    /// An empty record with zeroed intensity slots, filled in by loaders,
    /// aggregation, and tests.
    pub fn new(id: impl Into<String>, n_channels: usize) -> Self {
        FeatureRecord {
            id: id.into(),
            gene: String::new(),
            contaminant: false,
            reverse: false,
            only_by_site: false,
            score: f64::NAN,
            razor_unique_peptides: 0,
            psm_ids: Vec::new(),
            mod_count: None,
            site_states: Vec::new(),
            intensity: vec![0.0; n_channels],
            corrected: vec![0.0; n_channels],
            interference: f64::NAN,
            purity: f64::NAN,
            quantified: false,
        }
    }
}

/// Statistics from site-state expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteExpansion {
    /// Site rows before expansion.
    pub n_features: usize,
    /// Rows after expansion.
    pub n_rows: usize,
    /// Candidate state rows dropped for having no signal in either set.
    pub n_dropped: usize,
}

/// A table of features of one granularity.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    kind: TableKind,
    records: Vec<FeatureRecord>,
    channels: Vec<String>,
}

/// Header positions of one channel set's per-state reporter columns.
/// Outer key is the modification state.
type StatePositions = BTreeMap<u32, Vec<usize>>;

fn state_pattern(base: &str) -> String {
    let trimmed = base.strip_suffix('$').unwrap_or(base);
    format!(r"{}___(\d+)$", trimmed)
}

fn site_state_positions(
    headers: &[String],
    base_pattern: &str,
    channels: &ChannelConfig,
    table: &str,
) -> Result<StatePositions> {
    let pattern = state_pattern(base_pattern);
    let re = Regex::new(&pattern)
        .map_err(|e| QuantError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))?;

    let mut found: BTreeMap<u32, Vec<Option<usize>>> = BTreeMap::new();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(caps) = re.captures(header) {
            let label = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let state: u32 = match caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                Some(s) => s,
                None => continue,
            };
            if let Some(slot) = channels.labels.iter().position(|l| l == label) {
                found
                    .entry(state)
                    .or_insert_with(|| vec![None; channels.n_channels()])
                    [slot] = Some(idx);
            }
        }
    }
    if found.is_empty() {
        return Err(QuantError::MissingColumn {
            column: format!("per-state reporter columns (pattern '{}')", pattern),
            table: table.to_string(),
        });
    }
    found
        .into_iter()
        .map(|(state, slots)| {
            let complete: Result<Vec<usize>> = slots
                .into_iter()
                .enumerate()
                .map(|(slot, pos)| {
                    pos.ok_or_else(|| QuantError::MissingColumn {
                        column: format!(
                            "reporter channel '{}' for modification state {}",
                            channels.labels[slot], state
                        ),
                        table: table.to_string(),
                    })
                })
                .collect();
            Ok((state, complete?))
        })
        .collect()
}

fn named_position(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn require_position(headers: &[String], name: &str, table: &str) -> Result<usize> {
    named_position(headers, name).ok_or_else(|| QuantError::MissingColumn {
        column: name.to_string(),
        table: table.to_string(),
    })
}

impl FeatureTable {
    /// Build a table from records, validating channel widths.
    pub fn from_records(
        kind: TableKind,
        records: Vec<FeatureRecord>,
        channels: Vec<String>,
    ) -> Result<Self> {
        let n = channels.len();
        for rec in &records {
            if rec.intensity.len() != n || rec.corrected.len() != n {
                return Err(QuantError::DimensionMismatch {
                    expected: n,
                    actual: rec.intensity.len().min(rec.corrected.len()),
                });
            }
            for state in &rec.site_states {
                if state.intensity.len() != n || state.corrected.len() != n {
                    return Err(QuantError::DimensionMismatch {
                        expected: n,
                        actual: state.intensity.len().min(state.corrected.len()),
                    });
                }
            }
        }
        Ok(Self {
            kind,
            records,
            channels,
        })
    }

    /// Load a feature table from a TSV file.
    pub fn from_tsv<P: AsRef<Path>>(
        path: P,
        kind: TableKind,
        columns: &ColumnConfig,
        channels: &ChannelConfig,
    ) -> Result<Self> {
        let table_name = format!("{} table", kind);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path.as_ref())?;
        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();

        let idx_id = require_position(&headers, &columns.feature_id, &table_name)?;
        let idx_msms = require_position(&headers, &columns.msms_ids, &table_name)?;
        let idx_gene = named_position(&headers, &columns.gene_names);
        let idx_fasta = named_position(&headers, &columns.fasta_headers);
        let idx_contaminant = named_position(&headers, &columns.contaminant);
        let idx_reverse = named_position(&headers, &columns.reverse);
        let idx_only_by_site = named_position(&headers, &columns.only_by_site);
        let idx_score = match kind {
            TableKind::Site => Some(require_position(&headers, &columns.score, &table_name)?),
            TableKind::Protein => named_position(&headers, &columns.score),
        };
        let idx_peptides = match kind {
            TableKind::Protein => Some(require_position(
                &headers,
                &columns.razor_unique_peptides,
                &table_name,
            )?),
            TableKind::Site => named_position(&headers, &columns.razor_unique_peptides),
        };
        let states: Option<(StatePositions, StatePositions)> = match kind {
            TableKind::Site => Some((
                site_state_positions(&headers, &columns.reporter, channels, &table_name)?,
                site_state_positions(
                    &headers,
                    &columns.reporter_corrected,
                    channels,
                    &table_name,
                )?,
            )),
            TableKind::Protein => None,
        };
        if let Some((plain, corrected)) = &states {
            let plain_states: Vec<u32> = plain.keys().copied().collect();
            let corrected_states: Vec<u32> = corrected.keys().copied().collect();
            if plain_states != corrected_states {
                return Err(QuantError::Configuration(format!(
                    "modification states differ between channel sets: {:?} vs {:?}",
                    plain_states, corrected_states
                )));
            }
        }

        let gene_extractor = GeneExtractor::new();
        let n_channels = channels.n_channels();
        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            let field = |idx: usize| record.get(idx).unwrap_or("");
            let opt_field = |idx: Option<usize>| idx.map(field).unwrap_or("");

            let id = field(idx_id).trim().to_string();
            if id.is_empty() {
                return Err(QuantError::InvalidValue {
                    value: String::new(),
                    row,
                    column: columns.feature_id.clone(),
                });
            }

            let mut gene = opt_field(idx_gene).trim().to_string();
            if gene.is_empty() {
                if let Some(g) = gene_extractor.extract(opt_field(idx_fasta)) {
                    gene = g;
                }
            }

            let score = match parse_metric(opt_field(idx_score)) {
                Some(v) => v,
                None => {
                    return Err(QuantError::InvalidValue {
                        value: opt_field(idx_score).to_string(),
                        row,
                        column: columns.score.clone(),
                    })
                }
            };
            let razor_unique_peptides = match parse_count(opt_field(idx_peptides)) {
                Some(v) => v,
                None => {
                    return Err(QuantError::InvalidValue {
                        value: opt_field(idx_peptides).to_string(),
                        row,
                        column: columns.razor_unique_peptides.clone(),
                    })
                }
            };

            let mut site_states = Vec::new();
            if let Some((plain, corrected)) = &states {
                for (state, plain_pos) in plain {
                    let corrected_pos = &corrected[state];
                    let read_set = |positions: &[usize]| -> Result<Vec<f64>> {
                        positions
                            .iter()
                            .map(|&idx| {
                                parse_intensity(field(idx)).ok_or_else(|| {
                                    QuantError::InvalidValue {
                                        value: field(idx).to_string(),
                                        row,
                                        column: headers[idx].clone(),
                                    }
                                })
                            })
                            .collect()
                    };
                    site_states.push(SiteState {
                        mod_count: *state,
                        intensity: read_set(plain_pos)?,
                        corrected: read_set(corrected_pos)?,
                    });
                }
            }

            records.push(FeatureRecord {
                id,
                gene,
                contaminant: parse_flag(opt_field(idx_contaminant)),
                reverse: parse_flag(opt_field(idx_reverse)),
                only_by_site: parse_flag(opt_field(idx_only_by_site)),
                score,
                razor_unique_peptides,
                psm_ids: split_ids(field(idx_msms)),
                mod_count: None,
                site_states,
                intensity: vec![0.0; n_channels],
                corrected: vec![0.0; n_channels],
                interference: f64::NAN,
                purity: f64::NAN,
                quantified: false,
            });
        }

        if records.is_empty() {
            return Err(QuantError::EmptyData(format!("no rows in {}", table_name)));
        }
        Self::from_records(kind, records, channels.labels.clone())
    }

    #[inline]
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    #[inline]
    pub fn n_features(&self) -> usize {
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
    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    #[inline]
    pub fn records_mut(&mut self) -> &mut [FeatureRecord] {
        &mut self.records
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

    /// Subset to the given rows, preserving order of `indices`.
    pub fn subset(&self, indices: &[usize]) -> Result<FeatureTable> {
        for &row in indices {
            if row >= self.records.len() {
                return Err(QuantError::Pipeline(format!(
                    "feature index {} out of bounds for {} rows",
                    row,
                    self.records.len()
                )));
            }
        }
        let records = indices.iter().map(|&i| self.records[i].clone()).collect();
        Ok(FeatureTable {
            kind: self.kind,
            records,
            channels: self.channels.clone(),
        })
    }

    /// Expand a site table to one row per modification state.
    ///
    /// Each native state whose reporter columns carry any signal becomes its
    /// own row: the state's intensities replace the aggregated sums in both
    /// channel sets and `mod_count` records the multiplicity. States with no
    /// signal in either set are dropped. Quality metrics and provenance are
    /// inherited from the parent site row. Protein tables pass through
    /// untouched.
    pub fn expand_site_states(self) -> (FeatureTable, SiteExpansion) {
        if self.kind != TableKind::Site {
            let stats = SiteExpansion {
                n_features: self.records.len(),
                n_rows: self.records.len(),
                n_dropped: 0,
            };
            return (self, stats);
        }

        let n_features = self.records.len();
        let mut expanded = Vec::new();
        let mut n_dropped = 0usize;
        for mut record in self.records {
            let states = std::mem::take(&mut record.site_states);
            let base = record;
            for state in states {
                let has_signal = state.intensity.iter().any(|&v| v > 0.0)
                    || state.corrected.iter().any(|&v| v > 0.0);
                if !has_signal {
                    n_dropped += 1;
                    continue;
                }
                let mut row = base.clone();
                row.mod_count = Some(state.mod_count);
                row.intensity = state.intensity;
                row.corrected = state.corrected;
                expanded.push(row);
            }
        }

        let stats = SiteExpansion {
            n_features,
            n_rows: expanded.len(),
            n_dropped,
        };
        (
            FeatureTable {
                kind: TableKind::Site,
                records: expanded,
                channels: self.channels,
            },
            stats,
        )
    }
}
