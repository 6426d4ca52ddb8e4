//! Feature table filtering.
//!
//! Filtering is a fixed, ordered sequence of row predicates, each reporting
//! row counts before and after so the final table's provenance is auditable:
//!
//! 1. contaminant / reverse flags
//! 2. identification quality (only-by-site for proteins, score for sites)
//! 3. razor + unique peptide support (proteins only)
//! 4. quantification provenance (at least one PSM survived screening)
//! 5. valid-value count within at least one group
//! 6. top-3 mean log2 intensity cutoff
//!
//! The predicates test disjoint row properties, so the surviving set does not
//! depend on the order; the order is fixed anyway so reported per-stage
//! counts are comparable across runs.

mod identity;
mod intensity;
mod provenance;
mod valid_values;

pub use identity::{filter_flagged, filter_identification, filter_peptide_support};
pub use intensity::{filter_intensity, IntensityCutoff};
pub use provenance::filter_quantified;
pub use valid_values::filter_valid_values;

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::data::FeatureTable;
use crate::error::{QuantError, Result};

/// Thresholds for the filter pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum identification score (site tables).
    pub min_score: f64,
    /// Minimum razor + unique peptide count (protein tables).
    pub min_razor_unique_peptides: u32,
    /// Minimum observed channels required within at least one group.
    pub min_valid_values: usize,
    /// Low-intensity cutoff; defaults per table kind when unset.
    pub intensity_cutoff: Option<IntensityCutoff>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            min_score: 40.0,
            min_razor_unique_peptides: 2,
            min_valid_values: 2,
            intensity_cutoff: None,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_score.is_finite() {
            return Err(QuantError::Configuration(
                "min_score must be finite".to_string(),
            ));
        }
        if let Some(cutoff) = &self.intensity_cutoff {
            cutoff.validate()?;
        }
        Ok(())
    }
}

/// One stage of the filter pipeline, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Flagged,
    Identification,
    PeptideSupport,
    Unquantified,
    ValidValues,
    LowIntensity,
}

impl FilterStage {
    pub const ALL: [FilterStage; 6] = [
        FilterStage::Flagged,
        FilterStage::Identification,
        FilterStage::PeptideSupport,
        FilterStage::Unquantified,
        FilterStage::ValidValues,
        FilterStage::LowIntensity,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FilterStage::Flagged => "flagged",
            FilterStage::Identification => "identification",
            FilterStage::PeptideSupport => "peptide support",
            FilterStage::Unquantified => "unquantified",
            FilterStage::ValidValues => "valid values",
            FilterStage::LowIntensity => "low intensity",
        }
    }
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Row counts for one applied stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: FilterStage,
    pub n_before: usize,
    pub n_after: usize,
    pub n_removed: usize,
}

/// Per-stage audit trail of a filter run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterReport {
    /// Stage results in application order.
    pub stages: Vec<StageResult>,
    /// Features entering the pipeline.
    pub n_before: usize,
    /// Features surviving all stages.
    pub n_after: usize,
}

impl FilterReport {
    /// Proportion of features retained.
    pub fn retention_rate(&self) -> f64 {
        if self.n_before == 0 {
            0.0
        } else {
            self.n_after as f64 / self.n_before as f64
        }
    }
}

impl std::fmt::Display for FilterReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Feature Filter Report")?;
        for s in &self.stages {
            writeln!(
                f,
                "  {:<16} {:>6} -> {:<6} ({} removed)",
                s.stage.label(),
                s.n_before,
                s.n_after,
                s.n_removed
            )?;
        }
        writeln!(
            f,
            "  Retained: {} of {} features ({:.1}%)",
            self.n_after,
            self.n_before,
            self.retention_rate() * 100.0
        )?;
        Ok(())
    }
}

/// Run the full filter pipeline over a feature table.
///
/// Stages apply in the fixed order above; an unset intensity cutoff falls
/// back to the table kind's default. A stage that removes every remaining
/// row fails with [`QuantError::EmptyData`] naming that stage.
pub fn run_filters(
    table: FeatureTable,
    channels: &ChannelConfig,
    config: &FilterConfig,
) -> Result<(FeatureTable, FilterReport)> {
    config.validate()?;

    let kind = table.kind();
    let cutoff = config
        .intensity_cutoff
        .unwrap_or_else(|| IntensityCutoff::default_for(kind));

    let largest_group = channels
        .unique_groups()
        .iter()
        .map(|g| channels.group_indices(g).len())
        .max()
        .unwrap_or(0);
    if config.min_valid_values > largest_group {
        log::warn!(
            "min_valid_values = {} exceeds the largest group ({} channels); no feature can pass",
            config.min_valid_values,
            largest_group
        );
    }

    let n_before = table.n_features();
    let mut stages = Vec::with_capacity(FilterStage::ALL.len());
    let mut current = table;
    for stage in FilterStage::ALL {
        let kept = match stage {
            FilterStage::Flagged => filter_flagged(&current),
            FilterStage::Identification => filter_identification(&current, config.min_score),
            FilterStage::PeptideSupport => {
                filter_peptide_support(&current, config.min_razor_unique_peptides)
            }
            FilterStage::Unquantified => filter_quantified(&current),
            FilterStage::ValidValues => {
                filter_valid_values(&current, channels, config.min_valid_values)
            }
            FilterStage::LowIntensity => filter_intensity(&current, cutoff)?,
        };
        let stage_before = current.n_features();
        current = current.subset(&kept)?;
        stages.push(StageResult {
            stage,
            n_before: stage_before,
            n_after: current.n_features(),
            n_removed: stage_before - current.n_features(),
        });
        if current.is_empty() {
            return Err(QuantError::EmptyData(format!(
                "no {} features remain after the {} filter",
                kind, stage
            )));
        }
    }

    let report = FilterReport {
        stages,
        n_before,
        n_after: current.n_features(),
    };
    Ok((current, report))
}
