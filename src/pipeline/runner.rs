//! End-to-end quantification runs.
//!
//! [`run_pipeline`] owns the file I/O of a run: it loads the PSM and feature
//! tables, the optional impurity matrix and any persisted size factors, hands
//! everything to the pure [`process_tables`], and writes the annotated table
//! (plus freshly estimated size factors) into the results directory.
//!
//! [`process_tables`] sequences the engines over in-memory tables: purity
//! screening, impurity correction of every reporter set, PSM aggregation for
//! both channel sets, site-state expansion, the filter pipeline,
//! normalization, and the statistical screens. Each stage contributes counts
//! to the [`PipelineReport`] that the binary prints at the end of a run.

use std::path::{Path, PathBuf};

use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate_features, AggregateReport};
use crate::config::{AnalysisConfig, TableKind};
use crate::correct::{correct_impurities, ImpurityMatrix};
use crate::data::{ChannelSet, FeatureTable, PsmTable, ReporterMatrix, SiteExpansion};
use crate::error::{QuantError, Result};
use crate::filter::{run_filters, FilterReport};
use crate::normalize::{
    estimate_size_factors, norm_loess_with_config, norm_median, norm_size_factor_with,
    NormalizeMethod, SizeFactors,
};
use crate::pipeline::export::export_table;
use crate::stats::{test_anova, test_moderated, AnovaResult, ModeratedResult};

/// Cell counts and channel totals from unmixing one reporter matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionSummary {
    /// Which matrix was unmixed, e.g. `"PSM plain set"`.
    pub target: String,
    pub n_rows: usize,
    /// Cells clamped from a negative unmixed value to zero.
    pub n_clamped: usize,
    /// Cells held at zero because the observed input sat below the
    /// detection floor.
    pub n_suppressed: usize,
    /// Channel labels ordering the totals below.
    pub channels: Vec<String>,
    /// Per-channel intensity totals entering the unmixing.
    pub totals_before: Vec<f64>,
    /// Per-channel intensity totals after clamping and suppression.
    pub totals_after: Vec<f64>,
}

impl std::fmt::Display for CorrectionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} rows, {} cells clamped, {} suppressed",
            self.target, self.n_rows, self.n_clamped, self.n_suppressed
        )?;
        for (c, label) in self.channels.iter().enumerate() {
            write!(
                f,
                "\n    {}: total {:.4e} -> {:.4e}",
                label, self.totals_before[c], self.totals_after[c]
            )?;
        }
        Ok(())
    }
}

/// Normalization metadata for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationSummary {
    pub method: NormalizeMethod,
    /// One note per channel set or factor source.
    pub notes: Vec<String>,
}

/// Fit counts from one statistical screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    /// Screen label: `"anova"` or the contrast name.
    pub name: String,
    pub n_rows: usize,
    /// Rows without a defined p-value.
    pub n_unfit: usize,
    /// Rows with q < 0.05.
    pub n_significant: usize,
}

/// Aggregated stage reports of one quantification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub kind: TableKind,
    /// PSM rows entering the purity screen.
    pub n_psms_loaded: usize,
    /// PSM rows discarded by the purity screen.
    pub n_psms_low_purity: usize,
    /// One entry per unmixed matrix; empty without an impurity matrix.
    pub corrections: Vec<CorrectionSummary>,
    pub aggregation_plain: AggregateReport,
    pub aggregation_corrected: AggregateReport,
    /// Present for site tables only.
    pub site_expansion: Option<SiteExpansion>,
    pub filter: FilterReport,
    pub normalization: NormalizationSummary,
    /// One entry per statistical screen, in execution order.
    pub stats: Vec<StatsSummary>,
    /// Files written by [`run_pipeline`]; empty for a pure in-memory run.
    pub outputs: Vec<PathBuf>,
}

impl std::fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Quantification Report ({} table)", self.kind)?;
        writeln!(
            f,
            "  PSMs: {} of {} passed the purity screen",
            self.n_psms_loaded - self.n_psms_low_purity,
            self.n_psms_loaded
        )?;
        for c in &self.corrections {
            writeln!(f, "  impurity correction, {}", c)?;
        }
        writeln!(f, "  plain set: {}", self.aggregation_plain)?;
        writeln!(f, "  corrected set: {}", self.aggregation_corrected)?;
        if let Some(x) = &self.site_expansion {
            writeln!(
                f,
                "  site states: {} sites -> {} state rows, {} silent states dropped",
                x.n_features, x.n_rows, x.n_dropped
            )?;
        }
        write!(f, "{}", self.filter)?;
        writeln!(f, "  normalization: {}", self.normalization.method)?;
        for note in &self.normalization.notes {
            writeln!(f, "    {}", note)?;
        }
        for s in &self.stats {
            writeln!(
                f,
                "  {}: {} rows tested, {} unfit, {} significant at q < 0.05",
                s.name, s.n_rows, s.n_unfit, s.n_significant
            )?;
        }
        for path in &self.outputs {
            writeln!(f, "  wrote {}", path.display())?;
        }
        Ok(())
    }
}

/// Everything a finished run produces.
#[derive(Debug)]
pub struct QuantOutput {
    /// The filtered, normalized, annotated feature table.
    pub table: FeatureTable,
    /// ANOVA screen results, when enabled.
    pub anova: Option<AnovaResult>,
    /// Moderated contrast results, in configuration order.
    pub comparisons: Vec<ModeratedResult>,
    /// Size factors estimated during this run. Absent when factors were
    /// reused from disk or another normalization method ran.
    pub estimated_size_factors: Option<SizeFactors>,
    pub report: PipelineReport,
}

/// Unmix both channel sets of the PSM table in place.
fn correct_psm_sets(
    psms: &mut PsmTable,
    impurity: &ImpurityMatrix,
) -> Result<Vec<CorrectionSummary>> {
    let mut summaries = Vec::with_capacity(2);
    for set in ChannelSet::ALL {
        let matrix = psms.reporter_matrix(set)?;
        let corrected = correct_impurities(&matrix, impurity)?;
        summaries.push(CorrectionSummary {
            target: format!("PSM {} set", set),
            n_rows: matrix.n_rows(),
            n_clamped: corrected.n_clamped(),
            n_suppressed: corrected.n_suppressed(),
            channels: matrix.channels().to_vec(),
            totals_before: matrix.channel_sums(),
            totals_after: corrected.matrix().channel_sums(),
        });
        psms.set_reporter_matrix(set, corrected.matrix())?;
    }
    Ok(summaries)
}

/// Unmix the bundled per-state reporter columns of a site table in place.
///
/// The states of every site are stacked into one matrix per channel set so
/// the unmixing runs with the same parallelism as the PSM pass.
fn correct_site_states(
    features: &mut FeatureTable,
    impurity: &ImpurityMatrix,
) -> Result<Vec<CorrectionSummary>> {
    let channels = features.channels().to_vec();
    let mut summaries = Vec::with_capacity(2);
    for set in ChannelSet::ALL {
        let mut row_ids = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        for rec in features.records() {
            for state in &rec.site_states {
                row_ids.push(format!("{}___{}", rec.id, state.mod_count));
                let cells = match set {
                    ChannelSet::Plain => &state.intensity,
                    ChannelSet::Corrected => &state.corrected,
                };
                values.extend_from_slice(cells);
            }
        }
        if row_ids.is_empty() {
            break;
        }
        let data = DMatrix::from_row_slice(row_ids.len(), channels.len(), &values);
        let matrix = ReporterMatrix::new(data, row_ids, channels.clone())?;
        let corrected = correct_impurities(&matrix, impurity)?;
        summaries.push(CorrectionSummary {
            target: format!("site state {} set", set),
            n_rows: matrix.n_rows(),
            n_clamped: corrected.n_clamped(),
            n_suppressed: corrected.n_suppressed(),
            channels: channels.clone(),
            totals_before: matrix.channel_sums(),
            totals_after: corrected.matrix().channel_sums(),
        });
        let mut row = 0;
        for rec in features.records_mut() {
            for state in &mut rec.site_states {
                let target = match set {
                    ChannelSet::Plain => &mut state.intensity,
                    ChannelSet::Corrected => &mut state.corrected,
                };
                for (c, value) in target.iter_mut().enumerate() {
                    *value = corrected.matrix().get(row, c);
                }
                row += 1;
            }
        }
    }
    Ok(summaries)
}

/// Normalize both channel sets of the table with the configured method.
///
/// Size factors are estimated once on the corrected set and applied to both,
/// unless `persisted` factors were supplied. Returns the report notes and
/// any freshly estimated factors.
fn normalize_table(
    features: &mut FeatureTable,
    persisted: Option<SizeFactors>,
    config: &AnalysisConfig,
) -> Result<(NormalizationSummary, Option<SizeFactors>)> {
    let method = config.normalization.method;
    let mut notes = Vec::new();
    let mut estimated = None;
    match method {
        NormalizeMethod::None => {}
        NormalizeMethod::CyclicLoess => {
            for set in ChannelSet::ALL {
                let matrix = features.reporter_matrix(set)?;
                let result = norm_loess_with_config(&matrix, &config.normalization.loess)?;
                notes.push(format!(
                    "{} set: {} of {} channel pairs lacked shared signal",
                    set,
                    result.n_skipped_pairs(),
                    result.n_pairs()
                ));
                features.set_reporter_matrix(set, result.matrix())?;
            }
        }
        NormalizeMethod::Median => {
            for set in ChannelSet::ALL {
                let matrix = features.reporter_matrix(set)?;
                let result = norm_median(&matrix)?;
                notes.push(format!(
                    "{} set: centered on grand median {:.3}",
                    set,
                    result.grand_median()
                ));
                features.set_reporter_matrix(set, result.matrix())?;
            }
        }
        NormalizeMethod::SizeFactor => {
            let factors = match persisted {
                Some(factors) => {
                    notes.push("reusing persisted size factors".to_string());
                    factors
                }
                None => {
                    let corrected = features.reporter_matrix(ChannelSet::Corrected)?;
                    let factors = estimate_size_factors(&corrected)?;
                    notes.push(format!(
                        "estimated on the corrected set from {} complete rows",
                        factors.n_reference_rows()
                    ));
                    estimated = Some(factors.clone());
                    factors
                }
            };
            for set in ChannelSet::ALL {
                let matrix = features.reporter_matrix(set)?;
                let result = norm_size_factor_with(&matrix, &factors)?;
                features.set_reporter_matrix(set, result.matrix())?;
            }
        }
    }
    Ok((NormalizationSummary { method, notes }, estimated))
}

/// Run the full quantification over in-memory tables.
///
/// Pure apart from logging: no files are read or written. `impurity` enables
/// the unmixing of every reporter set and `persisted` short-circuits size
/// factor estimation. The tables are consumed; every stage hands a new table
/// forward.
pub fn process_tables(
    psms: PsmTable,
    features: FeatureTable,
    impurity: Option<&ImpurityMatrix>,
    persisted: Option<SizeFactors>,
    config: &AnalysisConfig,
) -> Result<QuantOutput> {
    config.validate()?;
    let kind = features.kind();

    // PSM-level screening
    let n_psms_loaded = psms.n_psms();
    let (mut psms, n_psms_low_purity) = psms.filter_by_purity(config.psm.min_purity);
    if psms.is_empty() {
        return Err(QuantError::EmptyData(format!(
            "no PSMs remain above purity {}",
            config.psm.min_purity
        )));
    }
    info!(
        "{} of {} PSMs passed the purity screen",
        psms.n_psms(),
        n_psms_loaded
    );

    // Impurity correction of every reporter set
    let mut features = features;
    let mut corrections = Vec::new();
    if let Some(impurity) = impurity {
        corrections.extend(correct_psm_sets(&mut psms, impurity)?);
        if kind == TableKind::Site {
            corrections.extend(correct_site_states(&mut features, impurity)?);
        }
        for c in &corrections {
            info!(
                "{}: {} cells clamped, {} suppressed",
                c.target, c.n_clamped, c.n_suppressed
            );
        }
    }

    // Aggregation; the corrected set runs last so its weights define the
    // feature-level quality metrics.
    let aggregation_plain =
        aggregate_features(&mut features, &psms, ChannelSet::Plain, &config.aggregation)?;
    let aggregation_corrected = aggregate_features(
        &mut features,
        &psms,
        ChannelSet::Corrected,
        &config.aggregation,
    )?;
    info!("{}", aggregation_corrected);

    // Site tables fan out to one row per modification state
    let (features, expansion) = features.expand_site_states();
    let site_expansion = (kind == TableKind::Site).then_some(expansion);
    if features.is_empty() {
        return Err(QuantError::EmptyData(
            "site-state expansion left no quantifiable rows".to_string(),
        ));
    }

    let (features, filter) = run_filters(features, &config.channels, &config.filters)?;

    let mut features = features;
    let (normalization, estimated_size_factors) =
        normalize_table(&mut features, persisted, config)?;

    // Statistics run on the corrected set
    let corrected = features.reporter_matrix(ChannelSet::Corrected)?;
    let mut stats = Vec::new();
    let anova = if config.stats.anova {
        let result = test_anova(
            &corrected,
            &config.channels,
            config.stats.anova_groups.as_deref(),
        )?;
        stats.push(StatsSummary {
            name: "anova".to_string(),
            n_rows: result.len(),
            n_unfit: result.n_unfit,
            n_significant: result.n_significant(0.05),
        });
        Some(result)
    } else {
        None
    };
    let mut comparisons = Vec::with_capacity(config.stats.comparisons.len());
    for cmp in &config.stats.comparisons {
        let result = test_moderated(&corrected, &config.channels, cmp, config.stats.use_blocking)?;
        stats.push(StatsSummary {
            name: result.comparison.clone(),
            n_rows: result.len(),
            n_unfit: result.n_unfit,
            n_significant: result.n_significant(0.05),
        });
        comparisons.push(result);
    }

    Ok(QuantOutput {
        table: features,
        anova,
        comparisons,
        estimated_size_factors,
        report: PipelineReport {
            kind,
            n_psms_loaded,
            n_psms_low_purity,
            corrections,
            aggregation_plain,
            aggregation_corrected,
            site_expansion,
            filter,
            normalization,
            stats,
            outputs: Vec::new(),
        },
    })
}

/// Run a quantification from files on disk and write its outputs.
///
/// Loads the PSM and feature tables plus the optional impurity matrix and
/// persisted size factors the configuration names, processes them, and
/// writes the annotated table (and any freshly estimated size factors) into
/// the results directory, creating it on demand.
pub fn run_pipeline(
    config: &AnalysisConfig,
    psm_path: &Path,
    feature_path: &Path,
    kind: TableKind,
) -> Result<QuantOutput> {
    config.validate()?;

    let psms = PsmTable::from_tsv(psm_path, &config.columns, &config.channels)?;
    info!("loaded {} PSMs from {}", psms.n_psms(), psm_path.display());
    let features = FeatureTable::from_tsv(feature_path, kind, &config.columns, &config.channels)?;
    info!(
        "loaded {} {} features from {}",
        features.n_features(),
        kind,
        feature_path.display()
    );
    let impurity = match &config.impurity.matrix {
        Some(path) => Some(ImpurityMatrix::from_tsv(path)?),
        None => None,
    };
    let persisted = match &config.normalization.size_factors {
        Some(path) => Some(SizeFactors::from_tsv(path)?),
        None => None,
    };

    let mut output = process_tables(psms, features, impurity.as_ref(), persisted, config)?;

    let dir = &config.output.directory;
    std::fs::create_dir_all(dir)?;
    let table_path = dir.join(format!("{}_quant.tsv", kind));
    export_table(
        &table_path,
        &output.table,
        &config.channels,
        output.anova.as_ref(),
        &output.comparisons,
    )?;
    output.report.outputs.push(table_path);
    if let Some(factors) = &output.estimated_size_factors {
        let factors_path = dir.join("size_factors.tsv");
        factors.to_tsv(&factors_path)?;
        output.report.outputs.push(factors_path);
    }
    Ok(output)
}
