//! TSV export of the annotated feature table.
//!
//! One output row per feature (or expanded site state). Reporter columns are
//! renamed `log2_intensity.<channel>.<sample>` with a `.corrected` variant
//! for the second channel set, and carry log2-transformed intensities with
//! `NA` for missing cells. Statistics columns are appended per screen, in
//! run order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::{ChannelConfig, TableKind};
use crate::data::FeatureTable;
use crate::error::{QuantError, Result};
use crate::stats::{AnovaResult, ModeratedResult};

/// Numeric cell: `NA` for unknown, infinities spelled out.
fn num(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else if value.is_infinite() {
        if value > 0.0 {
            "Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else {
        format!("{:.4}", value)
    }
}

/// P-value cell in scientific notation, `NA` for unfit rows.
fn pval(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else {
        format!("{:.3e}", value)
    }
}

/// Intensity cell: log2 of a positive value, `NA` for missing.
fn log2_cell(value: f64) -> String {
    if value > 0.0 {
        format!("{:.4}", value.log2())
    } else {
        "NA".to_string()
    }
}

/// Write the annotated feature table as one TSV file.
///
/// Statistics results must be row-aligned with the table; this holds for
/// every result computed from the table's own reporter matrix and is checked
/// up front.
pub fn export_table<P: AsRef<Path>>(
    path: P,
    table: &FeatureTable,
    channels: &ChannelConfig,
    anova: Option<&AnovaResult>,
    comparisons: &[ModeratedResult],
) -> Result<()> {
    if let Some(result) = anova {
        if result.len() != table.n_features() {
            return Err(QuantError::DimensionMismatch {
                expected: table.n_features(),
                actual: result.len(),
            });
        }
    }
    for result in comparisons {
        if result.len() != table.n_features() {
            return Err(QuantError::DimensionMismatch {
                expected: table.n_features(),
                actual: result.len(),
            });
        }
    }

    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);

    let site = table.kind() == TableKind::Site;
    let mut header: Vec<String> = vec!["id".into(), "gene".into()];
    if site {
        header.push("mod_count".into());
    }
    header.push("interference".into());
    header.push("purity".into());
    header.push("quantified".into());
    for (label, sample) in channels.labels.iter().zip(&channels.samples) {
        header.push(format!("log2_intensity.{}.{}", label, sample));
    }
    for (label, sample) in channels.labels.iter().zip(&channels.samples) {
        header.push(format!("log2_intensity.corrected.{}.{}", label, sample));
    }
    if anova.is_some() {
        header.push("anova_f".into());
        header.push("anova_p".into());
        header.push("anova_q".into());
    }
    let prefixes: Vec<String> = comparisons
        .iter()
        .map(|r| r.comparison.replace(' ', "_"))
        .collect();
    for prefix in &prefixes {
        for suffix in ["log2_fc", "t", "p", "q"] {
            header.push(format!("{}.{}", prefix, suffix));
        }
    }
    writeln!(writer, "{}", header.join("\t"))?;

    for (row, rec) in table.records().iter().enumerate() {
        let mut cells: Vec<String> = vec![rec.id.clone(), rec.gene.clone()];
        if site {
            cells.push(
                rec.mod_count
                    .map_or_else(|| "NA".to_string(), |m| m.to_string()),
            );
        }
        cells.push(num(rec.interference));
        cells.push(num(rec.purity));
        cells.push(rec.quantified.to_string());
        for value in &rec.intensity {
            cells.push(log2_cell(*value));
        }
        for value in &rec.corrected {
            cells.push(log2_cell(*value));
        }
        if let Some(result) = anova {
            let r = &result.results[row];
            cells.push(num(r.f_statistic));
            cells.push(pval(r.p_value));
            cells.push(pval(r.q_value));
        }
        for result in comparisons {
            let r = &result.results[row];
            cells.push(num(r.log2_fc));
            cells.push(num(r.t_statistic));
            cells.push(pval(r.p_value));
            cells.push(pval(r.q_value));
        }
        writeln!(writer, "{}", cells.join("\t"))?;
    }
    writer.flush()?;
    Ok(())
}
