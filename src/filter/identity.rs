//! Identification-quality filters.
//!
//! The first three stages of the filter pipeline judge a feature by how it
//! was identified, before any quantitative evidence is considered.

use rayon::prelude::*;

use crate::config::TableKind;
use crate::data::FeatureTable;

/// Stage 1: drop contaminants and reversed-decoy identifications.
pub fn filter_flagged(table: &FeatureTable) -> Vec<usize> {
    table
        .records()
        .par_iter()
        .enumerate()
        .filter(|(_, r)| !r.contaminant && !r.reverse)
        .map(|(i, _)| i)
        .collect()
}

/// Stage 2: drop weakly identified features.
///
/// Protein tables drop groups identified only by a modification site; site
/// tables drop rows below the minimum identification score.
pub fn filter_identification(table: &FeatureTable, min_score: f64) -> Vec<usize> {
    match table.kind() {
        TableKind::Protein => table
            .records()
            .par_iter()
            .enumerate()
            .filter(|(_, r)| !r.only_by_site)
            .map(|(i, _)| i)
            .collect(),
        TableKind::Site => table
            .records()
            .par_iter()
            .enumerate()
            // NaN scores are unknown, not failing
            .filter(|(_, r)| !(r.score < min_score))
            .map(|(i, _)| i)
            .collect(),
    }
}

/// Stage 3: require peptide support. Protein groups need at least
/// `min_peptides` razor + unique peptides; site tables pass through.
pub fn filter_peptide_support(table: &FeatureTable, min_peptides: u32) -> Vec<usize> {
    match table.kind() {
        TableKind::Protein => table
            .records()
            .par_iter()
            .enumerate()
            .filter(|(_, r)| r.razor_unique_peptides >= min_peptides)
            .map(|(i, _)| i)
            .collect(),
        TableKind::Site => (0..table.n_features()).collect(),
    }
}
