//! Aggregation-provenance filter.

use rayon::prelude::*;

use crate::data::FeatureTable;

/// Stage 4: drop features none of whose referenced PSMs survived the
/// upstream screening, i.e. rows whose quantities aggregation could not
/// rebuild.
pub fn filter_quantified(table: &FeatureTable) -> Vec<usize> {
    table
        .records()
        .par_iter()
        .enumerate()
        .filter(|(_, r)| r.quantified)
        .map(|(i, _)| i)
        .collect()
}
