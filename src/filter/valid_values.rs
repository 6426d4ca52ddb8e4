//! Group-wise valid-value filter.

use rayon::prelude::*;

use crate::config::ChannelConfig;
use crate::data::FeatureTable;

/// Stage 5: require a minimum number of observed values in at least one
/// experimental group, judged on the interference-corrected channel set.
///
/// A feature quantified scattered across groups but never `min_valid` times
/// within one of them cannot support a group comparison.
pub fn filter_valid_values(
    table: &FeatureTable,
    channels: &ChannelConfig,
    min_valid: usize,
) -> Vec<usize> {
    let groups: Vec<Vec<usize>> = channels
        .unique_groups()
        .iter()
        .map(|g| channels.group_indices(g))
        .collect();

    table
        .records()
        .par_iter()
        .enumerate()
        .filter(|(_, r)| {
            groups.iter().any(|members| {
                members
                    .iter()
                    .filter(|&&c| r.corrected[c] > 0.0)
                    .count()
                    >= min_valid
            })
        })
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableKind;
    use crate::data::FeatureRecord;

    fn config() -> ChannelConfig {
        ChannelConfig {
            labels: vec!["126".into(), "127".into(), "128".into(), "129".into()],
            samples: vec!["a1".into(), "a2".into(), "b1".into(), "b2".into()],
            groups: vec!["a".into(), "a".into(), "b".into(), "b".into()],
            blocks: None,
        }
    }

    fn record(id: &str, corrected: Vec<f64>) -> FeatureRecord {
        let mut r = FeatureRecord::new(id, 4);
        r.corrected = corrected;
        r
    }

    #[test]
    fn test_requires_full_group() {
        let table = FeatureTable::from_records(
            TableKind::Protein,
            vec![
                // complete in group a
                record("P1", vec![10.0, 20.0, 0.0, 0.0]),
                // one value per group only
                record("P2", vec![10.0, 0.0, 20.0, 0.0]),
                // complete in group b
                record("P3", vec![0.0, 0.0, 30.0, 40.0]),
                // nothing at all
                record("P4", vec![0.0, 0.0, 0.0, 0.0]),
            ],
            config().labels.clone(),
        )
        .unwrap();

        let kept = filter_valid_values(&table, &config(), 2);
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn test_min_one_keeps_any_signal() {
        let table = FeatureTable::from_records(
            TableKind::Protein,
            vec![
                record("P1", vec![0.0, 0.0, 0.0, 5.0]),
                record("P2", vec![0.0, 0.0, 0.0, 0.0]),
            ],
            config().labels.clone(),
        )
        .unwrap();
        let kept = filter_valid_values(&table, &config(), 1);
        assert_eq!(kept, vec![0]);
    }

    #[test]
    fn test_judged_on_corrected_set() {
        // plain set is rich but the corrected set is empty: the row fails
        let mut r = record("P1", vec![0.0, 0.0, 0.0, 0.0]);
        r.intensity = vec![10.0, 20.0, 30.0, 40.0];
        let table = FeatureTable::from_records(
            TableKind::Protein,
            vec![r],
            config().labels.clone(),
        )
        .unwrap();
        assert!(filter_valid_values(&table, &config(), 1).is_empty());
    }
}
