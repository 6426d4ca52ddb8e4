//! Group-comparison statistics.
//!
//! Two complementary screens over the normalized feature table:
//!
//! - [`test_anova`]: one-way ANOVA of log2 intensity against group label,
//!   a broad any-difference screen across all (or a subset of) groups.
//! - [`test_moderated`]: a two-group moderated t-test with empirical Bayes
//!   variance shrinkage and optional within-block correlation.
//!
//! Both adjust p-values with Benjamini-Hochberg across rows and report unfit
//! rows as NaN rather than failing the run.

mod anova;
mod bh;
mod eb;
mod moderated;

pub use anova::{test_anova, AnovaResult, AnovaRow};
pub use bh::adjust_bh;
pub use eb::{squeeze_var, VarPrior};
pub use moderated::{test_moderated, ModeratedResult, ModeratedRow};

use crate::config::ChannelConfig;
use crate::error::{QuantError, Result};

/// Resolve a group label to its channel indices.
pub(crate) fn group_channels(channels: &ChannelConfig, group: &str) -> Result<Vec<usize>> {
    let indices = channels.group_indices(group);
    if indices.is_empty() {
        return Err(QuantError::Configuration(format!(
            "unknown group '{}'; available groups: {:?}",
            group,
            channels.unique_groups()
        )));
    }
    Ok(indices)
}
