//! Data structures for isobaric quantification.

mod fasta;
mod feature;
mod parse;
mod psm;
mod reporter_matrix;

pub use feature::{FeatureRecord, FeatureTable, SiteExpansion, SiteState};
pub use psm::{PsmRecord, PsmTable};
pub use reporter_matrix::ReporterMatrix;

/// Which of the two reporter channel sets an operation targets: intensities
/// as measured, or the upstream interference-corrected variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSet {
    Plain,
    Corrected,
}

impl ChannelSet {
    /// Both sets, in pipeline processing order.
    pub const ALL: [ChannelSet; 2] = [ChannelSet::Plain, ChannelSet::Corrected];

    pub fn label(&self) -> &'static str {
        match self {
            ChannelSet::Plain => "plain",
            ChannelSet::Corrected => "corrected",
        }
    }
}

impl std::fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
