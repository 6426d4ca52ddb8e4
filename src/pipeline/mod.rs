//! Pipeline orchestration: file loading, stage sequencing, and export.

mod export;
mod runner;

pub use export::export_table;
pub use runner::{
    process_tables, run_pipeline, CorrectionSummary, NormalizationSummary, PipelineReport,
    QuantOutput, StatsSummary,
};
