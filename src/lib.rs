//! Isobaric Reporter Quantification Library
//!
//! This library turns PSM-level isobaric reporter intensities (TMT-style
//! search engine output) into corrected, normalized, and statistically
//! tested protein or modification-site abundance tables.
//!
//! # Overview
//!
//! Each stage of the quantification lives in its own module:
//!
//! - **config**: YAML-driven run configuration (channels, columns, thresholds)
//! - **data**: PSM and feature tables, reporter matrices
//! - **correct**: isotope impurity correction (linear unmixing)
//! - **aggregate**: PSM-to-feature rollup with weighted quality metrics
//! - **filter**: sequential feature filters with per-stage reporting
//! - **normalize**: between-channel normalization (cyclic loess, median, size factors)
//! - **stats**: one-way ANOVA and moderated pairwise comparisons
//! - **pipeline**: end-to-end orchestration and TSV export
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use isobarq::prelude::*;
//!
//! // Load configuration
//! let config = AnalysisConfig::from_file("analysis.yaml").unwrap();
//!
//! // Quantify a protein-group table end to end
//! let output = run_pipeline(
//!     &config,
//!     Path::new("evidence.txt"),
//!     Path::new("proteinGroups.txt"),
//!     TableKind::Protein,
//! )
//! .unwrap();
//!
//! println!("{}", output.report);
//! ```

pub mod aggregate;
pub mod config;
pub mod correct;
pub mod data;
pub mod error;
pub mod filter;
pub mod normalize;
pub mod pipeline;
pub mod stats;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::aggregate::{aggregate_features, AggregateConfig, AggregateReport};
    pub use crate::config::{
        AnalysisConfig, ChannelConfig, ColumnConfig, ComparisonConfig, ImpurityConfig,
        NormalizeSection, OutputConfig, PsmConfig, StatsSection, TableKind,
    };
    pub use crate::correct::{correct_impurities, CorrectedMatrix, ImpurityMatrix};
    pub use crate::data::{
        ChannelSet, FeatureRecord, FeatureTable, PsmRecord, PsmTable, ReporterMatrix,
        SiteExpansion, SiteState,
    };
    pub use crate::error::{QuantError, Result};
    pub use crate::filter::{
        // Identification-quality stages
        filter_flagged, filter_identification, filter_peptide_support,
        // Quantitative stages
        filter_intensity, filter_quantified, filter_valid_values,
        // Orchestration
        run_filters, FilterConfig, FilterReport, FilterStage, IntensityCutoff, StageResult,
    };
    pub use crate::normalize::{
        estimate_size_factors, norm_loess, norm_loess_with_config, norm_median, norm_size_factor,
        norm_size_factor_with, LoessConfig, LoessMatrix, MedianMatrix, NormalizeMethod,
        SizeFactorMatrix, SizeFactors,
    };
    pub use crate::pipeline::{
        export_table, process_tables, run_pipeline, PipelineReport, QuantOutput,
    };
    pub use crate::stats::{
        adjust_bh, squeeze_var, test_anova, test_moderated, AnovaResult, AnovaRow,
        ModeratedResult, ModeratedRow, VarPrior,
    };
}
