//! Between-channel normalization for reporter intensity matrices.
//!
//! This module provides several normalization approaches:
//!
//! - **Cyclic loess**: pairwise M-vs-A smoothing, removes
//!   intensity-dependent bias (default)
//! - **Median**: per-channel log2 median centering
//! - **Size factor**: DESeq-style median-of-ratios scaling with
//!   persistable factors
//!
//! All strategies work in log2 space, treat zero as missing, and hand back
//! intensities on the original scale with missing cells still missing.

pub mod loess;
pub mod median;
pub mod size_factor;

pub use loess::{norm_loess, norm_loess_with_config, LoessConfig, LoessMatrix};
pub use median::{norm_median, MedianMatrix};
pub use size_factor::{
    estimate_size_factors, norm_size_factor, norm_size_factor_with, SizeFactorMatrix, SizeFactors,
};

use serde::{Deserialize, Serialize};

/// Which normalization strategy a run applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    CyclicLoess,
    Median,
    SizeFactor,
    /// Leave intensities as they are.
    None,
}

impl Default for NormalizeMethod {
    fn default() -> Self {
        NormalizeMethod::CyclicLoess
    }
}

impl NormalizeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizeMethod::CyclicLoess => "cyclic_loess",
            NormalizeMethod::Median => "median",
            NormalizeMethod::SizeFactor => "size_factor",
            NormalizeMethod::None => "none",
        }
    }
}

impl std::fmt::Display for NormalizeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
