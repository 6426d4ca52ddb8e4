//! Analysis configuration.
//!
//! A single YAML document drives a whole quantification run: channel
//! composition and sample mapping, input column patterns, PSM-level
//! thresholds, impurity correction, aggregation, filtering, normalization
//! and statistics. The configuration is validated once, up front, so that
//! later stages can assume a coherent channel layout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateConfig;
use crate::error::{QuantError, Result};
use crate::filter::FilterConfig;
use crate::normalize::loess::LoessConfig;
use crate::normalize::NormalizeMethod;

/// Which feature granularity a run quantifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Protein-group table.
    Protein,
    /// Modification-site table with bundled multiplicity columns.
    Site,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Protein => "protein",
            TableKind::Site => "site",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isobaric channel layout: labels, per-channel sample names, and the
/// experimental grouping used by filtering and statistics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    /// Reporter channel labels in column order, e.g. `"126"`, `"127N"`.
    pub labels: Vec<String>,
    /// Sample name per channel, parallel to `labels`.
    pub samples: Vec<String>,
    /// Experimental group per channel, parallel to `labels`.
    pub groups: Vec<String>,
    /// Optional blocking factor per channel (e.g. replicate batch),
    /// consumed by the moderated pairwise tests.
    pub blocks: Option<Vec<String>>,
}

impl ChannelConfig {
    pub fn n_channels(&self) -> usize {
        self.labels.len()
    }

    /// Channel indices belonging to `group`, in channel order.
    pub fn group_indices(&self, group: &str) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.as_str() == group)
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct group names in order of first appearance.
    pub fn unique_groups(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .filter(|g| seen.insert(g.as_str()))
            .cloned()
            .collect()
    }
}

/// Input column names and reporter header patterns.
///
/// Reporter patterns must contain one capture group for the channel label.
/// Site tables append a `___<state>` multiplicity suffix to the same base
/// headers; loaders derive the suffixed pattern from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub reporter: String,
    pub reporter_corrected: String,
    pub psm_id: String,
    pub interference: String,
    pub purity: String,
    pub min_ms2_intensity: String,
    pub feature_id: String,
    pub gene_names: String,
    pub fasta_headers: String,
    pub msms_ids: String,
    pub contaminant: String,
    pub reverse: String,
    pub only_by_site: String,
    pub score: String,
    pub razor_unique_peptides: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        ColumnConfig {
            reporter: r"^Reporter intensity (\S+)$".into(),
            reporter_corrected: r"^Reporter intensity corrected (\S+)$".into(),
            psm_id: "id".into(),
            interference: "Estimated interference level".into(),
            purity: "Precursor purity fraction".into(),
            min_ms2_intensity: "Minimum MS2 intensity".into(),
            feature_id: "id".into(),
            gene_names: "Gene names".into(),
            fasta_headers: "Fasta headers".into(),
            msms_ids: "MS/MS IDs".into(),
            contaminant: "Potential contaminant".into(),
            reverse: "Reverse".into(),
            only_by_site: "Only identified by site".into(),
            score: "Score".into(),
            razor_unique_peptides: "Razor + unique peptides".into(),
        }
    }
}

/// PSM-level screening applied before aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsmConfig {
    /// Minimum precursor purity fraction; PSMs below it are discarded.
    pub min_purity: f64,
}

impl Default for PsmConfig {
    fn default() -> Self {
        PsmConfig { min_purity: 0.5 }
    }
}

/// Isotope impurity correction inputs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImpurityConfig {
    /// Path to a TSV impurity matrix (channels x channels). `None`
    /// disables correction.
    pub matrix: Option<PathBuf>,
}

/// Normalization strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSection {
    pub method: NormalizeMethod,
    pub loess: LoessConfig,
    /// Previously persisted size factors to reuse on a companion table
    /// instead of re-estimating.
    pub size_factors: Option<PathBuf>,
}

impl Default for NormalizeSection {
    fn default() -> Self {
        NormalizeSection {
            method: NormalizeMethod::CyclicLoess,
            loess: LoessConfig::default(),
            size_factors: None,
        }
    }
}

/// One pairwise comparison for the moderated tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    pub group_a: String,
    pub group_b: String,
}

/// Group-comparison statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    /// Run the one-way ANOVA screen.
    pub anova: bool,
    /// Restrict the ANOVA to these groups; `None` uses all groups.
    pub anova_groups: Option<Vec<String>>,
    /// Moderated pairwise contrasts.
    pub comparisons: Vec<ComparisonConfig>,
    /// Model the channel blocking factor in the pairwise tests.
    pub use_blocking: bool,
}

impl Default for StatsSection {
    fn default() -> Self {
        StatsSection {
            anova: true,
            anova_groups: None,
            comparisons: Vec::new(),
            use_blocking: false,
        }
    }
}

/// Output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            directory: PathBuf::from("results"),
        }
    }
}

/// Root configuration for a quantification run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalysisConfig {
    pub channels: ChannelConfig,
    pub columns: ColumnConfig,
    pub psm: PsmConfig,
    pub impurity: ImpurityConfig,
    pub aggregation: AggregateConfig,
    pub filters: FilterConfig,
    pub normalization: NormalizeSection,
    pub stats: StatsSection,
    pub output: OutputConfig,
}

impl AnalysisConfig {
    /// Load and validate a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AnalysisConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check internal consistency before any data is touched.
    pub fn validate(&self) -> Result<()> {
        let n = self.channels.labels.len();
        if n == 0 {
            return Err(QuantError::Configuration(
                "no reporter channels configured".into(),
            ));
        }
        if self.channels.samples.len() != n {
            return Err(QuantError::Configuration(format!(
                "{} channel labels but {} sample names",
                n,
                self.channels.samples.len()
            )));
        }
        if self.channels.groups.len() != n {
            return Err(QuantError::Configuration(format!(
                "{} channel labels but {} group assignments",
                n,
                self.channels.groups.len()
            )));
        }
        if let Some(blocks) = &self.channels.blocks {
            if blocks.len() != n {
                return Err(QuantError::Configuration(format!(
                    "{} channel labels but {} block assignments",
                    n,
                    blocks.len()
                )));
            }
        }
        let mut seen = HashSet::new();
        for sample in &self.channels.samples {
            if !seen.insert(sample.as_str()) {
                return Err(QuantError::Configuration(format!(
                    "duplicate sample name '{}'",
                    sample
                )));
            }
        }
        for pattern in [&self.columns.reporter, &self.columns.reporter_corrected] {
            let re = Regex::new(pattern).map_err(|e| {
                QuantError::Configuration(format!("invalid reporter pattern '{}': {}", pattern, e))
            })?;
            if re.captures_len() < 2 {
                return Err(QuantError::Configuration(format!(
                    "reporter pattern '{}' must capture the channel label",
                    pattern
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.psm.min_purity) {
            return Err(QuantError::Configuration(format!(
                "min_purity must lie in [0, 1], got {}",
                self.psm.min_purity
            )));
        }
        self.normalization.loess.validate()?;
        self.filters.validate()?;
        let groups: HashSet<&str> = self.channels.groups.iter().map(|g| g.as_str()).collect();
        if let Some(subset) = &self.stats.anova_groups {
            for g in subset {
                if !groups.contains(g.as_str()) {
                    return Err(QuantError::Configuration(format!(
                        "ANOVA group '{}' does not appear in the sample mapping",
                        g
                    )));
                }
            }
        }
        for cmp in &self.stats.comparisons {
            for g in [&cmp.group_a, &cmp.group_b] {
                if !groups.contains(g.as_str()) {
                    return Err(QuantError::Configuration(format!(
                        "comparison group '{}' does not appear in the sample mapping",
                        g
                    )));
                }
            }
            if cmp.group_a == cmp.group_b {
                return Err(QuantError::Configuration(format!(
                    "comparison '{0}' vs '{0}' contrasts a group with itself",
                    cmp.group_a
                )));
            }
        }
        if self.stats.use_blocking && self.channels.blocks.is_none() {
            return Err(QuantError::Configuration(
                "use_blocking requires channel block assignments".into(),
            ));
        }
        Ok(())
    }

    /// A filled-in example configuration, used by `isobarq template`.
    pub fn example() -> Self {
        AnalysisConfig {
            channels: ChannelConfig {
                labels: vec!["126", "127", "128", "129", "130", "131"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                samples: vec![
                    "control_1",
                    "control_2",
                    "control_3",
                    "treated_1",
                    "treated_2",
                    "treated_3",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                groups: vec![
                    "control", "control", "control", "treated", "treated", "treated",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                blocks: None,
            },
            stats: StatsSection {
                anova: true,
                anova_groups: None,
                comparisons: vec![ComparisonConfig {
                    group_a: "treated".into(),
                    group_b: "control".into(),
                }],
                use_blocking: false,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_config() -> AnalysisConfig {
        AnalysisConfig::example()
    }

    #[test]
    fn test_example_validates() {
        assert!(two_group_config().validate().is_ok());
    }

    #[test]
    fn test_default_rejects_empty_channels() {
        let config = AnalysisConfig::default();
        assert!(matches!(
            config.validate(),
            Err(QuantError::Configuration(_))
        ));
    }

    #[test]
    fn test_sample_group_length_mismatch() {
        let mut config = two_group_config();
        config.channels.groups.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_sample_names() {
        let mut config = two_group_config();
        config.channels.samples[1] = config.channels.samples[0].clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_comparison_group() {
        let mut config = two_group_config();
        config.stats.comparisons[0].group_a = "mutant".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutant"));
    }

    #[test]
    fn test_self_comparison_rejected() {
        let mut config = two_group_config();
        config.stats.comparisons[0].group_b = config.stats.comparisons[0].group_a.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blocking_requires_blocks() {
        let mut config = two_group_config();
        config.stats.use_blocking = true;
        assert!(config.validate().is_err());
        config.channels.blocks = Some(
            vec!["a", "b", "c", "a", "b", "c"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reporter_pattern_needs_capture() {
        let mut config = two_group_config();
        config.columns.reporter = r"^Reporter intensity \S+$".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = two_group_config();
        let yaml = config.to_yaml().unwrap();
        let back: AnalysisConfig = serde_yaml::from_str(&yaml).unwrap();
        back.validate().unwrap();
        assert_eq!(back.channels.labels, config.channels.labels);
        assert_eq!(back.stats.comparisons.len(), 1);
    }

    #[test]
    fn test_group_indices() {
        let config = two_group_config();
        assert_eq!(config.channels.group_indices("control"), vec![0, 1, 2]);
        assert_eq!(config.channels.group_indices("treated"), vec![3, 4, 5]);
        assert!(config.channels.group_indices("absent").is_empty());
        assert_eq!(config.channels.unique_groups(), vec!["control", "treated"]);
    }

    #[test]
    fn test_min_purity_bounds() {
        let mut config = two_group_config();
        config.psm.min_purity = 1.5;
        assert!(config.validate().is_err());
    }
}
