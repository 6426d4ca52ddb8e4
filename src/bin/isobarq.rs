//! isobarq - Isobaric Reporter Quantification CLI
//!
//! Command-line interface for quantifying TMT-labelled proteomics tables.

use clap::{Parser, Subcommand, ValueEnum};
use isobarq::config::{AnalysisConfig, TableKind};
use isobarq::error::Result;
use isobarq::pipeline::run_pipeline;
use std::path::PathBuf;

/// CLI-friendly table kind enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTableKind {
    /// Protein-group table (e.g. proteinGroups.txt)
    Protein,
    /// Modification-site table (e.g. Phospho (STY)Sites.txt)
    Site,
}

impl From<CliTableKind> for TableKind {
    fn from(kind: CliTableKind) -> Self {
        match kind {
            CliTableKind::Protein => TableKind::Protein,
            CliTableKind::Site => TableKind::Site,
        }
    }
}

/// Report output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFormat {
    /// Human-readable stage summary
    Text,
    /// Machine-readable JSON report
    Json,
}

/// Isobaric reporter-ion quantification
#[derive(Parser)]
#[command(name = "isobarq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quantify a feature table from a YAML configuration file
    Run {
        /// Path to analysis configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the PSM-level TSV (e.g. evidence.txt)
        #[arg(short, long)]
        psm: PathBuf,

        /// Path to the feature-level TSV (protein groups or sites)
        #[arg(short, long)]
        features: PathBuf,

        /// Feature granularity of the table
        #[arg(short, long, value_enum)]
        kind: CliTableKind,

        /// Override the output directory from the configuration
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Report format printed to stdout
        #[arg(long, value_enum, default_value = "text")]
        format: CliFormat,
    },

    /// Generate an example analysis configuration
    Template {
        /// Output path for the example YAML (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Warn)
        .parse_env(env_logger::Env::default().filter_or("ISOBARQ_LOG", "warn,isobarq=info"))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            psm,
            features,
            kind,
            output_dir,
            format,
        } => cmd_run(
            &config,
            &psm,
            &features,
            kind.into(),
            output_dir.as_ref(),
            format,
        ),

        Commands::Template { output } => cmd_template(output.as_ref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Run the quantification pipeline from configuration
fn cmd_run(
    config_path: &PathBuf,
    psm_path: &PathBuf,
    feature_path: &PathBuf,
    kind: TableKind,
    output_dir: Option<&PathBuf>,
    format: CliFormat,
) -> Result<()> {
    eprintln!("Loading configuration from {:?}...", config_path);
    let mut config = AnalysisConfig::from_file(config_path)?;
    if let Some(dir) = output_dir {
        config.output.directory = dir.clone();
    }

    eprintln!(
        "Running {} quantification ({} channels)...",
        kind,
        config.channels.labels.len()
    );
    let output = run_pipeline(&config, psm_path, feature_path, kind)?;

    eprintln!();
    match format {
        CliFormat::Json => println!("{}", serde_json::to_string_pretty(&output.report)?),
        CliFormat::Text => println!("{}", output.report),
    }

    Ok(())
}

/// Print or write an example configuration
fn cmd_template(output_path: Option<&PathBuf>) -> Result<()> {
    let yaml = AnalysisConfig::example().to_yaml()?;

    match output_path {
        Some(path) => {
            std::fs::write(path, &yaml)?;
            eprintln!("Wrote example configuration to {:?}", path);
        }
        None => print!("{}", yaml),
    }

    Ok(())
}
