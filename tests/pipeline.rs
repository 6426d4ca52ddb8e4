//! Integration tests for the quantification pipeline, from TSV inputs on
//! disk to the annotated output table.

use isobarq::prelude::*;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const LABELS: [&str; 6] = ["126", "127", "128", "129", "130", "131"];
const N_PROTEINS: usize = 30;

fn simple_rand(seed: &mut u64) -> f64 {
    *seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
    ((*seed >> 16) & 0x7FFF) as f64 / 32768.0
}

/// Six channels, three control then three treated.
fn test_config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.channels = ChannelConfig {
        labels: LABELS.iter().map(|s| s.to_string()).collect(),
        samples: vec![
            "ctrl_1".into(),
            "ctrl_2".into(),
            "ctrl_3".into(),
            "treat_1".into(),
            "treat_2".into(),
            "treat_3".into(),
        ],
        groups: vec![
            "control".into(),
            "control".into(),
            "control".into(),
            "treated".into(),
            "treated".into(),
            "treated".into(),
        ],
        blocks: None,
    };
    config.stats.comparisons = vec![ComparisonConfig {
        group_a: "treated".into(),
        group_b: "control".into(),
    }];
    config
}

/// Fold change applied to the treated channels of one protein.
///
/// - proteins 0-4: strong effect (4x)
/// - proteins 5-9: moderate effect (2x)
/// - proteins 10-29: no effect
fn effect_for(prot: usize) -> f64 {
    match prot {
        0..=4 => 4.0,
        5..=9 => 2.0,
        _ => 1.0,
    }
}

/// Abundance baseline, shuffled so the effect tiers interleave across the
/// intensity range instead of clustering at one end.
fn base_for(prot: usize) -> f64 {
    300.0 + 35.0 * ((prot * 7) % N_PROTEINS) as f64
}

/// Write a synthetic PSM table: three PSMs per protein (ids `3p+1..3p+3`)
/// plus two low-purity spectra (991, 992) that the purity screen discards.
fn write_synthetic_psms() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let mut header = vec!["id".to_string()];
    header.extend(LABELS.iter().map(|l| format!("Reporter intensity {}", l)));
    header.extend(
        LABELS
            .iter()
            .map(|l| format!("Reporter intensity corrected {}", l)),
    );
    header.push("Estimated interference level".into());
    header.push("Precursor purity fraction".into());
    header.push("Minimum MS2 intensity".into());
    writeln!(file, "{}", header.join("\t")).unwrap();

    let mut seed = 7u64;
    let mut write_psm = |id: usize, base: f64, effect: f64, purity: f64, seed: &mut u64| {
        let mut cells = Vec::with_capacity(12);
        for ch in 0..LABELS.len() {
            let mult = if ch >= 3 { effect } else { 1.0 };
            let noise = 0.9 + 0.2 * simple_rand(seed);
            cells.push(format!("{:.1}", base * mult * noise));
        }
        // the corrected set mirrors the plain one with a flat upstream scale
        for ch in 0..LABELS.len() {
            let plain: f64 = cells[ch].parse().unwrap();
            cells.push(format!("{:.1}", plain * 0.96));
        }
        let interference = 0.05 + 0.1 * simple_rand(seed);
        writeln!(
            file,
            "{}\t{}\t{:.3}\t{:.3}\t2.0",
            id,
            cells.join("\t"),
            interference,
            purity
        )
        .unwrap();
    };

    for prot in 0..N_PROTEINS {
        for rep in 0..3 {
            let id = prot * 3 + rep + 1;
            let base = base_for(prot) + 20.0 * rep as f64;
            let purity = 0.8 + 0.15 * simple_rand(&mut seed);
            write_psm(id, base, effect_for(prot), purity, &mut seed);
        }
    }
    write_psm(991, 500.0, 1.0, 0.2, &mut seed);
    write_psm(992, 520.0, 1.0, 0.2, &mut seed);
    file.flush().unwrap();
    file
}

/// Write the protein table: thirty quantifiable groups plus one doomed row
/// per filter stage.
fn write_synthetic_proteins() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "id\tGene names\tFasta headers\tMS/MS IDs\tPotential contaminant\tReverse\t\
         Only identified by site\tScore\tRazor + unique peptides"
    )
    .unwrap();
    for prot in 0..N_PROTEINS {
        let msms: Vec<String> = (1..=3).map(|rep| (prot * 3 + rep).to_string()).collect();
        writeln!(
            file,
            "PROT_{}\tGENE_{}\t\t{}\t\t\t\t{:.1}\t{}",
            prot,
            prot,
            msms.join(";"),
            60.0 + prot as f64,
            3 + prot % 4
        )
        .unwrap();
    }
    // one casualty per stage: flagged (x2), identification, peptide
    // support, and unquantified (x2: dangling refs, purity-screened refs)
    writeln!(file, "CONT_1\tKRT1\t\t1;2\t+\t\t\t55.0\t4").unwrap();
    writeln!(file, "REV_1\t\t\t4;5\t\t+\t\t12.0\t3").unwrap();
    writeln!(file, "ONLY_1\tUBC\t\t7;8\t\t\t+\t48.0\t3").unwrap();
    writeln!(file, "WEAK_1\tACTB\t\t10\t\t\t\t33.0\t1").unwrap();
    writeln!(file, "GHOST_1\tMYC\t\t9991;9992\t\t\t\t72.0\t3").unwrap();
    writeln!(file, "IMPURE_1\tEGFR\t\t991;992\t\t\t\t66.0\t2").unwrap();
    file.flush().unwrap();
    file
}

/// A near-diagonal isotope impurity matrix with 2% spillover into the
/// neighboring channels.
fn write_impurity_matrix() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "channel\t{}", LABELS.join("\t")).unwrap();
    for (i, label) in LABELS.iter().enumerate() {
        let row: Vec<String> = (0..LABELS.len())
            .map(|j| {
                if i == j {
                    "0.95".to_string()
                } else if i.abs_diff(j) == 1 {
                    "0.02".to_string()
                } else {
                    "0.0".to_string()
                }
            })
            .collect();
        writeln!(file, "{}\t{}", label, row.join("\t")).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_full_protein_pipeline() {
    let psms = write_synthetic_psms();
    let proteins = write_synthetic_proteins();
    let impurity = write_impurity_matrix();
    let out_dir = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.impurity.matrix = Some(impurity.path().to_path_buf());
    config.output.directory = out_dir.path().join("results");

    let output = run_pipeline(&config, psms.path(), proteins.path(), TableKind::Protein).unwrap();

    let report = &output.report;
    assert_eq!(report.kind, TableKind::Protein);
    assert_eq!(report.n_psms_loaded, 92);
    assert_eq!(report.n_psms_low_purity, 2);
    // both PSM channel sets were unmixed after the purity screen
    assert_eq!(report.corrections.len(), 2);
    assert!(report.corrections.iter().all(|c| c.n_rows == 90));
    for c in &report.corrections {
        assert_eq!(c.channels.len(), 6);
        assert!(c.totals_before.iter().all(|t| *t > 0.0));
        assert!(c.totals_after.iter().all(|t| *t > 0.0));
    }

    assert_eq!(report.aggregation_corrected.n_features, 36);
    assert_eq!(report.aggregation_corrected.n_quantified, 34);
    assert_eq!(report.aggregation_corrected.n_unquantified, 2);
    assert_eq!(report.aggregation_corrected.n_unresolved_refs, 4);
    assert!(report.site_expansion.is_none());

    // each doomed row fell at its designated stage
    assert_eq!(report.filter.n_before, 36);
    assert_eq!(report.filter.n_after, 30);
    let removed: Vec<usize> = report.filter.stages.iter().map(|s| s.n_removed).collect();
    assert_eq!(removed, vec![2, 1, 1, 2, 0, 0]);

    assert_eq!(output.table.n_features(), 30);
    for rec in output.table.records() {
        assert!(rec.quantified, "{} should be quantified", rec.id);
        assert!(rec.interference.is_finite());
        assert!(rec.purity.is_finite());
    }

    // cyclic loess ran on both channel sets with no skipped pairs
    assert_eq!(report.normalization.method, NormalizeMethod::CyclicLoess);
    assert_eq!(report.normalization.notes.len(), 2);
    assert!(report
        .normalization
        .notes
        .iter()
        .all(|n| n.contains("0 of 15")));

    // the strong tier separates cleanly from the null tier
    let cmp = &output.comparisons[0];
    assert_eq!(cmp.comparison, "treated vs control");
    assert_eq!(cmp.n_unfit, 0);
    let tier_mean = |range: std::ops::Range<usize>| -> f64 {
        let lfcs: Vec<f64> = range
            .map(|p| cmp.get_feature(&format!("PROT_{}", p)).unwrap().log2_fc)
            .collect();
        lfcs.iter().sum::<f64>() / lfcs.len() as f64
    };
    for prot in 0..5 {
        let row = cmp.get_feature(&format!("PROT_{}", prot)).unwrap();
        assert!(
            row.log2_fc > 0.8,
            "PROT_{} log2 fc {} too small",
            prot,
            row.log2_fc
        );
        assert!(row.q_value < 0.05, "PROT_{} q {}", prot, row.q_value);
    }
    let strong = tier_mean(0..5);
    let moderate = tier_mean(5..10);
    let null = tier_mean(10..N_PROTEINS);
    assert!(strong > moderate + 0.4, "{} vs {}", strong, moderate);
    assert!(moderate > null + 0.4, "{} vs {}", moderate, null);

    let anova = output.anova.as_ref().unwrap();
    assert_eq!(anova.len(), 30);
    assert_eq!(anova.n_unfit, 0);
    for prot in 0..5 {
        let row = anova.get_feature(&format!("PROT_{}", prot)).unwrap();
        assert!(row.q_value < 0.05, "PROT_{} anova q {}", prot, row.q_value);
    }

    // the exported table carries identification, intensity, and test columns
    assert_eq!(report.outputs.len(), 1);
    let table_path = &report.outputs[0];
    assert!(table_path.ends_with("protein_quant.tsv"));
    let content = std::fs::read_to_string(table_path).unwrap();
    let mut lines = content.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("id\tgene\tinterference\tpurity\tquantified"));
    assert!(header.contains("log2_intensity.126.ctrl_1"));
    assert!(header.contains("log2_intensity.corrected.131.treat_3"));
    assert!(header.contains("anova_q"));
    assert!(header.contains("treated_vs_control.log2_fc"));
    assert_eq!(lines.count(), 30);
    assert!(content.contains("GENE_0"));
}

/// Write a site table with native per-state reporter columns. Sites 0-3
/// carry two live modification states, the rest a silent second state;
/// site 11 scores below the identification threshold.
fn write_synthetic_sites() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let mut header = vec![
        "id".to_string(),
        "Gene names".to_string(),
        "MS/MS IDs".to_string(),
        "Score".to_string(),
    ];
    for state in 1..=2 {
        header.extend(
            LABELS
                .iter()
                .map(|l| format!("Reporter intensity {}___{}", l, state)),
        );
        header.extend(
            LABELS
                .iter()
                .map(|l| format!("Reporter intensity corrected {}___{}", l, state)),
        );
    }
    writeln!(file, "{}", header.join("\t")).unwrap();

    let mut seed = 23u64;
    for site in 0..12 {
        let msms: Vec<String> = (1..=3).map(|rep| (site * 3 + rep).to_string()).collect();
        let score = if site == 11 { 10.0 } else { 50.0 + site as f64 };
        let base = base_for(site);
        let effect = effect_for(site);
        let mut cells = Vec::with_capacity(24);
        for state in 1..=2 {
            let scale = if state == 1 {
                1.0
            } else if site < 4 {
                0.5
            } else {
                0.0
            };
            let mut plain = Vec::with_capacity(LABELS.len());
            for ch in 0..LABELS.len() {
                let mult = if ch >= 3 { effect } else { 1.0 };
                let noise = 0.9 + 0.2 * simple_rand(&mut seed);
                plain.push(base * mult * noise * scale);
            }
            cells.extend(plain.iter().map(|v| format!("{:.1}", v)));
            cells.extend(plain.iter().map(|v| format!("{:.1}", v * 0.96)));
        }
        writeln!(
            file,
            "SITE_{}\tGENE_{}\t{}\t{:.1}\t{}",
            site,
            site,
            msms.join(";"),
            score,
            cells.join("\t")
        )
        .unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_site_pipeline_expands_states() {
    let psms = write_synthetic_psms();
    let sites = write_synthetic_sites();
    let out_dir = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.normalization.method = NormalizeMethod::Median;
    // the tiny table is not a quantile target; keep every expanded row
    config.filters.intensity_cutoff = Some(IntensityCutoff::Absolute(0.0));
    config.output.directory = out_dir.path().join("results");

    let output = run_pipeline(&config, psms.path(), sites.path(), TableKind::Site).unwrap();

    let report = &output.report;
    assert_eq!(
        report.site_expansion,
        Some(SiteExpansion {
            n_features: 12,
            n_rows: 16,
            n_dropped: 8,
        })
    );
    assert!(report.corrections.is_empty());

    // only the low-score site falls out, after expansion
    assert_eq!(report.filter.n_before, 16);
    assert_eq!(report.filter.n_after, 15);
    let identification = report
        .filter
        .stages
        .iter()
        .find(|s| s.stage == FilterStage::Identification)
        .unwrap();
    assert_eq!(identification.n_removed, 1);

    assert_eq!(output.table.n_features(), 15);
    let first = &output.table.records()[0];
    let second = &output.table.records()[1];
    assert_eq!(first.id, "SITE_0");
    assert_eq!(first.mod_count, Some(1));
    assert_eq!(second.id, "SITE_0");
    assert_eq!(second.mod_count, Some(2));

    assert_eq!(report.normalization.method, NormalizeMethod::Median);
    assert!(report
        .normalization
        .notes
        .iter()
        .all(|n| n.contains("grand median")));

    // expanded rows keep their own intensities: the doubly modified state
    // of SITE_0 sits roughly one log2 unit below the singly modified one
    assert!(first.corrected[0] > second.corrected[0]);

    let table_path = &report.outputs[0];
    assert!(table_path.ends_with("site_quant.tsv"));
    let content = std::fs::read_to_string(table_path).unwrap();
    let header = content.lines().next().unwrap();
    assert!(header.starts_with("id\tgene\tmod_count"));
    assert_eq!(content.lines().count(), 16);
}

#[test]
fn test_size_factor_persistence() {
    let psms = write_synthetic_psms();
    let proteins = write_synthetic_proteins();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.normalization.method = NormalizeMethod::SizeFactor;
    config.output.directory = dir_a.path().join("results");

    let first = run_pipeline(&config, psms.path(), proteins.path(), TableKind::Protein).unwrap();
    let factors = first.estimated_size_factors.as_ref().unwrap();
    assert_eq!(factors.channels().len(), LABELS.len());
    assert!(factors.factors().iter().all(|f| f.is_finite() && *f > 0.0));
    assert_eq!(first.report.outputs.len(), 2);
    let factors_path = first.report.outputs[1].clone();
    assert!(factors_path.ends_with("size_factors.tsv"));

    let reloaded = SizeFactors::from_tsv(&factors_path).unwrap();
    assert_eq!(reloaded.channels(), factors.channels());

    // a second run reuses the persisted factors instead of re-estimating
    config.normalization.size_factors = Some(factors_path);
    config.output.directory = dir_b.path().join("results");
    let second = run_pipeline(&config, psms.path(), proteins.path(), TableKind::Protein).unwrap();
    assert!(second.estimated_size_factors.is_none());
    assert!(second
        .report
        .normalization
        .notes
        .iter()
        .any(|n| n.contains("reusing persisted size factors")));
    assert_eq!(second.report.outputs.len(), 1);

    // identical factors yield an identical table
    let a = std::fs::read_to_string(&first.report.outputs[0]).unwrap();
    let b = std::fs::read_to_string(&second.report.outputs[0]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_invalid_config_rejected_before_io() {
    let mut config = test_config();
    config.stats.comparisons = vec![ComparisonConfig {
        group_a: "treated".into(),
        group_b: "missing".into(),
    }];
    let err = run_pipeline(
        &config,
        Path::new("does_not_exist.tsv"),
        Path::new("does_not_exist.tsv"),
        TableKind::Protein,
    )
    .unwrap_err();
    assert!(matches!(err, QuantError::Configuration(_)));
}

#[test]
fn test_report_display_covers_every_stage() {
    let psms = write_synthetic_psms();
    let proteins = write_synthetic_proteins();
    let impurity = write_impurity_matrix();
    let out_dir = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.impurity.matrix = Some(impurity.path().to_path_buf());
    config.output.directory = out_dir.path().join("results");

    let output = run_pipeline(&config, psms.path(), proteins.path(), TableKind::Protein).unwrap();
    let text = output.report.to_string();
    assert!(text.contains("Quantification Report (protein table)"));
    assert!(text.contains("90 of 92 PSMs passed the purity screen"));
    assert!(text.contains("impurity correction, PSM plain set"));
    assert!(text.contains("Feature Filter Report"));
    assert!(text.contains("normalization: cyclic_loess"));
    assert!(text.contains("treated vs control"));
    assert!(text.contains("wrote"));
}
