//! Evaluation engine for submitted segmentations.
//!
//! Reads the prediction manifest, pairs each job's segmentation with the
//! ground truth of its case and writes per-case and aggregate metrics as one
//! JSON document. Any missing or ambiguous file aborts the run.

pub mod aggregate;
pub mod kdtree;
pub mod manifest;
pub mod metrics;
pub mod morphology;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use crate::predict::interface::IoKind;
use crate::predict::{INPUT_INTERFACES, OUTPUT_INTERFACES, log_input_files};
use crate::utils::{ensure_dir, validate_input_folder};
use crate::volume::load_single_image;
use aggregate::Aggregates;
use manifest::{Job, read_manifest};
use metrics::CaseMetrics;

/// File name of the manifest the platform places in the input root.
pub const PREDICTIONS_FILE: &str = "predictions.json";

/// CLI arguments for the `evaluate` subcommand.
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Root holding the manifest and one folder per job
    #[arg(long, env = "SPPIN_INPUT", default_value = "/input")]
    pub input: PathBuf,

    /// Prediction manifest [default: <input>/predictions.json]
    #[arg(long, env = "SPPIN_PREDICTIONS")]
    pub predictions: Option<PathBuf>,

    /// Root with one ground-truth folder per case
    #[arg(long, env = "SPPIN_GROUND_TRUTH", default_value = "ground-truth")]
    pub ground_truth: PathBuf,

    /// Where to write the metrics document
    #[arg(long, env = "SPPIN_METRICS", default_value = "/output/metrics.json")]
    pub metrics: PathBuf,

    /// Derive the case id from the T1 image name only
    #[arg(long)]
    pub no_cross_check: bool,
}

#[derive(Debug, Clone)]
pub struct EvaluateConfig {
    pub input_root: PathBuf,
    pub predictions: PathBuf,
    pub ground_truth_root: PathBuf,
    pub metrics_path: PathBuf,
    pub cross_check: bool,
}

impl From<&EvaluateArgs> for EvaluateConfig {
    fn from(args: &EvaluateArgs) -> Self {
        Self {
            input_root: args.input.clone(),
            predictions: args
                .predictions
                .clone()
                .unwrap_or_else(|| args.input.join(PREDICTIONS_FILE)),
            ground_truth_root: args.ground_truth.clone(),
            metrics_path: args.metrics.clone(),
            cross_check: !args.no_cross_check,
        }
    }
}

/// The document written to the metrics path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsDocument {
    pub case: BTreeMap<String, CaseMetrics>,
    pub aggregates: Aggregates,
}

impl MetricsDocument {
    pub fn from_cases(case: BTreeMap<String, CaseMetrics>) -> Self {
        let aggregates = Aggregates::from_cases(&case);
        Self { case, aggregates }
    }
}

fn input_slugs() -> Vec<&'static str> {
    INPUT_INTERFACES.iter().map(|iface| iface.slug).collect()
}

fn output_slug() -> &'static str {
    let [segmentation] = &OUTPUT_INTERFACES;
    segmentation.slug
}

/// Score one job against the ground truth. Returns the case id and metrics.
pub fn evaluate_job(job: &Job, config: &EvaluateConfig) -> Result<(String, CaseMetrics)> {
    let batch_id = job.batch_id(&input_slugs(), config.cross_check)?;
    let prediction_dir = job.output_location(&config.input_root, output_slug())?;
    if let Some(kind) = job.output_kind(output_slug()) {
        if kind.io_kind() != IoKind::Image {
            anyhow::bail!(
                "Output {} of job {} is a {kind}, not an image",
                output_slug(),
                job.pk
            );
        }
    }

    let prediction = load_single_image(&prediction_dir)
        .with_context(|| format!("Failed to load prediction of job {}", job.pk))?;
    let ground_truth = load_single_image(&config.ground_truth_root.join(&batch_id))
        .with_context(|| format!("Failed to load ground truth of case {batch_id}"))?;

    let metrics = CaseMetrics::compute(&ground_truth, &prediction)
        .with_context(|| format!("Cannot score case {batch_id}"))?;
    Ok((batch_id, metrics))
}

pub fn evaluate(config: &EvaluateConfig) -> Result<MetricsDocument> {
    let jobs = read_manifest(&config.predictions)?;
    info!("Evaluating {} job(s) from {:?}", jobs.len(), config.predictions);

    let mut cases = BTreeMap::new();
    for job in &jobs {
        let (batch_id, metrics) = evaluate_job(job, config)?;
        info!(
            "{batch_id}: Dice {:.4}, Hausdorff {:.4}, Volumetric similarity {:.4}",
            metrics.dice, metrics.hausdorff, metrics.volumetric_similarity
        );
        if cases.insert(batch_id.clone(), metrics).is_some() {
            warn!("Case {batch_id} appears in more than one job, keeping the last");
        }
    }
    Ok(MetricsDocument::from_cases(cases))
}

/// Write `document` as pretty JSON, creating parent folders.
pub fn write_metrics(path: &Path, document: &MetricsDocument) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let json = serde_json::to_string_pretty(document).context("Failed to serialize metrics")?;
    fs::write(path, json).with_context(|| format!("Failed to write metrics: {path:?}"))
}

pub fn run(args: &EvaluateArgs) -> Result<()> {
    let config = EvaluateConfig::from(args);
    validate_input_folder(&config.input_root)?;
    log_input_files(&config.input_root);

    let document = evaluate(&config)?;
    write_metrics(&config.metrics_path, &document)?;

    println!(
        "Evaluation complete! {} case(s) written to {:?}",
        document.case.len(),
        config.metrics_path
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolboxError;
    use crate::volume::{ElementType, Geometry, Volume, save_image};
    use ndarray::Array3;
    use tempfile::TempDir;

    const SEGMENTATION_PATH: &str = "images/neuroblastoma-segmentation";

    fn mask(lo: usize, hi: usize) -> Volume {
        Volume::new(
            Array3::from_shape_fn((6, 6, 6), |(z, y, x)| {
                let inside = |i: usize| (lo..hi).contains(&i);
                f32::from(u8::from(inside(z) && inside(y) && inside(x)))
            }),
            Geometry::default(),
            ElementType::U8,
        )
    }

    fn job_json(pk: &str, case: &str) -> serde_json::Value {
        let inputs: Vec<serde_json::Value> = input_slugs()
            .into_iter()
            .map(|slug| {
                serde_json::json!({
                    "interface": {"slug": slug, "relative_path": "images/x"},
                    "image": {"name": format!("sppin_{case}_{slug}_mr_2020.mha")}
                })
            })
            .collect();
        serde_json::json!({
            "pk": pk,
            "inputs": inputs,
            "outputs": [{
                "interface": {"slug": output_slug(), "relative_path": SEGMENTATION_PATH}
            }]
        })
    }

    struct Fixture {
        _temp_dir: TempDir,
        config: EvaluateConfig,
    }

    /// Manifest plus prediction and ground truth for each `(pk, case, pred, gt)`.
    fn fixture(jobs: &[(&str, &str, Volume, Volume)]) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let input_root = temp_dir.path().join("input");
        let ground_truth_root = temp_dir.path().join("ground-truth");

        let manifest: Vec<serde_json::Value> =
            jobs.iter().map(|(pk, case, _, _)| job_json(pk, case)).collect();
        fs::create_dir_all(&input_root).unwrap();
        fs::write(
            input_root.join(PREDICTIONS_FILE),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();

        for (pk, case, prediction, truth) in jobs {
            let output_dir = input_root.join(pk).join("output").join(SEGMENTATION_PATH);
            save_image(&output_dir, "overlay.mha", prediction).unwrap();
            save_image(&ground_truth_root.join(format!("{case}_2020")), "gt.mha", truth).unwrap();
        }

        let config = EvaluateConfig {
            predictions: input_root.join(PREDICTIONS_FILE),
            input_root,
            ground_truth_root,
            metrics_path: temp_dir.path().join("out/metrics.json"),
            cross_check: true,
        };
        Fixture {
            _temp_dir: temp_dir,
            config,
        }
    }

    // =========================================================================
    // Configuration Tests
    // =========================================================================

    mod config_tests {
        use super::*;

        #[test]
        fn manifest_defaults_to_input_root() {
            let args = EvaluateArgs {
                input: PathBuf::from("/data/in"),
                predictions: None,
                ground_truth: PathBuf::from("gt"),
                metrics: PathBuf::from("m.json"),
                no_cross_check: true,
            };
            let config = EvaluateConfig::from(&args);
            assert_eq!(config.predictions, PathBuf::from("/data/in/predictions.json"));
            assert!(!config.cross_check);
        }

        #[test]
        fn interface_slugs_come_from_declared_tables() {
            assert_eq!(input_slugs()[0], "pediatric-abdominal-mri-t1");
            assert_eq!(input_slugs().len(), 4);
            assert_eq!(output_slug(), "mri-segmentation-of-pediatric-neuroblastoma");
        }
    }

    // =========================================================================
    // Evaluation Tests
    // =========================================================================

    mod evaluation_tests {
        use super::*;

        #[test]
        fn perfect_and_empty_predictions() {
            let f = fixture(&[
                ("job-a", "001", mask(1, 4), mask(1, 4)),
                ("job-b", "002", mask(0, 0), mask(2, 5)),
            ]);
            let document = evaluate(&f.config).unwrap();

            let perfect = document.case["001_2020"];
            assert_eq!(perfect.dice, 1.0);
            assert_eq!(perfect.hausdorff, 0.0);
            assert_eq!(perfect.volumetric_similarity, 1.0);

            let empty = document.case["002_2020"];
            assert_eq!(empty.dice, 0.0);
            assert!(empty.hausdorff.is_nan());

            assert_eq!(document.aggregates.dice.mean, 0.5);
            assert_eq!(document.aggregates.hausdorff.mean, 0.0);
        }

        #[test]
        fn metrics_document_uses_leaderboard_keys_and_null() {
            let f = fixture(&[("job-a", "003", mask(0, 0), mask(1, 3))]);
            let document = evaluate(&f.config).unwrap();
            write_metrics(&f.config.metrics_path, &document).unwrap();

            let text = fs::read_to_string(&f.config.metrics_path).unwrap();
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["case"]["003_2020"]["Dice"], 0.0);
            assert!(json["case"]["003_2020"]["Hausdorff"].is_null());
            assert!(json["aggregates"]["Hausdorff"]["mean"].is_null());
            assert!(json["aggregates"]["Volumetric_similarity"]["std"].is_number());
        }

        #[test]
        fn missing_ground_truth_aborts() {
            let f = fixture(&[("job-a", "004", mask(1, 3), mask(1, 3))]);
            fs::remove_dir_all(f.config.ground_truth_root.join("004_2020")).unwrap();

            let err = evaluate(&f.config).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::ResourceNotFound { .. })
            ));
        }

        #[test]
        fn two_predictions_are_ambiguous() {
            let f = fixture(&[("job-a", "005", mask(1, 3), mask(1, 3))]);
            let output_dir = f.config.input_root.join("job-a/output").join(SEGMENTATION_PATH);
            save_image(&output_dir, "second.mha", &mask(1, 3)).unwrap();

            let err = evaluate(&f.config).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::AmbiguousResource { count: 2, .. })
            ));
        }

        #[test]
        fn non_image_output_kind_aborts() {
            let f = fixture(&[("job-a", "007", mask(1, 3), mask(1, 3))]);
            let manifest_path = f.config.input_root.join(PREDICTIONS_FILE);
            let mut manifest: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
            manifest[0]["outputs"][0]["interface"]["kind"] = "PDF file".into();
            fs::write(&manifest_path, manifest.to_string()).unwrap();

            let err = evaluate(&f.config).unwrap_err();
            assert!(format!("{err:#}").contains("is a PDF file, not an image"));
        }

        #[test]
        fn size_mismatch_aborts() {
            let small = Volume::new(
                Array3::from_elem((2, 2, 2), 1.0),
                Geometry::default(),
                ElementType::U8,
            );
            let f = fixture(&[("job-a", "006", small, mask(1, 3))]);
            let err = evaluate(&f.config).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::GeometryMismatch { .. })
            ));
        }
    }
}
