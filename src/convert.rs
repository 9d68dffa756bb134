//! DICOM series to NIfTI volume conversion.
//!
//! Walks `root/<patient>/<date>/<sequence>` folders, rebuilds each series as
//! a 3D volume and writes `dest/<patient>/<date>/<name>.nii.gz`.

pub mod nifti;
pub mod series;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use crate::report::{BatchArgs, FailWith, Failure, FailureKind, RunReport};
use crate::utils::{ensure_dir, progress_bar, validate_input_folder};

/// CLI arguments for the `convert` subcommand.
#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Root of a sorted dataset (`<patient>/<date>/<sequence>` folders)
    #[arg(long = "in", short = 'i', env = "SPPIN_CONVERT_INPUT")]
    pub input: PathBuf,

    /// Destination root for the NIfTI volumes
    #[arg(long = "out", short = 'o', env = "SPPIN_CONVERT_OUTPUT")]
    pub output: PathBuf,

    /// Name of the sequence folder to convert in every study
    #[arg(long, default_value = "mobiview_t_b100")]
    pub sequence: String,

    /// Base name of the written volume (defaults to the sequence folder name)
    #[arg(long)]
    pub output_name: Option<String>,

    /// Skip the first N series (in sorted order) to resume an interrupted batch
    #[arg(long, default_value_t = 0)]
    pub skip: usize,

    /// Reject series whose slice gaps deviate more than 10% from the median gap
    #[arg(long)]
    pub validate_increment: bool,

    #[command(flatten)]
    pub batch: BatchArgs,
}

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub sequence: String,
    pub output_name: String,
    pub skip: usize,
    pub validate_increment: bool,
}

impl From<&ConvertArgs> for ConvertConfig {
    fn from(args: &ConvertArgs) -> Self {
        Self {
            source: args.input.clone(),
            destination: args.output.clone(),
            sequence: args.sequence.clone(),
            output_name: args
                .output_name
                .clone()
                .unwrap_or_else(|| args.sequence.clone()),
            skip: args.skip,
            validate_increment: args.validate_increment,
        }
    }
}

/// One `<patient>/<date>/<sequence>` folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesJob {
    pub patient: String,
    pub date: String,
    pub dir: PathBuf,
}

impl SeriesJob {
    pub fn output_path(&self, config: &ConvertConfig) -> PathBuf {
        config
            .destination
            .join(&self.patient)
            .join(&self.date)
            .join(format!("{}.{}", config.output_name, nifti::NIFTI_EXTENSION))
    }
}

pub fn run(args: &ConvertArgs) -> Result<()> {
    validate_input_folder(&args.input)?;
    let config = ConvertConfig::from(args);
    let report = convert_dataset(&config, args.batch.quiet)?;
    report.finish(&args.batch)
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read folder: {dir:?}"))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Every `root/<patient>/<date>/<sequence>` folder, sorted.
pub fn find_series(root: &Path, sequence: &str) -> Result<Vec<SeriesJob>> {
    let mut jobs = Vec::new();
    for patient_dir in sorted_subdirs(root)? {
        for date_dir in sorted_subdirs(&patient_dir)? {
            let dir = date_dir.join(sequence);
            if dir.is_dir() {
                jobs.push(SeriesJob {
                    patient: dir_name(&patient_dir),
                    date: dir_name(&date_dir),
                    dir,
                });
            }
        }
    }
    Ok(jobs)
}

pub fn convert_dataset(config: &ConvertConfig, quiet: bool) -> Result<RunReport> {
    let mut report = RunReport::new("convert");
    let jobs = find_series(&config.source, &config.sequence)?;
    info!(
        "Found {} '{}' series under {:?}",
        jobs.len(),
        config.sequence,
        config.source
    );
    if config.skip > 0 {
        info!("Skipping the first {} series", config.skip.min(jobs.len()));
    }

    let pending: Vec<&SeriesJob> = jobs.iter().skip(config.skip).collect();
    let pb = progress_bar(pending.len(), quiet);
    for job in pending {
        let result = convert_series(job, config);
        if let Ok(path) = &result {
            info!("✓ {} / {} -> {path:?}", job.patient, job.date);
        }
        report.record(&job.dir, result);
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(report)
}

/// Convert one series. Nothing is written when any step fails.
pub fn convert_series(job: &SeriesJob, config: &ConvertConfig) -> Result<PathBuf, Failure> {
    let mut volume = series::load_series(&job.dir, config.validate_increment)?;
    volume.geometry = nifti::lps_to_ras(&volume.geometry);
    let volume = nifti::reorient_to_canonical(&volume);
    debug!("{:?}: {:?} voxels, spacing {:?}", job.dir, volume.size(), volume.geometry.spacing);

    let output = job.output_path(config);
    if let Some(parent) = output.parent() {
        ensure_dir(parent).fail_with(FailureKind::Write)?;
    }
    nifti::write_nifti(&output, &volume).fail_with(FailureKind::Write)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::series::tests::{AXIAL, write_slice};
    use tempfile::TempDir;

    fn config(source: &Path, destination: &Path) -> ConvertConfig {
        ConvertConfig {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            sequence: "mobiview_t_b100".to_string(),
            output_name: "DWI_b100".to_string(),
            skip: 0,
            validate_increment: false,
        }
    }

    fn write_series(dir: &Path, slices: usize) {
        for k in 0..slices {
            write_slice(
                &dir.join(format!("{k}.dcm")),
                Some([0.0, 0.0, 2.0 * k as f64]),
                AXIAL,
                k as i32 + 1,
                k as u16,
            );
        }
    }

    // =========================================================================
    // Discovery Tests
    // =========================================================================

    mod discovery_tests {
        use super::*;

        #[test]
        fn finds_sequence_folders_two_levels_down() {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();
            fs::create_dir_all(root.join("PT_2/20170412/mobiview_t_b100")).unwrap();
            fs::create_dir_all(root.join("PT_1/20170101/mobiview_t_b100")).unwrap();
            fs::create_dir_all(root.join("PT_1/20170101/t2_tse")).unwrap();
            fs::create_dir_all(root.join("PT_1/20170301")).unwrap();

            let jobs = find_series(root, "mobiview_t_b100").unwrap();
            let found: Vec<(&str, &str)> = jobs
                .iter()
                .map(|j| (j.patient.as_str(), j.date.as_str()))
                .collect();
            assert_eq!(found, vec![("PT_1", "20170101"), ("PT_2", "20170412")]);
        }

        #[test]
        fn output_path_mirrors_patient_and_date() {
            let job = SeriesJob {
                patient: "PT_86".to_string(),
                date: "20170412".to_string(),
                dir: PathBuf::from("in/PT_86/20170412/mobiview_t_b100"),
            };
            let cfg = config(Path::new("in"), Path::new("out"));
            assert_eq!(
                job.output_path(&cfg),
                PathBuf::from("out/PT_86/20170412/DWI_b100.nii.gz")
            );
        }

        #[test]
        fn output_name_defaults_to_sequence() {
            let args = ConvertArgs {
                input: PathBuf::from("in"),
                output: PathBuf::from("out"),
                sequence: "t2_tse".to_string(),
                output_name: None,
                skip: 0,
                validate_increment: false,
                batch: BatchArgs::default(),
            };
            assert_eq!(ConvertConfig::from(&args).output_name, "t2_tse");
        }
    }

    // =========================================================================
    // Batch Tests
    // =========================================================================

    mod batch_tests {
        use super::*;

        #[test]
        fn bad_series_is_skipped_without_partial_output() {
            let temp_dir = TempDir::new().unwrap();
            let (root, dest) = (temp_dir.path().join("in"), temp_dir.path().join("out"));
            write_series(&root.join("PT_1/20170101/mobiview_t_b100"), 3);
            write_series(&root.join("PT_2/20170202/mobiview_t_b100"), 1);

            let report = convert_dataset(&config(&root, &dest), true).unwrap();
            assert_eq!(report.succeeded(), 1);
            assert_eq!(report.failed_with(FailureKind::MissingSlices), 1);
            assert!(dest.join("PT_1/20170101/DWI_b100.nii.gz").is_file());
            assert!(!dest.join("PT_2/20170202").exists());
        }

        #[test]
        fn skip_resumes_after_first_series() {
            let temp_dir = TempDir::new().unwrap();
            let (root, dest) = (temp_dir.path().join("in"), temp_dir.path().join("out"));
            write_series(&root.join("PT_1/20170101/mobiview_t_b100"), 2);
            write_series(&root.join("PT_2/20170202/mobiview_t_b100"), 2);

            let cfg = ConvertConfig {
                skip: 1,
                ..config(&root, &dest)
            };
            let report = convert_dataset(&cfg, true).unwrap();
            assert_eq!(report.items.len(), 1);
            assert!(!dest.join("PT_1").exists());
            assert!(dest.join("PT_2/20170202/DWI_b100.nii.gz").is_file());
        }
    }
}
