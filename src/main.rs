//! # SPPIN Toolbox
//!
//! A command-line tool for the pediatric neuroblastoma MRI segmentation
//! challenge: curating raw DICOM exports, building volumes, running a
//! segmentation submission and scoring its output.
//!
//! ## Features
//!
//! - Re-file DICOM instances into a patient/date/series hierarchy
//! - Reconstruct one sequence per study into a canonical RAS NIfTI volume
//! - Run a segmentation algorithm over the platform's MetaImage interfaces
//! - Score predictions with Dice, 95th percentile Hausdorff distance and
//!   volumetric similarity
//!
//! ## Usage
//!
//! ```bash
//! sppin-toolbox sort --in <raw> --out <sorted> --patient-number 86
//! sppin-toolbox convert --in <sorted> --out <nifti> --sequence mobiview_t_b100
//! sppin-toolbox predict --input /input --output /output
//! sppin-toolbox evaluate --input /input --ground-truth <gt> --metrics /output/metrics.json
//! ```
//!
//! `sort` and `convert` keep going past bad files and print a run report at
//! the end; `--strict` turns any failure into a non-zero exit.

mod convert;
mod error;
mod evaluate;
mod predict;
mod report;
mod sort;
mod utils;
mod volume;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sppin-toolbox")]
#[command(about = "Curate, convert, predict and evaluate pediatric abdominal MRI segmentations")]
struct CliArgs {
    /// Log filter used when RUST_LOG is not set (e.g. debug, warn)
    #[arg(long, global = true, env = "SPPIN_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-file DICOM instances by patient, study date and series
    Sort {
        #[command(flatten)]
        args: sort::SortArgs,
    },
    /// Convert one sequence per study from DICOM to NIfTI
    Convert {
        #[command(flatten)]
        args: convert::ConvertArgs,
    },
    /// Run the segmentation algorithm on the submission inputs
    Predict {
        #[command(flatten)]
        args: predict::PredictArgs,
    },
    /// Score predicted segmentations against the ground truth
    Evaluate {
        #[command(flatten)]
        args: evaluate::EvaluateArgs,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    let result = match &args.command {
        Commands::Sort { args } => sort::run(args),
        Commands::Convert { args } => convert::run(args),
        Commands::Predict { args } => predict::run(args),
        Commands::Evaluate { args } => evaluate::run(args),
    };
    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}
