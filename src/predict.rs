//! Segmentation submission adapter.
//!
//! Loads the four abdominal MRI inputs from the container input root, runs an
//! [`Algorithm`] and stores the neuroblastoma segmentation under the output
//! root. [`ThresholdAlgorithm`] is the reference placeholder; a real
//! submission provides its own implementation of the trait.

pub mod interface;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::utils::{validate_input_folder, walk_files_with_extension};
use crate::volume::{ElementType, IMAGE_EXTENSION, Volume};
use interface::{Interface, InterfaceKind, InterfaceValue};

pub const INPUT_INTERFACES: [Interface; 4] = [
    Interface {
        slug: "pediatric-abdominal-mri-t1",
        relative_path: "images/abdominal-mr_t1",
        kind: InterfaceKind::Image,
    },
    Interface {
        slug: "pediatric-abdominal-mri-t2",
        relative_path: "images/abdominal-mr_t2",
        kind: InterfaceKind::Image,
    },
    Interface {
        slug: "pediatric-abdominal-mri-dwi-b0",
        relative_path: "images/abdominal-mr_b0",
        kind: InterfaceKind::Image,
    },
    Interface {
        slug: "pediatric-abdominal-mri-dwi-b100",
        relative_path: "images/abdominal-mr_b100",
        kind: InterfaceKind::Image,
    },
];

pub const OUTPUT_INTERFACES: [Interface; 1] = [Interface {
    slug: "mri-segmentation-of-pediatric-neuroblastoma",
    relative_path: "images/neuroblastoma-segmentation",
    kind: InterfaceKind::Segmentation,
}];

/// CLI arguments for the `predict` subcommand.
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Container input root
    #[arg(long, env = "SPPIN_INPUT", default_value = "/input")]
    pub input: PathBuf,

    /// Container output root
    #[arg(long, env = "SPPIN_OUTPUT", default_value = "/output")]
    pub output: PathBuf,
}

/// One field per entry of [`INPUT_INTERFACES`].
#[derive(Debug, Clone)]
pub struct Inputs {
    pub pediatric_abdominal_mri_t1: Volume,
    pub pediatric_abdominal_mri_t2: Volume,
    pub pediatric_abdominal_mri_dwi_b0: Volume,
    pub pediatric_abdominal_mri_dwi_b100: Volume,
}

impl Inputs {
    pub fn load(input_root: &Path) -> Result<Self> {
        let [t1, t2, b0, b100] = &INPUT_INTERFACES;
        Ok(Self {
            pediatric_abdominal_mri_t1: t1.load_image(input_root)?,
            pediatric_abdominal_mri_t2: t2.load_image(input_root)?,
            pediatric_abdominal_mri_dwi_b0: b0.load_image(input_root)?,
            pediatric_abdominal_mri_dwi_b100: b100.load_image(input_root)?,
        })
    }

    /// Volumes in [`INPUT_INTERFACES`] order.
    pub fn volumes(&self) -> [&Volume; 4] {
        [
            &self.pediatric_abdominal_mri_t1,
            &self.pediatric_abdominal_mri_t2,
            &self.pediatric_abdominal_mri_dwi_b0,
            &self.pediatric_abdominal_mri_dwi_b100,
        ]
    }
}

/// One field per entry of [`OUTPUT_INTERFACES`].
#[derive(Debug, Clone)]
pub struct Outputs {
    pub mri_segmentation_of_pediatric_neuroblastoma: Volume,
}

impl Outputs {
    pub fn save(self, output_root: &Path) -> Result<Vec<PathBuf>> {
        let [segmentation] = &OUTPUT_INTERFACES;
        let value = InterfaceValue::Image(self.mri_segmentation_of_pediatric_neuroblastoma);
        Ok(vec![segmentation.save(output_root, &value)?])
    }
}

/// A segmentation method. The output must be aligned with the T1 input to
/// be evaluated.
pub trait Algorithm {
    fn predict(&self, inputs: &Inputs) -> Result<Outputs>;
}

/// Binary threshold of the T1 image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdAlgorithm {
    pub lower: f32,
    pub upper: f32,
    pub inside_value: f32,
    pub outside_value: f32,
}

impl Default for ThresholdAlgorithm {
    fn default() -> Self {
        Self {
            lower: 10.0,
            upper: 255.0,
            inside_value: 0.0,
            outside_value: 1.0,
        }
    }
}

impl ThresholdAlgorithm {
    /// Map voxels within `[lower, upper]` to the inside value and all others
    /// to the outside value. The result is stored as unsigned char.
    pub fn threshold(&self, image: &Volume) -> Volume {
        let voxels = image.voxels.mapv(|v| {
            if (self.lower..=self.upper).contains(&v) {
                self.inside_value
            } else {
                self.outside_value
            }
        });
        image.with_voxels(voxels, ElementType::U8)
    }
}

impl Algorithm for ThresholdAlgorithm {
    fn predict(&self, inputs: &Inputs) -> Result<Outputs> {
        Ok(Outputs {
            mri_segmentation_of_pediatric_neuroblastoma: self
                .threshold(&inputs.pediatric_abdominal_mri_t1),
        })
    }
}

/// Log every image below `root`.
pub fn log_input_files(root: &Path) {
    for path in walk_files_with_extension(root, IMAGE_EXTENSION) {
        info!("Input file: {path:?}");
    }
}

/// Load, predict, save.
pub fn run_algorithm(
    algorithm: &impl Algorithm,
    input_root: &Path,
    output_root: &Path,
) -> Result<Vec<PathBuf>> {
    let inputs = Inputs::load(input_root)?;
    for (iface, volume) in INPUT_INTERFACES.iter().zip(inputs.volumes()) {
        info!("Loaded {}: {:?} voxels", iface.slug, volume.size());
    }
    let outputs = algorithm.predict(&inputs)?;
    outputs.save(output_root)
}

pub fn run(args: &PredictArgs) -> Result<()> {
    validate_input_folder(&args.input)?;
    log_input_files(&args.input);

    let written = run_algorithm(&ThresholdAlgorithm::default(), &args.input, &args.output)?;
    for path in &written {
        info!("Saved output: {path:?}");
    }
    println!("Prediction complete! Wrote {} output(s).", written.len());
    Ok(())
}
