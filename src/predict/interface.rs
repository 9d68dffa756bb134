//! Typed input/output interfaces of a challenge submission container.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::utils::ensure_dir;
use crate::volume::{self, Volume};

/// File name used for every image output.
pub const IMAGE_OUTPUT_FILE: &str = "overlay.mha";

/// How an interface is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Json,
    Image,
    File,
}

/// In-memory form of a file interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Text,
    Binary,
}

/// Every interface kind the platform knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    String,
    Integer,
    Float,
    Bool,
    Anything,
    Chart,
    TwoDBoundingBox,
    MultipleTwoDBoundingBoxes,
    DistanceMeasurement,
    MultipleDistanceMeasurements,
    Point,
    MultiplePoints,
    Polygon,
    MultiplePolygons,
    Line,
    MultipleLines,
    Angle,
    MultipleAngles,
    Ellipse,
    MultipleEllipses,
    Choice,
    MultipleChoice,
    Image,
    Segmentation,
    HeatMap,
    Pdf,
    Sqreg,
    ThumbnailJpg,
    ThumbnailPng,
    Obj,
    Mp4,
    Csv,
    Zip,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 33] = [
        Self::String,
        Self::Integer,
        Self::Float,
        Self::Bool,
        Self::Anything,
        Self::Chart,
        Self::TwoDBoundingBox,
        Self::MultipleTwoDBoundingBoxes,
        Self::DistanceMeasurement,
        Self::MultipleDistanceMeasurements,
        Self::Point,
        Self::MultiplePoints,
        Self::Polygon,
        Self::MultiplePolygons,
        Self::Line,
        Self::MultipleLines,
        Self::Angle,
        Self::MultipleAngles,
        Self::Ellipse,
        Self::MultipleEllipses,
        Self::Choice,
        Self::MultipleChoice,
        Self::Image,
        Self::Segmentation,
        Self::HeatMap,
        Self::Pdf,
        Self::Sqreg,
        Self::ThumbnailJpg,
        Self::ThumbnailPng,
        Self::Obj,
        Self::Mp4,
        Self::Csv,
        Self::Zip,
    ];

    /// Kind with the given platform label, if any.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    /// Platform label of the kind.
    pub fn label(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Integer => "Integer",
            Self::Float => "Float",
            Self::Bool => "Bool",
            Self::Anything => "Anything",
            Self::Chart => "Chart",
            Self::TwoDBoundingBox => "2D bounding box",
            Self::MultipleTwoDBoundingBoxes => "Multiple 2D bounding boxes",
            Self::DistanceMeasurement => "Distance measurement",
            Self::MultipleDistanceMeasurements => "Multiple distance measurements",
            Self::Point => "Point",
            Self::MultiplePoints => "Multiple points",
            Self::Polygon => "Polygon",
            Self::MultiplePolygons => "Multiple polygons",
            Self::Line => "Line",
            Self::MultipleLines => "Multiple lines",
            Self::Angle => "Angle",
            Self::MultipleAngles => "Multiple angles",
            Self::Ellipse => "Ellipse",
            Self::MultipleEllipses => "Multiple ellipses",
            Self::Choice => "Choice",
            Self::MultipleChoice => "Multiple choice",
            Self::Image => "Image",
            Self::Segmentation => "Segmentation",
            Self::HeatMap => "Heat Map",
            Self::Pdf => "PDF file",
            Self::Sqreg => "SQREG file",
            Self::ThumbnailJpg => "Thumbnail jpg",
            Self::ThumbnailPng => "Thumbnail png",
            Self::Obj => "OBJ file",
            Self::Mp4 => "MP4 file",
            Self::Csv => "CSV file",
            Self::Zip => "ZIP file",
        }
    }

    pub fn io_kind(&self) -> IoKind {
        match self {
            Self::Image | Self::Segmentation | Self::HeatMap => IoKind::Image,
            Self::Pdf
            | Self::Sqreg
            | Self::ThumbnailJpg
            | Self::ThumbnailPng
            | Self::Obj
            | Self::Mp4
            | Self::Csv
            | Self::Zip => IoKind::File,
            _ => IoKind::Json,
        }
    }

    /// Only meaningful for [`IoKind::File`] kinds.
    pub fn payload(&self) -> Payload {
        match self {
            Self::Csv | Self::String => Payload::Text,
            _ => Payload::Binary,
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A loaded or produced interface value.
#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceValue {
    Json(Value),
    Image(Volume),
    Text(String),
    Bytes(Vec<u8>),
}

/// A named slot of the container, stored under `relative_path` of the
/// input or output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub slug: &'static str,
    pub relative_path: &'static str,
    pub kind: InterfaceKind,
}

impl Interface {
    /// Slug as a field identifier: `a-b-C` becomes `a_b_c`.
    pub fn field_name(&self) -> String {
        self.slug.replace('-', "_").to_lowercase()
    }

    pub fn load(&self, input_root: &Path) -> Result<InterfaceValue> {
        let path = input_root.join(self.relative_path);
        debug!("Loading {} ({}) from {path:?}", self.field_name(), self.kind);
        match self.kind.io_kind() {
            IoKind::Json => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}: {path:?}", self.slug))?;
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("Invalid JSON for {}: {path:?}", self.slug))?;
                Ok(InterfaceValue::Json(value))
            }
            IoKind::Image => Ok(InterfaceValue::Image(volume::load_single_image(&path)?)),
            IoKind::File => match self.kind.payload() {
                Payload::Text => fs::read_to_string(&path)
                    .map(InterfaceValue::Text)
                    .with_context(|| format!("Failed to read {}: {path:?}", self.slug)),
                Payload::Binary => fs::read(&path)
                    .map(InterfaceValue::Bytes)
                    .with_context(|| format!("Failed to read {}: {path:?}", self.slug)),
            },
        }
    }

    /// Load an image interface.
    pub fn load_image(&self, input_root: &Path) -> Result<Volume> {
        match self.load(input_root)? {
            InterfaceValue::Image(volume) => Ok(volume),
            _ => anyhow::bail!("Interface {} is a {} and holds no image", self.slug, self.kind),
        }
    }

    /// Serialise `value` and return the written path.
    pub fn save(&self, output_root: &Path, value: &InterfaceValue) -> Result<PathBuf> {
        let path = output_root.join(self.relative_path);
        match (self.kind.io_kind(), value) {
            (IoKind::Json, InterfaceValue::Json(json)) => {
                create_parent(&path)?;
                let text = serde_json::to_string(json)?;
                fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}: {path:?}", self.slug))?;
                Ok(path)
            }
            (IoKind::Image, InterfaceValue::Image(volume)) => self.save_image(output_root, volume),
            (IoKind::File, InterfaceValue::Text(text)) if self.kind.payload() == Payload::Text => {
                create_parent(&path)?;
                fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}: {path:?}", self.slug))?;
                Ok(path)
            }
            (IoKind::File, InterfaceValue::Bytes(bytes))
                if self.kind.payload() == Payload::Binary =>
            {
                create_parent(&path)?;
                fs::write(&path, bytes)
                    .with_context(|| format!("Failed to write {}: {path:?}", self.slug))?;
                Ok(path)
            }
            (io_kind, _) => anyhow::bail!(
                "Value does not match interface {} ({}, stored as {io_kind:?})",
                self.slug,
                self.kind
            ),
        }
    }

    /// Write `volume` as `output_root/relative_path/overlay.mha`.
    pub fn save_image(&self, output_root: &Path, volume: &Volume) -> Result<PathBuf> {
        if self.kind.io_kind() != IoKind::Image {
            anyhow::bail!("Interface {} is a {} and cannot store an image", self.slug, self.kind);
        }
        volume::save_image(&output_root.join(self.relative_path), IMAGE_OUTPUT_FILE, volume)
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}
