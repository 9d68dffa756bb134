//! Reconstruct a 3D volume from the slices of one DICOM series.

use std::path::{Path, PathBuf};

use anyhow::Context;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::file::ReadPreamble;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption};
use ndarray::{Array2, Array3, Axis};
use tracing::debug;

use crate::report::{FailWith, Failure, FailureKind};
use crate::utils::{decode_pixels, files_with_extension};
use crate::volume::{ElementType, Geometry, Volume};

/// Geometry values that must agree across slices.
const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Largest accepted angle between the stacking direction and the slice normal.
const MAX_TILT_DEGREES: f64 = 0.1;

/// Allowed deviation of any slice gap from the median gap.
const INCREMENT_TOLERANCE: f64 = 0.1;

/// One slice with the header fields needed for stacking.
pub struct Slice {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
    /// Row spacing, column spacing (DICOM order).
    pub pixel_spacing: [f64; 2],
    /// Row cosine followed by column cosine.
    pub orientation: [f64; 6],
    pub position: Option<[f64; 3]>,
    pub instance_number: i32,
    /// Fallback gap when positions are missing.
    pub slice_gap: Option<f64>,
    object: DefaultDicomObject,
}

impl Slice {
    pub fn read(path: &Path) -> Result<Self, Failure> {
        let object = OpenFileOptions::new()
            .read_preamble(ReadPreamble::Auto)
            .open_file(path)
            .with_context(|| format!("Failed to open DICOM file: {path:?}"))
            .fail_with(FailureKind::Read)?;

        let int = |tag: Tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok())
        };
        let floats = |tag: Tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_multi_float64().ok())
        };

        let rows = int(tags::ROWS).unwrap_or(0);
        let columns = int(tags::COLUMNS).unwrap_or(0);
        if rows <= 0 || columns <= 0 {
            return Err(Failure::new(
                FailureKind::Read,
                format!("Invalid image dimensions {columns}x{rows} in {path:?}"),
            ));
        }

        let pixel_spacing = match floats(tags::PIXEL_SPACING).as_deref() {
            Some([r, c, ..]) => [*r, *c],
            _ => [1.0, 1.0],
        };
        let orientation = match floats(tags::IMAGE_ORIENTATION_PATIENT).as_deref() {
            Some([a, b, c, d, e, f, ..]) => [*a, *b, *c, *d, *e, *f],
            _ => [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        };
        let position = match floats(tags::IMAGE_POSITION_PATIENT).as_deref() {
            Some([x, y, z, ..]) => Some([*x, *y, *z]),
            _ => None,
        };
        let slice_gap = floats(tags::SPACING_BETWEEN_SLICES)
            .or_else(|| floats(tags::SLICE_THICKNESS))
            .and_then(|v| v.first().copied())
            .filter(|v| *v > 0.0);
        let instance_number = int(tags::INSTANCE_NUMBER).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            rows: rows as usize,
            columns: columns as usize,
            pixel_spacing,
            orientation,
            position,
            instance_number,
            slice_gap,
            object,
        })
    }

    pub fn row_cosine(&self) -> [f64; 3] {
        [self.orientation[0], self.orientation[1], self.orientation[2]]
    }

    pub fn column_cosine(&self) -> [f64; 3] {
        [self.orientation[3], self.orientation[4], self.orientation[5]]
    }

    /// Unit normal of the slice plane.
    pub fn normal(&self) -> [f64; 3] {
        normalize(cross(self.row_cosine(), self.column_cosine()))
    }

    /// Decode the first frame with the modality rescale applied.
    fn pixels(&self) -> Result<Array2<f32>, Failure> {
        let decoded = decode_pixels(&self.object)
            .with_context(|| format!("Failed to decode pixel data: {:?}", self.path))
            .fail_with(FailureKind::Decompress)?;

        if decoded.samples_per_pixel() != 1 {
            return Err(Failure::new(
                FailureKind::Read,
                format!(
                    "{} samples per pixel in {:?}, expected 1",
                    decoded.samples_per_pixel(),
                    self.path
                ),
            ));
        }
        let (rows, columns) = (decoded.rows() as usize, decoded.columns() as usize);
        if rows != self.rows || columns != self.columns {
            return Err(Failure::new(
                FailureKind::InconsistentGeometry,
                format!(
                    "Decoded size {columns}x{rows} does not match header {}x{} in {:?}",
                    self.columns, self.rows, self.path
                ),
            ));
        }

        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
        let values = decoded
            .to_vec_frame_with_options::<f32>(0, &options)
            .with_context(|| format!("Failed to convert pixel data: {:?}", self.path))
            .fail_with(FailureKind::Decompress)?;
        Array2::from_shape_vec((rows, columns), values)
            .with_context(|| format!("Unexpected pixel count in {:?}", self.path))
            .fail_with(FailureKind::Decompress)
    }
}

/// Slices in stacking order with the derived through-plane geometry.
pub struct Stack {
    pub slices: Vec<Slice>,
    pub slice_spacing: f64,
    pub slice_direction: [f64; 3],
    pub origin: [f64; 3],
}

/// Order slices along their normal and validate that they form a regular
/// volume.
pub fn stack_slices(mut slices: Vec<Slice>, validate_increment: bool) -> Result<Stack, Failure> {
    if slices.len() < 2 {
        return Err(Failure::new(
            FailureKind::MissingSlices,
            format!("{} slice(s) found, at least 2 are needed", slices.len()),
        ));
    }
    check_consistent(&slices)?;

    let normal = slices[0].normal();
    let positioned = slices.iter().all(|s| s.position.is_some());

    if !positioned {
        slices.sort_by_key(|s| s.instance_number);
        if slices
            .windows(2)
            .any(|w| w[0].instance_number == w[1].instance_number)
        {
            return Err(Failure::new(
                FailureKind::InconsistentGeometry,
                "Duplicate instance numbers without slice positions",
            ));
        }
        let slice_spacing = slices[0].slice_gap.unwrap_or(1.0);
        let origin = slices[0].position.unwrap_or([0.0; 3]);
        return Ok(Stack {
            slices,
            slice_spacing,
            slice_direction: normal,
            origin,
        });
    }

    let project = |s: &Slice| s.position.map_or(0.0, |p| dot(p, normal));
    slices.sort_by(|a, b| project(a).total_cmp(&project(b)));

    let gaps: Vec<f64> = slices
        .windows(2)
        .map(|w| project(&w[1]) - project(&w[0]))
        .collect();
    if let Some(i) = gaps.iter().position(|g| *g < GEOMETRY_TOLERANCE) {
        return Err(Failure::new(
            FailureKind::InconsistentGeometry,
            format!(
                "Duplicate slice position: {:?} and {:?}",
                slices[i].path,
                slices[i + 1].path
            ),
        ));
    }

    let slice_spacing = median(&gaps);
    if validate_increment
        && gaps
            .iter()
            .any(|g| (g - slice_spacing).abs() > INCREMENT_TOLERANCE * slice_spacing)
    {
        return Err(Failure::new(
            FailureKind::InconsistentGeometry,
            format!("Slice increment is not consistent (median {slice_spacing:.3} mm)"),
        ));
    }

    let first = slices[0].position.unwrap_or([0.0; 3]);
    let last = slices[slices.len() - 1].position.unwrap_or([0.0; 3]);
    let stacking = normalize(sub(last, first));
    let tilt = dot(stacking, normal).clamp(-1.0, 1.0).acos().to_degrees();
    if tilt > MAX_TILT_DEGREES {
        return Err(Failure::new(
            FailureKind::InconsistentGeometry,
            format!("Gantry tilt of {tilt:.2} degrees is not supported"),
        ));
    }

    Ok(Stack {
        slices,
        slice_spacing,
        slice_direction: normal,
        origin: first,
    })
}

fn check_consistent(slices: &[Slice]) -> Result<(), Failure> {
    let reference = &slices[0];
    for slice in &slices[1..] {
        let problem = if (slice.rows, slice.columns) != (reference.rows, reference.columns) {
            Some("size")
        } else if !close(&slice.pixel_spacing, &reference.pixel_spacing) {
            Some("pixel spacing")
        } else if !close(&slice.orientation, &reference.orientation) {
            Some("orientation")
        } else {
            None
        };
        if let Some(what) = problem {
            return Err(Failure::new(
                FailureKind::InconsistentGeometry,
                format!("Slice {what} differs: {:?} vs {:?}", slice.path, reference.path),
            ));
        }
    }
    Ok(())
}

/// Read every `.dcm` file in `dir` and build an LPS volume.
pub fn load_series(dir: &Path, validate_increment: bool) -> Result<Volume, Failure> {
    let files = files_with_extension(dir, "dcm").fail_with(FailureKind::Read)?;
    debug!("{} slice file(s) in {dir:?}", files.len());

    let slices = files
        .iter()
        .map(|path| Slice::read(path))
        .collect::<Result<Vec<_>, _>>()?;
    let stack = stack_slices(slices, validate_increment)?;
    build_volume(&stack)
}

/// Assemble decoded slices into a volume indexed `[slice, row, column]`.
pub fn build_volume(stack: &Stack) -> Result<Volume, Failure> {
    let first = &stack.slices[0];
    let mut voxels = Array3::<f32>::zeros((stack.slices.len(), first.rows, first.columns));
    for (k, slice) in stack.slices.iter().enumerate() {
        voxels.index_axis_mut(Axis(0), k).assign(&slice.pixels()?);
    }

    let geometry = Geometry {
        spacing: [
            first.pixel_spacing[1],
            first.pixel_spacing[0],
            stack.slice_spacing,
        ],
        origin: stack.origin,
        axes: [first.row_cosine(), first.column_cosine(), stack.slice_direction],
    };
    Ok(Volume::new(voxels, geometry, ElementType::F32))
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len().is_multiple_of(2) {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn close(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= GEOMETRY_TOLERANCE)
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f64; 3]) -> [f64; 3] {
    let norm = dot(v, v).sqrt();
    if norm == 0.0 {
        return v;
    }
    [v[0] / norm, v[1] / norm, v[2] / norm]
}
