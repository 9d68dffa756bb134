//! NIfTI output: LPS to RAS conversion, canonical reorientation and writing.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Axis;
use nifti::NiftiHeader;
use nifti::writer::WriterOptions;

use crate::volume::{Geometry, Volume};

/// NIfTI extension written by the converter.
pub const NIFTI_EXTENSION: &str = "nii.gz";

/// `sform_code` / `qform_code` value for scanner anatomical coordinates.
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

/// `xyzt_units` value for millimetres.
const NIFTI_UNITS_MM: u8 = 2;

/// Convert DICOM patient coordinates (LPS) to NIfTI world coordinates (RAS).
pub fn lps_to_ras(geometry: &Geometry) -> Geometry {
    let flip = |v: [f64; 3]| [-v[0], -v[1], v[2]];
    Geometry {
        spacing: geometry.spacing,
        origin: flip(geometry.origin),
        axes: geometry.axes.map(flip),
    }
}

/// Index axis to world axis assignment that keeps each index axis closest to
/// a world axis.
fn closest_permutation(axes: &[[f64; 3]; 3]) -> [usize; 3] {
    const PERMUTATIONS: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let score = |p: &[usize; 3]| -> f64 { (0..3).map(|i| axes[i][p[i]].abs()).sum() };
    PERMUTATIONS
        .into_iter()
        .max_by(|a, b| score(a).total_cmp(&score(b)))
        .unwrap_or([0, 1, 2])
}

/// Permute and flip index axes so that index axis `i` runs along positive
/// world axis `i`. The voxels keep their world positions.
pub fn reorient_to_canonical(volume: &Volume) -> Volume {
    let Geometry {
        spacing,
        origin,
        axes,
    } = volume.geometry;
    let size = volume.size();
    let mut voxels = volume.voxels.clone();
    let mut origin = origin;
    let mut axes = axes;

    // Flip index axes that point against their world axis.
    let world_of = closest_permutation(&axes);
    for (i, &w) in world_of.iter().enumerate() {
        if axes[i][w] < 0.0 {
            let extent = spacing[i] * (size[i].saturating_sub(1)) as f64;
            for (o, d) in origin.iter_mut().zip(axes[i].iter()) {
                *o += d * extent;
            }
            axes[i] = axes[i].map(|d| -d);
            voxels.invert_axis(Axis(2 - i));
        }
    }

    // index_of[w] is the old index axis that becomes new index axis w.
    let mut index_of = [0; 3];
    for (i, &w) in world_of.iter().enumerate() {
        index_of[w] = i;
    }
    let voxels = voxels
        .permuted_axes([2 - index_of[2], 2 - index_of[1], 2 - index_of[0]])
        .as_standard_layout()
        .into_owned();

    let geometry = Geometry {
        spacing: index_of.map(|i| spacing[i]),
        origin,
        axes: index_of.map(|i| axes[i]),
    };
    Volume::new(voxels, geometry, volume.element_type)
}

/// Header carrying the RAS affine of `geometry` in the sform.
pub fn nifti_header(geometry: &Geometry) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let Geometry {
        spacing,
        origin,
        axes,
    } = geometry;

    header.pixdim[0] = 1.0;
    for (pixdim, s) in header.pixdim[1..4].iter_mut().zip(spacing) {
        *pixdim = *s as f32;
    }
    let row = |r: usize| -> [f32; 4] {
        [
            (axes[0][r] * spacing[0]) as f32,
            (axes[1][r] * spacing[1]) as f32,
            (axes[2][r] * spacing[2]) as f32,
            origin[r] as f32,
        ]
    };
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header.sform_code = NIFTI_XFORM_SCANNER_ANAT;
    header.qform_code = 0;
    header.xyzt_units = NIFTI_UNITS_MM;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

/// Write an RAS volume. Data goes to a temporary file in the destination
/// folder first, so an interrupted write never leaves a partial file behind.
pub fn write_nifti(path: &Path, volume: &Volume) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(&format!(".{NIFTI_EXTENSION}"))
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temporary file in {dir:?}"))?;

    let header = nifti_header(&volume.geometry);
    // NIfTI indexes [x, y, z] with x fastest on disk.
    let data = volume.voxels.view().reversed_axes();
    WriterOptions::new(temp.path())
        .reference_header(&header)
        .write_nifti(&data)
        .with_context(|| format!("Failed to write NIfTI data: {:?}", temp.path()))?;

    temp.persist(path)
        .with_context(|| format!("Failed to move NIfTI file into place: {path:?}"))?;
    Ok(())
}
