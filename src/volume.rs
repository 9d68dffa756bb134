//! In-memory 3D image with physical geometry, plus directory-level loading.
//!
//! Voxels are kept as `f32` in an `Array3` indexed `[z, y, x]`, the layout a
//! MetaImage stores on disk. Geometry and index arguments use `[x, y, z]`.

pub mod mha;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array3;

use crate::error::ToolboxError;
use crate::utils::{ensure_dir, files_with_extension};

/// Extension of the image container used for submission inputs and outputs.
pub const IMAGE_EXTENSION: &str = "mha";

/// Voxel storage type on disk.
///
/// Voxels are held as `f32` in memory whatever the stored type. 32 and 64-bit
/// integers beyond 2^24 in magnitude, and doubles, lose precision when read
/// and are written back rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementType {
    pub fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

/// Physical placement of the voxel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Voxel size along x, y, z in mm.
    pub spacing: [f64; 3],
    /// Physical position of voxel `[0, 0, 0]`.
    pub origin: [f64; 3],
    /// Unit direction of each index axis in physical space (`axes[0]` is x).
    pub axes: [[f64; 3]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            origin: [0.0; 3],
            axes: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

impl Geometry {
    /// Map a continuous `[x, y, z]` index to a physical point.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let mut point = self.origin;
        for (axis, (&i, &s)) in index.iter().zip(self.spacing.iter()).enumerate() {
            for (p, d) in point.iter_mut().zip(self.axes[axis].iter()) {
                *p += d * s * i;
            }
        }
        point
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Indexed `[z, y, x]`; see [`ElementType`] for the precision limit.
    pub voxels: Array3<f32>,
    pub geometry: Geometry,
    pub element_type: ElementType,
}

impl Volume {
    pub fn new(voxels: Array3<f32>, geometry: Geometry, element_type: ElementType) -> Self {
        Self {
            voxels,
            geometry,
            element_type,
        }
    }

    /// Grid size as `[x, y, z]`.
    pub fn size(&self) -> [usize; 3] {
        let (z, y, x) = self.voxels.dim();
        [x, y, z]
    }

    /// Sum of voxel values.
    pub fn sum(&self) -> f64 {
        self.voxels.iter().map(|&v| f64::from(v)).sum()
    }

    /// Foreground mask: every non-zero voxel is `true`.
    pub fn mask(&self) -> Array3<bool> {
        self.voxels.mapv(|v| v != 0.0)
    }

    /// New volume on the same grid with different voxel values.
    pub fn with_voxels(&self, voxels: Array3<f32>, element_type: ElementType) -> Self {
        Self::new(voxels, self.geometry, element_type)
    }
}

/// Load the one image stored in `dir`.
///
/// Zero files (or a missing directory) is [`ToolboxError::ResourceNotFound`],
/// more than one is [`ToolboxError::AmbiguousResource`].
pub fn load_single_image(dir: &Path) -> Result<Volume> {
    let path = find_single_image(dir)?;
    mha::read(&path).with_context(|| format!("Failed to read image: {path:?}"))
}

/// Locate the one `.mha` file in `dir`.
pub fn find_single_image(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(ToolboxError::ResourceNotFound {
            dir: dir.to_path_buf(),
        }
        .into());
    }
    let mut files = files_with_extension(dir, IMAGE_EXTENSION)?;
    match files.len() {
        0 => Err(ToolboxError::ResourceNotFound {
            dir: dir.to_path_buf(),
        }
        .into()),
        1 => Ok(files.remove(0)),
        count => Err(ToolboxError::AmbiguousResource {
            dir: dir.to_path_buf(),
            count,
        }
        .into()),
    }
}

/// Write `volume` as `dir/file_name`, creating `dir` when needed.
pub fn save_image(dir: &Path, file_name: &str, volume: &Volume) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(file_name);
    mha::write(&path, volume, true).with_context(|| format!("Failed to write image: {path:?}"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn cube(values: &[f32], dim: (usize, usize, usize)) -> Volume {
        Volume::new(
            Array3::from_shape_vec(dim, values.to_vec()).unwrap(),
            Geometry::default(),
            ElementType::U8,
        )
    }

    mod geometry_tests {
        use super::*;

        #[test]
        fn identity_geometry_maps_index_to_itself() {
            let g = Geometry::default();
            assert_eq!(g.index_to_physical([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
        }

        #[test]
        fn spacing_and_origin_are_applied() {
            let g = Geometry {
                spacing: [0.5, 2.0, 4.0],
                origin: [10.0, -5.0, 1.0],
                ..Geometry::default()
            };
            assert_eq!(g.index_to_physical([2.0, 1.0, 1.0]), [11.0, -3.0, 5.0]);
        }

        #[test]
        fn axes_rotate_index_space() {
            // x index runs along -y, y index runs along +x
            let g = Geometry {
                axes: [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
                ..Geometry::default()
            };
            assert_eq!(g.index_to_physical([1.0, 2.0, 0.0]), [2.0, -1.0, 0.0]);
        }
    }

    mod volume_tests {
        use super::*;

        #[test]
        fn size_is_reported_as_xyz() {
            let v = cube(&[0.0; 24], (4, 3, 2));
            assert_eq!(v.size(), [2, 3, 4]);
        }

        #[test]
        fn sum_and_mask_follow_values() {
            let v = cube(&[0.0, 1.0, 2.0, 0.0, 0.0, 1.0, 0.0, 0.0], (2, 2, 2));
            assert_eq!(v.sum(), 4.0);
            assert_eq!(v.mask().iter().filter(|&&b| b).count(), 3);
        }
    }

    mod load_single_image_tests {
        use super::*;

        #[test]
        fn two_files_are_ambiguous() {
            let temp_dir = TempDir::new().unwrap();
            let v = cube(&[1.0; 8], (2, 2, 2));
            save_image(temp_dir.path(), "a.mha", &v).unwrap();
            save_image(temp_dir.path(), "b.mha", &v).unwrap();

            let err = load_single_image(temp_dir.path()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::AmbiguousResource { count: 2, .. })
            ));
        }

        #[test]
        fn empty_directory_is_not_found() {
            let temp_dir = TempDir::new().unwrap();
            fs::write(temp_dir.path().join("readme.txt"), "x").unwrap();

            let err = load_single_image(temp_dir.path()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::ResourceNotFound { .. })
            ));
        }

        #[test]
        fn missing_directory_is_not_found() {
            let temp_dir = TempDir::new().unwrap();
            let err = load_single_image(&temp_dir.path().join("nope")).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ToolboxError>(),
                Some(ToolboxError::ResourceNotFound { .. })
            ));
        }

        #[test]
        fn single_file_is_loaded() {
            let temp_dir = TempDir::new().unwrap();
            let v = cube(&[0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0], (2, 2, 2));
            save_image(&temp_dir.path().join("nested"), "overlay.mha", &v).unwrap();

            let loaded = load_single_image(&temp_dir.path().join("nested")).unwrap();
            assert_eq!(loaded, v);
        }
    }
}
