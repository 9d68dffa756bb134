//! 3D binary morphology on `[z, y, x]` masks.

use ndarray::{Array3, Zip};

/// Offsets of the radius-1 ball: the six face neighbours.
const FACE_NEIGHBOURS: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Erosion with the radius-1 ball. Neighbours outside the grid count as
/// foreground, so objects touching the border are not eroded from that side.
pub fn erode(mask: &Array3<bool>) -> Array3<bool> {
    let (nz, ny, nx) = mask.dim();
    let inside = |z: usize, dz: isize, n: usize| -> Option<usize> {
        let v = z as isize + dz;
        (0..n as isize).contains(&v).then_some(v as usize)
    };

    Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| {
        mask[[z, y, x]]
            && FACE_NEIGHBOURS.iter().all(|&(dz, dy, dx)| {
                match (inside(z, dz, nz), inside(y, dy, ny), inside(x, dx, nx)) {
                    (Some(z), Some(y), Some(x)) => mask[[z, y, x]],
                    _ => true,
                }
            })
    })
}

/// Foreground voxels removed by [`erode`]: the outer surface of each object.
pub fn boundary(mask: &Array3<bool>) -> Array3<bool> {
    let eroded = erode(mask);
    let mut edge = mask.clone();
    Zip::from(&mut edge).and(&eroded).for_each(|e, &inner| *e &= !inner);
    edge
}

/// `[x, y, z]` indices of the set voxels, in memory order.
pub fn set_indices(mask: &Array3<bool>) -> Vec<[usize; 3]> {
    mask.indexed_iter()
        .filter(|(_, set)| **set)
        .map(|((z, y, x), _)| [x, y, z])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(n: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            (lo..hi).contains(&z) && (lo..hi).contains(&y) && (lo..hi).contains(&x)
        })
    }

    fn count(mask: &Array3<bool>) -> usize {
        mask.iter().filter(|&&b| b).count()
    }

    #[test]
    fn erosion_peels_one_layer() {
        let mask = cube(7, 1, 6);
        let eroded = erode(&mask);
        assert_eq!(eroded, cube(7, 2, 5));
    }

    #[test]
    fn single_voxel_is_its_own_boundary() {
        let mut mask = Array3::from_elem((3, 3, 3), false);
        mask[[1, 1, 1]] = true;
        assert_eq!(count(&erode(&mask)), 0);
        assert_eq!(set_indices(&boundary(&mask)), vec![[1, 1, 1]]);
    }

    #[test]
    fn edge_voxels_of_cube_survive_face_erosion_only_inside() {
        // 3x3x3 block: only the centre has all six neighbours set.
        let mask = cube(5, 1, 4);
        let eroded = erode(&mask);
        assert_eq!(set_indices(&eroded), vec![[2, 2, 2]]);
        assert_eq!(count(&boundary(&mask)), 26);
    }

    #[test]
    fn grid_border_counts_as_foreground() {
        let full = Array3::from_elem((2, 3, 4), true);
        assert_eq!(erode(&full), full);
        assert_eq!(count(&boundary(&full)), 0);
    }

    #[test]
    fn indices_are_reported_as_xyz() {
        let mut mask = Array3::from_elem((2, 3, 4), false);
        mask[[1, 2, 3]] = true;
        assert_eq!(set_indices(&mask), vec![[3, 2, 1]]);
    }
}
