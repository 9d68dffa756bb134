//! Static 3-d tree for nearest-neighbour distance queries.

/// Points at or below this count are scanned linearly.
const LEAF_SIZE: usize = 16;

#[derive(Debug)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        axis: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// Balanced k-d tree over a fixed point set.
#[derive(Debug)]
pub struct KdTree {
    points: Vec<[f64; 3]>,
    root: Option<Node>,
}

impl KdTree {
    pub fn new(points: &[[f64; 3]]) -> Self {
        let mut points = points.to_vec();
        let root = if points.is_empty() {
            None
        } else {
            let len = points.len();
            Some(build(&mut points, 0, len))
        };
        Self { points, root }
    }

    /// Euclidean distance from `query` to the closest point, `None` when the
    /// tree is empty.
    pub fn nearest_distance(&self, query: &[f64; 3]) -> Option<f64> {
        let root = self.root.as_ref()?;
        let mut best = f64::INFINITY;
        self.search(root, query, &mut best);
        Some(best.sqrt())
    }

    fn search(&self, node: &Node, query: &[f64; 3], best: &mut f64) {
        match node {
            Node::Leaf { start, end } => {
                for p in &self.points[*start..*end] {
                    let d = squared_distance(p, query);
                    if d < *best {
                        *best = d;
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[*axis] - value;
                let (near, far) = if diff <= 0.0 {
                    (left, right)
                } else {
                    (right, left)
                };
                self.search(near, query, best);
                if diff * diff < *best {
                    self.search(far, query, best);
                }
            }
        }
    }
}

/// Partition `points[start..end]` around the median of the widest axis.
fn build(points: &mut [[f64; 3]], start: usize, end: usize) -> Node {
    if end - start <= LEAF_SIZE {
        return Node::Leaf { start, end };
    }

    let slice = &mut points[start..end];
    let axis = widest_axis(slice);
    let mid = slice.len() / 2;
    slice.select_nth_unstable_by(mid, |a, b| a[axis].total_cmp(&b[axis]));
    let value = slice[mid][axis];

    Node::Split {
        axis,
        value,
        left: Box::new(build(points, start, start + mid)),
        right: Box::new(build(points, start + mid, end)),
    }
}

fn widest_axis(points: &[[f64; 3]]) -> usize {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in points {
        for (axis, &v) in p.iter().enumerate() {
            lo[axis] = lo[axis].min(v);
            hi[axis] = hi[axis].max(v);
        }
    }
    (0..3)
        .max_by(|&a, &b| (hi[a] - lo[a]).total_cmp(&(hi[b] - lo[b])))
        .unwrap_or(0)
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(points: &[[f64; 3]], q: &[f64; 3]) -> f64 {
        points
            .iter()
            .map(|p| squared_distance(p, q))
            .fold(f64::INFINITY, f64::min)
            .sqrt()
    }

    /// Deterministic pseudo-random cloud (xorshift).
    fn cloud(n: usize, mut seed: u64) -> Vec<[f64; 3]> {
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % 10_000) as f64 / 100.0
        };
        (0..n).map(|_| [next(), next(), next()]).collect()
    }

    #[test]
    fn empty_tree_has_no_nearest() {
        let tree = KdTree::new(&[]);
        assert!(tree.root.is_none());
        assert_eq!(tree.nearest_distance(&[0.0; 3]), None);
    }

    #[test]
    fn exact_hit_is_zero() {
        let points = cloud(200, 7);
        let tree = KdTree::new(&points);
        assert_eq!(tree.points.len(), 200);
        for p in points.iter().take(20) {
            assert_eq!(tree.nearest_distance(p), Some(0.0));
        }
    }

    #[test]
    fn matches_brute_force() {
        let points = cloud(500, 42);
        let queries = cloud(100, 99);
        let tree = KdTree::new(&points);
        for q in &queries {
            let expected = brute_force(&points, q);
            let found = tree.nearest_distance(q).unwrap();
            assert!((found - expected).abs() < 1e-12, "{q:?}: {found} != {expected}");
        }
    }

    #[test]
    fn duplicate_points_are_handled() {
        let points = vec![[1.0, 1.0, 1.0]; 40];
        let tree = KdTree::new(&points);
        assert_eq!(tree.nearest_distance(&[1.0, 1.0, 4.0]), Some(3.0));
    }
}
