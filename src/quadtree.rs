//! Arena quadtree for Barnes-Hut force summarization.
//!
//! Nodes live in one flat `Vec` indexed by `u32` handles; the tree is
//! rebuilt from scratch every iteration and is read-only while gradients
//! are computed. A leaf whose points coincide within EPSILON keeps a
//! duplicate count instead of subdividing forever.

use ndarray::ArrayView2;

use crate::types::EPSILON;

const NO_CHILD: u32 = u32::MAX;

#[derive(Clone, Debug)]
struct Node {
    /// Geometric center of the region.
    center: [f64; 2],
    half_side: f64,
    /// Running mean of the points below this node.
    center_of_mass: [f64; 2],
    /// Point count; doubles as the mass in the Barnes-Hut sum.
    count: usize,
    /// Index of the first of 2^dim contiguous children, NO_CHILD for leaves.
    first_child: u32,
    /// Leaf holds two or more coincident points.
    duplicates: bool,
}

impl Node {
    fn new(center: [f64; 2], half_side: f64) -> Self {
        Self {
            center,
            half_side,
            center_of_mass: [0.0; 2],
            count: 0,
            first_child: NO_CHILD,
            duplicates: false,
        }
    }

    fn is_leaf(&self) -> bool {
        self.first_child == NO_CHILD
    }
}

pub struct QuadTree {
    dim: usize,
    nodes: Vec<Node>,
}

impl QuadTree {
    /// Bulk-build from an N x d array of points, d in {1, 2}. The 1-D case
    /// degenerates to a binary interval tree over the first coordinate.
    pub fn build(points: &ArrayView2<'_, f64>) -> Self {
        let dim = points.ncols().min(2);
        let n = points.nrows();

        let mut lo = [f64::MAX; 2];
        let mut hi = [f64::MIN; 2];
        for row in points.rows() {
            for a in 0..dim {
                lo[a] = lo[a].min(row[a]);
                hi[a] = hi[a].max(row[a]);
            }
        }
        let mut center = [0.0; 2];
        let mut half_side: f64 = 0.0;
        for a in 0..dim {
            center[a] = (lo[a] + hi[a]) / 2.0;
            half_side = half_side.max((hi[a] - lo[a]) / 2.0);
        }

        let mut tree = Self { dim, nodes: Vec::with_capacity(2 * n.max(1)) };
        tree.nodes.push(Node::new(center, half_side));
        for row in points.rows() {
            let mut p = [0.0; 2];
            for a in 0..dim {
                p[a] = row[a];
            }
            tree.add_point(p);
        }
        tree
    }

    fn child_index(&self, node: usize, p: &[f64; 2]) -> usize {
        let mut quadrant = 0;
        for a in 0..self.dim {
            if p[a] > self.nodes[node].center[a] {
                quadrant |= 1 << a;
            }
        }
        self.nodes[node].first_child as usize + quadrant
    }

    /// Allocate 2^dim children for `node` and push the points it currently
    /// holds down into the matching quadrant.
    fn split(&mut self, node: usize) {
        let first = self.nodes.len() as u32;
        let parent_center = self.nodes[node].center;
        let half = self.nodes[node].half_side / 2.0;
        for quadrant in 0..(1usize << self.dim) {
            let mut center = parent_center;
            for a in 0..self.dim {
                center[a] += if quadrant & (1 << a) != 0 { half } else { -half };
            }
            self.nodes.push(Node::new(center, half));
        }
        self.nodes[node].first_child = first;

        let com = self.nodes[node].center_of_mass;
        let count = self.nodes[node].count;
        let child = self.child_index(node, &com);
        let child_node = &mut self.nodes[child];
        child_node.center_of_mass = com;
        child_node.count = count;
        child_node.duplicates = count > 1;
    }

    fn add_point(&mut self, p: [f64; 2]) {
        let mut idx = 0;
        loop {
            if self.nodes[idx].is_leaf() {
                if self.nodes[idx].count == 0 {
                    let node = &mut self.nodes[idx];
                    node.center_of_mass = p;
                    node.count = 1;
                    return;
                }
                let com = self.nodes[idx].center_of_mass;
                let coincident =
                    (0..self.dim).all(|a| (p[a] - com[a]).abs() <= EPSILON);
                if coincident {
                    let node = &mut self.nodes[idx];
                    node.count += 1;
                    node.duplicates = true;
                    return;
                }
                // Distinct point in an occupied leaf: push the resident
                // points down one level and keep descending.
                self.split(idx);
            }
            let node = &mut self.nodes[idx];
            node.count += 1;
            let c = node.count as f64;
            for a in 0..2 {
                node.center_of_mass[a] += (p[a] - node.center_of_mass[a]) / c;
            }
            idx = self.child_index(idx, &p);
        }
    }

    /// Barnes-Hut traversal for one query point.
    ///
    /// Visits `(diff, dist_sq, mass)` for every accepted summary, where
    /// `diff = query - center_of_mass`. A node is accepted when it is a
    /// leaf or `side / sqrt(dist) < theta`. A zero-distance leaf is the
    /// query's own cell: one unit of mass is skipped so the point never
    /// interacts with itself.
    pub fn summarize<F>(&self, query: &[f64; 2], theta: f64, mut visit: F)
    where
        F: FnMut(&[f64; 2], f64, f64),
    {
        let theta_sq = theta * theta;
        let mut stack: Vec<u32> = Vec::with_capacity(64);
        stack.push(0);
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i as usize];
            if node.count == 0 {
                continue;
            }
            let diff = [
                query[0] - node.center_of_mass[0],
                query[1] - node.center_of_mass[1],
            ];
            let dist_sq = diff[0] * diff[0] + diff[1] * diff[1];
            let side = 2.0 * node.half_side;
            if node.is_leaf() || side * side < theta_sq * dist_sq {
                if dist_sq < EPSILON {
                    if node.count > 1 {
                        visit(&diff, dist_sq, (node.count - 1) as f64);
                    }
                    continue;
                }
                visit(&diff, dist_sq, node.count as f64);
            } else {
                for c in 0..(1u32 << self.dim) {
                    stack.push(node.first_child + c);
                }
            }
        }
    }

    pub fn num_points(&self) -> usize {
        self.nodes[0].count
    }

    /// Whether every point sits on a single coordinate (the all-duplicates
    /// degenerate case).
    pub fn is_degenerate(&self) -> bool {
        self.nodes[0].is_leaf() && self.nodes[0].duplicates
    }

    #[cfg(test)]
    fn root(&self) -> &Node {
        &self.nodes[0]
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
