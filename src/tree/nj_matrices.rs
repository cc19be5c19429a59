use std::fmt::{Display, Formatter, Result};

use nalgebra::{max, min, DMatrix};

use crate::tree::NodeIdx;

pub(super) type Mat = DMatrix<f64>;

/// Distances between the clusters that are still to be joined.
#[derive(Debug)]
pub(super) struct NJMat {
    pub(super) idx: Vec<NodeIdx>,
    pub(super) distances: Mat,
}

impl Display for NJMat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:?}\n {}", self.idx, self.distances)
    }
}

impl NJMat {
    pub(super) fn add_merge_node(mut self, idx_new: NodeIdx) -> Self {
        let new_row_index = self.distances.nrows();
        self.distances = self
            .distances
            .insert_row(new_row_index, 0.0)
            .insert_column(new_row_index, 0.0);
        self.idx.push(idx_new);
        self
    }

    pub(super) fn remove_merged_nodes(mut self, idx_i: usize, idx_j: usize) -> Self {
        debug_assert!(idx_i > idx_j);
        self.distances = self
            .distances
            .remove_columns_at(&[idx_i, idx_j])
            .remove_rows_at(&[idx_i, idx_j]);
        self.idx.remove(max(idx_i, idx_j));
        self.idx.remove(min(idx_i, idx_j));
        self
    }

    pub(super) fn recompute_new_node_distances(mut self, i: usize, j: usize) -> Self {
        let new = self.distances.ncols() - 1;
        for k in (0..new).filter(|&k| k != i && k != j) {
            let new_dist =
                (self.distances[(i, k)] + self.distances[(j, k)] - self.distances[(i, j)]) / 2.0;
            self.distances[(new, k)] = new_dist;
            self.distances[(k, new)] = new_dist;
        }
        self
    }

    /// Lengths of the branches from the new node to clusters `i` and `j`,
    /// non-positive lengths are replaced by `f64::EPSILON`.
    pub(super) fn branch_lengths(&self, i: usize, j: usize) -> (f64, f64) {
        let sums = self.distances.row_sum();
        let n = self.distances.ncols() as f64;
        let blen_i = self.distances[(i, j)] / 2.0 + (sums[i] - sums[j]) / (2.0 * (n - 2.0));
        let blen_j = self.distances[(i, j)] - blen_i;
        (positive(blen_i), positive(blen_j))
    }

    /// Lengths of the branches joining the last three clusters to the centre node.
    pub(super) fn final_branch_lengths(&self) -> [f64; 3] {
        let d = &self.distances;
        [
            positive((d[(0, 1)] + d[(0, 2)] - d[(1, 2)]) / 2.0),
            positive((d[(0, 1)] + d[(1, 2)] - d[(0, 2)]) / 2.0),
            positive((d[(0, 2)] + d[(1, 2)] - d[(0, 1)]) / 2.0),
        ]
    }

    pub(super) fn compute_nj_q(&self) -> Mat {
        let n = self.distances.ncols();
        let s = self.distances.row_sum();
        Mat::from_fn(n, n, |r, c| -> f64 {
            if r == c {
                0.0
            } else {
                (n - 2) as f64 * self.distances[(r, c)] - s[r] - s[c]
            }
        })
    }
}

fn positive(blen: f64) -> f64 {
    if blen <= 0.0 {
        f64::EPSILON
    } else {
        blen
    }
}
