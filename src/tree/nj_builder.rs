use anyhow::bail;
use log::info;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alignment::SuperAlignment;
use crate::tree::nj_matrices::{Mat, NJMat};
use crate::tree::{NodeIdx, Tree};
use crate::Result;

/// Builds a starting tree for the search.
pub trait TreeBuilder {
    fn build_tree(&mut self, alignment: &SuperAlignment) -> Result<Tree>;
}

/// Neighbour joining on the corrected distances of a partitioned alignment.
/// Ties in the Q matrix are broken by a seeded random number generator.
pub struct NJBuilder {
    rng: StdRng,
}

impl TreeBuilder for NJBuilder {
    fn build_tree(&mut self, alignment: &SuperAlignment) -> Result<Tree> {
        info!(
            "Building neighbour joining tree for {} taxa.",
            alignment.num_taxa()
        );
        let distances = alignment.distance_matrix()?;
        let mut tree = self.build_from_distances(alignment.names(), distances)?;
        tree.assign_taxa(alignment.names())?;
        Ok(tree)
    }
}

impl NJBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn argmin_wo_diagonal(&mut self, q: &Mat) -> (usize, usize) {
        debug_assert!(
            q.ncols() > 1 && q.nrows() > 1,
            "The input matrix should have more than 1 element."
        );
        let mut arg_min = vec![];
        let mut val_min = f64::MAX;
        for i in 0..q.nrows() {
            for j in 0..i {
                let val = q[(i, j)];
                if val < val_min {
                    val_min = val;
                    arg_min = vec![(i, j)];
                } else if val == val_min {
                    arg_min.push((i, j));
                }
            }
        }
        arg_min[self.rng.gen_range(0..arg_min.len())]
    }

    /// Joins the taxa of a symmetric distance matrix into an unrooted tree, the last three
    /// clusters meet at the root node.
    pub fn build_from_distances(&mut self, names: &[String], distances: DMatrix<f64>) -> Result<Tree> {
        let n = names.len();
        if distances.nrows() != n || distances.ncols() != n {
            bail!(
                "Distance matrix is {}x{}, expected {n}x{n}",
                distances.nrows(),
                distances.ncols()
            );
        }
        let mut tree = Tree::new();
        let leaves: Vec<NodeIdx> = names.iter().map(|name| tree.add_leaf(name)).collect();
        match n {
            0 => bail!("Cannot build a tree without taxa"),
            1 => {}
            2 => tree.connect(leaves[0], leaves[1], distances[(0, 1)].max(f64::EPSILON)),
            _ => {
                let mut nj_data = NJMat {
                    idx: leaves,
                    distances,
                };
                while nj_data.idx.len() > 3 {
                    let q = nj_data.compute_nj_q();
                    let (i, j) = self.argmin_wo_diagonal(&q);
                    let (blen_i, blen_j) = nj_data.branch_lengths(i, j);
                    let new = tree.add_internal("");
                    tree.connect(new, nj_data.idx[i], blen_i);
                    tree.connect(new, nj_data.idx[j], blen_j);
                    nj_data = nj_data
                        .add_merge_node(new)
                        .recompute_new_node_distances(i, j)
                        .remove_merged_nodes(i, j);
                }
                let centre = tree.add_internal("");
                for (&cluster, blen) in nj_data.idx.iter().zip(nj_data.final_branch_lengths()) {
                    tree.connect(centre, cluster, blen);
                }
                tree.root = centre;
            }
        }
        tree.complete();
        Ok(tree)
    }
}
