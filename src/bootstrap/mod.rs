use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::alignment::{BootstrapMode, SuperAlignment};
use crate::io::DataError;
use crate::optimisers::{BranchOptimiser, BranchSettings, NniOptimiser, SearchConfig};
use crate::supertree::{BranchLinkage, PartitionedTreeBuilder};
use crate::tree::{canonical_split, Branch, NJBuilder, Tree, TreeBuilder};
use crate::Result;

/// Bootstrap replicates of a partitioned alignment. Every replicate resamples the alignment,
/// builds a neighbour joining tree, optimises its branch lengths and runs an NNI search.
/// Replicate `i` draws from a generator seeded with `seed + i`, so results do not depend on
/// the order in which replicates run.
pub struct BootstrapAnalysis<'a> {
    alignment: &'a SuperAlignment,
    replicates: usize,
    mode: BootstrapMode,
    seed: u64,
    config: SearchConfig,
    linkage: BranchLinkage,
    settings: BranchSettings,
}

impl<'a> BootstrapAnalysis<'a> {
    pub fn new(alignment: &'a SuperAlignment, replicates: usize) -> Self {
        Self {
            alignment,
            replicates,
            mode: BootstrapMode::default(),
            seed: 0,
            config: SearchConfig::default(),
            linkage: BranchLinkage::default(),
            settings: BranchSettings::default(),
        }
    }

    pub fn mode(mut self, mode: BootstrapMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn linkage(mut self, linkage: BranchLinkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn settings(mut self, settings: BranchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn run(&self) -> Result<Vec<Tree>> {
        info!(
            "Running {} {:?} bootstrap replicates",
            self.replicates, self.mode
        );
        cfg_if::cfg_if! {
            if #[cfg(feature = "par-bootstrap")] {
                use rayon::prelude::*;
                (0..self.replicates)
                    .into_par_iter()
                    .map(|i| self.replicate(i))
                    .collect()
            } else {
                (0..self.replicates).map(|i| self.replicate(i)).collect()
            }
        }
    }

    fn replicate(&self, i: usize) -> Result<Tree> {
        let seed = self.seed.wrapping_add(i as u64);
        let mut rng = StdRng::seed_from_u64(seed);
        let (sample, _) = self.alignment.bootstrap(self.mode, &mut rng);
        let start = NJBuilder::new(seed).build_tree(&sample)?;
        let mut cost = PartitionedTreeBuilder::new(&sample, start)
            .linkage(self.linkage)
            .settings(self.settings)
            .build()?;
        BranchOptimiser::new(&mut cost).run()?;
        let res = NniOptimiser::new(&mut cost)
            .config(self.config.clone())
            .run()?;
        info!(
            "Replicate {i}: logl {} after {} NNI(s)",
            res.final_cost, res.moves_applied
        );
        Ok(cost.into_tree())
    }
}

/// Splits of `tree` over the taxa of `index`, with the set of taxa present in the tree.
fn named_splits(
    tree: &Tree,
    index: &HashMap<&str, usize>,
) -> Result<(Vec<(Branch, FixedBitSet)>, FixedBitSet)> {
    let mut tree = tree.clone();
    let mut present = FixedBitSet::with_capacity(index.len());
    let leaves: Vec<_> = tree.leaves().iter().map(|n| n.idx).collect();
    for leaf in leaves {
        let id = &tree.node(leaf).id;
        let Some(&taxon) = index.get(id.as_str()) else {
            bail!(DataError {
                message: format!("Leaf {id} is not in the reference tree")
            });
        };
        present.insert(taxon);
        tree.node_mut(leaf).taxon = Some(taxon);
    }
    Ok((tree.splits(index.len()), present))
}

/// Percentage of the replicates that contain the bipartition of every internal branch of
/// `reference`. Taxa are matched by name. A replicate only counts for a branch if both sides
/// of the bipartition keep at least two of its taxa, smaller sides are present in any tree.
///
/// # Errors
/// Fails with a `DataError` if a replicate has a leaf that is not in the reference tree.
pub fn split_support(reference: &Tree, replicates: &[Tree]) -> Result<Vec<(Branch, f64)>> {
    let names = reference.leaf_ids();
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let (reference_splits, _) = named_splits(reference, &index)?;
    let replicate_splits = replicates
        .iter()
        .map(|tree| {
            let (splits, present) = named_splits(tree, &index)?;
            let canonical = splits
                .iter()
                .map(|(_, split)| canonical_split(split, &present))
                .collect::<Vec<_>>();
            Ok((canonical, present))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(reference_splits
        .into_iter()
        .filter(|(branch, _)| branch.is_internal())
        .map(|(branch, split)| {
            let (mut found, mut informative) = (0, 0);
            for (splits, present) in &replicate_splits {
                let mut side = split.clone();
                side.intersect_with(present);
                let k = side.count_ones(..);
                if k < 2 || present.count_ones(..) - k < 2 {
                    continue;
                }
                informative += 1;
                if splits.contains(&canonical_split(&side, present)) {
                    found += 1;
                }
            }
            let support = if informative > 0 {
                100.0 * found as f64 / informative as f64
            } else {
                0.0
            };
            (branch, support)
        })
        .collect())
}

/// Labels the node below every supported branch, as seen from the root, with its support.
pub fn assign_support(tree: &mut Tree, support: &[(Branch, f64)]) {
    for (branch, value) in support {
        let (a, b) = branch.ends();
        let below = if tree.parent(a) == Some(b) { a } else { b };
        tree.node_mut(below).id = format!("{value:.0}");
    }
}
