use std::fmt::{self, Display};

use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::alignment::SuperAlignment;
use crate::errors::StructuralError;
use crate::likelihood::{check_memory, F81Likelihood, LikelihoodOracle, TreeSearchCost};
use crate::optimisers::{
    brent_maximise, optimise_single_branch, BranchSettings, NniMove, SingleValOptResult,
};
use crate::tree::{canonical_split, Branch, NodeIdx, Tree};
use crate::Result;

const MIN_RATE: f64 = 1e-3;
const MAX_RATE: f64 = 100.0;

/// How partition branch lengths relate to the global ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchLinkage {
    /// Every partition optimises its own branch lengths, the global length of a branch is
    /// the site weighted average over the partitions that map it.
    #[default]
    Unlinked,
    /// Only global lengths are free. A partition branch is `rate * (sum of the global
    /// lengths mapped to it)`.
    Proportional,
}

pub struct PartitionedTreeBuilder<'a> {
    alignment: &'a SuperAlignment,
    tree: Tree,
    linkage: BranchLinkage,
    settings: BranchSettings,
    empirical_freqs: bool,
    memory_limit: Option<usize>,
}

impl<'a> PartitionedTreeBuilder<'a> {
    pub fn new(alignment: &'a SuperAlignment, tree: Tree) -> Self {
        Self {
            alignment,
            tree,
            linkage: BranchLinkage::default(),
            settings: BranchSettings::default(),
            empirical_freqs: false,
            memory_limit: None,
        }
    }

    pub fn linkage(mut self, linkage: BranchLinkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn settings(mut self, settings: BranchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use F81 with state frequencies counted per partition instead of Jukes-Cantor.
    pub fn empirical_freqs(mut self, empirical: bool) -> Self {
        self.empirical_freqs = empirical;
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// # Errors
    /// Fails with a `DataError` if the tree leaves do not match the taxa of the alignment, with
    /// a `StructuralError` if the tree is not bifurcating and with a `ConfigurationError` if the
    /// partial likelihoods of all partitions do not fit in memory.
    pub fn build(self) -> Result<PartitionedTree> {
        let alignment = self.alignment;
        let mut tree = self.tree;
        tree.assign_taxa(alignment.names())?;
        tree.check_bifurcating("partitioned tree")?;

        let num_taxa = alignment.num_taxa();
        let mut subtrees = Vec::with_capacity(alignment.num_partitions());
        let mut oracles: Vec<Box<dyn LikelihoodOracle>> = Vec::new();
        let mut presence = Vec::new();
        let mut local_to_global = Vec::new();
        for (p, partition) in alignment.partitions().iter().enumerate() {
            let keep: Vec<Option<usize>> =
                (0..num_taxa).map(|t| alignment.local_index(t, p)).collect();
            let mut globals = vec![0; partition.num_taxa()];
            for (global, local) in keep.iter().enumerate() {
                if let Some(local) = local {
                    globals[*local] = global;
                }
            }
            if partition.num_taxa() < 2 {
                warn!("Partition {p} has {} taxa", partition.num_taxa());
            }
            subtrees.push(tree.restrict(&keep));
            oracles.push(if self.empirical_freqs {
                Box::new(F81Likelihood::empirical(partition.clone()))
            } else {
                Box::new(F81Likelihood::jc(partition.clone()))
            });
            presence.push(alignment.presence(p));
            local_to_global.push(globals);
        }

        let required: usize = oracles
            .iter()
            .zip(&subtrees)
            .map(|(oracle, subtree)| oracle.memory_required(subtree))
            .sum();
        check_memory(required, self.memory_limit)?;
        for (oracle, subtree) in oracles.iter().zip(subtrees.iter_mut()) {
            oracle.allocate(subtree);
        }

        let num_partitions = subtrees.len();
        let mut partitioned = PartitionedTree {
            tree,
            num_taxa,
            subtrees,
            oracles,
            links: vec![HashMap::new(); num_partitions],
            members: vec![HashMap::new(); num_partitions],
            presence,
            local_to_global,
            site_counts: alignment.partitions().iter().map(|p| p.num_sites()).collect(),
            rates: vec![1.0; num_partitions],
            linkage: self.linkage,
            settings: self.settings,
            local_swaps: 0,
            local_unchanged: 0,
        };
        partitioned.map_trees()?;
        if partitioned.linkage == BranchLinkage::Proportional {
            partitioned.push_lengths();
        }
        info!(
            "Set up partitioned tree with {} partitions over {num_taxa} taxa",
            num_partitions
        );
        Ok(partitioned)
    }
}

/// One global topology with one induced subtree per partition. Every global branch is linked to
/// the partition branch with the same bipartition of the partition taxa, or to nothing where
/// one side holds none of them.
#[derive(Debug, Clone)]
pub struct PartitionedTree {
    tree: Tree,
    num_taxa: usize,
    subtrees: Vec<Tree>,
    oracles: Vec<Box<dyn LikelihoodOracle>>,
    links: Vec<HashMap<Branch, Branch>>,
    members: Vec<HashMap<Branch, Vec<Branch>>>,
    presence: Vec<FixedBitSet>,
    local_to_global: Vec<Vec<usize>>,
    site_counts: Vec<usize>,
    rates: Vec<f64>,
    linkage: BranchLinkage,
    settings: BranchSettings,
    local_swaps: usize,
    local_unchanged: usize,
}

impl Display for PartitionedTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tree)
    }
}

fn shared_end(a: &Branch, b: &Branch) -> Option<NodeIdx> {
    let (a0, a1) = a.ends();
    if b.contains(a0) {
        Some(a0)
    } else if b.contains(a1) {
        Some(a1)
    } else {
        None
    }
}

impl PartitionedTree {
    pub fn num_partitions(&self) -> usize {
        self.subtrees.len()
    }

    pub fn subtree(&self, p: usize) -> &Tree {
        &self.subtrees[p]
    }

    /// Branch of partition `p` that the global `branch` maps to.
    pub fn link(&self, p: usize, branch: &Branch) -> Option<Branch> {
        self.links[p].get(branch).copied()
    }

    /// Global branches mapped to the partition branch `local`.
    pub fn members(&self, p: usize, local: &Branch) -> &[Branch] {
        self.members[p]
            .get(local)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn linkage(&self) -> BranchLinkage {
        self.linkage
    }

    /// Global NNIs that changed a partition topology and ones that left it as it was, summed
    /// over partitions.
    pub fn nni_counters(&self) -> (usize, usize) {
        (self.local_swaps, self.local_unchanged)
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }

    /// Log-likelihood of every partition.
    pub fn partition_costs(&mut self) -> Vec<f64> {
        self.oracles
            .iter()
            .zip(self.subtrees.iter_mut())
            .map(|(oracle, subtree)| oracle.logl(subtree))
            .collect()
    }

    /// Rebuilds the links between the global branches and the partition branches from the
    /// bipartitions of both trees.
    ///
    /// # Errors
    /// Fails with a `StructuralError` if an informative global branch has no partition branch
    /// with the same bipartition, or a partition branch is not covered by a global branch.
    pub fn map_trees(&mut self) -> Result<()> {
        let num_taxa = self.num_taxa;
        let global_splits = self.tree.splits(num_taxa);
        for p in 0..self.num_partitions() {
            let present = &self.presence[p];
            let count = present.count_ones(..);
            let globals = &self.local_to_global[p];
            let subtree = &self.subtrees[p];
            let local_splits: HashMap<FixedBitSet, Branch> = subtree
                .splits(globals.len())
                .into_iter()
                .map(|(branch, split)| {
                    let mut global = FixedBitSet::with_capacity(num_taxa);
                    global.extend(split.ones().map(|l| globals[l]));
                    (canonical_split(&global, present), branch)
                })
                .collect();

            let mut links = HashMap::new();
            let mut members: HashMap<Branch, Vec<Branch>> = HashMap::new();
            for (branch, split) in &global_splits {
                let mut side = split.clone();
                side.intersect_with(present);
                let k = side.count_ones(..);
                if k == 0 || k == count {
                    continue;
                }
                let Some(&local) = local_splits.get(&canonical_split(&side, present)) else {
                    bail!(StructuralError::new(
                        "map_trees",
                        format!("{branch} has no counterpart in the tree of partition {p}")
                    ));
                };
                links.insert(*branch, local);
                members.entry(local).or_default().push(*branch);
            }
            if members.len() != subtree.branches().len() {
                bail!(StructuralError::new(
                    "map_trees",
                    format!(
                        "{} of {} branches of partition {p} are mapped",
                        members.len(),
                        subtree.branches().len()
                    )
                ));
            }
            debug!(
                "Partition {p}: {} of {} global branches mapped",
                links.len(),
                global_splits.len()
            );
            self.links[p] = links;
            self.members[p] = members;
        }
        Ok(())
    }

    /// Sets every partition branch to the rate scaled sum of its global branches.
    fn push_lengths(&mut self) {
        for p in 0..self.num_partitions() {
            self.push_partition_lengths(p);
        }
    }

    fn push_partition_lengths(&mut self, p: usize) {
        let lengths: Vec<(Branch, f64)> = self.members[p]
            .iter()
            .map(|(local, globals)| {
                let sum: f64 = globals.iter().map(|g| self.tree.blen(g)).sum();
                (*local, self.rates[p] * sum)
            })
            .collect();
        for (local, blen) in lengths {
            if self.subtrees[p].blen(&local) != blen {
                self.subtrees[p].set_blen(&local, blen);
            }
        }
    }

    /// Site weighted average over the partitions mapping `branch` of the partition length,
    /// divided by the partition rate and split among the global branches it covers in
    /// proportion to their current lengths.
    fn averaged_length(&self, branch: &Branch) -> Option<f64> {
        let (mut weighted, mut total_weight) = (0.0, 0.0);
        for p in 0..self.num_partitions() {
            let Some(local) = self.links[p].get(branch) else {
                continue;
            };
            let globals = self.members(p, local);
            let sum: f64 = globals.iter().map(|g| self.tree.blen(g)).sum();
            let share = if sum > 0.0 {
                self.tree.blen(branch) / sum
            } else {
                1.0 / globals.len() as f64
            };
            let weight = self.site_counts[p] as f64;
            weighted += weight * self.subtrees[p].blen(local) / self.rates[p] * share;
            total_weight += weight;
        }
        (total_weight > 0.0).then(|| weighted / total_weight)
    }

    fn optimise_unlinked(&mut self, branch: &Branch) -> Result<bool> {
        let mut retained = true;
        for p in 0..self.num_partitions() {
            let Some(local) = self.links[p].get(branch).copied() else {
                continue;
            };
            let oracle = &self.oracles[p];
            let subtree = &mut self.subtrees[p];
            let start = subtree.blen(&local);
            let res = optimise_single_branch(&self.settings, start, |blen| {
                oracle.logl_derivatives(subtree, &local, blen)
            })?;
            if res.value != start {
                self.subtrees[p].set_blen(&local, res.value);
            }
            retained &= res.retained;
        }
        if let Some(blen) = self.averaged_length(branch) {
            self.tree.set_blen(branch, blen);
        }
        Ok(retained)
    }

    fn optimise_proportional(&mut self, branch: &Branch) -> Result<bool> {
        let mut involved = Vec::new();
        let mut rest = 0.0;
        for p in 0..self.num_partitions() {
            match self.links[p].get(branch) {
                Some(local) => {
                    let others: f64 = self
                        .members(p, local)
                        .iter()
                        .filter(|g| *g != branch)
                        .map(|g| self.tree.blen(g))
                        .sum();
                    let rate = self.rates[p];
                    involved.push((p, *local, rate, rate * others));
                }
                None => rest += self.oracles[p].logl(&mut self.subtrees[p]),
            }
        }
        if involved.is_empty() {
            return Ok(true);
        }
        let start = self.tree.blen(branch);
        let oracles = &self.oracles;
        let subtrees = &mut self.subtrees;
        let res = optimise_single_branch(&self.settings, start, |blen| {
            let (mut f, mut df, mut ddf) = (rest, 0.0, 0.0);
            for &(p, local, rate, offset) in &involved {
                let (fp, dfp, ddfp) =
                    oracles[p].logl_derivatives(&mut subtrees[p], &local, rate * blen + offset);
                f += fp;
                df += rate * dfp;
                ddf += rate * rate * ddfp;
            }
            (f, df, ddf)
        })?;
        self.tree.set_blen(branch, res.value);
        for (p, local, rate, offset) in involved {
            let blen = rate * res.value + offset;
            if self.subtrees[p].blen(&local) != blen {
                self.subtrees[p].set_blen(&local, blen);
            }
        }
        Ok(res.retained)
    }

    /// Optimises the rate of every partition with Brent's method, then rescales rates to a site
    /// weighted mean of one and the global lengths by the inverse, which leaves the likelihood
    /// unchanged. Only meaningful with proportional branch lengths; returns the log-likelihood.
    pub fn optimise_partition_rates(&mut self) -> Result<f64> {
        if self.linkage != BranchLinkage::Proportional {
            debug!("Partition rates are only used with proportional branch lengths");
            return Ok(self.cost());
        }
        for p in 0..self.num_partitions() {
            let sums: Vec<(Branch, f64)> = self.members[p]
                .iter()
                .map(|(local, globals)| (*local, globals.iter().map(|g| self.tree.blen(g)).sum()))
                .collect();
            if sums.is_empty() {
                continue;
            }
            let oracle = &self.oracles[p];
            let subtree = &mut self.subtrees[p];
            let mut logl = |rate: f64| {
                for (local, sum) in &sums {
                    subtree.set_blen(local, rate * sum);
                }
                oracle.logl(subtree)
            };
            let before = logl(self.rates[p]);
            let (rate, after) = brent_maximise(
                MIN_RATE,
                MAX_RATE,
                self.rates[p],
                self.settings.max_iterations,
                &mut logl,
            )?;
            if after > before {
                self.rates[p] = rate;
            }
            debug!("Partition {p}: rate {}", self.rates[p]);
            self.push_partition_lengths(p);
        }

        let total_sites: f64 = self.site_counts.iter().sum::<usize>() as f64;
        let mean = self
            .rates
            .iter()
            .zip(&self.site_counts)
            .map(|(r, &w)| r * w as f64)
            .sum::<f64>()
            / total_sites;
        if mean > 0.0 && mean.is_finite() {
            for rate in self.rates.iter_mut() {
                *rate /= mean;
            }
            for branch in self.tree.branches() {
                let blen = self.tree.blen(&branch) * mean;
                self.tree.set_blen(&branch, blen);
            }
            self.push_lengths();
        }
        let cost = self.cost();
        info!("Optimised partition rates {:?}, logl {cost}", self.rates);
        Ok(cost)
    }

    /// Local move in partition `p` matching the global `mv`, when all five branches of the
    /// global move map to the partition.
    fn local_move(&self, p: usize, mv: &NniMove) -> Result<Option<NniMove>> {
        let mut mapped = [mv.branch; 5];
        for (slot, branch) in mapped.iter_mut().zip(mv.branches()) {
            match self.links[p].get(&branch) {
                Some(local) => *slot = *local,
                None => return Ok(None),
            }
        }
        let [central, swap1_branch, stay1, swap2_branch, stay2] = mapped;
        let ends = shared_end(&central, &swap1_branch).and_then(|node1| {
            let node2 = central.other(node1)?;
            Some((
                node1,
                node2,
                swap1_branch.other(node1)?,
                swap2_branch.other(node2)?,
            ))
        });
        let Some((node1, node2, swap1, swap2)) = ends else {
            bail!(StructuralError::new(
                "NNI",
                format!("branches around {} do not meet in partition {p}", mv.branch)
            ));
        };
        Ok(Some(NniMove {
            branch: central,
            node1,
            node2,
            swap1,
            swap2,
            adjacent: [swap1_branch, stay1, swap2_branch, stay2],
            ..*mv
        }))
    }
}

impl TreeSearchCost for PartitionedTree {
    fn cost(&mut self) -> f64 {
        self.partition_costs().iter().sum()
    }

    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn optimise_branch(&mut self, branch: &Branch) -> Result<SingleValOptResult> {
        self.tree.check_branch(branch, "branch optimisation")?;
        let initial_cost = self.cost();
        let retained = match self.linkage {
            BranchLinkage::Unlinked => self.optimise_unlinked(branch)?,
            BranchLinkage::Proportional => self.optimise_proportional(branch)?,
        };
        Ok(SingleValOptResult {
            value: self.tree.blen(branch),
            initial_cost,
            final_cost: self.cost(),
            iterations: 1,
            retained,
        })
    }

    /// Applies the swap to the global tree and the matching swaps to the partition trees, then
    /// remaps all branches.
    fn do_nni(&mut self, mv: &NniMove) -> Result<()> {
        let local_moves = (0..self.num_partitions())
            .map(|p| self.local_move(p, mv))
            .collect::<Result<Vec<_>>>()?;
        self.tree.nni(mv.node1, mv.node2, mv.swap1, mv.swap2)?;
        for (subtree, local) in self.subtrees.iter_mut().zip(local_moves) {
            match local {
                Some(local) => {
                    subtree.nni(local.node1, local.node2, local.swap1, local.swap2)?;
                    self.local_swaps += 1;
                }
                None => self.local_unchanged += 1,
            }
        }
        self.map_trees()?;
        if self.linkage == BranchLinkage::Proportional {
            self.push_lengths();
        }
        Ok(())
    }

    fn compute_branch_lengths(&mut self) {
        match self.linkage {
            BranchLinkage::Unlinked => {
                let lengths: Vec<(Branch, f64)> = self
                    .tree
                    .branches()
                    .into_iter()
                    .filter_map(|b| self.averaged_length(&b).map(|blen| (b, blen)))
                    .collect();
                for (branch, blen) in lengths {
                    self.tree.set_blen(&branch, blen);
                }
            }
            BranchLinkage::Proportional => self.push_lengths(),
        }
    }
}
