use std::fmt::{Debug, Display};
use std::fs;

use anyhow::bail;
use dyn_clone::DynClone;
use fixedbitset::FixedBitSet;
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::alignment::Alignment;
use crate::errors::ConfigurationError;
use crate::optimisers::{NniMove, NniScope, SingleValOptResult};
use crate::tree::{Branch, Tree};
use crate::Result;

mod f81;
mod tree_cost;

pub use f81::*;
pub use tree_cost::*;

const MEMINFO_PATH: &str = "/proc/meminfo";
const MEM_AVAILABLE_PREFIX: &str = "MemAvailable:";

pub(crate) fn parse_mem_available(meminfo: &str) -> Option<usize> {
    let line = meminfo
        .lines()
        .find_map(|line| line.strip_prefix(MEM_AVAILABLE_PREFIX))?;
    let mut parts = line.split_whitespace();
    let value = parts.next()?.parse::<usize>().ok()?;
    let unit = match parts.next() {
        Some("kB") => 1024,
        Some("MB") => 1024 * 1024,
        _ => 1,
    };
    Some(value * unit)
}

/// Memory the system reports as available, `None` where it cannot be read.
pub fn available_memory() -> Option<usize> {
    fs::read_to_string(MEMINFO_PATH)
        .ok()
        .and_then(|meminfo| parse_mem_available(&meminfo))
}

/// Bytes needed for the partial likelihoods and scaling factors of `num_slots` directed branches.
pub fn memory_required(num_slots: usize, num_states: usize, num_patterns: usize) -> usize {
    num_slots * (num_states + 1) * num_patterns * std::mem::size_of::<f64>()
}

/// Fails with a `ConfigurationError` if `required` bytes exceed `limit`, or the available
/// system memory when no limit is given.
pub fn check_memory(required: usize, limit: Option<usize>) -> Result<()> {
    let available = limit.or_else(available_memory);
    debug!("Partial likelihoods need {required} bytes, {available:?} bytes available");
    if let Some(available) = available {
        if required > available {
            bail!(ConfigurationError {
                required,
                available
            });
        }
    }
    Ok(())
}

/// Partial likelihood buffers of one tree, one per directed branch (slot). A slot holds, per
/// pattern, the scaled likelihood of the subtree behind the branch and the log of its scaling.
#[derive(Debug, Clone, Default)]
pub struct PartialArena {
    pub(crate) buffers: Vec<DMatrix<f64>>,
    pub(crate) scales: Vec<DVector<f64>>,
    pub(crate) valid: FixedBitSet,
}

impl PartialArena {
    pub(crate) fn allocate(&mut self, num_slots: usize, num_states: usize, num_patterns: usize) {
        self.buffers = vec![DMatrix::zeros(num_states, num_patterns); num_slots];
        self.scales = vec![DVector::zeros(num_patterns); num_slots];
        self.valid = FixedBitSet::with_capacity(num_slots);
    }

    pub(crate) fn fits(&self, num_slots: usize, num_states: usize, num_patterns: usize) -> bool {
        self.buffers.len() >= num_slots
            && self
                .buffers
                .first()
                .map_or(num_slots == 0, |b| b.nrows() == num_states && b.ncols() == num_patterns)
    }

    pub fn is_valid(&self, slot: usize) -> bool {
        self.valid.contains(slot)
    }

    /// Returns whether the slot was valid before.
    pub(crate) fn invalidate(&mut self, slot: usize) -> bool {
        if self.valid.contains(slot) {
            self.valid.set(slot, false);
            true
        } else {
            false
        }
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.valid.clear();
    }

    pub(crate) fn validate(&mut self, slot: usize) {
        if slot >= self.valid.len() {
            self.valid.grow(slot + 1);
        }
        self.valid.insert(slot);
    }
}

/// Computes likelihoods of a tree for one alignment. Partial likelihoods are cached in the
/// tree's own `PartialArena` and only recomputed where the tree invalidated them.
pub trait LikelihoodOracle: Debug + DynClone + Send + Sync {
    fn alignment(&self) -> &Alignment;

    /// Log-likelihood of the whole tree.
    fn logl(&self, tree: &mut Tree) -> f64;

    /// Log-likelihood of the tree with the length of `branch` set to `blen`, with its first
    /// and second derivative in `blen`. The tree itself is not changed.
    fn logl_derivatives(&self, tree: &mut Tree, branch: &Branch, blen: f64) -> (f64, f64, f64);

    fn distance(&self, a: usize, b: usize) -> f64 {
        self.alignment().ml_distance(a, b)
    }

    fn memory_required(&self, tree: &Tree) -> usize {
        let alignment = self.alignment();
        memory_required(
            tree.slot_count(),
            alignment.num_states(),
            alignment.num_patterns(),
        )
    }

    fn allocate(&self, tree: &mut Tree) {
        let alignment = self.alignment();
        let num_slots = tree.slot_count();
        tree.partials.allocate(
            num_slots,
            alignment.num_states(),
            alignment.num_patterns(),
        );
    }
}

dyn_clone::clone_trait_object!(LikelihoodOracle);

/// Tree search capabilities the optimisers work with. Implemented by a plain tree with one
/// alignment and by the partitioned tree.
pub trait TreeSearchCost: Clone + Display + Send + Sync {
    /// Log-likelihood of the current tree.
    fn cost(&mut self) -> f64;

    fn tree(&self) -> &Tree;

    /// Optimises the length of one branch, never lowering the log-likelihood.
    fn optimise_branch(&mut self, branch: &Branch) -> Result<SingleValOptResult>;

    fn do_nni(&mut self, mv: &NniMove) -> Result<()>;

    /// Derives global branch lengths after the branches were optimised.
    fn compute_branch_lengths(&mut self) {}

    /// Log-likelihood after applying `mv` to a copy and optimising the branches in `scope`.
    fn evaluate_nni(&self, mv: &NniMove, scope: NniScope) -> Result<f64> {
        let mut moved = self.clone();
        moved.do_nni(mv)?;
        for branch in mv.scope_branches(moved.tree(), scope) {
            moved.optimise_branch(&branch)?;
        }
        Ok(moved.cost())
    }

    /// Log-likelihood after applying `mv` to a copy without touching branch lengths.
    fn approximate_nni(&self, mv: &NniMove) -> Result<f64> {
        let mut moved = self.clone();
        moved.do_nni(mv)?;
        Ok(moved.cost())
    }

    /// Log-likelihood of a copy of the current topology after optimising the same branches an
    /// evaluation of `mv` optimises. NNIs around the branch of `mv` compete against this score.
    fn evaluate_unchanged(&self, mv: &NniMove, scope: NniScope) -> Result<f64> {
        let mut current = self.clone();
        for branch in mv.scope_branches(current.tree(), scope) {
            current.optimise_branch(&branch)?;
        }
        Ok(current.cost())
    }

    /// Best of the two NNIs around `branch`. Deltas are taken against the current topology with
    /// the same branches optimised, and never against less than `base_cost`.
    fn best_nni_for_branch(
        &self,
        branch: &Branch,
        scope: NniScope,
        base_cost: f64,
    ) -> Result<Option<NniMove>> {
        let candidates = NniMove::candidates(self.tree(), branch)?;
        let Some(first) = candidates.first() else {
            return Ok(None);
        };
        let baseline = self.evaluate_unchanged(first, scope)?.max(base_cost);
        let mut best: Option<NniMove> = None;
        for mut mv in candidates {
            mv.logl = self.evaluate_nni(&mv, scope)?;
            mv.delta = mv.logl - baseline;
            if best.map_or(true, |b| mv.delta > b.delta) {
                best = Some(mv);
            }
        }
        Ok(best)
    }
}
