use std::cmp::Reverse;
use std::time::Instant;

use anyhow::bail;
use hashbrown::{HashMap, HashSet};
use inc_stats::SummStats;
use log::{debug, info};

use crate::errors::StructuralError;
use crate::likelihood::TreeSearchCost;
use crate::optimisers::{BranchOptimiser, NniScope, SearchConfig};
use crate::tree::{Branch, NodeIdx, Tree};
use crate::{f64_h, Result};

/// Nearest neighbour interchange around `branch = node1 -- node2`, trading `swap1` (a neighbour
/// of `node1`) with `swap2` (a neighbour of `node2`). `logl` and `delta` hold the score of the
/// move once it has been evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NniMove {
    pub branch: Branch,
    pub node1: NodeIdx,
    pub node2: NodeIdx,
    pub swap1: NodeIdx,
    pub swap2: NodeIdx,
    pub(crate) adjacent: [Branch; 4],
    pub logl: f64,
    pub delta: f64,
}

impl NniMove {
    /// The two alternative topologies around an internal branch. Branches with a leaf end have
    /// none.
    ///
    /// # Errors
    /// Fails with a `StructuralError` if the branch is not in the tree or one of its ends has
    /// more than three neighbours.
    pub fn candidates(tree: &Tree, branch: &Branch) -> Result<Vec<NniMove>> {
        let (node1, node2) = branch.ends();
        if !tree.is_adjacent(node1, node2) {
            bail!(StructuralError::new(
                "NNI candidates",
                format!("{branch} is not part of the tree")
            ));
        }
        let others = |node: NodeIdx, exclude: NodeIdx| -> Vec<NodeIdx> {
            tree.node(node)
                .neighbours()
                .iter()
                .map(|n| n.node)
                .filter(|&n| n != exclude)
                .collect()
        };
        let (others1, others2) = (others(node1, node2), others(node2, node1));
        if others1.len() > 2 || others2.len() > 2 {
            bail!(StructuralError::new(
                "NNI candidates",
                format!("{branch} has a multifurcating end")
            ));
        }
        if others1.len() < 2 || others2.len() < 2 {
            return Ok(Vec::new());
        }
        let (swap1, stay1) = (others1[0], others1[1]);
        Ok([(others2[0], others2[1]), (others2[1], others2[0])]
            .into_iter()
            .map(|(swap2, stay2)| NniMove {
                branch: *branch,
                node1,
                node2,
                swap1,
                swap2,
                adjacent: [
                    Branch::new(node1, swap1),
                    Branch::new(node1, stay1),
                    Branch::new(node2, swap2),
                    Branch::new(node2, stay2),
                ],
                logl: f64::NEG_INFINITY,
                delta: 0.0,
            })
            .collect())
    }

    /// The central branch and the four branches around it, before the move.
    pub fn branches(&self) -> [Branch; 5] {
        let [a, b, c, d] = self.adjacent;
        [self.branch, a, b, c, d]
    }

    /// Branches to re-optimise once the move is applied to `tree`.
    pub fn scope_branches(&self, tree: &Tree, scope: NniScope) -> Vec<Branch> {
        let mut branches = vec![Branch::new(self.node1, self.node2)];
        if scope == NniScope::FiveBranches {
            for node in [self.node1, self.node2] {
                for n in tree.node(node).neighbours() {
                    let branch = Branch::new(node, n.node);
                    if !branches.contains(&branch) {
                        branches.push(branch);
                    }
                }
            }
        }
        branches
    }

    /// Move that undoes this one once it has been applied.
    pub(crate) fn inverse(&self) -> NniMove {
        let [_, stay1, _, stay2] = self.adjacent;
        NniMove {
            swap1: self.swap2,
            swap2: self.swap1,
            adjacent: [
                Branch::new(self.node1, self.swap2),
                stay1,
                Branch::new(self.node2, self.swap1),
                stay2,
            ],
            logl: f64::NEG_INFINITY,
            delta: 0.0,
            ..*self
        }
    }
}

/// Why a search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    LocalOptimum,
    MaxRounds,
    TimeLimit,
}

#[derive(Debug, Clone)]
pub struct NniSearchResult {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub rounds: usize,
    pub moves_applied: usize,
    /// Moves applied in every round.
    pub applied: Vec<Vec<NniMove>>,
    pub stop_reason: StopReason,
}

/// Moves taken greedily in the given order, skipping any that shares a branch with one
/// already taken.
pub(crate) fn select_conflict_free(moves: &[NniMove]) -> Vec<NniMove> {
    let mut consumed: HashSet<Branch> = HashSet::new();
    let mut selected = Vec::new();
    for mv in moves {
        let branches = mv.branches();
        if branches.iter().any(|b| consumed.contains(b)) {
            continue;
        }
        consumed.extend(branches);
        selected.push(*mv);
    }
    selected
}

/// Hill climbing with batches of non-conflicting NNIs until no NNI improves the
/// log-likelihood by more than the cutoff, or a round or time budget runs out. With
/// `optimise_branches` set, every round starts from branch lengths converged to the cutoff.
pub struct NniOptimiser<'a, C: TreeSearchCost> {
    cost: &'a mut C,
    config: SearchConfig,
    gains: Vec<f64>,
}

impl<'a, C: TreeSearchCost> NniOptimiser<'a, C> {
    pub fn new(cost: &'a mut C) -> Self {
        Self {
            cost,
            config: SearchConfig::default(),
            gains: Vec::new(),
        }
    }

    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cutoff(mut self, cutoff: f64) -> Self {
        self.config.cutoff = cutoff;
        self
    }

    pub fn approximate(mut self, approximate: bool) -> Self {
        self.config.approximate = approximate;
        self
    }

    /// # Errors
    /// Fails with a `StructuralError` if the tree is not bifurcating.
    pub fn run(mut self) -> Result<NniSearchResult> {
        self.cost.tree().check_bifurcating("NNI search")?;
        info!("Optimising tree topology with NNIs");
        let start = Instant::now();
        let initial_cost = self.cost.cost();
        info!("Initial cost: {initial_cost}");

        let mut curr_cost = initial_cost;
        let mut applied: Vec<Vec<NniMove>> = Vec::new();
        let mut rounds = 0;
        let stop_reason = loop {
            if rounds >= self.config.max_rounds {
                break StopReason::MaxRounds;
            }
            if self.config.max_time.is_some_and(|limit| start.elapsed() >= limit) {
                break StopReason::TimeLimit;
            }
            rounds += 1;
            if self.config.optimise_branches {
                BranchOptimiser::new(&mut *self.cost)
                    .tolerance(self.config.cutoff)
                    .run()?;
                curr_cost = self.cost.cost();
            }

            let candidates = if self.config.approximate {
                self.approximate_candidates(curr_cost)?
            } else {
                self.exact_candidates(curr_cost)?
            };
            let mut improving: Vec<NniMove> = candidates
                .into_iter()
                .filter(|mv| mv.delta > self.config.cutoff)
                .collect();
            debug!("Round {rounds}: {} improving NNI(s)", improving.len());
            if improving.is_empty() {
                break StopReason::LocalOptimum;
            }
            improving.sort_by_key(|mv| Reverse(f64_h::from(mv.delta)));

            let batch = self.apply_batch(select_conflict_free(&improving))?;
            curr_cost = self.cost.cost();
            info!(
                "Round {rounds}: applied {} NNI(s), cost {curr_cost}",
                batch.len()
            );
            applied.push(batch);
        };

        let moves_applied = applied.iter().map(Vec::len).sum();
        info!("Done optimising tree topology ({stop_reason:?})");
        info!("Final cost: {curr_cost}, {moves_applied} NNI(s) in {rounds} round(s)");
        Ok(NniSearchResult {
            initial_cost,
            final_cost: curr_cost,
            rounds,
            moves_applied,
            applied,
            stop_reason,
        })
    }

    /// Best move of every internal branch, fully evaluated.
    fn exact_candidates(&self, base_cost: f64) -> Result<Vec<NniMove>> {
        let branches = self.cost.tree().internal_branches();
        let scope = self.config.scope;
        let cost = &*self.cost;
        cfg_if::cfg_if! {
            if #[cfg(feature = "par-nni")] {
                use rayon::prelude::*;
                let best: Vec<Option<NniMove>> = branches
                    .par_iter()
                    .map(|branch| cost.best_nni_for_branch(branch, scope, base_cost))
                    .collect::<Result<_>>()?;
            } else {
                let best: Vec<Option<NniMove>> = branches
                    .iter()
                    .map(|branch| cost.best_nni_for_branch(branch, scope, base_cost))
                    .collect::<Result<_>>()?;
            }
        }
        Ok(best.into_iter().flatten().collect())
    }

    /// All moves ranked by their score without branch optimisation; only the best ones are
    /// evaluated fully.
    fn approximate_candidates(&mut self, base_cost: f64) -> Result<Vec<NniMove>> {
        let mut ranked = Vec::new();
        for branch in self.cost.tree().internal_branches() {
            for mut mv in NniMove::candidates(self.cost.tree(), &branch)? {
                mv.logl = self.cost.approximate_nni(&mv)?;
                mv.delta = mv.logl - base_cost;
                ranked.push(mv);
            }
        }
        ranked.sort_by_key(|mv| Reverse(f64_h::from(mv.delta)));

        let mut baselines: HashMap<Branch, f64> = HashMap::new();
        let mut scored = Vec::new();
        for approx in ranked.into_iter().take(self.config.approximate_top) {
            if let Some(max_gain) = self.expected_gain() {
                if approx.delta + max_gain <= self.config.cutoff {
                    debug!(
                        "Skipping NNI on {} with approximate gain {}",
                        approx.branch, approx.delta
                    );
                    continue;
                }
            }
            let baseline = match baselines.get(&approx.branch) {
                Some(&baseline) => baseline,
                None => {
                    let baseline = self
                        .cost
                        .evaluate_unchanged(&approx, self.config.scope)?
                        .max(base_cost);
                    baselines.insert(approx.branch, baseline);
                    baseline
                }
            };
            let mut mv = approx;
            mv.logl = self.cost.evaluate_nni(&approx, self.config.scope)?;
            mv.delta = mv.logl - baseline;
            self.gains.push(mv.delta - approx.delta);
            scored.push(mv);
        }
        Ok(scored)
    }

    /// Upper estimate of what branch optimisation adds to an approximate score.
    fn expected_gain(&self) -> Option<f64> {
        let estimation = self.config.cutoff_estimation?;
        if self.gains.len() < estimation.min_samples {
            return None;
        }
        let stats: SummStats<f64> = self.gains.iter().collect();
        Some(stats.mean()? + estimation.z * stats.standard_deviation().unwrap_or(0.0))
    }

    /// Applies a batch sorted best first. If the whole batch scores below its best move alone,
    /// only that move is kept.
    fn apply_batch(&mut self, batch: Vec<NniMove>) -> Result<Vec<NniMove>> {
        let snapshot = (batch.len() > 1).then(|| self.cost.clone());
        for mv in &batch {
            self.apply_move(mv)?;
        }
        let Some(snapshot) = snapshot else {
            return Ok(batch);
        };
        let batch_cost = self.cost.cost();
        let best = batch[0];
        if batch_cost < best.logl {
            debug!(
                "Batch of {} NNIs scored {batch_cost}, below {} of the best move alone",
                batch.len(),
                best.logl
            );
            *self.cost = snapshot;
            self.apply_move(&best)?;
            return Ok(vec![best]);
        }
        Ok(batch)
    }

    fn apply_move(&mut self, mv: &NniMove) -> Result<()> {
        self.cost.do_nni(mv)?;
        for branch in mv.scope_branches(self.cost.tree(), self.config.scope) {
            self.cost.optimise_branch(&branch)?;
        }
        Ok(())
    }
}

/// Runs an NNI search with default settings otherwise, returning the final log-likelihood and
/// the number of applied moves.
pub fn do_nni_search<C: TreeSearchCost>(
    cost: &mut C,
    cutoff: f64,
    approximate: bool,
) -> Result<(f64, usize)> {
    let res = NniOptimiser::new(cost)
        .cutoff(cutoff)
        .approximate(approximate)
        .run()?;
    Ok((res.final_cost, res.moves_applied))
}
