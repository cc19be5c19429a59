use std::time::Duration;

mod branch_length_optimiser;
mod nni_optimiser;
mod single_branch;

pub use branch_length_optimiser::*;
pub use nni_optimiser::*;
pub use single_branch::*;

/// Bounds and convergence settings for branch length optimisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchSettings {
    pub min_blen: f64,
    pub max_blen: f64,
    /// Newton stops once a step gains less log-likelihood than this.
    pub epsilon: f64,
    pub max_iterations: usize,
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            min_blen: 1e-6,
            max_blen: 100.0,
            epsilon: 1e-6,
            max_iterations: 100,
        }
    }
}

/// Branches re-optimised when an NNI is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NniScope {
    CentralBranch,
    #[default]
    FiveBranches,
}

/// Skips the full evaluation of an approximately scored NNI when even the expected gain from
/// branch optimisation (mean plus `z` standard deviations of the gains seen so far) cannot lift
/// it above the cutoff. Kicks in after `min_samples` full evaluations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutoffEstimation {
    pub min_samples: usize,
    pub z: f64,
}

impl Default for CutoffEstimation {
    fn default() -> Self {
        Self {
            min_samples: 10,
            z: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// Minimal log-likelihood improvement for an NNI to count.
    pub cutoff: f64,
    /// Pre-score NNIs without branch optimisation and fully evaluate only the best ones.
    pub approximate: bool,
    pub approximate_top: usize,
    pub scope: NniScope,
    pub cutoff_estimation: Option<CutoffEstimation>,
    pub max_rounds: usize,
    pub max_time: Option<Duration>,
    /// Converge all branch lengths to within `cutoff` before every round.
    pub optimise_branches: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cutoff: 1e-6,
            approximate: false,
            approximate_top: 10,
            scope: NniScope::default(),
            cutoff_estimation: None,
            max_rounds: 100,
            max_time: None,
            optimise_branches: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleValOptResult {
    pub value: f64,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// The starting value was kept because nothing better was found.
    pub retained: bool,
}

#[cfg(test)]
mod tests;
