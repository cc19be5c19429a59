use log::{debug, info};

use crate::likelihood::TreeSearchCost;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct BranchOptimisationResult {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Branch optimisations that kept the starting length.
    pub degenerate_steps: usize,
}

/// Optimises every branch of the tree in turn until a full pass gains less than `tolerance`.
pub struct BranchOptimiser<'a, C: TreeSearchCost> {
    cost: &'a mut C,
    max_iterations: usize,
    tolerance: f64,
}

impl<'a, C: TreeSearchCost> BranchOptimiser<'a, C> {
    pub fn new(cost: &'a mut C) -> Self {
        Self {
            cost,
            max_iterations: 100,
            tolerance: 1e-3,
        }
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn run(self) -> Result<BranchOptimisationResult> {
        info!("Optimising branch lengths.");
        let initial_cost = self.cost.cost();
        info!("Initial logl: {initial_cost}.");

        let mut curr_cost = initial_cost;
        let mut iterations = 0;
        let mut degenerate_steps = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            let prev_cost = curr_cost;
            for branch in self.cost.tree().branches() {
                let res = self.cost.optimise_branch(&branch)?;
                if res.retained {
                    degenerate_steps += 1;
                }
                debug!(
                    "Optimised {branch} to length {:.5} with logl {:.5}",
                    res.value, res.final_cost
                );
            }
            self.cost.compute_branch_lengths();
            curr_cost = self.cost.cost();
            debug!("Iteration {iterations}: logl {curr_cost}");
            if curr_cost - prev_cost <= self.tolerance {
                break;
            }
        }
        info!("Final logl: {curr_cost}, achieved in {iterations} iteration(s).");
        Ok(BranchOptimisationResult {
            initial_cost,
            final_cost: curr_cost,
            iterations,
            degenerate_steps,
        })
    }
}

/// Optimises all branch lengths and returns the final log-likelihood.
pub fn optimise_all_branches<C: TreeSearchCost>(
    cost: &mut C,
    max_iterations: usize,
    tolerance: f64,
) -> Result<f64> {
    let res = BranchOptimiser::new(cost)
        .max_iterations(max_iterations)
        .tolerance(tolerance)
        .run()?;
    Ok(res.final_cost)
}
