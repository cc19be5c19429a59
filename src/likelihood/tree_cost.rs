use std::fmt::{self, Display};

use log::info;

use crate::likelihood::{check_memory, LikelihoodOracle, TreeSearchCost};
use crate::optimisers::{optimise_single_branch, BranchSettings, NniMove, SingleValOptResult};
use crate::tree::{Branch, Tree};
use crate::Result;

pub struct TreeCostBuilder {
    oracle: Box<dyn LikelihoodOracle>,
    tree: Tree,
    settings: BranchSettings,
    memory_limit: Option<usize>,
}

impl TreeCostBuilder {
    pub fn new(oracle: impl LikelihoodOracle + 'static, tree: Tree) -> Self {
        Self {
            oracle: Box::new(oracle),
            tree,
            settings: BranchSettings::default(),
            memory_limit: None,
        }
    }

    pub fn settings(mut self, settings: BranchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Caps the memory for partial likelihoods instead of asking the system.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// # Errors
    /// Fails with a `DataError` if the tree leaves do not match the alignment taxa and with a
    /// `ConfigurationError` if the partial likelihoods do not fit in memory.
    pub fn build(self) -> Result<TreeCost> {
        let mut tree = self.tree;
        tree.assign_taxa(self.oracle.alignment().names())?;
        check_memory(self.oracle.memory_required(&tree), self.memory_limit)?;
        self.oracle.allocate(&mut tree);
        info!(
            "Set up likelihood for {} taxa and {} site patterns",
            tree.num_leaves(),
            self.oracle.alignment().num_patterns()
        );
        Ok(TreeCost {
            tree,
            oracle: self.oracle,
            settings: self.settings,
        })
    }
}

/// One tree scored on one alignment.
#[derive(Debug, Clone)]
pub struct TreeCost {
    pub(crate) tree: Tree,
    pub(crate) oracle: Box<dyn LikelihoodOracle>,
    pub(crate) settings: BranchSettings,
}

impl TreeCost {
    pub fn oracle(&self) -> &dyn LikelihoodOracle {
        self.oracle.as_ref()
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

impl Display for TreeCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tree)
    }
}

impl TreeSearchCost for TreeCost {
    fn cost(&mut self) -> f64 {
        self.oracle.logl(&mut self.tree)
    }

    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn optimise_branch(&mut self, branch: &Branch) -> Result<SingleValOptResult> {
        self.tree.check_branch(branch, "branch optimisation")?;
        let start = self.tree.blen(branch);
        let oracle = &self.oracle;
        let tree = &mut self.tree;
        let res = optimise_single_branch(&self.settings, start, |blen| {
            oracle.logl_derivatives(tree, branch, blen)
        })?;
        if res.value != start {
            self.tree.set_blen(branch, res.value);
        }
        Ok(res)
    }

    fn do_nni(&mut self, mv: &NniMove) -> Result<()> {
        self.tree.nni(mv.node1, mv.node2, mv.swap1, mv.swap2)
    }
}
