use anyhow::bail;
use approx::relative_eq;
use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::alignment::Alignment;
use crate::io::DataError;
use crate::likelihood::LikelihoodOracle;
use crate::tree::{Branch, Neighbour, NodeIdx, Tree};
use crate::Result;

/// F81 substitution model over any alphabet: P(t) = e * I + (1 - e) * 1 pi^T with
/// e = exp(-beta * t) and beta normalising the rate to one substitution per site and unit
/// time. With uniform frequencies this is Jukes-Cantor.
#[derive(Debug, Clone)]
pub struct F81Likelihood {
    alignment: Alignment,
    freqs: DVector<f64>,
    beta: f64,
    tips: Vec<DMatrix<f64>>,
    missing: DMatrix<f64>,
}

impl F81Likelihood {
    /// Jukes-Cantor model with uniform state frequencies.
    pub fn jc(alignment: Alignment) -> Self {
        let num_states = alignment.num_states();
        let freqs = DVector::from_element(num_states, 1.0 / num_states as f64);
        Self::build(alignment, freqs)
    }

    /// # Errors
    /// Fails with a `DataError` if the frequencies do not match the alphabet, are negative, do
    /// not sum to one or put all mass on one state.
    pub fn with_freqs(alignment: Alignment, freqs: &[f64]) -> Result<Self> {
        if freqs.len() != alignment.num_states() {
            bail!(DataError {
                message: format!(
                    "Expected {} state frequencies, got {}",
                    alignment.num_states(),
                    freqs.len()
                )
            });
        }
        if freqs.iter().any(|&f| !(0.0..1.0).contains(&f))
            || !relative_eq!(freqs.iter().sum::<f64>(), 1.0, epsilon = 1e-6)
        {
            bail!(DataError {
                message: format!("Invalid state frequencies {freqs:?}")
            });
        }
        Ok(Self::build(alignment, DVector::from_column_slice(freqs)))
    }

    /// Frequencies counted from the alignment with one pseudocount per state.
    pub fn empirical(alignment: Alignment) -> Self {
        let num_states = alignment.num_states();
        let mut counts = DVector::from_element(num_states, 1.0);
        for pattern in alignment.patterns() {
            for &state in pattern.states() {
                if (state as usize) < num_states {
                    counts[state as usize] += pattern.frequency() as f64;
                }
            }
        }
        let total = counts.sum();
        Self::build(alignment, counts / total)
    }

    fn build(alignment: Alignment, freqs: DVector<f64>) -> Self {
        let num_states = alignment.num_states();
        let num_patterns = alignment.num_patterns();
        let beta = 1.0 / (1.0 - freqs.iter().map(|f| f * f).sum::<f64>());
        let tips = (0..alignment.num_taxa())
            .map(|taxon| {
                DMatrix::from_fn(num_states, num_patterns, |s, p| {
                    let state = alignment.patterns()[p].states()[taxon] as usize;
                    if state >= num_states || state == s {
                        1.0
                    } else {
                        0.0
                    }
                })
            })
            .collect();
        Self {
            missing: DMatrix::from_element(num_states, num_patterns, 1.0),
            alignment,
            freqs,
            beta,
            tips,
        }
    }

    pub fn freqs(&self) -> &DVector<f64> {
        &self.freqs
    }

    fn tip(&self, taxon: Option<usize>) -> &DMatrix<f64> {
        match taxon.and_then(|t| self.tips.get(t)) {
            Some(tip) => tip,
            None => &self.missing,
        }
    }

    /// Partial likelihood and log scaling of the subtree that `half` points to.
    fn side<'a>(
        &'a self,
        tree: &'a Tree,
        half: &Neighbour,
    ) -> (&'a DMatrix<f64>, Option<&'a DVector<f64>>) {
        match half.node {
            NodeIdx::Leaf(_) => (self.tip(tree.node(half.node).taxon), None),
            NodeIdx::Internal(_) => (
                &tree.partials.buffers[half.slot],
                Some(&tree.partials.scales[half.slot]),
            ),
        }
    }

    fn prepare(&self, tree: &mut Tree) {
        let (states, patterns) = (self.alignment.num_states(), self.alignment.num_patterns());
        if !tree.partials.fits(tree.slot_count(), states, patterns) {
            self.allocate(tree);
        }
    }

    /// Brings the partial of the `to` side seen from `from` up to date, computing only the
    /// invalid partials it depends on.
    fn update_partials(&self, tree: &mut Tree, from: NodeIdx, to: NodeIdx) {
        let mut stack = vec![(from, to)];
        while let Some(&(from, to)) = stack.last() {
            let needed = match (to, tree.slot(from, to)) {
                (NodeIdx::Internal(_), Some(slot)) => !tree.partials.is_valid(slot),
                _ => false,
            };
            if !needed {
                stack.pop();
                continue;
            }
            let pending: Vec<(NodeIdx, NodeIdx)> = tree
                .node(to)
                .neighbours()
                .iter()
                .filter(|n| n.node != from && matches!(n.node, NodeIdx::Internal(_)))
                .filter(|n| !tree.partials.is_valid(n.slot))
                .map(|n| (to, n.node))
                .collect();
            if pending.is_empty() {
                self.compute_partial(tree, from, to);
                stack.pop();
            } else {
                stack.extend(pending);
            }
        }
    }

    fn compute_partial(&self, tree: &mut Tree, from: NodeIdx, to: NodeIdx) {
        let (num_states, num_patterns) =
            (self.alignment.num_states(), self.alignment.num_patterns());
        let mut partial = DMatrix::from_element(num_states, num_patterns, 1.0);
        let mut scale = DVector::zeros(num_patterns);
        for half in tree.node(to).neighbours().iter().filter(|n| n.node != from) {
            let (child, child_scale) = self.side(tree, half);
            let e = (-self.beta * half.blen).exp();
            for p in 0..num_patterns {
                let mixed: f64 = (0..num_states).map(|s| self.freqs[s] * child[(s, p)]).sum();
                for s in 0..num_states {
                    partial[(s, p)] *= e * child[(s, p)] + (1.0 - e) * mixed;
                }
            }
            if let Some(child_scale) = child_scale {
                scale += child_scale;
            }
        }
        for p in 0..num_patterns {
            let max = (0..num_states).map(|s| partial[(s, p)]).fold(0.0, f64::max);
            if max > 0.0 {
                for s in 0..num_states {
                    partial[(s, p)] /= max;
                }
                scale[p] += max.ln();
            }
        }
        let Some(slot) = tree.slot(from, to) else {
            return;
        };
        tree.partials.buffers[slot] = partial;
        tree.partials.scales[slot] = scale;
        tree.partials.validate(slot);
    }

    /// Log-likelihood with its first two derivatives for `branch` at length `blen`.
    fn branch_terms(&self, tree: &mut Tree, branch: &Branch, blen: f64) -> (f64, f64, f64) {
        self.prepare(tree);
        let (u, v) = branch.ends();
        self.update_partials(tree, u, v);
        self.update_partials(tree, v, u);
        let (Some(to_v), Some(to_u)) = (tree.neighbour(u, v), tree.neighbour(v, u)) else {
            panic!("{branch} is not part of the tree");
        };
        let (lower, lower_scale) = self.side(tree, to_v);
        let (upper, upper_scale) = self.side(tree, to_u);

        let e = (-self.beta * blen).exp();
        let (mut logl, mut d1, mut d2) = (0.0, 0.0, 0.0);
        for (p, pattern) in self.alignment.patterns().iter().enumerate() {
            let (mut same, mut upper_mix, mut lower_mix) = (0.0, 0.0, 0.0);
            for s in 0..self.freqs.len() {
                let pi = self.freqs[s];
                same += pi * upper[(s, p)] * lower[(s, p)];
                upper_mix += pi * upper[(s, p)];
                lower_mix += pi * lower[(s, p)];
            }
            let diff = same - upper_mix * lower_mix;
            let lik = (e * diff + upper_mix * lower_mix).max(f64::MIN_POSITIVE);
            let dlik = -self.beta * e * diff;
            let ddlik = self.beta * self.beta * e * diff;
            let scale = upper_scale.map_or(0.0, |s| s[p]) + lower_scale.map_or(0.0, |s| s[p]);
            let weight = pattern.frequency() as f64;
            logl += weight * (lik.ln() + scale);
            d1 += weight * dlik / lik;
            d2 += weight * (ddlik / lik - (dlik / lik).powi(2));
        }
        (logl, d1, d2)
    }
}

impl LikelihoodOracle for F81Likelihood {
    fn alignment(&self) -> &Alignment {
        &self.alignment
    }

    fn logl(&self, tree: &mut Tree) -> f64 {
        if tree.is_empty() {
            warn!("Computing the likelihood of an empty tree");
            return 0.0;
        }
        let root = tree.root;
        match tree.node(root).neighbours().first().copied() {
            Some(half) => self.branch_terms(tree, &Branch::new(root, half.node), half.blen).0,
            None => {
                let tip = self.tip(tree.node(root).taxon);
                self.alignment
                    .patterns()
                    .iter()
                    .enumerate()
                    .map(|(p, pattern)| {
                        let lik = (0..self.freqs.len())
                            .map(|s| self.freqs[s] * tip[(s, p)])
                            .sum::<f64>();
                        pattern.frequency() as f64 * lik.max(f64::MIN_POSITIVE).ln()
                    })
                    .sum()
            }
        }
    }

    fn logl_derivatives(&self, tree: &mut Tree, branch: &Branch, blen: f64) -> (f64, f64, f64) {
        self.branch_terms(tree, branch, blen)
    }
}
