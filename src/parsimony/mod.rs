use anyhow::bail;
use hashbrown::HashMap;

use crate::alignment::Alignment;
use crate::io::DataError;
use crate::tree::{NodeIdx, Tree};
use crate::Result;

/// Fitch parsimony score of an unrooted tree, summed over the non-constant patterns of the
/// alignment weighted by their frequency. Leaves are matched to alignment rows by name, gaps and
/// ambiguous characters match every state.
///
/// # Errors
/// Fails with a `StructuralError` if a node has more than three neighbours and with a
/// `DataError` if a leaf has no row in the alignment.
pub fn parsimony_score(tree: &Tree, alignment: &Alignment) -> Result<usize> {
    tree.check_bifurcating("parsimony score")?;
    let num_states = alignment.num_states();
    let any_state: u64 = (1 << num_states) - 1;
    let mut rows: HashMap<NodeIdx, usize> = HashMap::with_capacity(tree.num_leaves());
    for leaf in tree.leaves() {
        let Some(row) = alignment.taxon_index(&leaf.id) else {
            bail!(DataError {
                message: format!("Leaf {} is not in the alignment", leaf.id)
            });
        };
        rows.insert(leaf.idx, row);
    }

    let mut masks = vec![0u64; tree.nodes.len()];
    let mut score = 0;
    for pattern in alignment.patterns().iter().filter(|p| !p.is_const()) {
        let mut changes = 0;
        for &node in tree.postorder() {
            let mut acc = rows.get(&node).map(|&row| {
                let state = pattern.states()[row] as usize;
                if state < num_states {
                    1 << state
                } else {
                    any_state
                }
            });
            let parent = tree.parent(node);
            for child in tree
                .node(node)
                .neighbours()
                .iter()
                .filter(|n| Some(n.node) != parent)
            {
                let mask = masks[usize::from(child.node)];
                acc = Some(match acc {
                    None => mask,
                    Some(a) if a & mask != 0 => a & mask,
                    Some(a) => {
                        changes += 1;
                        a | mask
                    }
                });
            }
            masks[usize::from(node)] = acc.unwrap_or(any_state);
        }
        score += changes * pattern.frequency();
    }
    Ok(score)
}
