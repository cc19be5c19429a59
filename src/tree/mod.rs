use std::fmt::{self, Display};

use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::debug;

use crate::errors::StructuralError;
use crate::io::DataError;
use crate::likelihood::PartialArena;
use crate::Result;

mod nj_builder;
mod nj_matrices;
pub mod tree_parser;

pub use nj_builder::*;
use NodeIdx::{Internal as Int, Leaf};

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Int(idx) => write!(f, "internal node {idx}"),
            Leaf(idx) => write!(f, "leaf node {idx}"),
        }
    }
}

/// Undirected branch between two adjacent nodes, stored with the lower node index first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Branch(NodeIdx, NodeIdx);

impl Branch {
    pub fn new(a: NodeIdx, b: NodeIdx) -> Self {
        if usize::from(a) <= usize::from(b) {
            Branch(a, b)
        } else {
            Branch(b, a)
        }
    }

    pub fn ends(&self) -> (NodeIdx, NodeIdx) {
        (self.0, self.1)
    }

    pub fn contains(&self, node: NodeIdx) -> bool {
        self.0 == node || self.1 == node
    }

    /// End of the branch opposite to `node`.
    pub fn other(&self, node: NodeIdx) -> Option<NodeIdx> {
        if self.0 == node {
            Some(self.1)
        } else if self.1 == node {
            Some(self.0)
        } else {
            None
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!((self.0, self.1), (Int(_), Int(_)))
    }
}

impl Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch {} -- {}", self.0, self.1)
    }
}

/// Half of an undirected branch as seen from the node that owns it. `slot` names the partial
/// likelihood buffer of the subtree hanging off `node`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub node: NodeIdx,
    pub blen: f64,
    pub(crate) slot: usize,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub idx: NodeIdx,
    pub id: String,
    /// Row of the taxon in the alignment the tree is evaluated on.
    pub taxon: Option<usize>,
    pub(crate) neighbours: Vec<Neighbour>,
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}", self.idx)
        } else {
            write!(f, "{} with id {}", self.idx, self.id)
        }
    }
}

impl Node {
    pub fn neighbours(&self) -> &[Neighbour] {
        &self.neighbours
    }

    pub fn degree(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.idx, Leaf(_))
    }
}

/// Options for newick output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewickFormat {
    pub branch_lengths: bool,
    pub internal_labels: bool,
    /// Fixed number of decimals for branch lengths, shortest representation if `None`.
    pub precision: Option<usize>,
}

impl Default for NewickFormat {
    fn default() -> Self {
        Self {
            branch_lengths: true,
            internal_labels: true,
            precision: None,
        }
    }
}

/// Unrooted tree stored as an arena of nodes with adjacency lists. Removed nodes return their
/// index to a free list. `root` only fixes the traversal orders.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) nodes: Vec<Node>,
    free: Vec<usize>,
    live: FixedBitSet,
    pub root: NodeIdx,
    pub(crate) n: usize,
    preorder: Vec<NodeIdx>,
    postorder: Vec<NodeIdx>,
    parents: Vec<Option<NodeIdx>>,
    slot_count: usize,
    free_slots: Vec<usize>,
    pub(crate) partials: PartialArena,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_newick())
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            live: FixedBitSet::new(),
            root: Int(0),
            n: 0,
            preorder: Vec::new(),
            postorder: Vec::new(),
            parents: Vec::new(),
            slot_count: 0,
            free_slots: Vec::new(),
            partials: PartialArena::default(),
        }
    }

    fn add_node(&mut self, leaf: bool, id: &str) -> NodeIdx {
        let i = self.free.pop().unwrap_or(self.nodes.len());
        let idx = if leaf { Leaf(i) } else { Int(i) };
        let node = Node {
            idx,
            id: id.to_string(),
            taxon: None,
            neighbours: Vec::with_capacity(3),
        };
        if i == self.nodes.len() {
            self.nodes.push(node);
            self.live.grow(self.nodes.len());
        } else {
            self.nodes[i] = node;
        }
        self.live.insert(i);
        idx
    }

    pub fn add_leaf(&mut self, id: &str) -> NodeIdx {
        self.add_node(true, id)
    }

    pub fn add_internal(&mut self, id: &str) -> NodeIdx {
        self.add_node(false, id)
    }

    fn alloc_slot(&mut self) -> usize {
        self.free_slots.pop().unwrap_or_else(|| {
            self.slot_count += 1;
            self.slot_count - 1
        })
    }

    /// Adds a branch of length `blen` between two nodes.
    pub fn connect(&mut self, a: NodeIdx, b: NodeIdx, blen: f64) {
        let slot_ab = self.alloc_slot();
        let slot_ba = self.alloc_slot();
        self.node_mut(a).neighbours.push(Neighbour {
            node: b,
            blen,
            slot: slot_ab,
        });
        self.node_mut(b).neighbours.push(Neighbour {
            node: a,
            blen,
            slot: slot_ba,
        });
        self.partials.invalidate_all();
    }

    /// Removes the branch between two nodes, returning its length.
    pub fn disconnect(&mut self, a: NodeIdx, b: NodeIdx) -> Option<f64> {
        let pos_ab = self.position(a, b)?;
        let pos_ba = self.position(b, a)?;
        let ab = self.node_mut(a).neighbours.remove(pos_ab);
        let ba = self.node_mut(b).neighbours.remove(pos_ba);
        self.free_slots.push(ab.slot);
        self.free_slots.push(ba.slot);
        self.partials.invalidate_all();
        Some(ab.blen)
    }

    /// Detaches a node from all its neighbours and returns its index to the free list.
    pub fn remove_node(&mut self, idx: NodeIdx) {
        let neighbours: Vec<NodeIdx> = self.node(idx).neighbours.iter().map(|n| n.node).collect();
        for other in neighbours {
            self.disconnect(idx, other);
        }
        let node = self.node_mut(idx);
        node.id.clear();
        node.taxon = None;
        self.free.push(usize::from(idx));
        self.live.set(usize::from(idx), false);
    }

    fn is_live(&self, i: usize) -> bool {
        self.live.contains(i)
    }

    fn live_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_live(*i))
            .map(|(_, node)| node)
    }

    /// Finalises a tree after construction: picks a root if needed and computes the
    /// traversal orders.
    pub fn complete(&mut self) {
        if !self.is_live(usize::from(self.root)) || self.node(self.root).idx != self.root {
            let first_internal = self.live_nodes().find(|n| !n.is_leaf()).map(|n| n.idx);
            let first_any = self.live_nodes().next().map(|n| n.idx);
            if let Some(root) = first_internal.or(first_any) {
                self.root = root;
            }
        }
        self.n = self.live_nodes().filter(|n| n.is_leaf()).count();
        self.compute_orders();
    }

    pub(crate) fn compute_orders(&mut self) {
        self.preorder.clear();
        self.postorder.clear();
        self.parents = vec![None; self.nodes.len()];
        if self.is_empty() {
            return;
        }
        let mut stack = vec![(self.root, None)];
        while let Some((node, parent)) = stack.pop() {
            self.preorder.push(node);
            self.parents[usize::from(node)] = parent;
            for n in self.node(node).neighbours.iter().rev() {
                if Some(n.node) != parent {
                    stack.push((n.node, Some(node)));
                }
            }
        }
        let mut stack = vec![(self.root, None)];
        while let Some((node, parent)) = stack.pop() {
            self.postorder.push(node);
            for n in self.node(node).neighbours.iter() {
                if Some(n.node) != parent {
                    stack.push((n.node, Some(node)));
                }
            }
        }
        self.postorder.reverse();
        debug_assert_eq!(self.preorder.len(), self.len());
    }

    pub fn set_root(&mut self, root: NodeIdx) {
        self.root = root;
        self.compute_orders();
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub(crate) fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[usize::from(idx)]
    }

    pub fn by_id(&self, id: &str) -> Option<&Node> {
        self.live_nodes().find(|n| n.id == id)
    }

    pub fn idx(&self, id: &str) -> Result<NodeIdx> {
        match self.by_id(id) {
            Some(node) => Ok(node.idx),
            None => bail!("No node with id {id} found in the tree"),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_leaves(&self) -> usize {
        self.n
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.live_nodes().filter(|n| n.is_leaf()).collect()
    }

    pub fn leaf_ids(&self) -> Vec<String> {
        self.leaves().iter().map(|n| n.id.clone()).collect()
    }

    pub fn preorder(&self) -> &[NodeIdx] {
        &self.preorder
    }

    pub fn postorder(&self) -> &[NodeIdx] {
        &self.postorder
    }

    pub fn parent(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.parents.get(usize::from(idx)).copied().flatten()
    }

    fn position(&self, from: NodeIdx, to: NodeIdx) -> Option<usize> {
        self.node(from).neighbours.iter().position(|n| n.node == to)
    }

    pub fn neighbour(&self, from: NodeIdx, to: NodeIdx) -> Option<&Neighbour> {
        self.node(from).neighbours.iter().find(|n| n.node == to)
    }

    pub fn is_adjacent(&self, a: NodeIdx, b: NodeIdx) -> bool {
        self.position(a, b).is_some()
    }

    /// Partial likelihood slot of the subtree on the `to` side of the branch, seen from `from`.
    pub(crate) fn slot(&self, from: NodeIdx, to: NodeIdx) -> Option<usize> {
        self.neighbour(from, to).map(|n| n.slot)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// All branches, each once, in preorder of their lower end.
    pub fn branches(&self) -> Vec<Branch> {
        self.preorder
            .iter()
            .filter_map(|&node| self.parent(node).map(|parent| Branch::new(parent, node)))
            .collect()
    }

    /// Branches between two internal nodes, the ones NNI moves act on.
    pub fn internal_branches(&self) -> Vec<Branch> {
        self.branches()
            .into_iter()
            .filter(|b| b.is_internal())
            .collect()
    }

    /// # Panics
    /// Panics if the two nodes of the branch are not adjacent.
    pub fn blen(&self, branch: &Branch) -> f64 {
        match self.neighbour(branch.0, branch.1) {
            Some(n) => n.blen,
            None => panic!("{branch} is not part of the tree"),
        }
    }

    /// Sets the length of a branch in both half-edges and invalidates every partial
    /// likelihood that includes the branch.
    ///
    /// # Panics
    /// Panics if the two nodes of the branch are not adjacent.
    pub fn set_blen(&mut self, branch: &Branch, blen: f64) {
        let (a, b) = branch.ends();
        for (from, to) in [(a, b), (b, a)] {
            match self.position(from, to) {
                Some(pos) => self.node_mut(from).neighbours[pos].blen = blen,
                None => panic!("{branch} is not part of the tree"),
            }
        }
        self.invalidate_outward(a, b);
        self.invalidate_outward(b, a);
    }

    /// Invalidates the partials of all subtrees that contain `start` while not containing
    /// `exclude`. Stops at partials that are already invalid, everything beyond them is too.
    fn invalidate_outward(&mut self, start: NodeIdx, exclude: NodeIdx) {
        let mut stack = vec![(start, exclude)];
        while let Some((node, prev)) = stack.pop() {
            for i in 0..self.node(node).neighbours.len() {
                let next = self.node(node).neighbours[i].node;
                if next == prev {
                    continue;
                }
                if let Some(slot) = self.slot(next, node) {
                    if self.partials.invalidate(slot) {
                        stack.push((next, node));
                    }
                }
            }
        }
    }

    /// Fails with a `StructuralError` if the two ends of `branch` are not adjacent, e.g. for a
    /// branch kept from before an NNI.
    pub fn check_branch(&self, branch: &Branch, operation: &str) -> Result<()> {
        let (a, b) = branch.ends();
        let known = |n: NodeIdx| self.is_live(usize::from(n)) && self.node(n).idx == n;
        if !known(a) || !known(b) || !self.is_adjacent(a, b) {
            bail!(StructuralError::new(
                operation,
                format!("{branch} is not part of the tree")
            ));
        }
        Ok(())
    }

    /// Sum of all branch lengths.
    pub fn height(&self) -> f64 {
        self.branches().iter().map(|b| self.blen(b)).sum()
    }

    /// Fails with a `StructuralError` if a node has more than three neighbours.
    pub fn check_bifurcating(&self, operation: &str) -> Result<()> {
        if let Some(node) = self.live_nodes().find(|n| n.degree() > 3) {
            bail!(StructuralError::new(
                operation,
                format!(
                    "{node} has {} neighbours, only bifurcating trees are supported",
                    node.degree()
                )
            ));
        }
        Ok(())
    }

    /// Sets the taxon of every leaf to the position of its id in `names`.
    ///
    /// # Errors
    /// Fails with a `DataError` if a leaf is not in `names`, if two leaves share a name or if
    /// some name has no leaf.
    pub fn assign_taxa(&mut self, names: &[String]) -> Result<()> {
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut assigned = FixedBitSet::with_capacity(names.len());
        let leaves: Vec<NodeIdx> = self.leaves().iter().map(|n| n.idx).collect();
        for leaf in leaves {
            let id = &self.node(leaf).id;
            let Some(&taxon) = index.get(id.as_str()) else {
                bail!(DataError {
                    message: format!("Leaf {id} is not in the alignment")
                });
            };
            if assigned.put(taxon) {
                bail!(DataError {
                    message: format!("Leaf {id} occurs more than once in the tree")
                });
            }
            self.node_mut(leaf).taxon = Some(taxon);
        }
        if assigned.count_ones(..) != names.len() {
            bail!(DataError {
                message: format!(
                    "Tree has {} leaves, but the alignment has {} taxa",
                    self.n,
                    names.len()
                )
            });
        }
        Ok(())
    }

    /// Taxa below every branch, on the side away from the root, as sets over `num_taxa` taxa.
    pub fn splits(&self, num_taxa: usize) -> Vec<(Branch, FixedBitSet)> {
        let mut below = vec![FixedBitSet::with_capacity(num_taxa); self.nodes.len()];
        let mut splits = Vec::with_capacity(self.len());
        for &node in &self.postorder {
            let i = usize::from(node);
            if let Some(taxon) = self.nodes[i].taxon {
                below[i].insert(taxon);
            }
            if let Some(parent) = self.parent(node) {
                splits.push((Branch::new(parent, node), below[i].clone()));
                let child = std::mem::take(&mut below[i]);
                below[usize::from(parent)].union_with(&child);
            }
        }
        splits
    }

    /// Induced subtree on the taxa with `keep[taxon] = Some(new_taxon)`. Other leaves are pruned,
    /// nodes left with fewer than three neighbours are suppressed and the lengths of merged
    /// branches are summed. The new tree has its own, empty, partial likelihood buffers.
    pub fn restrict(&self, keep: &[Option<usize>]) -> Tree {
        let mut tree = self.clone();
        tree.partials = PartialArena::default();
        let leaves: Vec<NodeIdx> = tree.leaves().iter().map(|n| n.idx).collect();
        for leaf in leaves {
            let mapped = tree
                .node(leaf)
                .taxon
                .and_then(|t| keep.get(t).copied().flatten());
            match mapped {
                Some(local) => tree.node_mut(leaf).taxon = Some(local),
                None => tree.remove_node(leaf),
            }
        }
        tree.suppress_internal_nodes();
        tree.complete();
        debug!("Restricted tree to {} leaves", tree.num_leaves());
        tree
    }

    fn suppress_internal_nodes(&mut self) {
        loop {
            let next = self
                .live_nodes()
                .find(|n| !n.is_leaf() && n.degree() < 3)
                .map(|n| n.idx);
            let Some(node) = next else {
                break;
            };
            let neighbours = self.node(node).neighbours.clone();
            self.remove_node(node);
            if let [a, b] = neighbours.as_slice() {
                self.connect(a.node, b.node, a.blen + b.blen);
            }
        }
    }

    /// Nearest neighbour interchange around the branch `node1 -- node2`: `swap1`, a neighbour
    /// of `node1`, and `swap2`, a neighbour of `node2`, trade places. The swapped subtrees keep
    /// their branch lengths and partial likelihoods; partials that see the changed region are
    /// invalidated.
    pub fn nni(
        &mut self,
        node1: NodeIdx,
        node2: NodeIdx,
        swap1: NodeIdx,
        swap2: NodeIdx,
    ) -> Result<()> {
        let invalid = |msg: String| StructuralError::new("NNI", msg);
        if !self.is_adjacent(node1, node2) {
            bail!(invalid(format!("{node1} and {node2} are not adjacent")));
        }
        if swap1 == node2 || swap2 == node1 {
            bail!(invalid(String::from("cannot swap the central branch")));
        }
        let (Some(pos1), Some(pos2), Some(back1), Some(back2)) = (
            self.position(node1, swap1),
            self.position(node2, swap2),
            self.position(swap1, node1),
            self.position(swap2, node2),
        ) else {
            bail!(invalid(format!(
                "{swap1} must neighbour {node1} and {swap2} must neighbour {node2}"
            )));
        };

        let half1 = self.node(node1).neighbours[pos1];
        let half2 = self.node(node2).neighbours[pos2];
        self.node_mut(node1).neighbours[pos1] = half2;
        self.node_mut(node2).neighbours[pos2] = half1;
        self.node_mut(swap1).neighbours[back1].node = node2;
        self.node_mut(swap2).neighbours[back2].node = node1;

        for (from, to) in [(node1, node2), (node2, node1)] {
            if let Some(slot) = self.slot(from, to) {
                self.partials.invalidate(slot);
            }
        }
        self.invalidate_outward(node1, node2);
        self.invalidate_outward(node2, node1);
        self.compute_orders();
        Ok(())
    }

    pub fn to_newick(&self) -> String {
        self.to_newick_with(&NewickFormat::default())
    }

    pub fn to_newick_with(&self, format: &NewickFormat) -> String {
        let mut out = String::new();
        if self.is_empty() {
            out.push(';');
            return out;
        }
        let root = self.node(self.root);
        match (root.is_leaf(), root.neighbours.first()) {
            (true, Some(n)) if !self.node(n.node).is_leaf() => {
                self.write_subtree(&mut out, n.node, None, format);
            }
            (true, Some(n)) => {
                out.push('(');
                self.write_subtree(&mut out, root.idx, Some(n.node), format);
                self.write_blen(&mut out, n.blen, format);
                out.push(',');
                self.write_subtree(&mut out, n.node, Some(root.idx), format);
                self.write_blen(&mut out, 0.0, format);
                out.push(')');
            }
            _ => self.write_subtree(&mut out, root.idx, None, format),
        }
        out.push(';');
        out
    }

    fn write_blen(&self, out: &mut String, blen: f64, format: &NewickFormat) {
        if format.branch_lengths {
            out.push(':');
            match format.precision {
                Some(p) => out.push_str(&format!("{blen:.p$}")),
                None => out.push_str(&format!("{blen}")),
            }
        }
    }

    fn write_subtree(
        &self,
        out: &mut String,
        idx: NodeIdx,
        parent: Option<NodeIdx>,
        format: &NewickFormat,
    ) {
        let node = self.node(idx);
        let mut children = node.neighbours.iter().filter(|n| Some(n.node) != parent).peekable();
        if children.peek().is_some() {
            out.push('(');
            for (i, child) in children.enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_subtree(out, child.node, Some(idx), format);
                self.write_blen(out, child.blen, format);
            }
            out.push(')');
        }
        if node.is_leaf() || format.internal_labels {
            out.push_str(&quote_label(&node.id));
        }
    }
}

fn quote_label(label: &str) -> String {
    if label
        .chars()
        .any(|c| c.is_whitespace() || "()[]:;,'".contains(c))
    {
        format!("'{}'", label.replace('\'', ""))
    } else {
        label.to_string()
    }
}

/// Puts a split into the form that contains the first taxon of `present`, so that both sides of
/// a bipartition compare equal.
pub(crate) fn canonical_split(split: &FixedBitSet, present: &FixedBitSet) -> FixedBitSet {
    let mut side = split.clone();
    side.intersect_with(present);
    match present.ones().next() {
        Some(first) if !side.contains(first) => {
            let mut other = present.clone();
            other.difference_with(&side);
            other
        }
        _ => side,
    }
}

#[cfg(test)]
mod tests;
