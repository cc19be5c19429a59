use std::error::Error;
use std::fmt;

use anyhow::bail;
use log::{info, warn};
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{NodeIdx, Tree};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl Error for ParsingError {}

/// Parses all trees in a newick string. Multifurcations are kept, a top level node with two
/// children is suppressed so that every tree comes out unrooted.
pub fn from_newick(newick: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let newick_rule = match NewickParser::parse(Rule::newick, newick) {
        Ok(mut pairs) => match pairs.next() {
            Some(rule) => rule,
            None => bail!("Empty newick string"),
        },
        Err(e) => bail!(ParsingError(Box::new(e))),
    };
    let mut trees = Vec::new();
    for tree_rule in newick_rule
        .into_inner()
        .filter(|rule| rule.as_rule() == Rule::tree)
    {
        let mut tree = Tree::new();
        if let Some(top_rule) = tree_rule.into_inner().next() {
            let (top, _) = tree.parse_subtree(top_rule);
            tree.root = top;
            tree.unroot();
        }
        tree.complete();
        trees.push(tree);
    }
    info!("Finished parsing {} newick tree(s) successfully.", trees.len());
    Ok(trees)
}

impl Tree {
    fn parse_subtree(&mut self, rule: Pair<Rule>) -> (NodeIdx, f64) {
        let is_internal = rule.as_rule() == Rule::internal;
        let idx = if is_internal {
            self.add_internal("")
        } else {
            self.add_leaf("")
        };
        let mut blen = 0.0;
        for inner in rule.into_inner() {
            match inner.as_rule() {
                Rule::internal | Rule::leaf => {
                    let (child, child_blen) = self.parse_subtree(inner);
                    self.connect(idx, child, child_blen);
                }
                Rule::quoted_label => {
                    let label = inner.as_str();
                    self.node_mut(idx).id = label[1..label.len() - 1].to_string();
                }
                Rule::unquoted_label => self.node_mut(idx).id = inner.as_str().to_string(),
                Rule::branch_length => blen = Tree::parse_branch_length(inner),
                _ => unreachable!(),
            }
        }
        (idx, blen)
    }

    fn parse_branch_length(rule: Pair<Rule>) -> f64 {
        rule.into_inner()
            .next()
            .map(|float| float.as_str().trim().parse::<f64>().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Merges the two branches of a degree two top level node.
    fn unroot(&mut self) {
        let top = self.root;
        if self.node(top).is_leaf() || self.node(top).degree() != 2 {
            return;
        }
        warn!("Found rooted tree, suppressing the root node.");
        let neighbours = self.node(top).neighbours.clone();
        self.remove_node(top);
        let (a, b) = (neighbours[0], neighbours[1]);
        self.connect(a.node, b.node, a.blen + b.blen);
        self.root = if !self.node(a.node).is_leaf() {
            a.node
        } else {
            b.node
        };
    }
}

