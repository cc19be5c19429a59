use approx::assert_relative_eq;
use assert_matches::assert_matches;
use fixedbitset::FixedBitSet;
use nalgebra::dmatrix;
use rstest::*;

use crate::alignment::{Alignment, SuperAlignment};
use crate::alphabets::SeqType;
use crate::errors::StructuralError;
use crate::io::DataError;
use crate::tree::{
    canonical_split,
    tree_parser::{from_newick, ParsingError},
    Branch, NJBuilder, NewickFormat,
    NodeIdx::{Internal as I, Leaf as L},
    Tree, TreeBuilder,
};
use crate::{record_wo_desc as record, tree};

fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn leaf_blen(tree: &Tree, id: &str) -> f64 {
    tree.node(tree.idx(id).unwrap()).neighbours()[0].blen
}

fn sorted_splits(tree: &Tree, taxa: &[String]) -> Vec<Vec<usize>> {
    let mut present = FixedBitSet::with_capacity(taxa.len());
    present.insert_range(..);
    let mut splits: Vec<Vec<usize>> = tree
        .splits(taxa.len())
        .into_iter()
        .map(|(_, split)| canonical_split(&split, &present).ones().collect())
        .collect();
    splits.sort();
    splits
}

#[test]
fn parse_suppresses_the_root() {
    let tree = tree!("((A:1.0,B:2.0):0.5,(C:1.0,D:1.0):0.25);");
    assert_eq!(tree.num_leaves(), 4);
    assert_eq!(tree.len(), 6);
    assert_eq!(tree.branches().len(), 5);
    let internal = tree.internal_branches();
    assert_eq!(internal.len(), 1);
    assert_relative_eq!(tree.blen(&internal[0]), 0.75);
    assert_relative_eq!(tree.height(), 5.75);
    assert!(!tree.node(tree.root).is_leaf());
}

#[test]
fn parse_labels_and_comments() {
    let tree = tree!("('A b':1.5,B[a comment]:2e-1,C:3)inner;");
    assert_eq!(tree.leaf_ids(), names(&["A b", "B", "C"]));
    assert_relative_eq!(leaf_blen(&tree, "A b"), 1.5);
    assert_relative_eq!(leaf_blen(&tree, "B"), 0.2);
    assert_eq!(tree.node(tree.root).id, "inner");
}

#[test]
fn parse_keeps_multifurcations() {
    let tree = tree!("(A,B,C,D);");
    assert_eq!(tree.len(), 5);
    assert_eq!(tree.node(tree.root).degree(), 4);
    let err = tree.check_bifurcating("test").unwrap_err();
    let err = err.downcast_ref::<StructuralError>().unwrap();
    assert_eq!(err.context(), "test");
}

#[test]
fn parse_multiple_trees() {
    let trees = from_newick("(A,B,C);\n((A,C),(B,D));").unwrap();
    assert_eq!(trees.len(), 2);
    assert_eq!(trees[0].num_leaves(), 3);
    assert_eq!(trees[1].num_leaves(), 4);
}

#[rstest]
#[case::unbalanced("((A,B),(C,D);")]
#[case::missing_semicolon("((A,B),(C,D))")]
#[case::bad_length("((A:x,B),(C,D));")]
fn parse_malformed(#[case] newick: &str) {
    let err = from_newick(newick).unwrap_err();
    assert_matches!(err.downcast_ref::<ParsingError>(), Some(_));
}

#[test]
fn newick_round_trip() {
    let taxa = names(&["A", "B", "C", "D", "E"]);
    let mut tree = tree!("((A:0.1,B:0.2):0.3,C:0.4,(D:0.5,E:0.6):0.7);");
    tree.assign_taxa(&taxa).unwrap();
    let mut again = from_newick(&tree.to_newick()).unwrap().pop().unwrap();
    again.assign_taxa(&taxa).unwrap();
    assert_eq!(sorted_splits(&tree, &taxa), sorted_splits(&again, &taxa));
    assert_relative_eq!(tree.height(), again.height());
    for id in &taxa {
        assert_relative_eq!(leaf_blen(&tree, id), leaf_blen(&again, id));
    }
}

#[test]
fn newick_formats() {
    let tree = tree!("((A:0.123,B:0.2)x:0.3,C:0.4,D:0.5);");
    let plain = NewickFormat {
        branch_lengths: false,
        internal_labels: false,
        precision: None,
    };
    assert_eq!(tree.to_newick_with(&plain), "((A,B),C,D);");
    let rounded = NewickFormat {
        precision: Some(1),
        ..NewickFormat::default()
    };
    assert_eq!(tree.to_newick_with(&rounded), "((A:0.1,B:0.2)x:0.3,C:0.4,D:0.5);");
}

#[test]
fn newick_two_leaves() {
    let tree = tree!("(A:0.5,B:0.25);");
    assert_eq!(tree.len(), 2);
    assert_eq!(tree.to_newick(), "(B:0.75,A:0);");
}

#[test]
fn set_blen_updates_both_half_edges() {
    let mut tree = tree!("((A:1,B:1):1,(C:1,D:1):1);");
    let branch = tree.internal_branches()[0];
    tree.set_blen(&branch, 0.42);
    let (a, b) = branch.ends();
    assert_eq!(tree.neighbour(a, b).unwrap().blen, 0.42);
    assert_eq!(tree.neighbour(b, a).unwrap().blen, 0.42);
    assert_eq!(tree.blen(&branch), 0.42);
}

#[test]
fn branch_is_normalised() {
    let branch = Branch::new(I(5), L(2));
    assert_eq!(branch, Branch::new(L(2), I(5)));
    assert_eq!(branch.ends(), (L(2), I(5)));
    assert_eq!(branch.other(L(2)), Some(I(5)));
    assert_eq!(branch.other(I(3)), None);
    assert!(!branch.is_internal());
    assert!(Branch::new(I(1), I(4)).is_internal());
}

#[test]
fn nni_keeps_node_and_branch_counts() {
    let mut tree = tree!("(((A:1,B:1):1,C:1):1,(D:1,(E:1,F:1):1):1);");
    let leaves = tree.num_leaves();
    assert_eq!(leaves, 6);
    for i in 0..tree.internal_branches().len() {
        let (node1, node2) = tree.internal_branches()[i].ends();
        let swap1 = tree.node(node1).neighbours().iter().find(|n| n.node != node2).unwrap().node;
        let swap2 = tree.node(node2).neighbours().iter().find(|n| n.node != node1).unwrap().node;
        tree.nni(node1, node2, swap1, swap2).unwrap();
        assert_eq!(tree.len(), 2 * leaves - 2);
        assert_eq!(tree.branches().len(), 2 * leaves - 3);
        assert_eq!(tree.preorder().len(), tree.len());
        tree.check_bifurcating("NNI").unwrap();
    }
}

#[test]
fn nni_swaps_subtrees() {
    let taxa = names(&["A", "B", "C", "D"]);
    let mut tree = tree!("((A:1,B:2):0.5,(C:3,D:4):0.5);");
    tree.assign_taxa(&taxa).unwrap();
    let branch = tree.internal_branches()[0];
    let (node1, node2) = branch.ends();
    let a = tree.idx("A").unwrap();
    let c = tree.idx("C").unwrap();
    let (node_a, node_c) = if tree.is_adjacent(node1, a) {
        (node1, node2)
    } else {
        (node2, node1)
    };
    tree.nni(node_a, node_c, a, c).unwrap();
    assert!(tree.is_adjacent(node_a, c));
    assert!(tree.is_adjacent(node_c, a));
    assert_relative_eq!(leaf_blen(&tree, "A"), 1.0);
    assert_relative_eq!(leaf_blen(&tree, "C"), 3.0);
    assert!(sorted_splits(&tree, &taxa).contains(&vec![0, 3]));

    tree.nni(node_a, node_c, c, a).unwrap();
    assert!(tree.is_adjacent(node_a, a));
}

#[test]
fn nni_rejects_invalid_swaps() {
    let mut tree = tree!("((A,B),(C,D));");
    let a = tree.idx("A").unwrap();
    let c = tree.idx("C").unwrap();
    let branch = tree.internal_branches()[0];
    let (node1, node2) = branch.ends();

    let err = tree.nni(a, c, node1, node2).unwrap_err();
    assert_matches!(err.downcast_ref::<StructuralError>(), Some(_));
    let err = tree.nni(node1, node2, node2, node1).unwrap_err();
    assert_matches!(err.downcast_ref::<StructuralError>(), Some(_));
}

#[test]
fn splits_below_every_branch() {
    let taxa = names(&["A", "B", "C", "D", "E"]);
    let mut tree = tree!("((A,B),C,(D,E));");
    tree.assign_taxa(&taxa).unwrap();
    let splits = sorted_splits(&tree, &taxa);
    assert_eq!(splits.len(), 7);
    assert!(splits.contains(&vec![0, 1]));
    assert!(splits.contains(&vec![0, 1, 2]));
    assert!(splits.contains(&vec![0, 1, 2, 3]));
}

#[test]
fn canonical_split_contains_first_present_taxon() {
    let mut present = FixedBitSet::with_capacity(6);
    present.insert_range(1..5);
    let mut split = FixedBitSet::with_capacity(6);
    split.insert(3);
    split.insert(4);
    split.insert(5);
    assert_eq!(canonical_split(&split, &present).ones().collect::<Vec<_>>(), vec![1, 2]);
    split.insert(1);
    assert_eq!(canonical_split(&split, &present).ones().collect::<Vec<_>>(), vec![1, 3, 4]);
}

#[test]
fn restrict_prunes_and_suppresses() {
    let taxa = names(&["A", "B", "C", "D", "E"]);
    let mut tree = tree!("((A:1,B:1):1,C:1,(D:1,E:1):1);");
    tree.assign_taxa(&taxa).unwrap();
    let keep = [Some(0), Some(1), None, Some(2), None];
    let sub = tree.restrict(&keep);
    assert_eq!(sub.num_leaves(), 3);
    assert_eq!(sub.len(), 4);
    assert_eq!(sub.branches().len(), 3);
    assert_relative_eq!(sub.height(), 5.0);
    assert_relative_eq!(leaf_blen(&sub, "D"), 3.0);
    assert_eq!(sub.node(sub.idx("D").unwrap()).taxon, Some(2));
    sub.check_bifurcating("restrict").unwrap();
}

#[test]
fn restrict_to_four_taxa_keeps_quartet() {
    let taxa = names(&["A", "B", "C", "D", "E", "F"]);
    let mut tree = tree!("(((A,B),C),(D,(E,F)));");
    tree.assign_taxa(&taxa).unwrap();
    let keep = [Some(0), None, Some(1), Some(2), None, Some(3)];
    let sub = tree.restrict(&keep);
    assert_eq!(sub.len(), 6);
    assert_eq!(sub.internal_branches().len(), 1);
    let local = names(&["A", "C", "D", "F"]);
    assert!(sorted_splits(&sub, &local).contains(&vec![0, 1]));
}

#[test]
fn restrict_large_tree_to_sparse_taxa() {
    let n = 300;
    let mut newick = String::from("(T0:0.1,T1:0.1)");
    for i in 2..n - 1 {
        newick = format!("({newick}:0.1,T{i}:0.1)");
    }
    newick = format!("({newick}:0.1,T{}:0.1);", n - 1);
    let taxa: Vec<String> = (0..n).map(|i| format!("T{i}")).collect();
    let mut tree = tree!(&newick);
    tree.assign_taxa(&taxa).unwrap();
    let keep: Vec<Option<usize>> = (0..n).map(|i| (i % 60 == 0).then_some(i / 60)).collect();
    let sub = tree.restrict(&keep);
    assert_eq!(sub.num_leaves(), 5);
    assert_eq!(sub.len(), 8);
    assert_eq!(sub.branches().len(), 7);
    sub.check_bifurcating("restrict").unwrap();
}

#[test]
fn removed_nodes_are_reused() {
    let mut tree = tree!("(A:1,B:1,C:1);");
    let c = tree.idx("C").unwrap();
    tree.remove_node(c);
    assert_eq!(tree.len(), 3);
    assert!(tree.by_id("C").is_none());
    let x = tree.add_leaf("X");
    assert_eq!(usize::from(x), usize::from(c));
    assert_eq!(tree.len(), 4);
    assert_eq!(tree.by_id("X").map(|n| n.idx), Some(x));
    assert_eq!(tree.leaves().len(), 3);
}

#[test]
fn stale_branch_is_rejected() {
    let mut tree = tree!("((A,B),(C,D));");
    let branch = tree.internal_branches()[0];
    tree.check_branch(&branch, "test").unwrap();
    let (node1, node2) = branch.ends();
    let swap1 = tree.node(node1).neighbours().iter().find(|n| n.node != node2).unwrap().node;
    let swap2 = tree.node(node2).neighbours().iter().find(|n| n.node != node1).unwrap().node;
    tree.nni(node1, node2, swap1, swap2).unwrap();
    let stale = Branch::new(node1, swap1);
    let err = tree.check_branch(&stale, "test").unwrap_err();
    let err = err.downcast_ref::<StructuralError>().unwrap();
    assert_eq!(err.context(), "test");
}

#[rstest]
#[case::missing_leaf(&["A", "B", "X"])]
#[case::too_many_names(&["A", "B", "C", "D"])]
fn assign_taxa_errors(#[case] ids: &[&str]) {
    let mut tree = tree!("(A,B,C);");
    let err = tree.assign_taxa(&names(ids)).unwrap_err();
    assert_matches!(err.downcast_ref::<DataError>(), Some(_));
}

#[test]
fn assign_taxa_rejects_duplicate_leaves() {
    let mut tree = tree!("(A,B,A);");
    let err = tree.assign_taxa(&names(&["A", "B"])).unwrap_err();
    assert_matches!(err.downcast_ref::<DataError>(), Some(_));
}

#[test]
fn nj_recovers_additive_tree() {
    let distances = dmatrix![
        0.0, 5.0, 9.0, 9.0, 8.0;
        5.0, 0.0, 10.0, 10.0, 9.0;
        9.0, 10.0, 0.0, 8.0, 7.0;
        9.0, 10.0, 8.0, 0.0, 3.0;
        8.0, 9.0, 7.0, 3.0, 0.0
    ];
    let taxa = names(&["a", "b", "c", "d", "e"]);
    let tree = NJBuilder::new(0)
        .build_from_distances(&taxa, distances)
        .unwrap();
    assert_eq!(tree.num_leaves(), 5);
    assert_eq!(tree.len(), 8);
    for (id, blen) in [("a", 2.0), ("b", 3.0), ("c", 4.0), ("d", 2.0), ("e", 1.0)] {
        assert_relative_eq!(leaf_blen(&tree, id), blen, epsilon = 1e-10);
    }
    assert_relative_eq!(tree.height(), 17.0, epsilon = 1e-10);
}

#[test]
fn nj_small_inputs() {
    let mut builder = NJBuilder::new(0);
    let two = builder
        .build_from_distances(&names(&["a", "b"]), dmatrix![0.0, 0.3; 0.3, 0.0])
        .unwrap();
    assert_eq!(two.len(), 2);
    assert_relative_eq!(two.height(), 0.3);

    let one = builder
        .build_from_distances(&names(&["a"]), dmatrix![0.0])
        .unwrap();
    assert_eq!(one.len(), 1);
    assert!(one.branches().is_empty());

    assert!(builder
        .build_from_distances(&names(&["a", "b"]), dmatrix![0.0])
        .is_err());
}

#[test]
fn nj_from_super_alignment() {
    let gene = Alignment::from_records(
        &[
            record!("A", b"AAAAAAAAAA"),
            record!("B", b"AAAAAAAAAC"),
            record!("C", b"CCAAAAAAGG"),
            record!("D", b"CCAAAAAAGT"),
        ],
        SeqType::Dna,
    )
    .unwrap();
    let alignment = SuperAlignment::from_partitions(vec![gene]);
    let tree = NJBuilder::new(7).build_tree(&alignment).unwrap();
    assert_eq!(tree.num_leaves(), 4);
    assert!(tree.leaves().iter().all(|leaf| leaf.taxon.is_some()));
    assert!(sorted_splits(&tree, alignment.names()).contains(&vec![0, 1]));
}
