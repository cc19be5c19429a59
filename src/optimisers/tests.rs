use std::time::Duration;

use approx::assert_relative_eq;
use assert_matches::assert_matches;
use fixedbitset::FixedBitSet;
use hashbrown::HashSet;
use rstest::*;

use crate::alignment::Alignment;
use crate::alphabets::SeqType;
use crate::errors::StructuralError;
use crate::likelihood::{F81Likelihood, TreeCost, TreeCostBuilder, TreeSearchCost};
use crate::optimisers::{
    brent_maximise, do_nni_search, optimise_all_branches, optimise_single_branch,
    select_conflict_free, BranchOptimiser, BranchSettings, CutoffEstimation, NniMove,
    NniOptimiser, NniScope, SearchConfig, StopReason,
};
use crate::tree::{canonical_split, Tree};
use crate::{record_wo_desc as record, tree};

fn quartet_alignment() -> Alignment {
    Alignment::from_records(
        &[
            record!("A", b"AAAAAAAAAACCCCCGGGGTTTTACGT"),
            record!("B", b"AAAAAAAAAACCCCCGGGGTTTTACGA"),
            record!("C", b"CCCCCAAAAAGGGGGTTTTAAAAACGT"),
            record!("D", b"CCCCCAAAAAGGGGGTTTTAAAAACGA"),
        ],
        SeqType::Dna,
    )
    .unwrap()
}

fn six_taxa_alignment() -> Alignment {
    Alignment::from_records(
        &[
            record!("A", b"ACGTACGTACGTTTGACCAGTACGATCGA"),
            record!("B", b"ACGTACGTACGTTTGACCAGTACGATCGT"),
            record!("C", b"ACGTTCGAACGATTGACCTGTACCATCGT"),
            record!("D", b"ACGTTCGAACGATTGACGTGTACCATCCT"),
            record!("E", b"TCCTTCGAAGGATAGACGTGAACCTTCCT"),
            record!("F", b"TCCTTCGAAGGATAGACGTGAACCTTGCT"),
        ],
        SeqType::Dna,
    )
    .unwrap()
}

fn cost_for(alignment: Alignment, newick: &str) -> TreeCost {
    TreeCostBuilder::new(F81Likelihood::jc(alignment), tree!(newick))
        .build()
        .unwrap()
}

fn has_split(tree: &Tree, num_taxa: usize, taxa: &[usize]) -> bool {
    let mut present = FixedBitSet::with_capacity(num_taxa);
    present.insert_range(..);
    let mut wanted = FixedBitSet::with_capacity(num_taxa);
    wanted.extend(taxa.iter().copied());
    let wanted = canonical_split(&wanted, &present);
    tree.splits(num_taxa)
        .iter()
        .any(|(_, split)| canonical_split(split, &present) == wanted)
}

fn caterpillar(n: usize) -> String {
    let mut newick = String::from("(T0:0.1,T1:0.1)");
    for i in 2..n - 1 {
        newick = format!("({newick}:0.1,T{i}:0.1)");
    }
    format!("({newick}:0.1,T{}:0.1);", n - 1)
}

#[test]
fn newton_on_concave_function() {
    let settings = BranchSettings::default();
    let res = optimise_single_branch(&settings, 0.5, |x| {
        (-(x - 2.0) * (x - 2.0), -2.0 * (x - 2.0), -2.0)
    })
    .unwrap();
    assert_relative_eq!(res.value, 2.0, epsilon = 1e-9);
    assert_relative_eq!(res.final_cost, 0.0, epsilon = 1e-12);
    assert_relative_eq!(res.initial_cost, -2.25);
    assert!(!res.retained);
}

#[test]
fn brent_takes_over_on_convex_start() {
    let settings = BranchSettings::default();
    let f = |x: f64| {
        let e = (-x).exp();
        (x * e, (1.0 - x) * e, (x - 2.0) * e)
    };
    let res = optimise_single_branch(&settings, 5.0, f).unwrap();
    assert_relative_eq!(res.value, 1.0, epsilon = 1e-3);
    assert!(res.final_cost > res.initial_cost);
}

#[test]
fn result_is_clamped_to_bounds() {
    let settings = BranchSettings::default();
    let res = optimise_single_branch(&settings, 1.0, |x| {
        (-(x + 1.0) * (x + 1.0), -2.0 * (x + 1.0), -2.0)
    })
    .unwrap();
    assert_eq!(res.value, settings.min_blen);

    let res = optimise_single_branch(&settings, 1.0, |x| (x, 1.0, 0.0)).unwrap();
    assert!(res.value <= settings.max_blen);
    assert!(res.value > settings.max_blen - 0.1);
}

#[test]
fn start_is_retained_when_nothing_is_better() {
    let settings = BranchSettings::default();
    let res = optimise_single_branch(&settings, 0.0, |x| (-x * x, -2.0 * x, -2.0)).unwrap();
    assert!(res.retained);
    assert_eq!(res.value, 0.0);
    assert_eq!(res.final_cost, res.initial_cost);
}

#[test]
fn brent_maximum() {
    let mut f = |x: f64| -(x - 0.5) * (x - 0.5);
    let (x, fx) = brent_maximise(0.0, 1.0, 0.1, 100, &mut f).unwrap();
    assert_relative_eq!(x, 0.5, epsilon = 1e-5);
    assert_relative_eq!(fx, 0.0, epsilon = 1e-9);
}

#[test]
fn branch_optimisation_never_lowers_logl() {
    let mut cost = cost_for(
        six_taxa_alignment(),
        "((A:1,B:1):1,(C:1,D:1):1,(E:1,F:1):1);",
    );
    let initial = cost.cost();
    let res = BranchOptimiser::new(&mut cost).max_iterations(5).run().unwrap();
    assert_relative_eq!(res.initial_cost, initial);
    assert!(res.final_cost > initial);
    assert!(res.iterations <= 5);
    assert_relative_eq!(res.final_cost, cost.cost());

    let again = optimise_all_branches(&mut cost, 10, 1e-6).unwrap();
    assert!(again >= res.final_cost - 1e-9);
}

#[test]
fn candidates_around_internal_branch() {
    let tree = tree!("((A,B),(C,D));");
    let branch = tree.internal_branches()[0];
    let moves = NniMove::candidates(&tree, &branch).unwrap();
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[0].swap1, moves[1].swap1);
    assert_ne!(moves[0].swap2, moves[1].swap2);
    for mv in &moves {
        let branches: HashSet<_> = mv.branches().into_iter().collect();
        assert_eq!(branches.len(), 5);
        assert!(branches.contains(&branch));
    }

    let leaf_branch = tree.branches().into_iter().find(|b| !b.is_internal()).unwrap();
    assert!(NniMove::candidates(&tree, &leaf_branch).unwrap().is_empty());
}

#[test]
fn candidates_reject_multifurcations() {
    let tree = tree!("((A,B,E),(C,D));");
    let branch = tree.internal_branches()[0];
    let err = NniMove::candidates(&tree, &branch).unwrap_err();
    assert_matches!(err.downcast_ref::<StructuralError>(), Some(_));
}

#[test]
fn inverse_move_restores_logl() {
    let mut cost = cost_for(six_taxa_alignment(), "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1,(E:0.1,F:0.1):0.1);");
    let before = cost.cost();
    let newick = cost.tree().to_newick();
    for branch in cost.tree().internal_branches() {
        for mv in NniMove::candidates(cost.tree(), &branch).unwrap() {
            cost.do_nni(&mv).unwrap();
            cost.cost();
            cost.do_nni(&mv.inverse()).unwrap();
            assert_relative_eq!(cost.cost(), before, epsilon = 1e-6);
            assert_eq!(cost.tree().to_newick(), newick);
        }
    }
}

#[test]
fn conflict_free_selection_is_greedy() {
    let tree = tree!(&caterpillar(8));
    let mut moves = Vec::new();
    for branch in tree.internal_branches() {
        moves.extend(NniMove::candidates(&tree, &branch).unwrap());
    }
    for (i, mv) in moves.iter_mut().enumerate() {
        mv.delta = 100.0 - i as f64;
    }
    let selected = select_conflict_free(&moves);
    assert_eq!(selected[0], moves[0]);
    assert!(selected.len() > 1);
    let mut seen = HashSet::new();
    for mv in &selected {
        for branch in mv.branches() {
            assert!(seen.insert(branch), "{branch} used twice");
        }
    }
}

#[test]
fn quartet_search_finds_better_topology() {
    let mut cost = cost_for(
        quartet_alignment(),
        "((A:0.1,C:0.1):0.1,(B:0.1,D:0.1):0.1);",
    );
    let start = cost.cost();
    let res = NniOptimiser::new(&mut cost).run().unwrap();
    assert!(res.final_cost > start);
    assert_relative_eq!(res.initial_cost, start);
    assert_eq!(res.applied[0].len(), 1);
    assert!(res.applied[0][0].delta > 0.0);
    assert_eq!(res.stop_reason, StopReason::LocalOptimum);
    assert!(has_split(cost.tree(), 4, &[0, 1]));
    assert_relative_eq!(res.final_cost, cost.cost());
}

#[rstest]
#[case::central(NniScope::CentralBranch)]
#[case::five(NniScope::FiveBranches)]
fn search_rounds_improve_and_do_not_conflict(#[case] scope: NniScope) {
    let mut cost = cost_for(
        six_taxa_alignment(),
        "((A:0.1,C:0.1):0.1,(B:0.1,E:0.1):0.1,(D:0.1,F:0.1):0.1);",
    );
    let config = SearchConfig {
        scope,
        ..SearchConfig::default()
    };
    let res = NniOptimiser::new(&mut cost).config(config).run().unwrap();
    assert!(res.final_cost > res.initial_cost);
    assert_eq!(res.rounds, res.applied.len() + 1);
    assert_eq!(res.moves_applied, res.applied.iter().map(Vec::len).sum::<usize>());
    for batch in &res.applied {
        let mut seen = HashSet::new();
        for mv in batch {
            for branch in mv.branches() {
                assert!(seen.insert(branch));
            }
        }
    }
    assert_eq!(cost.tree().len(), 10);
    cost.tree().check_bifurcating("test").unwrap();
}

#[test]
fn approximate_search_agrees_with_exact() {
    let mut exact = cost_for(
        quartet_alignment(),
        "((A:0.1,C:0.1):0.1,(B:0.1,D:0.1):0.1);",
    );
    let mut approximate = exact.clone();
    do_nni_search(&mut exact, 1e-6, false).unwrap();
    let config = SearchConfig {
        approximate: true,
        cutoff_estimation: Some(CutoffEstimation {
            min_samples: 1,
            z: 2.0,
        }),
        ..SearchConfig::default()
    };
    let res = NniOptimiser::new(&mut approximate).config(config).run().unwrap();
    assert!(res.moves_applied >= 1);
    assert!(has_split(approximate.tree(), 4, &[0, 1]));
    assert!(has_split(exact.tree(), 4, &[0, 1]));
}

#[test]
fn search_budgets() {
    let mut cost = cost_for(
        quartet_alignment(),
        "((A:0.1,C:0.1):0.1,(B:0.1,D:0.1):0.1);",
    );
    let res = NniOptimiser::new(&mut cost)
        .config(SearchConfig {
            max_rounds: 0,
            ..SearchConfig::default()
        })
        .run()
        .unwrap();
    assert_eq!(res.stop_reason, StopReason::MaxRounds);
    assert_eq!(res.moves_applied, 0);
    assert_eq!(res.final_cost, res.initial_cost);

    let res = NniOptimiser::new(&mut cost)
        .config(SearchConfig {
            max_time: Some(Duration::ZERO),
            ..SearchConfig::default()
        })
        .run()
        .unwrap();
    assert_eq!(res.stop_reason, StopReason::TimeLimit);
    assert_eq!(res.rounds, 0);
}

#[test]
fn search_rejects_multifurcating_trees() {
    let mut cost = cost_for(quartet_alignment(), "(A:0.1,B:0.1,C:0.1,D:0.1);");
    let err = NniOptimiser::new(&mut cost).run().unwrap_err();
    assert_matches!(err.downcast_ref::<StructuralError>(), Some(_));
}

#[rstest]
#[case::central(NniScope::CentralBranch)]
#[case::five(NniScope::FiveBranches)]
fn unconverged_lengths_do_not_favour_a_swap(#[case] scope: NniScope) {
    let cost = cost_for(quartet_alignment(), "((A:0.05,B:0.05):2,(C:0.05,D:0.05):2);");
    let mut base = cost.clone();
    let base_cost = base.cost();
    let branch = cost.tree().internal_branches()[0];
    let best = cost
        .best_nni_for_branch(&branch, scope, base_cost)
        .unwrap()
        .unwrap();
    let mv = NniMove::candidates(cost.tree(), &branch).unwrap()[0];
    let unchanged = cost.evaluate_unchanged(&mv, scope).unwrap();
    assert!(unchanged >= base_cost);
    assert!(best.delta < 0.0);
    assert_relative_eq!(best.delta, best.logl - unchanged);
}

#[test]
fn search_ends_where_no_swap_helps() {
    let mut cost = cost_for(quartet_alignment(), "((A:0.05,B:0.05):2,(C:0.05,D:0.05):2);");
    let res = NniOptimiser::new(&mut cost).run().unwrap();
    assert_eq!(res.moves_applied, 0);
    assert_eq!(res.rounds, 1);
    assert_eq!(res.stop_reason, StopReason::LocalOptimum);
    assert!(res.final_cost > res.initial_cost);
    assert!(has_split(cost.tree(), 4, &[0, 1]));
}
