use std::collections::{BTreeMap, BTreeSet};

use quarry_submitter::selector::{dominated_patches, select_new_submissions, CoverMap};

fn cover(entries: &[(i32, &[i32])]) -> CoverMap {
    entries
        .iter()
        .map(|(id, profiles)| (*id, profiles.iter().copied().collect::<BTreeSet<i32>>()))
        .collect::<BTreeMap<_, _>>()
}

/// Profiles {A,B,C} with p1={A}, p2={A,B}, p3={A,B,C}, p4={B,C}: p4's
/// coverage is a subset of p3's, so only p3 survives.
#[test]
fn patch_selection_with_domination() {
    const A: i32 = 1;
    const B: i32 = 2;
    const C: i32 = 3;
    let map = cover(&[(1, &[A]), (2, &[A, B]), (3, &[A, B, C]), (4, &[B, C])]);

    let dominated = dominated_patches(&map);
    assert_eq!(dominated, [1, 2, 4].into_iter().collect::<BTreeSet<i32>>());

    let selected = select_new_submissions(&map, &BTreeSet::new());
    assert_eq!(selected, vec![3]);
}

/// Selecting twice with the first round's results marked submitted adds
/// nothing: coverage accumulation is idempotent across scans.
#[test]
fn rescan_after_submission_selects_nothing_new() {
    let map = cover(&[(1, &[10]), (2, &[11]), (3, &[12, 13])]);
    let first = select_new_submissions(&map, &BTreeSet::new());
    assert_eq!(first, vec![1, 2, 3]);

    let submitted: BTreeSet<i32> = first.into_iter().collect();
    let second = select_new_submissions(&map, &submitted);
    assert!(second.is_empty());
}

/// Patches with empty coverage are never selected.
#[test]
fn empty_coverage_is_never_submitted() {
    let map = cover(&[(1, &[]), (2, &[10])]);
    let selected = select_new_submissions(&map, &BTreeSet::new());
    assert_eq!(selected, vec![2]);
}

/// Two equal coverages do not dominate each other (proper subset required),
/// but the second adds no new profile and is skipped.
#[test]
fn equal_coverage_ties_pick_one() {
    let map = cover(&[(1, &[10]), (2, &[10])]);
    let dominated = dominated_patches(&map);
    assert!(dominated.is_empty());

    let selected = select_new_submissions(&map, &BTreeSet::new());
    assert_eq!(selected, vec![1]);
}
