//! # Property-Based Tests
//!
//! Determinism, identity and termination invariants, checked with proptest.

use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;
use substrate_core::hashing::atom_hash;
use substrate_core::rating::baseline;
use substrate_core::{
    ContentHash, Point4, ProjectedAtoms, RatingDelta, RelationKind, RelationRating, WalkCandidate,
    WalkConfig, WalkEngine, compute_composition, project, spatial,
};

const KINDS: [RelationKind; 5] = [
    RelationKind::Adjacency,
    RelationKind::CoOccurrence,
    RelationKind::Dependency,
    RelationKind::Lexical,
    RelationKind::Translation,
];

fn node(i: u8) -> ContentHash {
    ContentHash([i; 32])
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Projection is a pure function of the codepoint.
    #[test]
    fn projection_is_bit_identical(cp in 0u32..0x11_0000) {
        let a = project(cp).expect("in range");
        let b = project(cp).expect("in range");
        prop_assert_eq!(a.hash, b.hash);
        prop_assert_eq!(a.position.to_bits(), b.position.to_bits());
        prop_assert_eq!(a.spatial_index, b.spatial_index);
        prop_assert!(a.position.is_unit());
    }

    /// Composing the same text twice yields the same hash and centroid.
    #[test]
    fn composition_is_pure(text in "\\PC{1,24}") {
        let a = compute_composition(&text, &ProjectedAtoms).into_valid().expect("valid");
        let b = compute_composition(&text, &ProjectedAtoms).into_valid().expect("valid");
        prop_assert_eq!(a.handle.hash, b.handle.hash);
        prop_assert_eq!(a.handle.centroid.to_bits(), b.handle.centroid.to_bits());
        prop_assert_eq!(a.composition, b.composition);
    }

    /// Equal atom sequences share a hash; any difference separates them.
    #[test]
    fn composition_hash_tracks_sequence(a in "[a-e]{1,8}", b in "[a-e]{1,8}") {
        let ha = compute_composition(&a, &ProjectedAtoms).into_valid().expect("valid").handle.hash;
        let hb = compute_composition(&b, &ProjectedAtoms).into_valid().expect("valid").handle.hash;
        prop_assert_eq!(a == b, ha == hb);
    }

    /// The final rating depends only on the multiset of observations.
    #[test]
    fn ratings_are_order_independent(kinds in vec(0usize..5, 1..20)) {
        let relation = atom_hash(1);
        let deltas: Vec<RatingDelta> = kinds
            .iter()
            .map(|&k| RatingDelta::observe(relation, baseline(KINDS[k])))
            .collect();

        let mut forward = RelationRating::from_delta(&deltas[0]);
        for d in &deltas[1..] {
            forward.apply(d);
        }

        let last = deltas.len() - 1;
        let mut backward = RelationRating::from_delta(&deltas[last]);
        for d in deltas[..last].iter().rev() {
            backward.apply(d);
        }

        let mut merged = deltas[0];
        for d in &deltas[1..] {
            merged.merge(d);
        }
        let batched = RelationRating::from_delta(&merged);

        prop_assert_eq!(forward, backward);
        prop_assert_eq!(forward, batched);
        prop_assert_eq!(forward.observations, deltas.len() as u64);
    }

    /// Every walk stops within its step bound and is reproducible.
    #[test]
    fn walks_terminate(
        edges in vec((0u8..12, 0u8..12, 0i64..3000), 0..60),
        start in 0u8..12,
        energy in 0u32..200,
        cost in prop::sample::select(vec![0.25f64, 0.5, 1.0, 2.0]),
        temperature in prop::sample::select(vec![0.0f64, 0.5, 1.0, 10.0]),
        seed in any::<u64>(),
    ) {
        let mut graph: BTreeMap<ContentHash, Vec<WalkCandidate>> = BTreeMap::new();
        for (i, &(from, to, rating)) in edges.iter().enumerate() {
            let relation = atom_hash(i as u32);
            graph.entry(node(from)).or_default().push(WalkCandidate {
                relation,
                target: node(to),
                rating,
            });
        }
        let config = WalkConfig {
            energy: f64::from(energy),
            step_cost: cost,
            temperature,
            seed,
            ..WalkConfig::default()
        };
        let bound = config.max_step_bound();

        let first = WalkEngine::new(&graph, node(start), config).expect("engine").run().expect("walk");
        let second = WalkEngine::new(&graph, node(start), config).expect("engine").run().expect("walk");
        prop_assert!(first.steps.len() <= bound);
        prop_assert_eq!(first.path(), second.path());
        prop_assert_eq!(first.termination, second.termination);
    }
}

// =============================================================================
// LOCALITY
// =============================================================================

/// Nearest neighbours on the sphere usually land close on the curve. Compares
/// the median key gap of brute-force nearest-neighbour pairs with that of
/// arbitrary pairs over a fixed sample.
#[test]
fn hilbert_keys_follow_geometry() {
    let points: Vec<Point4> = (0..1500u32)
        .map(|i| project(i.wrapping_mul(727) % 0x11_0000).expect("in range").position)
        .collect();
    let keys: Vec<u64> = points.iter().map(spatial::encode).collect();

    let mut near_gaps = Vec::new();
    let mut far_gaps = Vec::new();
    for i in 0..200 {
        let nearest = (0..points.len())
            .filter(|&j| j != i)
            .min_by(|&a, &b| {
                points[i]
                    .geodesic_distance(&points[a])
                    .total_cmp(&points[i].geodesic_distance(&points[b]))
            })
            .expect("neighbour");
        near_gaps.push(keys[i].abs_diff(keys[nearest]));
        far_gaps.push(keys[i].abs_diff(keys[(i * 7 + 500) % points.len()]));
    }
    near_gaps.sort_unstable();
    far_gaps.sort_unstable();
    let near_median = near_gaps[near_gaps.len() / 2];
    let far_median = far_gaps[far_gaps.len() / 2];
    assert!(
        near_median < far_median / 4,
        "near median {near_median}, far median {far_median}"
    );
}
