//! # Relation Ratings
//!
//! Confidence accounting for relations.
//!
//! - Every relation kind has a baseline rating
//! - Each further observation adds `RATING_STEP`
//! - A row remembers the highest baseline it was observed under
//!
//! The merge is commutative and associative: the final row depends only on
//! the multiset of observations, never on the order batches commit in.
//! Integer arithmetic, saturating.

use crate::types::{ContentHash, RatingDelta, RelationKind, RelationRating};

/// Rating points added per observation after the first.
pub const RATING_STEP: i64 = 8;

/// Baseline rating of a relation first observed as `kind`.
#[must_use]
pub const fn baseline(kind: RelationKind) -> i64 {
    match kind {
        RelationKind::CoOccurrence => 900,
        RelationKind::Adjacency => 1000,
        RelationKind::Dependency => 1200,
        RelationKind::Lexical => 1300,
        RelationKind::Translation => 1400,
    }
}

/// Rating of a row with the given seed after `observations` observations.
#[must_use]
pub fn rating_for(seed: i64, observations: u64) -> i64 {
    let extra = i64::try_from(observations.saturating_sub(1)).unwrap_or(i64::MAX);
    seed.saturating_add(RATING_STEP.saturating_mul(extra))
}

impl RatingDelta {
    /// A single observation under `base_rating`.
    #[must_use]
    pub fn observe(relation: ContentHash, base_rating: i64) -> Self {
        Self {
            relation,
            seed: base_rating,
            observations: 1,
        }
    }

    /// Fold another delta for the same relation into this one.
    pub fn merge(&mut self, other: &RatingDelta) {
        debug_assert_eq!(self.relation, other.relation);
        self.seed = self.seed.max(other.seed);
        self.observations = self.observations.saturating_add(other.observations);
    }
}

impl RelationRating {
    /// First row for a relation.
    #[must_use]
    pub fn from_delta(delta: &RatingDelta) -> Self {
        Self {
            relation: delta.relation,
            seed: delta.seed,
            observations: delta.observations,
            rating: rating_for(delta.seed, delta.observations),
        }
    }

    /// Apply new observations incrementally.
    pub fn apply(&mut self, delta: &RatingDelta) {
        let seed = self.seed.max(delta.seed);
        let added = i64::try_from(delta.observations).unwrap_or(i64::MAX);
        self.rating = self
            .rating
            .saturating_add(seed.saturating_sub(self.seed))
            .saturating_add(RATING_STEP.saturating_mul(added));
        self.seed = seed;
        self.observations = self.observations.saturating_add(delta.observations);
    }
}

// =============================================================================
// TESTS
// =============================================================================
