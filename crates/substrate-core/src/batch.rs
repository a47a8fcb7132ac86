//! # Batches
//!
//! A `Batch` collects the new rows of one partition until it is handed to
//! the writer. Rows enter only through `absorb_*`, which asks the cache to
//! claim each identity: a row is pushed only by the worker that claimed
//! it, so batches never carry rows already durable or owned by another
//! batch. Rating deltas and evidence are not identities; they are always
//! carried and merged. Both are kept in key order (relation, and
//! `(content, relation)`), the order of their tables; arrival order within
//! the partition is not recorded.
//!
//! After handoff a batch is owned by the writer and never touched again by
//! its producer.

use crate::cache::SubstrateCache;
use crate::compute::{CompositionBundle, RelationBundle};
use crate::types::{
    Atom, Composition, CompositionMembership, ContentHash, Physicality, RatingDelta, Relation,
    RelationEvidence, RelationMembership,
};
use std::collections::{BTreeMap, BTreeSet};

/// Rows bound for one write transaction.
#[derive(Debug, Default)]
pub struct Batch {
    pub id: u64,
    pub atoms: Vec<Atom>,
    pub physicalities: Vec<Physicality>,
    pub compositions: Vec<Composition>,
    pub composition_members: Vec<CompositionMembership>,
    pub relations: Vec<Relation>,
    pub relation_members: Vec<RelationMembership>,
    pub ratings: BTreeMap<ContentHash, RatingDelta>,
    /// Deduplicated, ordered by `(content, relation)`.
    pub evidence: BTreeSet<RelationEvidence>,
}

impl Batch {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Item count, compared against the flush threshold.
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
            + self.physicalities.len()
            + self.compositions.len()
            + self.composition_members.len()
            + self.relations.len()
            + self.relation_members.len()
            + self.ratings.len()
            + self.evidence.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim an atom row.
    pub fn absorb_atom(&mut self, atom: Atom, cache: &SubstrateCache) -> bool {
        if cache.claim(atom.hash) {
            self.atoms.push(atom);
            true
        } else {
            false
        }
    }

    /// Claim the rows of a composition bundle. Returns the number of rows
    /// added.
    pub fn absorb_composition(&mut self, bundle: CompositionBundle, cache: &SubstrateCache) -> usize {
        let before = self.len();
        for atom in bundle.atoms {
            self.absorb_atom(atom, cache);
        }
        if cache.claim(bundle.physicality.hash) {
            self.physicalities.push(bundle.physicality);
        }
        if cache.claim(bundle.composition.hash) {
            self.compositions.push(bundle.composition);
            self.composition_members.extend(bundle.members);
        }
        self.len() - before
    }

    /// Claim the rows of a relation bundle and record the observation.
    pub fn absorb_relation(&mut self, bundle: RelationBundle, cache: &SubstrateCache) -> usize {
        let before = self.len();
        if cache.claim(bundle.physicality.hash) {
            self.physicalities.push(bundle.physicality);
        }
        if cache.claim(bundle.relation.hash) {
            self.relations.push(bundle.relation);
            self.relation_members.extend(bundle.members);
        }
        self.ratings
            .entry(bundle.rating.relation)
            .and_modify(|delta| delta.merge(&bundle.rating))
            .or_insert(bundle.rating);
        self.evidence.insert(bundle.evidence);
        self.len() - before
    }

    /// Identities this batch claimed in the cache.
    pub fn claimed_hashes(&self) -> impl Iterator<Item = &ContentHash> {
        self.atoms
            .iter()
            .map(|a| &a.hash)
            .chain(self.physicalities.iter().map(|p| &p.hash))
            .chain(self.compositions.iter().map(|c| &c.hash))
            .chain(self.relations.iter().map(|r| &r.hash))
    }

    /// Fold `other` into this batch. Claims are disjoint across batches,
    /// so identity rows concatenate; observations merge.
    pub fn merge(&mut self, other: Batch) {
        self.atoms.extend(other.atoms);
        self.physicalities.extend(other.physicalities);
        self.compositions.extend(other.compositions);
        self.composition_members.extend(other.composition_members);
        self.relations.extend(other.relations);
        self.relation_members.extend(other.relation_members);
        for (relation, delta) in other.ratings {
            self.ratings
                .entry(relation)
                .and_modify(|d| d.merge(&delta))
                .or_insert(delta);
        }
        self.evidence.extend(other.evidence);
    }

    /// Rows of identity tables (everything except ratings and evidence).
    #[must_use]
    pub fn identity_rows(&self) -> usize {
        self.atoms.len() + self.physicalities.len() + self.compositions.len() + self.relations.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
