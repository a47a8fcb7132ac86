//! # Substrate Service
//!
//! Pure compute: turns text or resolved compositions into candidate rows.
//!
//! Nothing here touches storage or the cache. Every function is
//! referentially transparent, so partitions can call them in parallel
//! without coordination; deduplication against prior state is the caller's
//! job (see `batch`).
//!
//! Unrepresentable input is not an error: it comes back as
//! `Computed::Invalid`, which the caller must check.

use crate::geometry::{Point4, centroid};
use crate::hashing::{composition_hash, physicality_hash, relation_hash};
use crate::projection;
use crate::spatial;
use crate::types::{
    Atom, Composition, CompositionMembership, ContentHash, NodeKind, Physicality, RatingDelta,
    Relation, RelationEvidence, RelationMembership,
};
use std::collections::BTreeMap;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Why an input has no representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    /// Nothing to compose (empty text, fewer than two endpoints).
    Empty,
    /// A codepoint the atom lookup cannot resolve.
    UnresolvedCodepoint(u32),
    /// The children's mean has no direction (e.g. antipodal endpoints).
    DegenerateCentroid,
}

/// Outcome of a compute call.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed<T> {
    Valid(T),
    Invalid(Invalid),
}

impl<T> Computed<T> {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Computed::Valid(_))
    }

    /// The value, dropping the reason if invalid.
    #[must_use]
    pub fn into_valid(self) -> Option<T> {
        match self {
            Computed::Valid(v) => Some(v),
            Computed::Invalid(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Computed<U> {
        match self {
            Computed::Valid(v) => Computed::Valid(f(v)),
            Computed::Invalid(reason) => Computed::Invalid(reason),
        }
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Lightweight reference to a computed composition, cheap to memoize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositionHandle {
    pub hash: ContentHash,
    pub centroid: Point4,
    pub level: u8,
}

/// One child of a composition: an atom or a lower composition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildHandle {
    pub hash: ContentHash,
    pub point: Point4,
    pub kind: NodeKind,
    pub level: u8,
}

impl From<&Atom> for ChildHandle {
    fn from(atom: &Atom) -> Self {
        Self {
            hash: atom.hash,
            point: atom.position,
            kind: NodeKind::Atom,
            level: 0,
        }
    }
}

impl From<&CompositionHandle> for ChildHandle {
    fn from(handle: &CompositionHandle) -> Self {
        Self {
            hash: handle.hash,
            point: handle.centroid,
            kind: NodeKind::Composition,
            level: handle.level,
        }
    }
}

// =============================================================================
// ATOM LOOKUP
// =============================================================================

/// Resolves codepoints to atoms.
pub trait AtomLookup {
    fn resolve(&self, codepoint: u32) -> Option<Atom>;
}

/// Resolves every codepoint by projecting it. Needs no table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectedAtoms;

impl AtomLookup for ProjectedAtoms {
    fn resolve(&self, codepoint: u32) -> Option<Atom> {
        projection::atom(codepoint)
    }
}

impl AtomLookup for BTreeMap<u32, Atom> {
    fn resolve(&self, codepoint: u32) -> Option<Atom> {
        self.get(&codepoint).cloned()
    }
}

// =============================================================================
// BUNDLES
// =============================================================================

/// Candidate rows for one composition.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionBundle {
    pub handle: CompositionHandle,
    pub composition: Composition,
    pub physicality: Physicality,
    pub members: Vec<CompositionMembership>,
    /// Distinct atoms referenced, in first-seen order. Empty for
    /// compositions of compositions.
    pub atoms: Vec<Atom>,
}

/// Candidate rows for one relation observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationBundle {
    pub relation: Relation,
    pub physicality: Physicality,
    pub members: Vec<RelationMembership>,
    pub rating: RatingDelta,
    pub evidence: RelationEvidence,
}

// =============================================================================
// COMPUTE
// =============================================================================

/// Compose `text` from its codepoints.
pub fn compute_composition(text: &str, atoms: &impl AtomLookup) -> Computed<CompositionBundle> {
    let mut resolved: Vec<Atom> = Vec::new();
    let mut children = Vec::with_capacity(text.len());
    for c in text.chars() {
        let codepoint = c as u32;
        let Some(atom) = atoms.resolve(codepoint) else {
            return Computed::Invalid(Invalid::UnresolvedCodepoint(codepoint));
        };
        children.push(ChildHandle::from(&atom));
        if !resolved.iter().any(|a| a.hash == atom.hash) {
            resolved.push(atom);
        }
    }
    compute_sequence(&children).map(|mut bundle| {
        bundle.atoms = resolved;
        bundle
    })
}

/// Compose an ordered sequence of children.
pub fn compute_sequence(children: &[ChildHandle]) -> Computed<CompositionBundle> {
    let runs = runs(children.iter().map(|c| (c.hash, c)));
    if runs.is_empty() {
        return Computed::Invalid(Invalid::Empty);
    }

    let Some(center) = centroid(runs.iter().map(|(child, n)| (&child.point, *n))) else {
        return Computed::Invalid(Invalid::DegenerateCentroid);
    };
    let trajectory: Vec<Point4> = runs.iter().map(|(child, _)| child.point).collect();
    let physicality = physicality_row(center, trajectory);

    let keys: Vec<(ContentHash, u32)> = runs.iter().map(|(c, n)| (c.hash, *n)).collect();
    let hash = composition_hash(&keys);
    let level = runs
        .iter()
        .map(|(c, _)| c.level)
        .max()
        .unwrap_or(0)
        .saturating_add(1);

    let members = runs
        .iter()
        .enumerate()
        .map(|(ordinal, (child, occurrences))| CompositionMembership {
            composition: hash,
            child: child.hash,
            child_kind: child.kind,
            ordinal: ordinal_of(ordinal),
            occurrences: *occurrences,
        })
        .collect();

    Computed::Valid(CompositionBundle {
        handle: CompositionHandle {
            hash,
            centroid: center,
            level,
        },
        composition: Composition {
            hash,
            physicality: physicality.hash,
            length: keys.iter().map(|(_, n)| u64::from(*n)).sum(),
            level,
        },
        physicality,
        members,
        atoms: Vec::new(),
    })
}

/// Relate two compositions, observed in `source` under `base_rating`.
pub fn compute_relation(
    a: &CompositionHandle,
    b: &CompositionHandle,
    source: ContentHash,
    base_rating: i64,
) -> Computed<RelationBundle> {
    compute_relation_n(&[*a, *b], source, base_rating)
}

/// Relate an ordered list of two or more compositions.
pub fn compute_relation_n(
    endpoints: &[CompositionHandle],
    source: ContentHash,
    base_rating: i64,
) -> Computed<RelationBundle> {
    if endpoints.len() < 2 {
        return Computed::Invalid(Invalid::Empty);
    }
    let runs = runs(endpoints.iter().map(|e| (e.hash, e)));

    let Some(center) = centroid(runs.iter().map(|(e, n)| (&e.centroid, *n))) else {
        return Computed::Invalid(Invalid::DegenerateCentroid);
    };
    let trajectory: Vec<Point4> = runs.iter().map(|(e, _)| e.centroid).collect();
    let physicality = physicality_row(center, trajectory);

    let keys: Vec<(ContentHash, u32)> = runs.iter().map(|(e, n)| (e.hash, *n)).collect();
    let hash = relation_hash(&keys);

    let members = keys
        .iter()
        .enumerate()
        .map(|(ordinal, (composition, occurrences))| RelationMembership {
            relation: hash,
            composition: *composition,
            ordinal: ordinal_of(ordinal),
            occurrences: *occurrences,
        })
        .collect();

    Computed::Valid(RelationBundle {
        relation: Relation {
            hash,
            physicality: physicality.hash,
            arity: keys.iter().fold(0u32, |acc, (_, n)| acc.saturating_add(*n)),
        },
        physicality,
        members,
        rating: RatingDelta::observe(hash, base_rating),
        evidence: RelationEvidence {
            content: source,
            relation: hash,
        },
    })
}

fn physicality_row(center: Point4, trajectory: Vec<Point4>) -> Physicality {
    Physicality {
        hash: physicality_hash(&center, &trajectory),
        spatial_index: spatial::encode(&center),
        centroid: center,
        trajectory,
    }
}

/// Collapse consecutive equal keys into maximal runs.
fn runs<'a, T, I>(items: I) -> Vec<(&'a T, u32)>
where
    I: IntoIterator<Item = (ContentHash, &'a T)>,
{
    let mut out: Vec<(ContentHash, &'a T, u32)> = Vec::new();
    for (key, item) in items {
        match out.last_mut() {
            Some((last, _, n)) if *last == key => *n = n.saturating_add(1),
            _ => out.push((key, item, 1)),
        }
    }
    out.into_iter().map(|(_, item, n)| (item, n)).collect()
}

fn ordinal_of(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::atom_hash;
    use crate::rating::baseline;
    use crate::types::RelationKind;

    fn word(text: &str) -> CompositionBundle {
        compute_composition(text, &ProjectedAtoms)
            .into_valid()
            .expect("valid word")
    }

    #[test]
    fn empty_text_is_invalid() {
        assert_eq!(
            compute_composition("", &ProjectedAtoms),
            Computed::Invalid(Invalid::Empty)
        );
    }

    #[test]
    fn unresolved_codepoint_is_invalid() {
        let table: BTreeMap<u32, Atom> = [0x61u32]
            .into_iter()
            .filter_map(|cp| projection::atom(cp).map(|a| (cp, a)))
            .collect();
        assert_eq!(
            compute_composition("ab", &table),
            Computed::Invalid(Invalid::UnresolvedCodepoint(0x62))
        );
        assert!(compute_composition("aa", &table).is_valid());
    }

    #[test]
    fn compute_is_repeatable() {
        let a = word("hello");
        let b = word("hello");
        assert_eq!(a.handle.hash, b.handle.hash);
        assert_eq!(a.handle.centroid.to_bits(), b.handle.centroid.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn runs_are_length_encoded() {
        let b = word("aaab");
        assert_eq!(b.members.len(), 2);
        assert_eq!(b.members[0].occurrences, 3);
        assert_eq!(b.members[1].ordinal, 1);
        assert_eq!(b.composition.length, 4);
        assert_eq!(b.composition.level, 1);
        assert_eq!(b.atoms.len(), 2);
        assert_eq!(b.atoms[0].hash, atom_hash('a' as u32));
    }

    #[test]
    fn order_and_repeats_change_identity() {
        assert_ne!(word("ab").handle.hash, word("ba").handle.hash);
        assert_ne!(word("a").handle.hash, word("aa").handle.hash);
    }

    #[test]
    fn repeated_runs_share_geometry() {
        let a = word("a");
        let aa = word("aa");
        assert_eq!(a.physicality.hash, aa.physicality.hash);
        assert_eq!(a.composition.physicality, aa.composition.physicality);
    }

    #[test]
    fn centroid_is_unit() {
        let b = word("substrate");
        assert!(b.handle.centroid.is_unit());
        assert_eq!(b.physicality.trajectory.len(), b.members.len());
    }

    #[test]
    fn phrase_is_one_level_up() {
        let the = word("the");
        let cat = word("cat");
        let phrase = compute_sequence(&[
            ChildHandle::from(&the.handle),
            ChildHandle::from(&cat.handle),
        ])
        .into_valid()
        .expect("valid phrase");
        assert_eq!(phrase.composition.level, 2);
        assert_eq!(phrase.members[0].child_kind, NodeKind::Composition);
        assert!(phrase.atoms.is_empty());
    }

    #[test]
    fn relation_rows() {
        let the = word("the");
        let cat = word("cat");
        let source = atom_hash(0);
        let rel = compute_relation(
            &the.handle,
            &cat.handle,
            source,
            baseline(RelationKind::Adjacency),
        )
        .into_valid()
        .expect("valid relation");
        assert_eq!(rel.relation.arity, 2);
        assert_eq!(rel.members.len(), 2);
        assert_eq!(rel.rating.seed, 1000);
        assert_eq!(rel.evidence.content, source);
        assert!(rel.physicality.centroid.is_unit());

        let reversed = compute_relation(&cat.handle, &the.handle, source, 1000)
            .into_valid()
            .expect("valid relation");
        assert_ne!(rel.relation.hash, reversed.relation.hash);
    }

    #[test]
    fn relation_identity_ignores_source_and_rating() {
        let the = word("the");
        let cat = word("cat");
        let a = compute_relation(&the.handle, &cat.handle, atom_hash(1), 900)
            .into_valid()
            .expect("valid");
        let b = compute_relation(&the.handle, &cat.handle, atom_hash(2), 1400)
            .into_valid()
            .expect("valid");
        assert_eq!(a.relation, b.relation);
        assert_ne!(a.evidence, b.evidence);
    }

    #[test]
    fn antipodal_relation_is_degenerate() {
        let north = CompositionHandle {
            hash: atom_hash(1),
            centroid: Point4::new(0.0, 0.0, 0.0, 1.0),
            level: 1,
        };
        let south = CompositionHandle {
            hash: atom_hash(2),
            centroid: Point4::new(0.0, 0.0, 0.0, -1.0),
            level: 1,
        };
        assert_eq!(
            compute_relation(&north, &south, atom_hash(3), 1000),
            Computed::Invalid(Invalid::DegenerateCentroid)
        );
    }

    #[test]
    fn single_endpoint_is_invalid() {
        let the = word("the");
        assert_eq!(
            compute_relation_n(&[the.handle], atom_hash(0), 1000),
            Computed::Invalid(Invalid::Empty)
        );
    }
}
