//! # Core Type Definitions
//!
//! This module contains the record types of the substrate:
//! - Identity (`ContentHash`)
//! - Persisted rows (`Atom`, `Physicality`, `Composition`, `Relation`, ...)
//! - Relation kinds and rating rows
//! - Error types (`SubstrateError`)
//!
//! ## Identity Guarantees
//!
//! Every row is keyed by a `ContentHash` computed from its immediate
//! children's hashes (see `hashing`). Two rows with equal hashes are
//! interchangeable; nothing here carries an assigned or sequential id.

use crate::geometry::Point4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// CONTENT HASH
// =============================================================================

/// 256-bit BLAKE3 content hash. The primary key of every entity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Smallest possible hash, used as a range-scan lower bound.
    pub const MIN: Self = Self([0u8; 32]);
    /// Largest possible hash, used as a range-scan upper bound.
    pub const MAX: Self = Self([0xffu8; 32]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters).
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex()[..12].to_string()
    }

    /// The `index`-th little-endian 64-bit word of the hash (index mod 4).
    #[must_use]
    pub fn word(&self, index: usize) -> u64 {
        let start = (index % 4) * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[start..start + 8]);
        u64::from_le_bytes(buf)
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// =============================================================================
// ATOM
// =============================================================================

/// Coarse codepoint category derived from the codepoint alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Uppercase,
    Lowercase,
    OtherLetter,
    Digit,
    OtherNumber,
    Whitespace,
    Punctuation,
    Symbol,
    Control,
    Surrogate,
    PrivateUse,
    Other,
}

impl Category {
    /// Stable lowercase name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Category::Uppercase => "uppercase",
            Category::Lowercase => "lowercase",
            Category::OtherLetter => "letter",
            Category::Digit => "digit",
            Category::OtherNumber => "number",
            Category::Whitespace => "whitespace",
            Category::Punctuation => "punctuation",
            Category::Symbol => "symbol",
            Category::Control => "control",
            Category::Surrogate => "surrogate",
            Category::PrivateUse => "private-use",
            Category::Other => "other",
        }
    }
}

/// One Unicode codepoint. Created once by bootstrap (or on first sight
/// during ingestion), never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub hash: ContentHash,
    pub codepoint: u32,
    pub position: Point4,
    pub spatial_index: u64,
    pub category: Category,
}

// =============================================================================
// PHYSICALITY
// =============================================================================

/// Shared geometric payload referenced by compositions and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Physicality {
    pub hash: ContentHash,
    pub spatial_index: u64,
    pub centroid: Point4,
    /// Ordered points the centroid was derived from (one per run).
    pub trajectory: Vec<Point4>,
}

// =============================================================================
// COMPOSITION
// =============================================================================

/// What a membership edge points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Atom,
    Composition,
    Relation,
    Physicality,
}

impl NodeKind {
    /// Single-byte tag used in index values.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            NodeKind::Atom => 0,
            NodeKind::Composition => 1,
            NodeKind::Relation => 2,
            NodeKind::Physicality => 3,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(NodeKind::Atom),
            1 => Some(NodeKind::Composition),
            2 => Some(NodeKind::Relation),
            3 => Some(NodeKind::Physicality),
            _ => None,
        }
    }
}

/// An ordered sequence of atoms or lower compositions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub hash: ContentHash,
    pub physicality: ContentHash,
    /// Number of children with runs expanded.
    pub length: u64,
    /// 1 for compositions of atoms, 2 for compositions of words, ...
    pub level: u8,
}

/// Run-length encoded edge: `occurrences` identical consecutive children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionMembership {
    pub composition: ContentHash,
    pub child: ContentHash,
    pub child_kind: NodeKind,
    pub ordinal: u32,
    pub occurrences: u32,
}

// =============================================================================
// RELATION
// =============================================================================

/// The kind of evidence a relation observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    Adjacency,
    CoOccurrence,
    Dependency,
    Lexical,
    Translation,
}

impl RelationKind {
    /// Parse a kind name as written in source files.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adjacency" | "adjacent" => Some(RelationKind::Adjacency),
            "cooccurrence" | "co-occurrence" => Some(RelationKind::CoOccurrence),
            "dependency" | "dep" => Some(RelationKind::Dependency),
            "lexical" | "lex" => Some(RelationKind::Lexical),
            "translation" | "trans" => Some(RelationKind::Translation),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RelationKind::Adjacency => "adjacency",
            RelationKind::CoOccurrence => "cooccurrence",
            RelationKind::Dependency => "dependency",
            RelationKind::Lexical => "lexical",
            RelationKind::Translation => "translation",
        }
    }
}

/// Association between two or more compositions. Identity is the hash of
/// the ordered endpoint hashes; the kind is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub hash: ContentHash,
    pub physicality: ContentHash,
    /// Number of endpoints with runs expanded.
    pub arity: u32,
}

/// Run-length encoded endpoint edge of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMembership {
    pub relation: ContentHash,
    pub composition: ContentHash,
    pub ordinal: u32,
    pub occurrences: u32,
}

/// The mutable confidence state of one relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRating {
    pub relation: ContentHash,
    /// Highest kind baseline observed so far.
    pub seed: i64,
    pub observations: u64,
    pub rating: i64,
}

/// One or more observations of a relation, to be merged into its rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingDelta {
    pub relation: ContentHash,
    pub seed: i64,
    pub observations: u64,
}

/// Provenance edge, unique per (content, relation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationEvidence {
    pub content: ContentHash,
    pub relation: ContentHash,
}

// =============================================================================
// CONTENT
// =============================================================================

/// Descriptive metadata of one ingested source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContentMeta {
    pub tenant: String,
    pub owner: String,
    pub kind: String,
    pub title: String,
    pub language: String,
    pub encoding: String,
}

/// A stored source description. Written before any row derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub hash: ContentHash,
    pub meta: ContentMeta,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the substrate.
///
/// - `StoreUnavailable` and `IntegrityViolation` abort a run
/// - `MalformedInput` skips one record
/// - `BatchWriteFailure` rolls back one batch
/// - `DanglingReference` defers one batch until its references are durable
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The durable store cannot be opened, read or written.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A source record cannot be represented.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A batch was rolled back; earlier commits are unaffected.
    #[error("Batch {batch} write failed: {reason}")]
    BatchWriteFailure { batch: u64, reason: String },

    /// A row the cache reported as new collided with a different stored row.
    #[error("Integrity violation: stored row {0} differs from computed row")]
    IntegrityViolation(ContentHash),

    /// A row references a hash that is neither durable nor in its batch.
    #[error("Dangling reference to {0}")]
    DanglingReference(ContentHash),

    /// A row failed a storage constraint (e.g. non-unit centroid).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A read needs a secondary index that is dropped during a bulk load.
    #[error("Index unavailable during bulk load: {0}")]
    IndexUnavailable(&'static str),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl SubstrateError {
    /// Whether the error must abort the whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubstrateError::StoreUnavailable(_)
                | SubstrateError::IntegrityViolation(_)
                | SubstrateError::SerializationError(_)
                | SubstrateError::DeserializationError(_)
                | SubstrateError::IoError(_)
        )
    }

    /// Map any storage-engine error to `StoreUnavailable`.
    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        SubstrateError::StoreUnavailable(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_rendering_is_lowercase_and_full_width() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = ContentHash(bytes);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab00"));
        assert!(hex.ends_with("01"));
        assert_eq!(hash.short(), "ab0000000000");

        let digest = blake3::hash(b"substrate");
        assert_eq!(ContentHash(*digest.as_bytes()).to_hex(), digest.to_hex().as_str());
    }

    #[test]
    fn hash_ordering_is_bytewise() {
        assert!(ContentHash::MIN < ContentHash::MAX);
        let mut a = [0u8; 32];
        a[0] = 1;
        let mut b = [0u8; 32];
        b[31] = 0xff;
        assert!(ContentHash(b) < ContentHash(a));
    }

    #[test]
    fn node_kind_tags_round_trip() {
        for kind in [
            NodeKind::Atom,
            NodeKind::Composition,
            NodeKind::Relation,
            NodeKind::Physicality,
        ] {
            assert_eq!(NodeKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(NodeKind::from_tag(9), None);
    }

    #[test]
    fn relation_kind_parsing() {
        assert_eq!(
            RelationKind::parse("Translation"),
            Some(RelationKind::Translation)
        );
        assert_eq!(RelationKind::parse(" dep "), Some(RelationKind::Dependency));
        assert_eq!(RelationKind::parse("synonym"), None);
    }

    #[test]
    fn fatal_classification() {
        assert!(SubstrateError::StoreUnavailable("down".into()).is_fatal());
        assert!(SubstrateError::IntegrityViolation(ContentHash::MIN).is_fatal());
        assert!(!SubstrateError::MalformedInput("x".into()).is_fatal());
        assert!(!SubstrateError::DanglingReference(ContentHash::MIN).is_fatal());
        assert!(
            !SubstrateError::BatchWriteFailure {
                batch: 1,
                reason: "x".into()
            }
            .is_fatal()
        );
    }
}
