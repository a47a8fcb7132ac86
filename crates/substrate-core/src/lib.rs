//! # substrate-core
//!
//! The content-addressable geometric substrate - THE ENGINE.
//!
//! Every unit of content (a codepoint, a word, a phrase, a relation between
//! words) gets an identity derived purely from its structure, a position
//! on the unit 3-sphere derived from its children, and a Hilbert key for
//! proximity scans.
//!
//! ## Layers
//!
//! - `projection`, `spatial`, `hashing`: codepoint placement, curve keys and
//!   domain-separated identities
//! - `compute`: pure bundle construction, safe to call from any thread
//! - `cache`, `batch`, `writer`, `ingestor`: the parallel ingestion pipeline
//! - `storage`, `bulk`: the redb store and its bulk-load fast path
//! - `walk`: reproducible weighted walks over the relation graph
//!
//! ## Architectural Constraints
//!
//! - Identities are pure functions of immediate children's identities
//! - Only ratings and evidence change after a row is written, and only
//!   grow
//! - The cache is memoization; the store is the source of truth
//! - NO async, NO network dependencies

// =============================================================================
// MODULES
// =============================================================================

pub mod batch;
pub mod bulk;
pub mod cache;
pub mod compute;
pub mod geometry;
pub mod hashing;
pub mod ingestor;
pub mod primitives;
pub mod projection;
pub mod rating;
pub mod spatial;
pub mod storage;
pub mod types;
pub mod walk;
pub mod writer;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Atom, Category, Composition, CompositionMembership, ContentHash, ContentMeta, ContentRecord,
    NodeKind, Physicality, RatingDelta, Relation, RelationEvidence, RelationKind,
    RelationMembership, RelationRating, SubstrateError,
};

// =============================================================================
// RE-EXPORTS: Geometry and Identity
// =============================================================================

pub use geometry::Point4;
pub use hashing::{DomainHasher, HashDomain};
pub use projection::{Projection, project};

// =============================================================================
// RE-EXPORTS: Compute and Pipeline
// =============================================================================

pub use batch::Batch;
pub use bulk::{BulkLoad, RebuildReport};
pub use cache::SubstrateCache;
pub use compute::{
    AtomLookup, ChildHandle, CompositionBundle, CompositionHandle, Computed, Invalid,
    ProjectedAtoms, RelationBundle, compute_composition, compute_relation, compute_relation_n,
    compute_sequence,
};
pub use ingestor::{
    CancelToken, IngestRecord, Ingestor, PartitionTally, PipelineConfig, RelationHint, RunReport,
    SourceDocument, text_handle,
};
pub use writer::{BatchSender, BatchWriter, WriterReport};

// =============================================================================
// RE-EXPORTS: Storage and Walks
// =============================================================================

pub use storage::{NearHit, RedbSubstrate, StoreCounts, WriteMode, WriteStats};
pub use walk::{
    RelationGraph, StepOutcome, WalkCandidate, WalkConfig, WalkEngine, WalkStep, WalkTermination,
    WalkTrace,
};
