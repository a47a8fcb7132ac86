//! # redb-backed Substrate Storage
//!
//! The durable store: one redb database holding every substrate table.
//!
//! redb provides:
//! - ACID transactions (one per batch)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! ## Tables
//!
//! Primary tables are keyed by content hash (memberships by
//! `(owner, ordinal)`, evidence by `(content, relation)`); row payloads are
//! postcard-encoded. Secondary indexes are derived from the primary tables
//! and are the only thing the bulk-load path drops and rebuilds.
//!
//! ## Write modes
//!
//! - `Incremental`: every reference must be durable or in the same batch,
//!   stored points must be unit length, indexes are maintained live
//! - `Bulk`: plain appends, no reference or norm checks, no index writes
//!
//! In both modes an insert that replaces a *different* stored row is an
//! `IntegrityViolation`.

use crate::batch::Batch;
use crate::bulk::RebuildReport;
use crate::geometry::Point4;
use crate::primitives::SCHEMA_VERSION;
use crate::spatial;
use crate::types::{
    Atom, Composition, CompositionMembership, ContentHash, ContentRecord, NodeKind, Physicality,
    Relation, RelationMembership, RelationRating, SubstrateError,
};
use crate::walk::{RelationGraph, WalkCandidate};
use redb::{
    Database, Key, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable,
    ReadableTableMetadata, Table, TableDefinition, TableHandle, Value, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

type Hash32 = [u8; 32];

// =============================================================================
// TABLE DEFINITIONS
// =============================================================================

/// Atom rows: hash -> postcard `Atom`.
const ATOMS: TableDefinition<Hash32, &[u8]> = TableDefinition::new("atoms");

/// Physicality rows: hash -> postcard `Physicality`.
const PHYSICALITY: TableDefinition<Hash32, &[u8]> = TableDefinition::new("physicality");

/// Composition rows: hash -> postcard `Composition`.
const COMPOSITIONS: TableDefinition<Hash32, &[u8]> = TableDefinition::new("compositions");

/// Composition membership edges: (composition, ordinal) -> postcard membership.
const COMPOSITION_MEMBERS: TableDefinition<(Hash32, u32), &[u8]> =
    TableDefinition::new("composition_members");

/// Relation rows: hash -> postcard `Relation`.
const RELATIONS: TableDefinition<Hash32, &[u8]> = TableDefinition::new("relations");

/// Relation endpoint edges: (relation, ordinal) -> postcard membership.
const RELATION_MEMBERS: TableDefinition<(Hash32, u32), &[u8]> =
    TableDefinition::new("relation_members");

/// Rating rows: relation hash -> postcard `RelationRating`.
const RELATION_RATINGS: TableDefinition<Hash32, &[u8]> = TableDefinition::new("relation_ratings");

/// Provenance: (content, relation) -> ().
const RELATION_EVIDENCE: TableDefinition<(Hash32, Hash32), ()> =
    TableDefinition::new("relation_evidence");

/// Source descriptions: content hash -> postcard `ContentRecord`.
const CONTENT: TableDefinition<Hash32, &[u8]> = TableDefinition::new("content");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

// Secondary indexes.

/// codepoint -> atom hash
const ATOM_BY_CODEPOINT: TableDefinition<u32, Hash32> = TableDefinition::new("atom_by_codepoint");

/// (Hilbert key, hash) -> `NodeKind` tag
const SPATIAL_INDEX: TableDefinition<(u64, Hash32), u8> = TableDefinition::new("spatial_index");

/// (child, composition) -> ()
const COMPOSITION_BY_CHILD: TableDefinition<(Hash32, Hash32), ()> =
    TableDefinition::new("composition_by_child");

/// (composition, relation) -> ()
const RELATION_BY_COMPOSITION: TableDefinition<(Hash32, Hash32), ()> =
    TableDefinition::new("relation_by_composition");

/// (relation, content) -> ()
const EVIDENCE_BY_RELATION: TableDefinition<(Hash32, Hash32), ()> =
    TableDefinition::new("evidence_by_relation");

const META_SCHEMA_VERSION: &str = "schema_version";
const META_BULK_LOAD: &str = "bulk_load_active";

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// How a batch is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Steady state: reference checks, norm checks, live indexes.
    Incremental,
    /// Bulk-load fast path: plain appends.
    Bulk,
}

/// Rows actually inserted by one write (rows already stored are not counted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub atoms: u64,
    pub physicalities: u64,
    pub compositions: u64,
    pub composition_members: u64,
    pub relations: u64,
    pub relation_members: u64,
    pub ratings: u64,
    pub evidence: u64,
}

impl WriteStats {
    pub fn add(&mut self, other: &WriteStats) {
        self.atoms += other.atoms;
        self.physicalities += other.physicalities;
        self.compositions += other.compositions;
        self.composition_members += other.composition_members;
        self.relations += other.relations;
        self.relation_members += other.relation_members;
        self.ratings += other.ratings;
        self.evidence += other.evidence;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.atoms
            + self.physicalities
            + self.compositions
            + self.composition_members
            + self.relations
            + self.relation_members
            + self.ratings
            + self.evidence
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub atoms: u64,
    pub physicalities: u64,
    pub compositions: u64,
    pub composition_members: u64,
    pub relations: u64,
    pub relation_members: u64,
    pub ratings: u64,
    pub evidence: u64,
    pub content: u64,
}

/// One result of a proximity query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearHit {
    pub hash: ContentHash,
    pub kind: NodeKind,
    /// Great-circle distance to the query point, in radians.
    pub distance: f64,
}

/// The durable substrate store.
pub struct RedbSubstrate {
    db: Database,
}

impl std::fmt::Debug for RedbSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbSubstrate").finish_non_exhaustive()
    }
}

// =============================================================================
// OPEN / METADATA
// =============================================================================

impl RedbSubstrate {
    /// Open or create a substrate database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SubstrateError> {
        let db = Database::create(path.as_ref()).map_err(SubstrateError::store)?;

        let write_txn = db.begin_write().map_err(SubstrateError::store)?;
        {
            for def in [ATOMS, PHYSICALITY, COMPOSITIONS, RELATIONS, RELATION_RATINGS, CONTENT] {
                write_txn.open_table(def).map_err(SubstrateError::store)?;
            }
            for def in [COMPOSITION_MEMBERS, RELATION_MEMBERS] {
                write_txn.open_table(def).map_err(SubstrateError::store)?;
            }
            write_txn
                .open_table(RELATION_EVIDENCE)
                .map_err(SubstrateError::store)?;
            open_indexes(&write_txn)?;

            let mut meta = write_txn
                .open_table(METADATA)
                .map_err(SubstrateError::store)?;
            let stored = meta
                .get(META_SCHEMA_VERSION)
                .map_err(SubstrateError::store)?
                .map(|v| v.value());
            match stored {
                Some(version) if version != SCHEMA_VERSION => {
                    return Err(SubstrateError::StoreUnavailable(format!(
                        "schema version {version}, expected {SCHEMA_VERSION}"
                    )));
                }
                Some(_) => {}
                None => {
                    meta.insert(META_SCHEMA_VERSION, SCHEMA_VERSION)
                        .map_err(SubstrateError::store)?;
                }
            }
        }
        write_txn.commit().map_err(SubstrateError::store)?;

        Ok(Self { db })
    }

    fn read_txn(&self) -> Result<ReadTransaction, SubstrateError> {
        self.db.begin_read().map_err(SubstrateError::store)
    }

    /// Whether a bulk load has dropped the secondary indexes.
    pub fn bulk_load_active(&self) -> Result<bool, SubstrateError> {
        let txn = self.read_txn()?;
        let meta = txn.open_table(METADATA).map_err(SubstrateError::store)?;
        let flag = meta
            .get(META_BULK_LOAD)
            .map_err(SubstrateError::store)?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(flag != 0)
    }

    fn require_indexes(&self, index: &'static str) -> Result<(), SubstrateError> {
        if self.bulk_load_active()? {
            return Err(SubstrateError::IndexUnavailable(index));
        }
        Ok(())
    }

    /// Store a source description. Runs before any row derived from it.
    pub fn put_content(&self, record: &ContentRecord) -> Result<bool, SubstrateError> {
        let bytes = encode(record)?;
        let txn = self.db.begin_write().map_err(SubstrateError::store)?;
        let inserted = {
            let mut content = txn.open_table(CONTENT).map_err(SubstrateError::store)?;
            put_row(&mut content, &record.hash, &bytes)
        };
        finish(txn, inserted)
    }
}

// =============================================================================
// BATCH WRITES
// =============================================================================

impl RedbSubstrate {
    /// Write one batch in a single transaction. On any error the
    /// transaction is aborted and nothing of the batch is stored.
    pub fn write_batch(&self, batch: &Batch, mode: WriteMode) -> Result<WriteStats, SubstrateError> {
        let txn = self.db.begin_write().map_err(SubstrateError::store)?;
        let result = write_rows(&txn, batch, mode);
        finish(txn, result)
    }
}

fn finish<T>(txn: WriteTransaction, result: Result<T, SubstrateError>) -> Result<T, SubstrateError> {
    match result {
        Ok(value) => {
            txn.commit().map_err(SubstrateError::store)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort) = txn.abort() {
                tracing::warn!(error = %abort, "transaction abort failed");
            }
            Err(err)
        }
    }
}

fn write_rows(
    txn: &WriteTransaction,
    batch: &Batch,
    mode: WriteMode,
) -> Result<WriteStats, SubstrateError> {
    let incremental = mode == WriteMode::Incremental;
    let local: BTreeSet<ContentHash> = batch.claimed_hashes().copied().collect();

    if incremental {
        check_norms(batch)?;
        check_references(txn, batch, &local)?;
    }

    let mut stats = WriteStats::default();

    {
        let mut atoms = txn.open_table(ATOMS).map_err(SubstrateError::store)?;
        for atom in &batch.atoms {
            if put_row(&mut atoms, &atom.hash, &encode(atom)?)? {
                stats.atoms += 1;
            }
        }
    }
    {
        let mut table = txn.open_table(PHYSICALITY).map_err(SubstrateError::store)?;
        for row in &batch.physicalities {
            if put_row(&mut table, &row.hash, &encode(row)?)? {
                stats.physicalities += 1;
            }
        }
    }
    {
        let mut table = txn.open_table(COMPOSITIONS).map_err(SubstrateError::store)?;
        for row in &batch.compositions {
            if put_row(&mut table, &row.hash, &encode(row)?)? {
                stats.compositions += 1;
            }
        }
    }
    {
        let mut table = txn
            .open_table(COMPOSITION_MEMBERS)
            .map_err(SubstrateError::store)?;
        for m in &batch.composition_members {
            if put_member(&mut table, &m.composition, m.ordinal, &encode(m)?)? {
                stats.composition_members += 1;
            }
        }
    }
    {
        let mut table = txn.open_table(RELATIONS).map_err(SubstrateError::store)?;
        for row in &batch.relations {
            if put_row(&mut table, &row.hash, &encode(row)?)? {
                stats.relations += 1;
            }
        }
    }
    {
        let mut table = txn
            .open_table(RELATION_MEMBERS)
            .map_err(SubstrateError::store)?;
        for m in &batch.relation_members {
            if put_member(&mut table, &m.relation, m.ordinal, &encode(m)?)? {
                stats.relation_members += 1;
            }
        }
    }
    {
        let mut ratings = txn
            .open_table(RELATION_RATINGS)
            .map_err(SubstrateError::store)?;
        for delta in batch.ratings.values() {
            let existing: Option<RelationRating> = match ratings
                .get(&delta.relation.0)
                .map_err(SubstrateError::store)?
            {
                Some(data) => Some(decode(data.value())?),
                None => None,
            };
            let row = match existing {
                Some(mut row) => {
                    row.apply(delta);
                    row
                }
                None => RelationRating::from_delta(delta),
            };
            ratings
                .insert(&delta.relation.0, encode(&row)?.as_slice())
                .map_err(SubstrateError::store)?;
            stats.ratings += 1;
        }
    }
    {
        let mut evidence = txn
            .open_table(RELATION_EVIDENCE)
            .map_err(SubstrateError::store)?;
        for e in &batch.evidence {
            let previous = evidence
                .insert((e.content.0, e.relation.0), ())
                .map_err(SubstrateError::store)?;
            if previous.is_none() {
                stats.evidence += 1;
            }
        }
    }

    if incremental {
        write_indexes(txn, batch)?;
    }

    Ok(stats)
}

fn check_norms(batch: &Batch) -> Result<(), SubstrateError> {
    for atom in &batch.atoms {
        require_unit(&atom.position, "atom", &atom.hash)?;
    }
    for row in &batch.physicalities {
        require_unit(&row.centroid, "physicality", &row.hash)?;
    }
    Ok(())
}

fn require_unit(point: &Point4, what: &str, hash: &ContentHash) -> Result<(), SubstrateError> {
    if point.is_unit() {
        Ok(())
    } else {
        Err(SubstrateError::ConstraintViolation(format!(
            "{what} {} has norm {}",
            hash.short(),
            point.norm()
        )))
    }
}

type RowTable = TableDefinition<'static, Hash32, &'static [u8]>;

/// Hashes `batch` points at, grouped by the table each must be durable in.
/// Evidence content is checked separately against `CONTENT`.
fn references(batch: &Batch) -> [(RowTable, Vec<&ContentHash>); 4] {
    let physicalities = batch
        .compositions
        .iter()
        .map(|c| &c.physicality)
        .chain(batch.relations.iter().map(|r| &r.physicality))
        .collect();
    let atoms = batch
        .composition_members
        .iter()
        .filter(|m| m.child_kind == NodeKind::Atom)
        .map(|m| &m.child)
        .collect();
    let compositions = batch
        .composition_members
        .iter()
        .flat_map(|m| {
            let child = (m.child_kind == NodeKind::Composition).then_some(&m.child);
            std::iter::once(&m.composition).chain(child)
        })
        .chain(batch.relation_members.iter().map(|m| &m.composition))
        .collect();
    let relations = batch
        .relation_members
        .iter()
        .map(|m| &m.relation)
        .chain(batch.ratings.keys())
        .chain(batch.evidence.iter().map(|e| &e.relation))
        .collect();
    [
        (PHYSICALITY, physicalities),
        (ATOMS, atoms),
        (COMPOSITIONS, compositions),
        (RELATIONS, relations),
    ]
}

/// Every hash a batch references must be in the batch or already durable.
fn check_references(
    txn: &WriteTransaction,
    batch: &Batch,
    local: &BTreeSet<ContentHash>,
) -> Result<(), SubstrateError> {
    for (def, hashes) in references(batch) {
        let table = txn.open_table(def).map_err(SubstrateError::store)?;
        for hash in hashes {
            require_present(&table, local, hash)?;
        }
    }
    let content = txn.open_table(CONTENT).map_err(SubstrateError::store)?;
    for e in &batch.evidence {
        require_present(&content, local, &e.content)?;
    }
    Ok(())
}

fn require_present<T>(
    table: &T,
    local: &BTreeSet<ContentHash>,
    hash: &ContentHash,
) -> Result<(), SubstrateError>
where
    T: ReadableTable<Hash32, &'static [u8]>,
{
    if local.contains(hash) || table.get(&hash.0).map_err(SubstrateError::store)?.is_some() {
        Ok(())
    } else {
        Err(SubstrateError::DanglingReference(*hash))
    }
}

fn write_indexes(txn: &WriteTransaction, batch: &Batch) -> Result<(), SubstrateError> {
    // Hilbert keys of the physicalities the batch's compositions and
    // relations point at.
    let mut keys: BTreeMap<ContentHash, u64> = batch
        .physicalities
        .iter()
        .map(|p| (p.hash, p.spatial_index))
        .collect();
    {
        let table = txn.open_table(PHYSICALITY).map_err(SubstrateError::store)?;
        let wanted = batch
            .compositions
            .iter()
            .map(|c| c.physicality)
            .chain(batch.relations.iter().map(|r| r.physicality));
        for hash in wanted {
            if keys.contains_key(&hash) {
                continue;
            }
            if let Some(data) = table.get(&hash.0).map_err(SubstrateError::store)? {
                let row: Physicality = decode(data.value())?;
                keys.insert(hash, row.spatial_index);
            }
        }
    }

    {
        let mut by_codepoint = txn
            .open_table(ATOM_BY_CODEPOINT)
            .map_err(SubstrateError::store)?;
        for atom in &batch.atoms {
            by_codepoint
                .insert(atom.codepoint, atom.hash.0)
                .map_err(SubstrateError::store)?;
        }
    }
    {
        let mut spatial = txn.open_table(SPATIAL_INDEX).map_err(SubstrateError::store)?;
        for atom in &batch.atoms {
            spatial
                .insert((atom.spatial_index, atom.hash.0), NodeKind::Atom.tag())
                .map_err(SubstrateError::store)?;
        }
        for c in &batch.compositions {
            if let Some(key) = keys.get(&c.physicality) {
                spatial
                    .insert((*key, c.hash.0), NodeKind::Composition.tag())
                    .map_err(SubstrateError::store)?;
            }
        }
        for r in &batch.relations {
            if let Some(key) = keys.get(&r.physicality) {
                spatial
                    .insert((*key, r.hash.0), NodeKind::Relation.tag())
                    .map_err(SubstrateError::store)?;
            }
        }
    }
    {
        let mut by_child = txn
            .open_table(COMPOSITION_BY_CHILD)
            .map_err(SubstrateError::store)?;
        for m in &batch.composition_members {
            by_child
                .insert((m.child.0, m.composition.0), ())
                .map_err(SubstrateError::store)?;
        }
    }
    {
        let mut by_composition = txn
            .open_table(RELATION_BY_COMPOSITION)
            .map_err(SubstrateError::store)?;
        for m in &batch.relation_members {
            by_composition
                .insert((m.composition.0, m.relation.0), ())
                .map_err(SubstrateError::store)?;
        }
    }
    {
        let mut by_relation = txn
            .open_table(EVIDENCE_BY_RELATION)
            .map_err(SubstrateError::store)?;
        for e in &batch.evidence {
            by_relation
                .insert((e.relation.0, e.content.0), ())
                .map_err(SubstrateError::store)?;
        }
    }
    Ok(())
}

/// Insert a hash-keyed row. `Ok(true)` if new, `Ok(false)` if the identical
/// row was already stored.
fn put_row(
    table: &mut Table<Hash32, &'static [u8]>,
    hash: &ContentHash,
    bytes: &[u8],
) -> Result<bool, SubstrateError> {
    match table.insert(&hash.0, bytes).map_err(SubstrateError::store)? {
        Some(old) if old.value() != bytes => Err(SubstrateError::IntegrityViolation(*hash)),
        Some(_) => Ok(false),
        None => Ok(true),
    }
}

fn put_member(
    table: &mut Table<(Hash32, u32), &'static [u8]>,
    owner: &ContentHash,
    ordinal: u32,
    bytes: &[u8],
) -> Result<bool, SubstrateError> {
    match table
        .insert((owner.0, ordinal), bytes)
        .map_err(SubstrateError::store)?
    {
        Some(old) if old.value() != bytes => Err(SubstrateError::IntegrityViolation(*owner)),
        Some(_) => Ok(false),
        None => Ok(true),
    }
}

fn open_indexes(txn: &WriteTransaction) -> Result<(), SubstrateError> {
    txn.open_table(ATOM_BY_CODEPOINT)
        .map_err(SubstrateError::store)?;
    txn.open_table(SPATIAL_INDEX).map_err(SubstrateError::store)?;
    for def in [COMPOSITION_BY_CHILD, RELATION_BY_COMPOSITION, EVIDENCE_BY_RELATION] {
        txn.open_table(def).map_err(SubstrateError::store)?;
    }
    Ok(())
}

fn drop_indexes(txn: &WriteTransaction) -> Result<(), SubstrateError> {
    txn.delete_table(ATOM_BY_CODEPOINT)
        .map_err(SubstrateError::store)?;
    txn.delete_table(SPATIAL_INDEX)
        .map_err(SubstrateError::store)?;
    for def in [COMPOSITION_BY_CHILD, RELATION_BY_COMPOSITION, EVIDENCE_BY_RELATION] {
        txn.delete_table(def).map_err(SubstrateError::store)?;
    }
    Ok(())
}

fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>, SubstrateError> {
    postcard::to_allocvec(row).map_err(|e| SubstrateError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SubstrateError> {
    postcard::from_bytes(bytes).map_err(|e| SubstrateError::DeserializationError(e.to_string()))
}

// =============================================================================
// BULK LOAD
// =============================================================================

impl RedbSubstrate {
    /// Drop every secondary index and mark the store as bulk loading.
    pub fn begin_bulk_load(&self) -> Result<(), SubstrateError> {
        let txn = self.db.begin_write().map_err(SubstrateError::store)?;
        let result = drop_indexes(&txn).and_then(|()| set_bulk_flag(&txn, true));
        finish(txn, result)?;
        tracing::info!("secondary indexes dropped for bulk load");
        Ok(())
    }

    /// Rebuild every secondary index from the primary tables in one
    /// transaction, validate stored norms, and clear the bulk flag.
    pub fn rebuild_indexes(&self) -> Result<RebuildReport, SubstrateError> {
        let txn = self.db.begin_write().map_err(SubstrateError::store)?;
        let result = drop_indexes(&txn)
            .and_then(|()| open_indexes(&txn))
            .and_then(|()| rebuild_from_primary(&txn))
            .and_then(|report| set_bulk_flag(&txn, false).map(|()| report));
        let report = finish(txn, result)?;
        if report.dangling > 0 {
            tracing::warn!(dangling = report.dangling, "rebuild found dangling references");
        }
        tracing::info!(
            atoms = report.atoms_indexed,
            spatial = report.spatial_entries,
            "secondary indexes rebuilt"
        );
        Ok(report)
    }
}

fn set_bulk_flag(txn: &WriteTransaction, active: bool) -> Result<(), SubstrateError> {
    let mut meta = txn.open_table(METADATA).map_err(SubstrateError::store)?;
    meta.insert(META_BULK_LOAD, u64::from(active))
        .map_err(SubstrateError::store)?;
    Ok(())
}

fn rebuild_from_primary(txn: &WriteTransaction) -> Result<RebuildReport, SubstrateError> {
    let mut report = RebuildReport::default();

    let atoms = txn.open_table(ATOMS).map_err(SubstrateError::store)?;
    let physicality = txn.open_table(PHYSICALITY).map_err(SubstrateError::store)?;
    let compositions = txn.open_table(COMPOSITIONS).map_err(SubstrateError::store)?;
    let relations = txn.open_table(RELATIONS).map_err(SubstrateError::store)?;
    let content = txn.open_table(CONTENT).map_err(SubstrateError::store)?;

    let mut by_codepoint = txn
        .open_table(ATOM_BY_CODEPOINT)
        .map_err(SubstrateError::store)?;
    let mut spatial = txn.open_table(SPATIAL_INDEX).map_err(SubstrateError::store)?;

    for entry in atoms.iter().map_err(SubstrateError::store)? {
        let (_, value) = entry.map_err(SubstrateError::store)?;
        let atom: Atom = decode(value.value())?;
        require_unit(&atom.position, "atom", &atom.hash)?;
        by_codepoint
            .insert(atom.codepoint, atom.hash.0)
            .map_err(SubstrateError::store)?;
        spatial
            .insert((atom.spatial_index, atom.hash.0), NodeKind::Atom.tag())
            .map_err(SubstrateError::store)?;
        report.atoms_indexed += 1;
        report.spatial_entries += 1;
    }

    for entry in physicality.iter().map_err(SubstrateError::store)? {
        let (_, value) = entry.map_err(SubstrateError::store)?;
        let row: Physicality = decode(value.value())?;
        require_unit(&row.centroid, "physicality", &row.hash)?;
    }

    for entry in compositions.iter().map_err(SubstrateError::store)? {
        let (_, value) = entry.map_err(SubstrateError::store)?;
        let row: Composition = decode(value.value())?;
        match spatial_key(&physicality, &row.physicality)? {
            Some(key) => {
                spatial
                    .insert((key, row.hash.0), NodeKind::Composition.tag())
                    .map_err(SubstrateError::store)?;
                report.spatial_entries += 1;
            }
            None => report.dangling += 1,
        }
    }

    for entry in relations.iter().map_err(SubstrateError::store)? {
        let (_, value) = entry.map_err(SubstrateError::store)?;
        let row: Relation = decode(value.value())?;
        match spatial_key(&physicality, &row.physicality)? {
            Some(key) => {
                spatial
                    .insert((key, row.hash.0), NodeKind::Relation.tag())
                    .map_err(SubstrateError::store)?;
                report.spatial_entries += 1;
            }
            None => report.dangling += 1,
        }
    }

    {
        let members = txn
            .open_table(COMPOSITION_MEMBERS)
            .map_err(SubstrateError::store)?;
        let mut by_child = txn
            .open_table(COMPOSITION_BY_CHILD)
            .map_err(SubstrateError::store)?;
        for entry in members.iter().map_err(SubstrateError::store)? {
            let (_, value) = entry.map_err(SubstrateError::store)?;
            let m: CompositionMembership = decode(value.value())?;
            let child_table = if m.child_kind == NodeKind::Atom {
                &atoms
            } else {
                &compositions
            };
            if !contains(child_table, &m.child)? {
                report.dangling += 1;
            }
            by_child
                .insert((m.child.0, m.composition.0), ())
                .map_err(SubstrateError::store)?;
            report.composition_edges += 1;
        }
    }

    {
        let members = txn
            .open_table(RELATION_MEMBERS)
            .map_err(SubstrateError::store)?;
        let mut by_composition = txn
            .open_table(RELATION_BY_COMPOSITION)
            .map_err(SubstrateError::store)?;
        for entry in members.iter().map_err(SubstrateError::store)? {
            let (_, value) = entry.map_err(SubstrateError::store)?;
            let m: RelationMembership = decode(value.value())?;
            if !contains(&compositions, &m.composition)? {
                report.dangling += 1;
            }
            by_composition
                .insert((m.composition.0, m.relation.0), ())
                .map_err(SubstrateError::store)?;
            report.relation_edges += 1;
        }
    }

    {
        let evidence = txn
            .open_table(RELATION_EVIDENCE)
            .map_err(SubstrateError::store)?;
        let mut by_relation = txn
            .open_table(EVIDENCE_BY_RELATION)
            .map_err(SubstrateError::store)?;
        for entry in evidence.iter().map_err(SubstrateError::store)? {
            let (key, _) = entry.map_err(SubstrateError::store)?;
            let (source, relation) = key.value();
            if !contains(&content, &ContentHash(source))?
                || !contains(&relations, &ContentHash(relation))?
            {
                report.dangling += 1;
            }
            by_relation
                .insert((relation, source), ())
                .map_err(SubstrateError::store)?;
            report.evidence_edges += 1;
        }
    }

    Ok(report)
}

fn contains<T>(table: &T, hash: &ContentHash) -> Result<bool, SubstrateError>
where
    T: ReadableTable<Hash32, &'static [u8]>,
{
    Ok(table.get(&hash.0).map_err(SubstrateError::store)?.is_some())
}

fn spatial_key<T>(physicality: &T, hash: &ContentHash) -> Result<Option<u64>, SubstrateError>
where
    T: ReadableTable<Hash32, &'static [u8]>,
{
    match physicality.get(&hash.0).map_err(SubstrateError::store)? {
        Some(data) => {
            let row: Physicality = decode(data.value())?;
            Ok(Some(row.spatial_index))
        }
        None => Ok(None),
    }
}

// =============================================================================
// READS
// =============================================================================

impl RedbSubstrate {
    /// References of `batch` that are neither durable, nor rows of the
    /// batch itself, nor in `provided`. Sorted and deduplicated.
    pub fn missing_references(
        &self,
        batch: &Batch,
        provided: &BTreeSet<ContentHash>,
    ) -> Result<Vec<ContentHash>, SubstrateError> {
        let local: BTreeSet<ContentHash> = batch.claimed_hashes().copied().collect();
        let txn = self.read_txn()?;
        let mut missing = BTreeSet::new();
        let content: Vec<&ContentHash> = batch.evidence.iter().map(|e| &e.content).collect();
        for (def, hashes) in references(batch)
            .into_iter()
            .chain(std::iter::once((CONTENT, content)))
        {
            let table = txn.open_table(def).map_err(SubstrateError::store)?;
            for hash in hashes {
                if local.contains(hash) || provided.contains(hash) {
                    continue;
                }
                if table.get(&hash.0).map_err(SubstrateError::store)?.is_none() {
                    missing.insert(*hash);
                }
            }
        }
        Ok(missing.into_iter().collect())
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        def: TableDefinition<Hash32, &[u8]>,
        hash: &ContentHash,
    ) -> Result<Option<T>, SubstrateError> {
        let txn = self.read_txn()?;
        let table = txn.open_table(def).map_err(SubstrateError::store)?;
        match table.get(&hash.0).map_err(SubstrateError::store)? {
            Some(data) => Ok(Some(decode(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn atom(&self, hash: &ContentHash) -> Result<Option<Atom>, SubstrateError> {
        self.get_row(ATOMS, hash)
    }

    pub fn physicality(&self, hash: &ContentHash) -> Result<Option<Physicality>, SubstrateError> {
        self.get_row(PHYSICALITY, hash)
    }

    pub fn composition(&self, hash: &ContentHash) -> Result<Option<Composition>, SubstrateError> {
        self.get_row(COMPOSITIONS, hash)
    }

    pub fn relation(&self, hash: &ContentHash) -> Result<Option<Relation>, SubstrateError> {
        self.get_row(RELATIONS, hash)
    }

    pub fn rating(&self, relation: &ContentHash) -> Result<Option<RelationRating>, SubstrateError> {
        self.get_row(RELATION_RATINGS, relation)
    }

    pub fn content(&self, hash: &ContentHash) -> Result<Option<ContentRecord>, SubstrateError> {
        self.get_row(CONTENT, hash)
    }

    /// Atom hash for a codepoint, via the codepoint index.
    pub fn atom_by_codepoint(&self, codepoint: u32) -> Result<Option<ContentHash>, SubstrateError> {
        self.require_indexes("atom_by_codepoint")?;
        let txn = self.read_txn()?;
        let table = txn
            .open_table(ATOM_BY_CODEPOINT)
            .map_err(SubstrateError::store)?;
        Ok(table
            .get(codepoint)
            .map_err(SubstrateError::store)?
            .map(|v| ContentHash(v.value())))
    }

    /// Membership edges of a composition in ordinal order.
    pub fn composition_members(
        &self,
        composition: &ContentHash,
    ) -> Result<Vec<CompositionMembership>, SubstrateError> {
        let txn = self.read_txn()?;
        let table = txn
            .open_table(COMPOSITION_MEMBERS)
            .map_err(SubstrateError::store)?;
        members_of(&table, composition)
    }

    /// Endpoint edges of a relation in ordinal order.
    pub fn relation_members(
        &self,
        relation: &ContentHash,
    ) -> Result<Vec<RelationMembership>, SubstrateError> {
        let txn = self.read_txn()?;
        let table = txn
            .open_table(RELATION_MEMBERS)
            .map_err(SubstrateError::store)?;
        members_of(&table, relation)
    }

    /// Compositions that contain `child` directly.
    pub fn compositions_containing(
        &self,
        child: &ContentHash,
    ) -> Result<Vec<ContentHash>, SubstrateError> {
        self.require_indexes("composition_by_child")?;
        let txn = self.read_txn()?;
        let table = txn
            .open_table(COMPOSITION_BY_CHILD)
            .map_err(SubstrateError::store)?;
        second_halves(&table, child)
    }

    /// Relations with `composition` as an endpoint.
    pub fn relations_of(&self, composition: &ContentHash) -> Result<Vec<ContentHash>, SubstrateError> {
        self.require_indexes("relation_by_composition")?;
        let txn = self.read_txn()?;
        let table = txn
            .open_table(RELATION_BY_COMPOSITION)
            .map_err(SubstrateError::store)?;
        second_halves(&table, composition)
    }

    /// Sources that evidenced `relation`.
    pub fn evidence_for(&self, relation: &ContentHash) -> Result<Vec<ContentHash>, SubstrateError> {
        self.require_indexes("evidence_by_relation")?;
        let txn = self.read_txn()?;
        let table = txn
            .open_table(EVIDENCE_BY_RELATION)
            .map_err(SubstrateError::store)?;
        second_halves(&table, relation)
    }

    /// Surface text of a composition, runs expanded. Words of a phrase are
    /// separated by one space. `None` if the composition or any atom below
    /// it is not stored.
    pub fn composition_text(&self, hash: &ContentHash) -> Result<Option<String>, SubstrateError> {
        let txn = self.read_txn()?;
        let members = txn
            .open_table(COMPOSITION_MEMBERS)
            .map_err(SubstrateError::store)?;
        let atoms = txn.open_table(ATOMS).map_err(SubstrateError::store)?;
        let mut out = String::new();
        if append_text(&members, &atoms, hash, &mut out)? {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// The `k` stored atoms, compositions and relations nearest to `point`,
    /// found by scanning `window` spatial-index entries on each side of the
    /// point's Hilbert key and ranking them by true geodesic distance.
    pub fn near(
        &self,
        point: &Point4,
        k: usize,
        window: usize,
    ) -> Result<Vec<NearHit>, SubstrateError> {
        self.require_indexes("spatial_index")?;
        let txn = self.read_txn()?;
        let index = txn.open_table(SPATIAL_INDEX).map_err(SubstrateError::store)?;
        let key = spatial::encode(point);

        let mut found: Vec<(Hash32, u8)> = Vec::new();
        for entry in index
            .range((key, [0u8; 32])..)
            .map_err(SubstrateError::store)?
            .take(window)
        {
            let (key, tag) = entry.map_err(SubstrateError::store)?;
            found.push((key.value().1, tag.value()));
        }
        for entry in index
            .range(..(key, [0u8; 32]))
            .map_err(SubstrateError::store)?
            .rev()
            .take(window)
        {
            let (key, tag) = entry.map_err(SubstrateError::store)?;
            found.push((key.value().1, tag.value()));
        }

        let atoms = txn.open_table(ATOMS).map_err(SubstrateError::store)?;
        let physicality = txn.open_table(PHYSICALITY).map_err(SubstrateError::store)?;
        let compositions = txn.open_table(COMPOSITIONS).map_err(SubstrateError::store)?;
        let relations = txn.open_table(RELATIONS).map_err(SubstrateError::store)?;

        let mut hits = Vec::with_capacity(found.len());
        for (raw, tag) in found {
            let hash = ContentHash(raw);
            let Some(kind) = NodeKind::from_tag(tag) else {
                continue;
            };
            let position = match kind {
                NodeKind::Atom => read::<Atom, _>(&atoms, &hash)?.map(|a| a.position),
                NodeKind::Composition => match read::<Composition, _>(&compositions, &hash)? {
                    Some(c) => read::<Physicality, _>(&physicality, &c.physicality)?
                        .map(|p| p.centroid),
                    None => None,
                },
                NodeKind::Relation => match read::<Relation, _>(&relations, &hash)? {
                    Some(r) => read::<Physicality, _>(&physicality, &r.physicality)?
                        .map(|p| p.centroid),
                    None => None,
                },
                NodeKind::Physicality => None,
            };
            if let Some(position) = position {
                hits.push(NearHit {
                    hash,
                    kind,
                    distance: point.geodesic_distance(&position),
                });
            }
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.hash.cmp(&b.hash)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Row counts per primary table.
    pub fn counts(&self) -> Result<StoreCounts, SubstrateError> {
        let txn = self.read_txn()?;
        let len = |def: TableDefinition<Hash32, &[u8]>| -> Result<u64, SubstrateError> {
            txn.open_table(def)
                .map_err(SubstrateError::store)?
                .len()
                .map_err(SubstrateError::store)
        };
        let member_len =
            |def: TableDefinition<(Hash32, u32), &[u8]>| -> Result<u64, SubstrateError> {
                txn.open_table(def)
                    .map_err(SubstrateError::store)?
                    .len()
                    .map_err(SubstrateError::store)
            };
        let evidence = txn
            .open_table(RELATION_EVIDENCE)
            .map_err(SubstrateError::store)?
            .len()
            .map_err(SubstrateError::store)?;
        Ok(StoreCounts {
            atoms: len(ATOMS)?,
            physicalities: len(PHYSICALITY)?,
            compositions: len(COMPOSITIONS)?,
            composition_members: member_len(COMPOSITION_MEMBERS)?,
            relations: len(RELATIONS)?,
            relation_members: member_len(RELATION_MEMBERS)?,
            ratings: len(RELATION_RATINGS)?,
            evidence,
            content: len(CONTENT)?,
        })
    }

    /// Visit every atom, physicality, composition and relation hash.
    /// Returns the number visited.
    pub fn for_each_hash(&self, mut f: impl FnMut(ContentHash)) -> Result<u64, SubstrateError> {
        let txn = self.read_txn()?;
        let mut visited = 0u64;
        for def in [ATOMS, PHYSICALITY, COMPOSITIONS, RELATIONS] {
            let table = txn.open_table(def).map_err(SubstrateError::store)?;
            for entry in table.iter().map_err(SubstrateError::store)? {
                let (key, _) = entry.map_err(SubstrateError::store)?;
                f(ContentHash(key.value()));
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// BLAKE3 digest over every row and index entry in key order.
    /// Two stores with equal digests hold identical data.
    pub fn table_digest(&self) -> Result<ContentHash, SubstrateError> {
        self.require_indexes("table digest")?;
        let txn = self.read_txn()?;
        let mut hasher = blake3::Hasher::new();
        for def in [ATOMS, PHYSICALITY, COMPOSITIONS, RELATIONS, RELATION_RATINGS, CONTENT] {
            digest_table(&txn, def, &mut hasher)?;
        }
        for def in [COMPOSITION_MEMBERS, RELATION_MEMBERS] {
            digest_table(&txn, def, &mut hasher)?;
        }
        for def in [
            RELATION_EVIDENCE,
            COMPOSITION_BY_CHILD,
            RELATION_BY_COMPOSITION,
            EVIDENCE_BY_RELATION,
        ] {
            digest_table(&txn, def, &mut hasher)?;
        }
        digest_table(&txn, ATOM_BY_CODEPOINT, &mut hasher)?;
        digest_table(&txn, SPATIAL_INDEX, &mut hasher)?;
        Ok(ContentHash(*hasher.finalize().as_bytes()))
    }
}

fn read<T, Tab>(table: &Tab, hash: &ContentHash) -> Result<Option<T>, SubstrateError>
where
    T: DeserializeOwned,
    Tab: ReadableTable<Hash32, &'static [u8]>,
{
    match table.get(&hash.0).map_err(SubstrateError::store)? {
        Some(data) => Ok(Some(decode(data.value())?)),
        None => Ok(None),
    }
}

fn members_of<T, M>(table: &T, owner: &ContentHash) -> Result<Vec<M>, SubstrateError>
where
    T: ReadableTable<(Hash32, u32), &'static [u8]>,
    M: DeserializeOwned,
{
    let mut out = Vec::new();
    for entry in table
        .range((owner.0, 0u32)..=(owner.0, u32::MAX))
        .map_err(SubstrateError::store)?
    {
        let (_, value) = entry.map_err(SubstrateError::store)?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

fn second_halves<T>(table: &T, first: &ContentHash) -> Result<Vec<ContentHash>, SubstrateError>
where
    T: ReadableTable<(Hash32, Hash32), ()>,
{
    let mut out = Vec::new();
    for entry in table
        .range((first.0, [0u8; 32])..=(first.0, [0xffu8; 32]))
        .map_err(SubstrateError::store)?
    {
        let (key, _) = entry.map_err(SubstrateError::store)?;
        out.push(ContentHash(key.value().1));
    }
    Ok(out)
}

fn append_text(
    members: &ReadOnlyTable<(Hash32, u32), &'static [u8]>,
    atoms: &ReadOnlyTable<Hash32, &'static [u8]>,
    hash: &ContentHash,
    out: &mut String,
) -> Result<bool, SubstrateError> {
    let edges: Vec<CompositionMembership> = members_of(members, hash)?;
    if edges.is_empty() {
        return Ok(false);
    }
    let mut first = true;
    for m in edges {
        for _ in 0..m.occurrences {
            match m.child_kind {
                NodeKind::Atom => {
                    let Some(atom) = read::<Atom, _>(atoms, &m.child)? else {
                        return Ok(false);
                    };
                    out.push(char::from_u32(atom.codepoint).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                _ => {
                    if !first {
                        out.push(' ');
                    }
                    if !append_text(members, atoms, &m.child, out)? {
                        return Ok(false);
                    }
                }
            }
            first = false;
        }
    }
    Ok(true)
}

fn digest_table<K, V>(
    txn: &ReadTransaction,
    def: TableDefinition<K, V>,
    hasher: &mut blake3::Hasher,
) -> Result<(), SubstrateError>
where
    K: Key + 'static,
    V: Value + 'static,
{
    let table = txn.open_table(def).map_err(SubstrateError::store)?;
    hasher.update(def.name().as_bytes());
    for entry in table.iter().map_err(SubstrateError::store)? {
        let (key, value) = entry.map_err(SubstrateError::store)?;
        let key = key.value();
        let value = value.value();
        let key_bytes = K::as_bytes(&key);
        let value_bytes = V::as_bytes(&value);
        hasher.update(key_bytes.as_ref());
        hasher.update(&(value_bytes.as_ref().len() as u64).to_le_bytes());
        hasher.update(value_bytes.as_ref());
    }
    Ok(())
}

// =============================================================================
// RELATION GRAPH
// =============================================================================

impl RelationGraph for RedbSubstrate {
    fn candidates(&self, from: &ContentHash) -> Result<Vec<WalkCandidate>, SubstrateError> {
        self.require_indexes("relation_by_composition")?;
        let txn = self.read_txn()?;
        let index = txn
            .open_table(RELATION_BY_COMPOSITION)
            .map_err(SubstrateError::store)?;
        let members = txn
            .open_table(RELATION_MEMBERS)
            .map_err(SubstrateError::store)?;
        let ratings = txn
            .open_table(RELATION_RATINGS)
            .map_err(SubstrateError::store)?;

        let mut out = Vec::new();
        for relation in second_halves(&index, from)? {
            let rating = read::<RelationRating, _>(&ratings, &relation)?
                .map(|r| r.rating)
                .unwrap_or(0);
            let endpoints: Vec<RelationMembership> = members_of(&members, &relation)?;
            let mut targets: BTreeSet<ContentHash> = endpoints
                .iter()
                .map(|m| m.composition)
                .filter(|c| c != from)
                .collect();
            if targets.is_empty() {
                targets.insert(*from);
            }
            for target in targets {
                out.push(WalkCandidate {
                    relation,
                    target,
                    rating,
                });
            }
        }
        Ok(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================
