//! # Scenario Tests
//!
//! End-to-end runs against a real redb file: atom placement, structural
//! sharing across ingests, idempotence, bulk-load equivalence,
//! cancellation and walks over stored relations.

use std::sync::Arc;
use substrate_core::{
    BulkLoad, CancelToken, ContentMeta, IngestRecord, Ingestor, PipelineConfig, RedbSubstrate,
    RelationKind, SourceDocument, SubstrateError, WalkConfig, WalkEngine, WalkTermination,
    WriteMode, project, text_handle,
};
use tempfile::TempDir;

fn config() -> PipelineConfig {
    PipelineConfig {
        workers: 4,
        batch_size: 64,
        queue_depth: 2,
        partition_size: 3,
        text_memo: 1024,
    }
}

fn open_store(temp: &TempDir, name: &str) -> Arc<RedbSubstrate> {
    Arc::new(RedbSubstrate::open(temp.path().join(name)).expect("open db"))
}

fn document(title: &str, records: Vec<IngestRecord>) -> SourceDocument {
    let meta = ContentMeta {
        owner: "tests".to_string(),
        kind: "text".to_string(),
        title: title.to_string(),
        language: "en".to_string(),
        encoding: "utf-8".to_string(),
        ..ContentMeta::default()
    };
    SourceDocument::new(meta, title.as_bytes(), records)
}

fn corpus() -> SourceDocument {
    let mut records: Vec<IngestRecord> = [
        "the quick brown fox",
        "jumps over the lazy dog",
        "the dog sleeps",
        "a quick brown dog",
        "over and over and over",
        "fox and dog",
    ]
    .into_iter()
    .map(IngestRecord::sequence)
    .collect();
    records.push(IngestRecord::phrase("lazy dog"));
    records.push(IngestRecord::pair("dog", "chien", RelationKind::Translation));
    records.push(IngestRecord::pair("quick", "fast", RelationKind::Lexical));
    records.push(IngestRecord::pair("the dog", "le chien", RelationKind::Translation));
    document("corpus", records)
}

fn ingest(ingestor: &Ingestor, doc: &SourceDocument, mode: WriteMode) {
    let report = ingestor
        .ingest(doc, mode, &CancelToken::new())
        .expect("ingest");
    assert_eq!(report.writer.batches_failed, 0);
}

// =============================================================================
// SCENARIO A: CASE PAIRS SIT TOGETHER
// =============================================================================

#[test]
fn case_pair_is_closer_than_digit() {
    let upper = project('A' as u32).expect("A").position;
    let lower = project('a' as u32).expect("a").position;
    let nine = project('9' as u32).expect("9").position;

    let pair = upper.geodesic_distance(&lower);
    assert!(pair < 0.25, "A-a distance {pair}");
    assert!(pair < upper.geodesic_distance(&nine));
    assert!(pair < lower.geodesic_distance(&nine));
}

#[test]
fn seeded_atoms_are_stored_once() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "seed.redb");
    let seeding = PipelineConfig {
        batch_size: 50_000,
        ..config()
    };
    let ingestor = Ingestor::open(Arc::clone(&store), seeding).expect("ingestor");
    let report = ingestor
        .seed_atoms(WriteMode::Incremental, &CancelToken::new())
        .expect("seed");
    assert_eq!(report.writer.rows.atoms, 0x11_0000);

    let upper = store.atom_by_codepoint('A' as u32).expect("index");
    assert_eq!(upper, Some(project('A' as u32).expect("A").hash));

    let again = ingestor
        .seed_atoms(WriteMode::Incremental, &CancelToken::new())
        .expect("reseed");
    assert_eq!(again.writer.rows.total(), 0);
}

// =============================================================================
// SCENARIO B: STRUCTURAL SHARING ACROSS INGESTS
// =============================================================================

#[test]
fn second_ingest_reuses_existing_word() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "b.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");

    ingest(&ingestor, &document("one", vec![IngestRecord::sequence("the")]), WriteMode::Incremental);
    let the = text_handle("the").into_valid().expect("the");
    let before = store.counts().expect("counts");
    assert_eq!(before.compositions, 1);
    assert_eq!(before.relations, 0);

    ingest(
        &ingestor,
        &document("two", vec![IngestRecord::sequence("the cat")]),
        WriteMode::Incremental,
    );
    let after = store.counts().expect("counts");
    assert_eq!(after.compositions, before.compositions + 1);
    assert_eq!(after.relations, before.relations + 1);
    assert!(store.composition(&the.hash).expect("read").is_some());

    let cat = text_handle("cat").into_valid().expect("cat");
    let shared = store.relations_of(&the.hash).expect("relations");
    assert_eq!(shared, store.relations_of(&cat.hash).expect("relations"));
}

// =============================================================================
// IDEMPOTENCE
// =============================================================================

#[test]
fn reingest_adds_no_identity_rows() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "idem.redb");
    let doc = corpus();
    {
        let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
        ingest(&ingestor, &doc, WriteMode::Incremental);
    }
    let before = store.counts().expect("counts");

    // A fresh ingestor starts from a cache preloaded from the store.
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    let report = ingestor
        .ingest(&doc, WriteMode::Incremental, &CancelToken::new())
        .expect("reingest");
    let rows = report.writer.rows;
    assert_eq!(rows.atoms + rows.physicalities + rows.compositions + rows.relations, 0);
    assert_eq!(rows.evidence, 0);

    let after = store.counts().expect("counts");
    assert_eq!(after, before);

    let dog = text_handle("dog").into_valid().expect("dog");
    let chien = text_handle("chien").into_valid().expect("chien");
    let relation = store
        .relations_of(&dog.hash)
        .expect("relations")
        .into_iter()
        .find(|r| {
            store
                .relation_members(r)
                .expect("members")
                .iter()
                .any(|m| m.composition == chien.hash)
        })
        .expect("translation relation");
    let rating = store.rating(&relation).expect("rating").expect("row");
    assert_eq!(rating.observations, 2);
}

// =============================================================================
// BULK-LOAD EQUIVALENCE
// =============================================================================

#[test]
fn bulk_and_incremental_stores_are_identical() {
    let temp = TempDir::new().expect("temp dir");
    let doc = corpus();

    let incremental = open_store(&temp, "incremental.redb");
    {
        let ingestor = Ingestor::open(Arc::clone(&incremental), config()).expect("ingestor");
        ingest(&ingestor, &doc, WriteMode::Incremental);
    }

    let bulk = open_store(&temp, "bulk.redb");
    {
        let ingestor = Ingestor::open(Arc::clone(&bulk), config()).expect("ingestor");
        let load = BulkLoad::begin(Arc::clone(&bulk)).expect("begin");
        ingest(&ingestor, &doc, WriteMode::Bulk);
        let report = load.finish().expect("rebuild");
        assert_eq!(report.dangling, 0);
    }

    assert_eq!(
        incremental.counts().expect("counts"),
        bulk.counts().expect("counts")
    );
    assert_eq!(
        incremental.table_digest().expect("digest"),
        bulk.table_digest().expect("digest")
    );
}

#[test]
fn open_bulk_load_refuses_incremental_ingest() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "mixed.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    let doc = document("mixed", vec![IngestRecord::sequence("slow steady")]);

    let load = BulkLoad::begin(Arc::clone(&store)).expect("begin");
    let err = ingestor
        .ingest(&doc, WriteMode::Incremental, &CancelToken::new())
        .expect_err("indexes are dropped");
    assert!(matches!(err, SubstrateError::IndexUnavailable(_)));
    assert!(!err.is_fatal());
    assert_eq!(store.counts().expect("counts").compositions, 0);
    assert!(matches!(
        store.relations_of(&text_handle("slow").into_valid().expect("slow").hash),
        Err(SubstrateError::IndexUnavailable(_))
    ));

    load.finish().expect("rebuild");
    ingest(&ingestor, &doc, WriteMode::Incremental);
    let counts = store.counts().expect("counts");
    assert_eq!(counts.compositions, 2);
    assert_eq!(counts.relations, 1);
}

// =============================================================================
// MALFORMED INPUT
// =============================================================================

#[test]
fn malformed_records_do_not_stop_the_run() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "malformed.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    let records = vec![
        IngestRecord::sequence("first line"),
        IngestRecord::sequence("   "),
        IngestRecord::sequence("x".repeat(substrate_core::primitives::MAX_TEXT_LENGTH + 1)),
        IngestRecord::pair("orphan", "", RelationKind::Translation),
        IngestRecord::sequence("last line"),
    ];
    let report = ingestor
        .ingest(&document("mixed", records), WriteMode::Incremental, &CancelToken::new())
        .expect("ingest");
    assert_eq!(report.tally.records, 2);
    assert_eq!(report.tally.skipped, 3);
    assert_eq!(report.writer.batches_failed, 0);

    // first, line, last; the skipped pair stored nothing.
    let counts = store.counts().expect("counts");
    assert_eq!(counts.compositions, 3);
    assert_eq!(counts.relations, 2);
    assert!(store
        .composition(&text_handle("orphan").into_valid().expect("orphan").hash)
        .expect("read")
        .is_none());
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[test]
fn cancelled_run_leaves_store_consistent() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "cancel.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    let doc = corpus();

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = ingestor
        .ingest(&doc, WriteMode::Incremental, &cancel)
        .expect("cancelled ingest");
    assert!(report.cancelled);
    assert_eq!(store.counts().expect("counts").compositions, 0);

    // Nothing was claimed for good, so a later run stores everything.
    ingest(&ingestor, &doc, WriteMode::Incremental);

    let reference = open_store(&temp, "reference.redb");
    let fresh = Ingestor::open(Arc::clone(&reference), config()).expect("ingestor");
    ingest(&fresh, &doc, WriteMode::Incremental);
    assert_eq!(
        store.table_digest().expect("digest"),
        reference.table_digest().expect("digest")
    );
}

// =============================================================================
// WALKS AND PROXIMITY
// =============================================================================

#[test]
fn walk_follows_stored_relations() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "walk.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    ingest(
        &ingestor,
        &document("walk", vec![IngestRecord::sequence("alpha beta gamma")]),
        WriteMode::Incremental,
    );
    let alpha = text_handle("alpha").into_valid().expect("alpha");
    let beta = text_handle("beta").into_valid().expect("beta");

    let config = WalkConfig {
        energy: 1.0,
        step_cost: 1.0,
        temperature: 0.0,
        seed: 7,
        ..WalkConfig::default()
    };
    let trace = WalkEngine::new(&*store, alpha.hash, config)
        .expect("engine")
        .run()
        .expect("walk");
    assert_eq!(trace.path(), vec![alpha.hash, beta.hash]);
    assert_eq!(trace.termination, WalkTermination::EnergyExhausted);

    let lonely = text_handle("delta").into_valid().expect("delta");
    let trace = WalkEngine::new(&*store, lonely.hash, WalkConfig::default())
        .expect("engine")
        .run()
        .expect("walk");
    assert!(trace.steps.is_empty());
    assert_eq!(trace.termination, WalkTermination::NoCandidates);
}

#[test]
fn near_finds_the_composition_itself() {
    let temp = TempDir::new().expect("temp dir");
    let store = open_store(&temp, "near.redb");
    let ingestor = Ingestor::open(Arc::clone(&store), config()).expect("ingestor");
    ingest(&ingestor, &corpus(), WriteMode::Incremental);

    let fox = text_handle("fox").into_valid().expect("fox");
    let stored = store.composition(&fox.hash).expect("read").expect("fox row");
    let shape = store
        .physicality(&stored.physicality)
        .expect("read")
        .expect("fox physicality");
    assert_eq!(shape.centroid.to_bits(), fox.centroid.to_bits());

    let hits = store.near(&fox.centroid, 3, 256).expect("near");
    assert_eq!(hits.first().map(|h| h.hash), Some(fox.hash));
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}
