//! # CLI Command Implementations
//!
//! Each command opens the store named by the resolved configuration, runs
//! one operation and prints its result (text, or JSON with `--json-mode`).

use crate::config::SubstrateConfig;
use crate::sources::{ParsedSource, collect_files, read_pairs, read_text};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use substrate_core::{
    BulkLoad, CancelToken, ContentHash, Ingestor, NodeKind, RebuildReport, RedbSubstrate,
    RelationKind, RunReport, SubstrateError, WalkConfig, WalkEngine, WriteMode, WriteStats,
    text_handle,
};

/// Spatial-index entries scanned per side for every requested neighbour.
const NEAR_WINDOW_PER_RESULT: usize = 16;

/// Lower bound on the scan window of a proximity query.
const MIN_NEAR_WINDOW: usize = 256;

fn open_store(config: &SubstrateConfig) -> Result<Arc<RedbSubstrate>, SubstrateError> {
    tracing::debug!(db = %config.db_path.display(), "opening store");
    Ok(Arc::new(RedbSubstrate::open(&config.db_path)?))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), SubstrateError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| SubstrateError::SerializationError(e.to_string()))?;
    println!("{text}");
    Ok(())
}

/// Human label for a stored composition: its text, or its short hash.
fn label(store: &RedbSubstrate, hash: &ContentHash) -> Result<String, SubstrateError> {
    Ok(store
        .composition_text(hash)?
        .unwrap_or_else(|| hash.short()))
}

// =============================================================================
// INGEST SUMMARY
// =============================================================================

/// Totals over every file of one ingest command.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IngestSummary {
    pub files: u64,
    /// Files that could not be read as a source and were passed over.
    pub skipped_files: u64,
    pub records: u64,
    pub skipped: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub batches_deferred: u64,
    pub rows: WriteStats,
    pub elapsed: Duration,
}

impl IngestSummary {
    /// Fold one run into the totals.
    pub fn add_run(&mut self, report: &RunReport, skipped_lines: u64) {
        self.records += report.tally.records;
        self.skipped += report.tally.skipped + skipped_lines;
        self.batches_committed += report.writer.batches_committed;
        self.batches_failed += report.writer.batches_failed;
        self.batches_deferred += report.writer.batches_deferred;
        self.rows.add(&report.writer.rows);
    }

    #[must_use]
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows.total() as f64 / secs
        } else {
            0.0
        }
    }

    fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "files": self.files,
            "skipped_files": self.skipped_files,
            "records": self.records,
            "skipped": self.skipped,
            "batches_committed": self.batches_committed,
            "batches_failed": self.batches_failed,
            "batches_deferred": self.batches_deferred,
            "rows": self.rows,
            "rows_total": self.rows.total(),
            "elapsed_secs": self.elapsed.as_secs_f64(),
            "rows_per_sec": self.rows_per_sec()
        })
    }

    fn print(&self) {
        println!("Files:        {}", self.files);
        if self.skipped_files > 0 {
            println!("Bad files:    {}", self.skipped_files);
        }
        println!("Records:      {}", self.records);
        println!("Skipped:      {}", self.skipped);
        println!(
            "Batches:      {} committed, {} failed, {} deferred",
            self.batches_committed, self.batches_failed, self.batches_deferred
        );
        println!("Rows:         {}", self.rows.total());
        println!("  atoms:        {}", self.rows.atoms);
        println!("  compositions: {}", self.rows.compositions);
        println!("  relations:    {}", self.rows.relations);
        println!("  evidence:     {}", self.rows.evidence);
        println!("Elapsed:      {:.2}s", self.elapsed.as_secs_f64());
        println!("Throughput:   {:.0} rows/sec", self.rows_per_sec());
    }
}

fn print_rebuild(report: &RebuildReport) {
    println!("Indexes rebuilt:");
    println!("  atoms:         {}", report.atoms_indexed);
    println!("  spatial:       {}", report.spatial_entries);
    println!("  compositions:  {}", report.composition_edges);
    println!("  relations:     {}", report.relation_edges);
    println!("  evidence:      {}", report.evidence_edges);
    if report.dangling > 0 {
        println!("  dangling refs: {}", report.dangling);
    }
}

// =============================================================================
// SEED COMMAND
// =============================================================================

/// Store every codepoint's Atom.
pub fn cmd_seed(config: &SubstrateConfig, json_mode: bool) -> Result<(), SubstrateError> {
    let store = open_store(config)?;
    let ingestor = Ingestor::open(store, config.pipeline)?;
    let report = ingestor.seed_atoms(WriteMode::Incremental, &CancelToken::new())?;

    let mut summary = IngestSummary {
        elapsed: report.elapsed,
        ..IngestSummary::default()
    };
    summary.add_run(&report, 0);

    if json_mode {
        print_json(&summary.to_json())?;
        return Ok(());
    }
    println!("Atom bootstrap");
    println!("==============");
    summary.print();
    Ok(())
}

// =============================================================================
// INGEST COMMANDS
// =============================================================================

/// How source files are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Text,
    Pairs(RelationKind),
}

impl SourceFormat {
    fn read(self, path: &Path) -> Result<ParsedSource, SubstrateError> {
        match self {
            SourceFormat::Text => read_text(path),
            SourceFormat::Pairs(kind) => read_pairs(path, kind),
        }
    }
}

/// Ingest every file under `paths`, optionally through the bulk-load path.
pub fn cmd_ingest(
    config: &SubstrateConfig,
    json_mode: bool,
    paths: &[PathBuf],
    format: SourceFormat,
    bulk: bool,
) -> Result<(), SubstrateError> {
    let files = collect_files(paths)?;
    tracing::info!(files = files.len(), bulk, "ingesting");

    let store = open_store(config)?;
    let ingestor = Ingestor::open(Arc::clone(&store), config.pipeline)?;
    let started = Instant::now();

    let (summary, rebuild) = if bulk {
        let load = BulkLoad::begin(Arc::clone(&store))?;
        let summary = ingest_files(&ingestor, &files, format, WriteMode::Bulk)?;
        (summary, Some(load.finish()?))
    } else {
        (
            ingest_files(&ingestor, &files, format, WriteMode::Incremental)?,
            None,
        )
    };
    let summary = IngestSummary {
        elapsed: started.elapsed(),
        ..summary
    };

    if json_mode {
        let mut output = summary.to_json();
        if let Some(rebuild) = rebuild {
            output["rebuild"] = serde_json::json!(rebuild);
        }
        print_json(&output)?;
        return Ok(());
    }

    println!("Ingest complete");
    println!("===============");
    summary.print();
    if let Some(rebuild) = rebuild {
        println!();
        print_rebuild(&rebuild);
    }
    Ok(())
}

fn ingest_files(
    ingestor: &Ingestor,
    files: &[PathBuf],
    format: SourceFormat,
    mode: WriteMode,
) -> Result<IngestSummary, SubstrateError> {
    let cancel = CancelToken::new();
    let mut summary = IngestSummary::default();
    for file in files {
        let parsed = match format.read(file) {
            Ok(parsed) => parsed,
            Err(SubstrateError::MalformedInput(reason)) => {
                tracing::warn!(file = %file.display(), %reason, "skipping file");
                summary.skipped_files += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        let report = ingestor.ingest(&parsed.document, mode, &cancel)?;
        summary.add_run(&report, parsed.skipped_lines);
        summary.files += 1;
    }
    Ok(summary)
}

// =============================================================================
// WALK COMMAND
// =============================================================================

/// Walk from the composition of `text`.
pub fn cmd_walk(
    config: &SubstrateConfig,
    json_mode: bool,
    text: &str,
    walk: WalkConfig,
) -> Result<(), SubstrateError> {
    let start = text_handle(text).into_valid().ok_or_else(|| {
        SubstrateError::MalformedInput(format!("'{text}' has no composition"))
    })?;
    let store = open_store(config)?;
    let trace = WalkEngine::new(&*store, start.hash, walk)?.run()?;

    let mut labels = Vec::with_capacity(trace.steps.len() + 1);
    for hash in trace.path() {
        labels.push(label(&store, &hash)?);
    }

    if json_mode {
        let steps: Vec<serde_json::Value> = trace
            .steps
            .iter()
            .zip(labels.iter().skip(1))
            .map(|(step, to)| {
                serde_json::json!({
                    "relation": step.relation.to_hex(),
                    "to": step.to.to_hex(),
                    "text": to,
                    "rating": step.rating,
                    "remaining_energy": step.remaining_energy
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "start": trace.start.to_hex(),
            "text": text,
            "steps": steps,
            "termination": trace.termination.name()
        }))?;
        return Ok(());
    }

    println!("Walk from {:?} ({})", text, trace.start.short());
    println!("  Path: {}", labels.join(" -> "));
    for step in &trace.steps {
        println!(
            "    {} -> {} (rating: {}, energy left: {:.2})",
            step.from.short(),
            step.to.short(),
            step.rating,
            step.remaining_energy
        );
    }
    println!("  Stopped: {}", trace.termination.name());
    Ok(())
}

// =============================================================================
// NEAR COMMAND
// =============================================================================

/// The `k` stored rows nearest to the centroid of `text`.
pub fn cmd_near(
    config: &SubstrateConfig,
    json_mode: bool,
    text: &str,
    k: usize,
) -> Result<(), SubstrateError> {
    let handle = text_handle(text).into_valid().ok_or_else(|| {
        SubstrateError::MalformedInput(format!("'{text}' has no composition"))
    })?;
    let store = open_store(config)?;
    let window = (k * NEAR_WINDOW_PER_RESULT).max(MIN_NEAR_WINDOW);
    let hits = store.near(&handle.centroid, k, window)?;

    let mut rows = Vec::with_capacity(hits.len());
    for hit in &hits {
        let shown = match hit.kind {
            NodeKind::Atom => store
                .atom(&hit.hash)?
                .and_then(|atom| char::from_u32(atom.codepoint))
                .map(String::from),
            NodeKind::Composition => store.composition_text(&hit.hash)?,
            NodeKind::Relation | NodeKind::Physicality => None,
        };
        rows.push((hit, shown));
    }

    if json_mode {
        let results: Vec<serde_json::Value> = rows
            .iter()
            .map(|(hit, shown)| {
                serde_json::json!({
                    "hash": hit.hash.to_hex(),
                    "kind": format!("{:?}", hit.kind),
                    "distance": hit.distance,
                    "text": shown
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "query": text,
            "query_hash": handle.hash.to_hex(),
            "results": results
        }))?;
        return Ok(());
    }

    println!("Nearest to {:?}:", text);
    if rows.is_empty() {
        println!("  (nothing stored)");
    }
    for (hit, shown) in rows {
        println!(
            "  {:.6}  {:<11} {}  {}",
            hit.distance,
            format!("{:?}", hit.kind),
            hit.hash.short(),
            shown.unwrap_or_default()
        );
    }
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show per-table row counts.
pub fn cmd_status(config: &SubstrateConfig, json_mode: bool) -> Result<(), SubstrateError> {
    let store = open_store(config)?;
    let counts = store.counts()?;
    let bulk_active = store.bulk_load_active()?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": config.db_path.to_string_lossy(),
            "bulk_load_active": bulk_active,
            "counts": counts
        }))?;
        return Ok(());
    }

    println!("Substrate Status");
    println!("================");
    println!("Database: {:?}", config.db_path);
    println!();
    println!("Atoms:               {}", counts.atoms);
    println!("Physicalities:       {}", counts.physicalities);
    println!("Compositions:        {}", counts.compositions);
    println!("Composition members: {}", counts.composition_members);
    println!("Relations:           {}", counts.relations);
    println!("Relation members:    {}", counts.relation_members);
    println!("Ratings:             {}", counts.ratings);
    println!("Evidence:            {}", counts.evidence);
    println!("Sources:             {}", counts.content);
    if bulk_active {
        println!();
        println!("Bulk load in progress; run `substrate rebuild-indexes` to finish it.");
    }
    Ok(())
}

// =============================================================================
// REBUILD COMMAND
// =============================================================================

/// Rebuild every secondary index and clear the bulk-load flag.
pub fn cmd_rebuild(config: &SubstrateConfig, json_mode: bool) -> Result<(), SubstrateError> {
    let store = open_store(config)?;
    let report = store.rebuild_indexes()?;

    if json_mode {
        print_json(&serde_json::json!(report))?;
        return Ok(());
    }
    print_rebuild(&report);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use substrate_core::PipelineConfig;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> SubstrateConfig {
        SubstrateConfig {
            db_path: temp.path().join("cli.redb"),
            pipeline: PipelineConfig {
                workers: 2,
                batch_size: 32,
                queue_depth: 2,
                partition_size: 2,
                text_memo: 1024,
            },
        }
    }

    #[test]
    fn bulk_ingest_leaves_indexes_live() {
        let temp = TempDir::new().expect("temp dir");
        let source = temp.path().join("words.txt");
        std::fs::write(&source, "red green\nblue green\n").expect("write");
        let config = config(&temp);

        cmd_ingest(&config, true, &[source], SourceFormat::Text, true).expect("ingest");

        let store = RedbSubstrate::open(&config.db_path).expect("open");
        assert!(!store.bulk_load_active().expect("flag"));
        let counts = store.counts().expect("counts");
        assert_eq!(counts.compositions, 3);
        assert_eq!(counts.relations, 2);
    }

    #[test]
    fn walk_and_near_read_ingested_pairs() {
        let temp = TempDir::new().expect("temp dir");
        let source = temp.path().join("pairs.tsv");
        std::fs::write(&source, "cat\tchat\ndog\tchien\tlexical\n").expect("write");
        let config = config(&temp);

        cmd_ingest(
            &config,
            false,
            &[source],
            SourceFormat::Pairs(RelationKind::Translation),
            false,
        )
        .expect("ingest");
        cmd_walk(&config, true, "cat", WalkConfig::default()).expect("walk");
        cmd_near(&config, true, "cat", 3).expect("near");
        cmd_status(&config, false).expect("status");
    }

    #[test]
    fn unrepresentable_walk_start_is_malformed() {
        let temp = TempDir::new().expect("temp dir");
        let err = cmd_walk(&config(&temp), false, "   ", WalkConfig::default())
            .expect_err("blank text");
        assert!(matches!(err, SubstrateError::MalformedInput(_)));
    }

    #[test]
    fn unreadable_file_is_skipped_and_rest_ingested() {
        let temp = TempDir::new().expect("temp dir");
        let first = temp.path().join("a_good.txt");
        let bad = temp.path().join("b_bad.txt");
        let last = temp.path().join("c_good.txt");
        std::fs::write(&first, "alpha beta\n").expect("write");
        std::fs::write(&bad, [0xFF, 0xFE, b'\n']).expect("write");
        std::fs::write(&last, "gamma delta\n").expect("write");
        let config = config(&temp);
        let files = [first, bad, last];

        let store = Arc::new(RedbSubstrate::open(&config.db_path).expect("open"));
        let ingestor = Ingestor::open(Arc::clone(&store), config.pipeline).expect("ingestor");
        let summary =
            ingest_files(&ingestor, &files, SourceFormat::Text, WriteMode::Incremental)
                .expect("ingest");
        assert_eq!(summary.files, 2);
        assert_eq!(summary.skipped_files, 1);

        let counts = store.counts().expect("counts");
        assert_eq!(counts.compositions, 4);
        assert_eq!(counts.content, 2);
    }

    #[test]
    fn bulk_ingest_survives_unreadable_file() {
        let temp = TempDir::new().expect("temp dir");
        let good = temp.path().join("good.txt");
        let bad = temp.path().join("bad.txt");
        std::fs::write(&good, "north south\n").expect("write");
        std::fs::write(&bad, [0xC3, 0x28]).expect("write");
        let config = config(&temp);

        cmd_ingest(&config, true, &[bad, good], SourceFormat::Text, true).expect("ingest");

        let store = RedbSubstrate::open(&config.db_path).expect("open");
        assert!(!store.bulk_load_active().expect("flag"));
        assert_eq!(store.counts().expect("counts").compositions, 2);
    }

    #[test]
    fn unserializable_json_is_an_error() {
        let keyed = std::collections::BTreeMap::from([((1u8, 2u8), 3u8)]);
        let err = print_json(&keyed).expect_err("tuple keys");
        assert!(matches!(err, SubstrateError::SerializationError(_)));
        print_json(&serde_json::json!({"ok": true})).expect("plain object");
    }

    #[test]
    fn rows_per_sec_uses_elapsed() {
        let mut summary = IngestSummary::default();
        summary.rows.atoms = 10;
        summary.elapsed = Duration::from_secs(2);
        assert!((summary.rows_per_sec() - 5.0).abs() < f64::EPSILON);
        assert_eq!(IngestSummary::default().rows_per_sec(), 0.0);
    }
}
