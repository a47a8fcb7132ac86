//! # Ingestor
//!
//! Runs the ingestion pipeline for one source document or for the atom
//! bootstrap.
//!
//! - Records are validated before any compute; malformed records are
//!   skipped and counted
//! - The content row is stored before any row derived from it
//! - One rayon task per partition computes bundles, claims them through
//!   the cache and fills a partition-local batch
//! - Full batches move to the writer thread; nothing shared is touched
//!   afterwards
//! - Per-partition tallies are reduced once, after the pool finishes

use crate::batch::Batch;
use crate::cache::SubstrateCache;
use crate::compute::{
    ChildHandle, CompositionHandle, Computed, Invalid, ProjectedAtoms, compute_composition,
    compute_relation, compute_sequence,
};
use crate::hashing::content_hash;
use crate::primitives::{
    ATOM_SEED_PARTITION, CODEPOINT_SPACE, DEFAULT_BATCH_SIZE, DEFAULT_PARTITION_SIZE,
    DEFAULT_QUEUE_DEPTH, DEFAULT_TEXT_MEMO, MAX_RECORD_TOKENS, MAX_TEXT_LENGTH,
};
use crate::projection;
use crate::rating::baseline;
use crate::storage::{RedbSubstrate, WriteMode};
use crate::types::{ContentHash, ContentMeta, ContentRecord, RelationKind, SubstrateError};
use crate::writer::{BatchSender, BatchWriter, WriterReport};
use rayon::prelude::*;
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// INPUT
// =============================================================================

/// How the words of a record relate to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationHint {
    /// Words become compositions; consecutive words are adjacent.
    Sequence,
    /// As `Sequence`, plus one composition of the words themselves.
    Phrase,
    /// The record and `partner` are related as `kind`.
    Pair { partner: String, kind: RelationKind },
}

/// One (text, relation hint) tuple from an upstream parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRecord {
    pub text: String,
    pub hint: RelationHint,
}

impl IngestRecord {
    pub fn sequence(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hint: RelationHint::Sequence,
        }
    }

    pub fn phrase(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hint: RelationHint::Phrase,
        }
    }

    pub fn pair(left: impl Into<String>, right: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            text: left.into(),
            hint: RelationHint::Pair {
                partner: right.into(),
                kind,
            },
        }
    }

    /// Reject records that cannot be represented.
    pub fn validate(&self) -> Result<(), SubstrateError> {
        validate_text(&self.text)?;
        if let RelationHint::Pair { partner, .. } = &self.hint {
            validate_text(partner)?;
        }
        Ok(())
    }
}

fn validate_text(text: &str) -> Result<(), SubstrateError> {
    if text.trim().is_empty() {
        return Err(SubstrateError::MalformedInput("empty text".to_string()));
    }
    if text.len() > MAX_TEXT_LENGTH {
        return Err(SubstrateError::MalformedInput(format!(
            "text of {} bytes exceeds {MAX_TEXT_LENGTH}",
            text.len()
        )));
    }
    if text.split_whitespace().count() > MAX_RECORD_TOKENS {
        return Err(SubstrateError::MalformedInput(format!(
            "more than {MAX_RECORD_TOKENS} tokens"
        )));
    }
    Ok(())
}

/// A source and the records parsed from it.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub meta: ContentMeta,
    /// BLAKE3 digest of the raw source bytes.
    pub body_digest: [u8; 32],
    pub records: Vec<IngestRecord>,
}

impl SourceDocument {
    pub fn new(meta: ContentMeta, body: &[u8], records: Vec<IngestRecord>) -> Self {
        Self {
            meta,
            body_digest: *blake3::hash(body).as_bytes(),
            records,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        content_hash(&self.meta, &self.body_digest)
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Sizing of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Item count at which a batch is handed to the writer.
    pub batch_size: usize,
    /// Batches the handoff queue holds before producers block.
    pub queue_depth: usize,
    /// Records per compute task.
    pub partition_size: usize,
    /// Word and phrase handles memoized across records; 0 disables it.
    pub text_memo: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            partition_size: DEFAULT_PARTITION_SIZE,
            text_memo: DEFAULT_TEXT_MEMO,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), SubstrateError> {
        for (name, value) in [
            ("workers", self.workers),
            ("batch_size", self.batch_size),
            ("queue_depth", self.queue_depth),
            ("partition_size", self.partition_size),
        ] {
            if value == 0 {
                return Err(SubstrateError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

// =============================================================================
// RUN STATE
// =============================================================================

/// Shared stop flag, checked between records and before every handoff.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a partition task needs, owned by the run that created it.
struct RunContext<'r> {
    cache: &'r SubstrateCache,
    sender: BatchSender,
    config: &'r PipelineConfig,
    cancel: &'r CancelToken,
    source: ContentHash,
}

/// Counters of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionTally {
    pub records: u64,
    pub skipped: u64,
    /// Composition and relation bundles computed.
    pub bundles: u64,
    /// Rows this partition claimed and emitted.
    pub claimed_rows: u64,
    pub batches: u64,
    /// Rows discarded unflushed after cancellation.
    pub discarded_rows: u64,
}

impl PartitionTally {
    pub fn merge(&mut self, other: &PartitionTally) {
        self.records += other.records;
        self.skipped += other.skipped;
        self.bundles += other.bundles;
        self.claimed_rows += other.claimed_rows;
        self.batches += other.batches;
        self.discarded_rows += other.discarded_rows;
    }
}

/// Result of one ingestion run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunReport {
    pub partitions: u64,
    pub tally: PartitionTally,
    pub writer: WriterReport,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// Rows inserted per second of wall time.
    #[must_use]
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.writer.rows.total() as f64 / secs
        } else {
            0.0
        }
    }
}

// =============================================================================
// PARTITION WORKER
// =============================================================================

struct PartitionWorker<'c, 'r> {
    ctx: &'c RunContext<'r>,
    partition: u64,
    seq: u64,
    batch: Batch,
    tally: PartitionTally,
}

impl<'c, 'r> PartitionWorker<'c, 'r> {
    fn new(ctx: &'c RunContext<'r>, partition: u64) -> Self {
        Self {
            ctx,
            partition,
            seq: 0,
            batch: Batch::new(partition << 32),
            tally: PartitionTally::default(),
        }
    }

    fn cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    fn maybe_flush(&mut self) -> Result<(), SubstrateError> {
        if self.batch.len() >= self.ctx.config.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SubstrateError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.seq += 1;
        let full = std::mem::replace(&mut self.batch, Batch::new((self.partition << 32) | self.seq));
        if self.cancelled() {
            self.tally.discarded_rows += full.len() as u64;
            self.ctx.cache.evict(full.claimed_hashes());
            self.ctx.cache.clear_texts();
            return Ok(());
        }
        self.tally.batches += 1;
        self.ctx.sender.send(full)
    }

    fn finish(mut self) -> Result<PartitionTally, SubstrateError> {
        self.flush()?;
        Ok(self.tally)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    fn record(&mut self, record: &IngestRecord) -> Result<(), SubstrateError> {
        match self.absorb_record(record) {
            Ok(()) => self.tally.records += 1,
            Err(SubstrateError::MalformedInput(reason)) => {
                tracing::warn!(partition = self.partition, %reason, "skipping record");
                self.tally.skipped += 1;
            }
            Err(err) => return Err(err),
        }
        self.maybe_flush()
    }

    fn absorb_record(&mut self, record: &IngestRecord) -> Result<(), SubstrateError> {
        record.validate()?;
        match &record.hint {
            RelationHint::Sequence => {
                self.words(&record.text)?;
            }
            RelationHint::Phrase => {
                let words = self.words(&record.text)?;
                self.phrase(&record.text, &words)?;
            }
            RelationHint::Pair { partner, kind } => {
                let left = self.side(&record.text)?;
                let right = self.side(partner)?;
                self.relate(&left, &right, *kind)?;
            }
        }
        Ok(())
    }

    /// Word compositions of `text`, with consecutive words related.
    fn words(&mut self, text: &str) -> Result<Vec<CompositionHandle>, SubstrateError> {
        let handles = text
            .split_whitespace()
            .map(|word| self.word(word))
            .collect::<Result<Vec<_>, _>>()?;
        for pair in handles.windows(2) {
            self.relate(&pair[0], &pair[1], RelationKind::Adjacency)?;
        }
        Ok(handles)
    }

    /// One side of a pair: its word, or the phrase of its words.
    fn side(&mut self, text: &str) -> Result<CompositionHandle, SubstrateError> {
        let words = text
            .split_whitespace()
            .map(|word| self.word(word))
            .collect::<Result<Vec<_>, _>>()?;
        self.phrase(text, &words)
    }

    fn word(&mut self, word: &str) -> Result<CompositionHandle, SubstrateError> {
        if let Some(handle) = self.ctx.cache.text_handle(word) {
            return Ok(handle);
        }
        let bundle = valid(compute_composition(word, &ProjectedAtoms), word)?;
        let handle = bundle.handle;
        self.tally.bundles += 1;
        self.tally.claimed_rows += self.batch.absorb_composition(bundle, self.ctx.cache) as u64;
        self.ctx.cache.remember_text(word, handle);
        Ok(handle)
    }

    fn phrase(
        &mut self,
        text: &str,
        words: &[CompositionHandle],
    ) -> Result<CompositionHandle, SubstrateError> {
        if let [single] = words {
            return Ok(*single);
        }
        // Words never contain whitespace, so phrase keys cannot shadow them.
        let key = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if let Some(handle) = self.ctx.cache.text_handle(&key) {
            return Ok(handle);
        }
        let children: Vec<ChildHandle> = words.iter().map(ChildHandle::from).collect();
        let bundle = valid(compute_sequence(&children), text)?;
        let handle = bundle.handle;
        self.tally.bundles += 1;
        self.tally.claimed_rows += self.batch.absorb_composition(bundle, self.ctx.cache) as u64;
        self.ctx.cache.remember_text(&key, handle);
        Ok(handle)
    }

    fn relate(
        &mut self,
        a: &CompositionHandle,
        b: &CompositionHandle,
        kind: RelationKind,
    ) -> Result<(), SubstrateError> {
        let bundle = valid(
            compute_relation(a, b, self.ctx.source, baseline(kind)),
            kind.name(),
        )?;
        self.tally.bundles += 1;
        self.tally.claimed_rows += self.batch.absorb_relation(bundle, self.ctx.cache) as u64;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Atoms
    // -------------------------------------------------------------------------

    fn atoms(&mut self, codepoints: Range<u32>) -> Result<(), SubstrateError> {
        for codepoint in codepoints {
            if self.cancelled() {
                break;
            }
            if let Some(atom) = projection::atom(codepoint) {
                if self.batch.absorb_atom(atom, self.ctx.cache) {
                    self.tally.claimed_rows += 1;
                }
            }
            self.tally.records += 1;
            self.maybe_flush()?;
        }
        Ok(())
    }
}

fn valid<T>(computed: Computed<T>, what: &str) -> Result<T, SubstrateError> {
    match computed {
        Computed::Valid(value) => Ok(value),
        Computed::Invalid(reason) => Err(SubstrateError::MalformedInput(format!(
            "{what:?}: {reason:?}"
        ))),
    }
}

/// Handle of the composition `text` ingests as: its word, or the phrase
/// of its words. Pure; used to address stored text.
#[must_use]
pub fn text_handle(text: &str) -> Computed<CompositionHandle> {
    let mut words = Vec::new();
    for word in text.split_whitespace() {
        match compute_composition(word, &ProjectedAtoms) {
            Computed::Valid(bundle) => words.push(bundle.handle),
            Computed::Invalid(reason) => return Computed::Invalid(reason),
        }
    }
    match words.as_slice() {
        [] => Computed::Invalid(Invalid::Empty),
        [single] => Computed::Valid(*single),
        _ => {
            let children: Vec<ChildHandle> = words.iter().map(ChildHandle::from).collect();
            compute_sequence(&children).map(|bundle| bundle.handle)
        }
    }
}

// =============================================================================
// INGESTOR
// =============================================================================

/// Owns the worker pool and the run-spanning cache of one store.
pub struct Ingestor {
    store: Arc<RedbSubstrate>,
    cache: Arc<SubstrateCache>,
    config: PipelineConfig,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Build an ingestor with a cache preloaded from `store`.
    pub fn open(store: Arc<RedbSubstrate>, config: PipelineConfig) -> Result<Self, SubstrateError> {
        let cache = Arc::new(SubstrateCache::preload(&store)?.with_text_capacity(config.text_memo));
        Self::with_cache(store, cache, config)
    }

    pub fn with_cache(
        store: Arc<RedbSubstrate>,
        cache: Arc<SubstrateCache>,
        config: PipelineConfig,
    ) -> Result<Self, SubstrateError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("substrate-worker-{i}"))
            .build()
            .map_err(|e| SubstrateError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            store,
            cache,
            config,
            pool,
        })
    }

    /// Store this ingestor writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<RedbSubstrate> {
        &self.store
    }

    /// Ingest one source document.
    pub fn ingest(
        &self,
        doc: &SourceDocument,
        mode: WriteMode,
        cancel: &CancelToken,
    ) -> Result<RunReport, SubstrateError> {
        self.check_mode(mode)?;
        let source = doc.content_hash();
        self.store.put_content(&ContentRecord {
            hash: source,
            meta: doc.meta.clone(),
        })?;
        tracing::info!(
            source = %source.short(),
            title = %doc.meta.title,
            records = doc.records.len(),
            "ingest started"
        );
        let partitions: Vec<&[IngestRecord]> =
            doc.records.chunks(self.config.partition_size).collect();
        let report = self.run(mode, cancel, source, &partitions, |worker, records| {
            for record in *records {
                if worker.cancelled() {
                    break;
                }
                worker.record(record)?;
            }
            Ok(())
        })?;
        log_report("ingest finished", &report);
        Ok(report)
    }

    /// Bootstrap every atom of the codepoint space.
    pub fn seed_atoms(&self, mode: WriteMode, cancel: &CancelToken) -> Result<RunReport, SubstrateError> {
        self.check_mode(mode)?;
        tracing::info!(codepoints = CODEPOINT_SPACE, "atom seed started");
        let partitions: Vec<Range<u32>> = (0..CODEPOINT_SPACE)
            .step_by(ATOM_SEED_PARTITION as usize)
            .map(|start| start..start.saturating_add(ATOM_SEED_PARTITION).min(CODEPOINT_SPACE))
            .collect();
        let report = self.run(mode, cancel, ContentHash::MIN, &partitions, |worker, range| {
            worker.atoms(range.clone())
        })?;
        log_report("atom seed finished", &report);
        Ok(report)
    }

    fn check_mode(&self, mode: WriteMode) -> Result<(), SubstrateError> {
        match (mode, self.store.bulk_load_active()?) {
            (WriteMode::Incremental, true) => Err(SubstrateError::IndexUnavailable("incremental ingest")),
            (WriteMode::Bulk, false) => Err(SubstrateError::ConstraintViolation(
                "bulk writes need an open bulk load".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn run<P, F>(
        &self,
        mode: WriteMode,
        cancel: &CancelToken,
        source: ContentHash,
        partitions: &[P],
        work: F,
    ) -> Result<RunReport, SubstrateError>
    where
        P: Sync,
        F: Fn(&mut PartitionWorker<'_, '_>, &P) -> Result<(), SubstrateError> + Sync,
    {
        let start = Instant::now();
        let (sender, writer) = BatchWriter::spawn(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            mode,
            self.config.queue_depth,
        )?;
        let ctx = RunContext {
            cache: &self.cache,
            sender,
            config: &self.config,
            cancel,
            source,
        };

        let results: Vec<Result<PartitionTally, SubstrateError>> = self.pool.install(|| {
            partitions
                .par_iter()
                .enumerate()
                .map(|(index, part)| {
                    let mut worker = PartitionWorker::new(&ctx, index as u64);
                    work(&mut worker, part)?;
                    worker.finish()
                })
                .collect()
        });
        // Closing the queue lets the writer drain.
        drop(ctx);
        let written = writer.finish();

        let mut tally = PartitionTally::default();
        let mut failure = None;
        for result in results {
            match result {
                Ok(partition) => tally.merge(&partition),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        let writer_report = written?;
        if let Some(err) = failure {
            tracing::error!(error = %err, "run aborted");
            return Err(err);
        }

        Ok(RunReport {
            partitions: partitions.len() as u64,
            tally,
            writer: writer_report,
            cancelled: cancel.is_cancelled(),
            elapsed: start.elapsed(),
        })
    }
}

fn log_report(message: &str, report: &RunReport) {
    tracing::info!(
        records = report.tally.records,
        skipped = report.tally.skipped,
        rows = report.writer.rows.total(),
        batches = report.writer.batches_committed,
        failed = report.writer.batches_failed,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "{message}"
    );
}

// =============================================================================
// TESTS
// =============================================================================
