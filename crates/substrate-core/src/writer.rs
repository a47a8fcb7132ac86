//! # Batch Writer
//!
//! A dedicated thread owns the write side of the store. Producers hand
//! finished batches over a bounded channel and block only when it is full.
//!
//! Per batch the writer:
//! - commits it in one transaction and records the inserted rows
//! - defers it on `DanglingReference` (incremental mode), retrying after
//!   every later commit
//! - on any other non-fatal error, rolls it back and evicts its claims from
//!   the cache so later records can emit those rows again
//! - stops the run on a fatal error
//!
//! Deferred batches are resolved at drain time, or earlier once more than
//! `DEFERRED_PER_QUEUE_SLOT * queue_depth` of them are waiting. Batches
//! that reference rows no other deferred batch provides fail on their own;
//! the rest wait only on each other and are merged into one write.

use crate::batch::Batch;
use crate::cache::SubstrateCache;
use crate::storage::{RedbSubstrate, WriteMode, WriteStats};
use crate::types::{ContentHash, SubstrateError};
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Deferred batches allowed per handoff queue slot before a forced drain.
const DEFERRED_PER_QUEUE_SLOT: usize = 16;

/// Outcome of one writer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterReport {
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Batches that had to wait for another batch's rows at least once.
    pub batches_deferred: u64,
    pub rows: WriteStats,
}

/// Producer side of the handoff queue.
#[derive(Debug, Clone)]
pub struct BatchSender {
    tx: Sender<Batch>,
}

impl BatchSender {
    /// Hand a batch to the writer. Empty batches are dropped.
    pub fn send(&self, batch: Batch) -> Result<(), SubstrateError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(batch)
            .map_err(|_| SubstrateError::StoreUnavailable("writer stopped".to_string()))
    }
}

/// Handle to the writer thread.
#[derive(Debug)]
pub struct BatchWriter {
    handle: JoinHandle<Result<WriterReport, SubstrateError>>,
}

impl BatchWriter {
    /// Start the writer thread with a queue of `queue_depth` batches.
    pub fn spawn(
        store: Arc<RedbSubstrate>,
        cache: Arc<SubstrateCache>,
        mode: WriteMode,
        queue_depth: usize,
    ) -> Result<(BatchSender, BatchWriter), SubstrateError> {
        let queue_depth = queue_depth.max(1);
        let (tx, rx) = bounded(queue_depth);
        let max_deferred = queue_depth.saturating_mul(DEFERRED_PER_QUEUE_SLOT);
        let handle = std::thread::Builder::new()
            .name("substrate-writer".to_string())
            .spawn(move || WriterLoop::new(&store, &cache, mode, max_deferred).run(&rx))
            .map_err(|e| SubstrateError::IoError(e.to_string()))?;
        Ok((BatchSender { tx }, BatchWriter { handle }))
    }

    /// Wait for the queue to drain. Every `BatchSender` must be dropped
    /// first or this blocks forever.
    pub fn finish(self) -> Result<WriterReport, SubstrateError> {
        self.handle
            .join()
            .map_err(|_| SubstrateError::StoreUnavailable("writer thread panicked".to_string()))?
    }
}

// =============================================================================
// LOOP
// =============================================================================

struct WriterLoop<'a> {
    store: &'a RedbSubstrate,
    cache: &'a SubstrateCache,
    mode: WriteMode,
    deferred: Vec<Batch>,
    max_deferred: usize,
    report: WriterReport,
}

enum Attempt {
    Committed,
    Deferred(Batch),
    Failed,
}

impl<'a> WriterLoop<'a> {
    fn new(
        store: &'a RedbSubstrate,
        cache: &'a SubstrateCache,
        mode: WriteMode,
        max_deferred: usize,
    ) -> Self {
        Self {
            store,
            cache,
            mode,
            deferred: Vec::new(),
            max_deferred,
            report: WriterReport::default(),
        }
    }

    fn run(mut self, rx: &Receiver<Batch>) -> Result<WriterReport, SubstrateError> {
        for batch in rx {
            match self.attempt(batch)? {
                Attempt::Committed => self.retry_deferred()?,
                Attempt::Deferred(batch) => self.defer(batch)?,
                Attempt::Failed => {}
            }
        }
        self.drain()?;
        Ok(self.report)
    }

    fn defer(&mut self, batch: Batch) -> Result<(), SubstrateError> {
        self.report.batches_deferred += 1;
        self.deferred.push(batch);
        if self.deferred.len() > self.max_deferred {
            tracing::warn!(
                deferred = self.deferred.len(),
                limit = self.max_deferred,
                "deferral queue full, draining early"
            );
            self.drain()?;
        }
        Ok(())
    }

    fn attempt(&mut self, batch: Batch) -> Result<Attempt, SubstrateError> {
        match self.store.write_batch(&batch, self.mode) {
            Ok(stats) => {
                self.report.rows.add(&stats);
                self.report.batches_committed += 1;
                tracing::debug!(batch = batch.id, rows = stats.total(), "batch committed");
                Ok(Attempt::Committed)
            }
            Err(SubstrateError::DanglingReference(hash)) if self.mode == WriteMode::Incremental => {
                tracing::debug!(batch = batch.id, missing = %hash.short(), "batch deferred");
                Ok(Attempt::Deferred(batch))
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(batch = batch.id, error = %err, "fatal write error");
                Err(err)
            }
            Err(err) => {
                self.fail(&batch, &err.to_string());
                Ok(Attempt::Failed)
            }
        }
    }

    fn retry_deferred(&mut self) -> Result<(), SubstrateError> {
        loop {
            let pending = std::mem::take(&mut self.deferred);
            let before = pending.len();
            for batch in pending {
                if let Attempt::Deferred(batch) = self.attempt(batch)? {
                    self.deferred.push(batch);
                }
            }
            if self.deferred.len() == before {
                return Ok(());
            }
        }
    }

    fn drain(&mut self) -> Result<(), SubstrateError> {
        self.retry_deferred()?;
        self.fail_unresolvable()?;
        let mut pending = std::mem::take(&mut self.deferred).into_iter();
        let Some(mut merged) = pending.next() else {
            return Ok(());
        };
        // What is left waits only on rows of other deferred batches.
        let mut parts = 1u64;
        for batch in pending {
            merged.merge(batch);
            parts += 1;
        }
        match self.store.write_batch(&merged, self.mode) {
            Ok(stats) => {
                self.report.rows.add(&stats);
                self.report.batches_committed += parts;
                tracing::debug!(batches = parts, rows = stats.total(), "deferred batches committed");
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.fail(&merged, &err.to_string());
                self.report.batches_failed += parts - 1;
                Ok(())
            }
        }
    }

    /// Fail every deferred batch that references a row neither durable nor
    /// claimed by another deferred batch. Failing one batch withdraws its
    /// rows, so repeat until nothing changes.
    fn fail_unresolvable(&mut self) -> Result<(), SubstrateError> {
        loop {
            let provided: BTreeSet<ContentHash> = self
                .deferred
                .iter()
                .flat_map(Batch::claimed_hashes)
                .copied()
                .collect();
            let pending = std::mem::take(&mut self.deferred);
            let before = pending.len();
            for batch in pending {
                match self.store.missing_references(&batch, &provided)?.first() {
                    Some(hash) => {
                        let reason = SubstrateError::DanglingReference(*hash).to_string();
                        self.fail(&batch, &reason);
                    }
                    None => self.deferred.push(batch),
                }
            }
            if self.deferred.len() == before {
                return Ok(());
            }
        }
    }

    fn fail(&mut self, batch: &Batch, reason: &str) {
        let err = SubstrateError::BatchWriteFailure {
            batch: batch.id,
            reason: reason.to_string(),
        };
        tracing::warn!(error = %err, "batch rolled back");
        self.cache.evict(batch.claimed_hashes());
        self.cache.clear_texts();
        self.report.batches_failed += 1;
    }
}

// =============================================================================
// TESTS
// =============================================================================
