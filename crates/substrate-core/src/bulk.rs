//! # Bulk-Load Fast Path
//!
//! For large one-shot imports the store drops every secondary index, takes
//! plain appends without reference or norm checks, and rebuilds the
//! indexes from the sorted primary tables in one pass at the end.
//!
//! The mode is persisted: if a bulk load is interrupted, the
//! `bulk_load_active` flag stays set, index-backed reads fail with
//! `IndexUnavailable`, and `RedbSubstrate::rebuild_indexes` completes it.

use crate::storage::RedbSubstrate;
use crate::types::SubstrateError;
use serde::Serialize;
use std::sync::Arc;

/// What an index rebuild did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub atoms_indexed: u64,
    pub spatial_entries: u64,
    pub composition_edges: u64,
    pub relation_edges: u64,
    pub evidence_edges: u64,
    /// References to rows that are not stored.
    pub dangling: u64,
}

/// An open bulk load. `finish` rebuilds the indexes; dropping the guard
/// without finishing leaves the store flagged for `rebuild_indexes`.
#[derive(Debug)]
pub struct BulkLoad {
    store: Arc<RedbSubstrate>,
    finished: bool,
}

impl BulkLoad {
    /// Drop the secondary indexes and enter bulk mode.
    pub fn begin(store: Arc<RedbSubstrate>) -> Result<Self, SubstrateError> {
        store.begin_bulk_load()?;
        Ok(Self {
            store,
            finished: false,
        })
    }

    /// Rebuild every index and leave bulk mode.
    pub fn finish(mut self) -> Result<RebuildReport, SubstrateError> {
        let report = self.store.rebuild_indexes()?;
        self.finished = true;
        Ok(report)
    }
}

impl Drop for BulkLoad {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("bulk load not finished; run rebuild-indexes to restore indexes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unfinished_load_stays_flagged() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("s.redb");
        {
            let store = Arc::new(RedbSubstrate::open(&path).expect("open db"));
            let guard = BulkLoad::begin(Arc::clone(&store)).expect("begin");
            drop(guard);
            assert!(store.bulk_load_active().expect("flag"));
        }
        let store = RedbSubstrate::open(&path).expect("reopen db");
        assert!(store.bulk_load_active().expect("flag"));
        store.rebuild_indexes().expect("rebuild");
        assert!(!store.bulk_load_active().expect("flag"));
    }

    #[test]
    fn finish_clears_flag() {
        let temp = tempdir().expect("temp dir");
        let store = Arc::new(RedbSubstrate::open(temp.path().join("s.redb")).expect("open db"));
        let guard = BulkLoad::begin(Arc::clone(&store)).expect("begin");
        let report = guard.finish().expect("finish");
        assert_eq!(report, RebuildReport::default());
        assert!(!store.bulk_load_active().expect("flag"));
    }
}
