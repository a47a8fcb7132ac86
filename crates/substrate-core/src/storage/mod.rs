//! # Storage
//!
//! Durable substrate storage on redb.

mod redb_substrate;

pub use redb_substrate::{NearHit, RedbSubstrate, StoreCounts, WriteMode, WriteStats};
