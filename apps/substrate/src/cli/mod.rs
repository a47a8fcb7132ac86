//! # Substrate CLI Module
//!
//! ## Available Commands
//!
//! - `seed` - Bootstrap the full Atom table
//! - `ingest-text` - Ingest line-oriented text sources
//! - `ingest-pairs` - Ingest tab-separated relation pairs
//! - `walk` - Weighted walk from a composition
//! - `near` - Nearest stored rows by geometry
//! - `status` - Table row counts
//! - `rebuild-indexes` - Finish an interrupted bulk load

mod commands;

use crate::config::SubstrateConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use substrate_core::{RelationKind, SubstrateError, WalkConfig};

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Substrate - content-addressable geometric store
///
/// Every character, word, phrase and relation gets an identity derived from
/// its structure and a position on the unit 3-sphere.
#[derive(Parser, Debug)]
#[command(name = "substrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the store (overrides SUBSTRATE_DB)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap every codepoint as an Atom
    Seed,

    /// Ingest text files; each non-empty line is one sequence
    IngestText {
        /// Files or directories (walked recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Use the bulk-load fast path (drop and rebuild indexes)
        #[arg(long)]
        bulk: bool,
    },

    /// Ingest `left<TAB>right[<TAB>kind]` pair files
    IngestPairs {
        /// Files or directories (walked recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Relation kind for lines without a third field
        #[arg(short, long, default_value = "translation", value_parser = parse_kind)]
        kind: RelationKind,

        /// Use the bulk-load fast path (drop and rebuild indexes)
        #[arg(long)]
        bulk: bool,
    },

    /// Walk the relation graph from the composition of TEXT
    Walk {
        /// Start text (a word or phrase)
        text: String,

        /// Starting energy
        #[arg(short, long, default_value_t = substrate_core::primitives::DEFAULT_WALK_ENERGY)]
        energy: f64,

        /// Energy spent per step
        #[arg(short, long, default_value_t = substrate_core::primitives::DEFAULT_STEP_COST)]
        cost: f64,

        /// Selection temperature (0 = greedy)
        #[arg(short, long, default_value_t = substrate_core::primitives::DEFAULT_TEMPERATURE)]
        temperature: f64,

        /// RNG seed
        #[arg(short, long, default_value_t = 0)]
        seed: u64,

        /// Hard step limit
        #[arg(short, long, default_value_t = substrate_core::primitives::MAX_WALK_STEPS)]
        max_steps: usize,
    },

    /// Stored rows nearest to the position of TEXT
    Near {
        /// Query text
        text: String,

        /// Number of results
        #[arg(short, default_value_t = 10)]
        k: usize,
    },

    /// Show table row counts
    Status,

    /// Rebuild secondary indexes after an interrupted bulk load
    RebuildIndexes,
}

fn parse_kind(raw: &str) -> Result<RelationKind, String> {
    RelationKind::parse(raw).ok_or_else(|| {
        format!(
            "unknown relation kind '{raw}' (adjacency, cooccurrence, dependency, lexical, translation)"
        )
    })
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), SubstrateError> {
    let mut config = SubstrateConfig::from_env()?;
    if let Some(database) = cli.database {
        config.db_path = database;
    }
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Seed) => cmd_seed(&config, json_mode),
        Some(Commands::IngestText { paths, bulk }) => {
            cmd_ingest(&config, json_mode, &paths, SourceFormat::Text, bulk)
        }
        Some(Commands::IngestPairs { paths, kind, bulk }) => {
            cmd_ingest(&config, json_mode, &paths, SourceFormat::Pairs(kind), bulk)
        }
        Some(Commands::Walk {
            text,
            energy,
            cost,
            temperature,
            seed,
            max_steps,
        }) => {
            let walk = WalkConfig {
                energy,
                step_cost: cost,
                temperature,
                max_steps,
                seed,
            };
            cmd_walk(&config, json_mode, &text, walk)
        }
        Some(Commands::Near { text, k }) => cmd_near(&config, json_mode, &text, k),
        Some(Commands::Status) => cmd_status(&config, json_mode),
        Some(Commands::RebuildIndexes) => cmd_rebuild(&config, json_mode),
        None => {
            // No subcommand - show status by default
            cmd_status(&config, json_mode)
        }
    }
}
