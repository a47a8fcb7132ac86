//! # Substrate
//!
//! Command-line front end of the content-addressable geometric substrate.
//!
//! ## Usage
//!
//! ```bash
//! # Bootstrap every codepoint as an Atom
//! SUBSTRATE_DB=corpus.redb substrate seed
//!
//! # Ingest text and translation pairs
//! substrate -D corpus.redb ingest-text books/
//! substrate -D corpus.redb ingest-pairs --kind translation pairs.tsv --bulk
//!
//! # Read side
//! substrate -D corpus.redb walk "the dog" --temperature 0.5 --seed 7
//! substrate -D corpus.redb near fox -k 5
//! ```

use clap::Parser;
use substrate::cli;
use substrate::config::ENV_LOG_FORMAT;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // SUBSTRATE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var(ENV_LOG_FORMAT).unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "substrate=info,substrate_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        "substrate v{} - content-addressable geometric store\n",
        env!("CARGO_PKG_VERSION")
    );
}
