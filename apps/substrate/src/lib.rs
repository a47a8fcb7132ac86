//! # substrate
//!
//! CLI, configuration and source readers of the `substrate` binary, kept in
//! a library target so they can be tested directly.

pub mod cli;
pub mod config;
pub mod sources;
