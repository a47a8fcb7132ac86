//! # Codepoint Projection
//!
//! Deterministic map from every Unicode codepoint to a unit point on S³.
//!
//! ## Scheme
//!
//! 1. **Seed rank.** A bijection on `0..CODEPOINT_SPACE` that keeps the
//!    codepoint order except inside Basic Latin, where upper and lower case
//!    letters are interleaved (`A a B b ...`) and followed by the digits and
//!    the remaining ASCII. Related codepoints get adjacent ranks.
//! 2. **Stratified cell.** `CODEPOINT_SPACE = 68 x 128 x 128` exactly, so the
//!    rank is decomposed into one cell of an equal-measure grid over the
//!    Hopf coordinates `(u = sin²η, ξ₂, ξ₁)`, walked boustrophedon so that
//!    consecutive ranks are neighbouring cells.
//! 3. **Jitter.** The atom's content hash places the point inside its cell.
//!
//! Every cell has the same measure on S³, each holds exactly one codepoint,
//! and nothing needs a persisted table: `project` recomputes any position.

use crate::geometry::Point4;
use crate::hashing::atom_hash;
use crate::primitives::CODEPOINT_SPACE;
use crate::spatial;
use crate::types::{Atom, Category, ContentHash};
use std::f64::consts::TAU;

/// Slabs along `u = sin²η`.
const GRID_U: u32 = 68;
/// Cells around the ξ₂ circle.
const GRID_XI2: u32 = 128;
/// Cells around the ξ₁ circle (innermost, fastest varying).
const GRID_XI1: u32 = 128;

const ASCII_LETTERS: u32 = 52;
const ASCII_DIGITS: u32 = 10;

/// Result of projecting one codepoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub hash: ContentHash,
    pub position: Point4,
    pub spatial_index: u64,
    pub category: Category,
}

impl Projection {
    /// The atom row for this projection.
    #[must_use]
    pub fn into_atom(self, codepoint: u32) -> Atom {
        Atom {
            hash: self.hash,
            codepoint,
            position: self.position,
            spatial_index: self.spatial_index,
            category: self.category,
        }
    }
}

/// Project a codepoint. `None` above U+10FFFF; every value below,
/// including surrogates and unassigned codepoints, has a position.
#[must_use]
pub fn project(codepoint: u32) -> Option<Projection> {
    if codepoint >= CODEPOINT_SPACE {
        return None;
    }
    let hash = atom_hash(codepoint);
    let position = place(seed_rank(codepoint), &hash);
    Some(Projection {
        hash,
        spatial_index: spatial::encode(&position),
        position,
        category: category(codepoint),
    })
}

/// The atom row for `codepoint`, if in range.
#[must_use]
pub fn atom(codepoint: u32) -> Option<Atom> {
    project(codepoint).map(|p| p.into_atom(codepoint))
}

/// Seed ordering: a permutation of the codepoint space.
#[must_use]
pub fn seed_rank(codepoint: u32) -> u32 {
    if codepoint >= 0x80 {
        return codepoint;
    }
    match codepoint {
        0x41..=0x5a => (codepoint - 0x41) * 2,
        0x61..=0x7a => (codepoint - 0x61) * 2 + 1,
        0x30..=0x39 => ASCII_LETTERS + (codepoint - 0x30),
        _ => {
            // Remaining ASCII in codepoint order, skipping the slots above.
            let skipped = match codepoint {
                0x00..=0x2f => 0,
                0x3a..=0x40 => ASCII_DIGITS,
                0x5b..=0x60 => ASCII_DIGITS + 26,
                _ => ASCII_DIGITS + 52,
            };
            ASCII_LETTERS + ASCII_DIGITS + codepoint - skipped
        }
    }
}

/// Boustrophedon decomposition of a rank into `(u, ξ₂, ξ₁)` cell indices.
fn cell(rank: u32) -> (u32, u32, u32) {
    let inner = rank % GRID_XI1;
    let row = rank / GRID_XI1;
    let middle = row % GRID_XI2;
    let slab = row / GRID_XI2;

    let xi1 = if row % 2 == 1 { GRID_XI1 - 1 - inner } else { inner };
    let xi2 = if slab % 2 == 1 { GRID_XI2 - 1 - middle } else { middle };
    (slab, xi2, xi1)
}

/// Uniform value in `[0, 1)` from a 64-bit word.
fn unit_interval(word: u64) -> f64 {
    (word >> 11) as f64 / (1u64 << 53) as f64
}

fn place(rank: u32, hash: &ContentHash) -> Point4 {
    let (slab, xi2_cell, xi1_cell) = cell(rank);

    let u = (f64::from(slab) + unit_interval(hash.word(0))) / f64::from(GRID_U);
    let xi2 = TAU * (f64::from(xi2_cell) + unit_interval(hash.word(1))) / f64::from(GRID_XI2);
    let xi1 = TAU * (f64::from(xi1_cell) + unit_interval(hash.word(2))) / f64::from(GRID_XI1);

    // u = sin²η has uniform density under the S³ volume measure.
    let sin_eta = u.sqrt();
    let cos_eta = (1.0 - u).sqrt();

    Point4([
        cos_eta * xi1.cos(),
        cos_eta * xi1.sin(),
        sin_eta * xi2.cos(),
        sin_eta * xi2.sin(),
    ])
}

/// Coarse category from codepoint ranges and `char` predicates.
#[must_use]
pub fn category(codepoint: u32) -> Category {
    match codepoint {
        0xd800..=0xdfff => return Category::Surrogate,
        0xe000..=0xf8ff | 0xf_0000..=0x10_ffff => return Category::PrivateUse,
        _ => {}
    }
    let Some(c) = char::from_u32(codepoint) else {
        return Category::Other;
    };
    if c.is_control() {
        Category::Control
    } else if c.is_whitespace() {
        Category::Whitespace
    } else if c.is_uppercase() {
        Category::Uppercase
    } else if c.is_lowercase() {
        Category::Lowercase
    } else if c.is_alphabetic() {
        Category::OtherLetter
    } else if c.is_ascii_digit() {
        Category::Digit
    } else if c.is_numeric() {
        Category::OtherNumber
    } else if is_punctuation(codepoint) {
        Category::Punctuation
    } else if is_symbol(codepoint) {
        Category::Symbol
    } else {
        Category::Other
    }
}

fn is_punctuation(codepoint: u32) -> bool {
    matches!(
        codepoint,
        0x21..=0x23 | 0x25..=0x2a | 0x2c..=0x2f | 0x3a | 0x3b | 0x3f | 0x40
            | 0x5b..=0x5d | 0x5f | 0x7b | 0x7d
            | 0xa1 | 0xa7 | 0xab | 0xb6 | 0xb7 | 0xbb | 0xbf
            | 0x2010..=0x2027 | 0x2030..=0x205e
            | 0x3001..=0x3003 | 0x3008..=0x3011
    )
}

fn is_symbol(codepoint: u32) -> bool {
    matches!(
        codepoint,
        0x24 | 0x2b | 0x3c..=0x3e | 0x5e | 0x60 | 0x7c | 0x7e
            | 0xa2..=0xa6 | 0xa8 | 0xa9 | 0xac | 0xae..=0xb1 | 0xb4 | 0xb8 | 0xd7 | 0xf7
            | 0x2100..=0x2bff | 0x1f000..=0x1faff
    )
}

// =============================================================================
// TESTS
// =============================================================================
