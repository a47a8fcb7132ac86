//! # Source Readers
//!
//! Turn files into `SourceDocument`s of (text, relation hint) records.
//!
//! - Text sources: every non-empty line is one `Sequence` record
//! - Pair sources: `left<TAB>right[<TAB>kind]` lines become `Pair` records;
//!   blank lines and `#` comments are ignored, malformed lines are skipped
//!   and counted
//!
//! Directories are walked recursively in sorted order.

use std::path::{Path, PathBuf};
use substrate_core::{ContentMeta, IngestRecord, RelationKind, SourceDocument, SubstrateError};

/// Maximum size of one source file (512 MB).
pub const MAX_SOURCE_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// A parsed source plus the number of lines that could not be used.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub document: SourceDocument,
    pub skipped_lines: u64,
}

// =============================================================================
// FILE DISCOVERY
// =============================================================================

/// Every regular file named by `paths`, descending into directories.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>, SubstrateError> {
    let mut files = Vec::new();
    for path in paths {
        let canonical = path.canonicalize().map_err(|e| {
            SubstrateError::IoError(format!("Invalid path '{}': {}", path.display(), e))
        })?;
        walk(&canonical, &mut files)?;
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) -> Result<(), SubstrateError> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    if !path.is_dir() {
        return Ok(());
    }
    let entries = std::fs::read_dir(path).map_err(|e| {
        SubstrateError::IoError(format!("Cannot list '{}': {}", path.display(), e))
    })?;
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SubstrateError::IoError(e.to_string()))?;
        children.push(entry.path());
    }
    children.sort();
    for child in children {
        walk(&child, out)?;
    }
    Ok(())
}

fn read_source(path: &Path) -> Result<(Vec<u8>, String), SubstrateError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        SubstrateError::IoError(format!("Cannot read file metadata: {}", e))
    })?;
    if metadata.len() > MAX_SOURCE_FILE_SIZE {
        return Err(SubstrateError::MalformedInput(format!(
            "'{}' is {} bytes, above the {} byte limit",
            path.display(),
            metadata.len(),
            MAX_SOURCE_FILE_SIZE
        )));
    }
    let bytes = std::fs::read(path)
        .map_err(|e| SubstrateError::IoError(format!("Read '{}': {}", path.display(), e)))?;
    let text = String::from_utf8(bytes.clone()).map_err(|e| {
        SubstrateError::MalformedInput(format!("'{}' is not UTF-8: {}", path.display(), e))
    })?;
    Ok((bytes, text))
}

fn meta_for(path: &Path, kind: &str) -> ContentMeta {
    ContentMeta {
        kind: kind.to_string(),
        title: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
        encoding: "utf-8".to_string(),
        ..ContentMeta::default()
    }
}

// =============================================================================
// TEXT SOURCES
// =============================================================================

/// One `Sequence` record per non-empty line.
pub fn read_text(path: &Path) -> Result<ParsedSource, SubstrateError> {
    let (bytes, text) = read_source(path)?;
    let records = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(IngestRecord::sequence)
        .collect();
    Ok(ParsedSource {
        document: SourceDocument::new(meta_for(path, "text"), &bytes, records),
        skipped_lines: 0,
    })
}

// =============================================================================
// PAIR SOURCES
// =============================================================================

/// Parse one pair line. `Ok(None)` for blank lines and comments.
pub fn parse_pair_line(
    line: &str,
    default_kind: RelationKind,
) -> Result<Option<IngestRecord>, SubstrateError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.trim_start().starts_with('#') {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('\t').collect();
    let (left, right, kind) = match fields.as_slice() {
        [left, right] => (*left, *right, default_kind),
        [left, right, kind] => {
            let kind = RelationKind::parse(kind).ok_or_else(|| {
                SubstrateError::MalformedInput(format!("unknown relation kind {kind:?}"))
            })?;
            (*left, *right, kind)
        }
        _ => {
            return Err(SubstrateError::MalformedInput(format!(
                "expected 2 or 3 tab-separated fields, got {}",
                fields.len()
            )));
        }
    };
    let record = IngestRecord::pair(left.trim(), right.trim(), kind);
    record.validate()?;
    Ok(Some(record))
}

/// One `Pair` record per well-formed line.
pub fn read_pairs(path: &Path, default_kind: RelationKind) -> Result<ParsedSource, SubstrateError> {
    let (bytes, text) = read_source(path)?;
    let mut records = Vec::new();
    let mut skipped_lines = 0u64;
    for (number, line) in text.lines().enumerate() {
        match parse_pair_line(line, default_kind) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(SubstrateError::MalformedInput(reason)) => {
                tracing::warn!(file = %path.display(), line = number + 1, %reason, "skipping line");
                skipped_lines += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ParsedSource {
        document: SourceDocument::new(meta_for(path, "pairs"), &bytes, records),
        skipped_lines,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_core::RelationHint;

    #[test]
    fn pair_line_forms() {
        let record = parse_pair_line("dog\tchien", RelationKind::Translation)
            .expect("parse")
            .expect("record");
        assert_eq!(record.text, "dog");
        assert_eq!(
            record.hint,
            RelationHint::Pair {
                partner: "chien".to_string(),
                kind: RelationKind::Translation
            }
        );

        let record = parse_pair_line("big\tlarge\tlexical", RelationKind::Translation)
            .expect("parse")
            .expect("record");
        assert!(matches!(
            record.hint,
            RelationHint::Pair {
                kind: RelationKind::Lexical,
                ..
            }
        ));

        assert!(parse_pair_line("", RelationKind::Lexical).expect("blank").is_none());
        assert!(parse_pair_line("# note", RelationKind::Lexical).expect("comment").is_none());
    }

    #[test]
    fn malformed_pair_lines() {
        assert!(parse_pair_line("only-one-field", RelationKind::Lexical).is_err());
        assert!(parse_pair_line("a\tb\tsideways", RelationKind::Lexical).is_err());
        assert!(parse_pair_line("a\t \tlexical", RelationKind::Lexical).is_err());
        assert!(parse_pair_line("a\tb\tc\td", RelationKind::Lexical).is_err());
    }

    #[test]
    fn directories_are_walked_in_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).expect("mkdir");
        std::fs::write(dir.path().join("b.txt"), "two\n").expect("write");
        std::fs::write(nested.join("a.txt"), "one\n").expect("write");

        let files = collect_files(&[dir.path().to_path_buf()]).expect("collect");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b.txt"));
        assert!(files[1].ends_with("nested/a.txt"));
    }

    #[test]
    fn text_lines_become_sequences() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("corpus.txt");
        std::fs::write(&path, "the cat\n\n  sat down  \n").expect("write");
        let parsed = read_text(&path).expect("read");
        assert_eq!(parsed.document.records.len(), 2);
        assert_eq!(parsed.document.records[1].text, "sat down");
        assert_eq!(parsed.document.meta.title, "corpus.txt");
    }

    #[test]
    fn pair_files_count_skipped_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("pairs.tsv");
        std::fs::write(&path, "# header\ncat\tchat\nbroken\nhouse\tmaison\ttranslation\n")
            .expect("write");
        let parsed = read_pairs(&path, RelationKind::Translation).expect("read");
        assert_eq!(parsed.document.records.len(), 2);
        assert_eq!(parsed.skipped_lines, 1);
    }

    #[test]
    fn non_utf8_is_malformed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).expect("write");
        assert!(matches!(read_text(&path), Err(SubstrateError::MalformedInput(_))));
    }
}
