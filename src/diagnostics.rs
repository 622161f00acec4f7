//! Compile diagnostics: parsing compiler stderr and holding per-file results.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Diagnostic, DiagnosticSeverity, Position, Range};

/// Diagnostic source label attached to everything this server reports.
pub const DIAGNOSTIC_SOURCE: &str = "capnp-compiler";

/// Per-file diagnostics, keyed by workspace-relative path.
///
/// Cleared before every compile and repopulated from compiler stderr, so its
/// contents always describe the most recent compile.
#[derive(Debug, Default)]
pub struct DiagnosticStore {
    data: HashMap<String, Vec<Diagnostic>>,
}

impl DiagnosticStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn push(&mut self, file: String, diagnostic: Diagnostic) {
        self.data.entry(file).or_default().push(diagnostic);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn for_file(&self, file: &str) -> &[Diagnostic] {
        self.data.get(file).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Diagnostic>)> {
        self.data.iter()
    }
}

/// One `file:row[-row][:col[-col]]: type: message` line, tolerating Windows
/// drive letters in the file prefix.
fn error_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*((?:\w:[/\\])?[^:]+):(\d+)(?:-(\d+))?(?::(\d+)(?:-(\d+))?)?:\s*([^:]*):\s*(.*?)\s*$",
        )
        .expect("error line pattern is valid")
    })
}

/// Parse compiler stderr, appending diagnostics for lines whose reported
/// filename equals `file_name`.
///
/// The compiler emits 1-based rows and columns; stored diagnostics are
/// 0-based. A missing row end defaults to the row start; a missing column
/// start to 0; a missing column end to the column start. The compiler does
/// not distinguish warnings in its error stream, so everything is an error.
///
/// Returns `true` iff at least one line matched `file_name`.
pub fn parse_compiler_errors(
    file_name: &str,
    stderr: &str,
    store: &mut DiagnosticStore,
) -> bool {
    let pattern = error_line_pattern();
    let mut found_any = false;

    for line in stderr.lines() {
        if line.is_empty() {
            continue;
        }
        let Some(captures) = pattern.captures(line) else {
            continue;
        };
        if &captures[1] != file_name {
            continue;
        }
        found_any = true;

        let row_start: u32 = match captures[2].parse::<u32>() {
            Ok(row) => row.saturating_sub(1),
            Err(_) => continue,
        };
        let row_end = captures
            .get(3)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map_or(row_start, |row| row.saturating_sub(1));
        let col_start = captures
            .get(4)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map_or(0, |col| col.saturating_sub(1));
        let col_end = captures
            .get(5)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map_or(col_start, |col| col.saturating_sub(1));

        store.push(
            file_name.to_string(),
            Diagnostic {
                range: Range {
                    start: Position::new(row_start, col_start),
                    end: Position::new(row_end, col_end),
                },
                severity: DiagnosticSeverity::Error,
                message: captures[7].to_string(),
                source: DIAGNOSTIC_SOURCE.to_string(),
            },
        );
    }

    found_any
}
