//! Core data model shared across the server.
//!
//! Positions and ranges in the symbol indices are 1-based (byte offset 0 of a
//! file is line 1, character 1); conversion to the LSP's 0-based coordinates
//! happens only at the protocol boundary. Diagnostics, by contrast, are
//! stored 0-based because they are produced directly from compiler output and
//! emitted without further translation.

use std::collections::HashMap;

use serde::Deserialize;

/// A 1-based line/character pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A half-open-feeling but actually inclusive span: `start <= end`
/// lexicographically. Used as a map key, hence `Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    /// Componentwise containment check, matching how identifier spans are
    /// matched against cursor positions.
    #[must_use]
    pub fn contains(&self, pos: Position) -> bool {
        self.start.line <= pos.line
            && pos.line <= self.end.line
            && self.start.character <= pos.character
            && pos.character <= self.end.character
    }
}

/// A declaration site. `uri` is a workspace-relative path; the
/// `file://<workspace>/<relative>` form is assembled only when a reply or
/// notification is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// LSP diagnostic severity values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    #[must_use]
    pub fn as_lsp(self) -> u8 {
        self as u8
    }
}

/// A single compiler diagnostic. Coordinates are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub range: Range,
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub source: String,
}

/// The two symbol indices built by the resolver and owned by the handler.
///
/// `file_source_info`: per workspace-relative file, the span of every
/// identifier occurrence and the node id it refers to.
/// `node_locations`: where each node is declared.
#[derive(Debug, Default)]
pub struct SymbolIndices {
    pub file_source_info: HashMap<String, HashMap<Range, u64>>,
    pub node_locations: HashMap<u64, Location>,
}

impl SymbolIndices {
    /// Find the node id of the identifier under `pos` in `file`, if any.
    #[must_use]
    pub fn node_at(&self, file: &str, pos: Position) -> Option<u64> {
        let ranges = self.file_source_info.get(file)?;
        ranges
            .iter()
            .find(|(range, _)| range.contains(pos))
            .map(|(_, id)| *id)
    }

    /// Declaration location for a node id.
    #[must_use]
    pub fn location_of(&self, node_id: u64) -> Option<&Location> {
        self.node_locations.get(&node_id)
    }
}

/// `initializationOptions.capnp` as sent by the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapnpConfig {
    /// Path to the `capnp` executable. Empty means "capnp" on PATH.
    #[serde(default)]
    pub compiler_path: String,
    /// Extra `-I` directories, absolute or workspace-relative.
    #[serde(default)]
    pub import_paths: Vec<String>,
}
