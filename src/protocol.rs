//! JSON-RPC / LSP wire shapes.
//!
//! The dispatcher works with dynamic `serde_json::Value` frames; this module
//! is the one place that knows how those frames are shaped. It classifies
//! incoming frames, builds replies and server-to-client notifications, and
//! converts between `file://` URIs and workspace-relative paths.

use serde_json::{json, Value};

use crate::types::{Diagnostic, Location};

/// An incoming frame, classified.
#[derive(Debug)]
pub enum IncomingMessage {
    /// Has a numeric `id` and a `method`; a reply must be written.
    Request {
        id: serde_json::Number,
        method: String,
        params: Value,
    },
    /// Has a `method` but no usable `id`; never replied to.
    Notification { method: String, params: Value },
}

/// Classify a decoded frame.
///
/// Returns `None` for frames that carry no method (e.g. stray responses) or
/// whose `id` is present but non-numeric and non-null; per JSON-RPC these are
/// not requests we can serve. A `null` id is treated as a notification: the
/// client cannot correlate a reply to it anyway.
pub fn classify(frame: &Value) -> Option<IncomingMessage> {
    let method = frame.get("method")?.as_str()?.to_string();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match frame.get("id") {
        Some(Value::Number(id)) => Some(IncomingMessage::Request {
            id: id.clone(),
            method,
            params,
        }),
        Some(Value::Null) | None => Some(IncomingMessage::Notification { method, params }),
        Some(other) => {
            tracing::error!("invalid id type in frame: {other}");
            None
        }
    }
}

/// Build a success reply. `result` may be `Value::Null`.
#[must_use]
pub fn response(id: &serde_json::Number, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error reply.
#[must_use]
pub fn error_response(id: &serde_json::Number, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// `window/logMessage` / `window/showMessage` type values.
#[derive(Debug, Clone, Copy)]
pub enum MessageType {
    Error = 1,
    Warning = 2,
    Info = 3,
}

/// Build a `window/logMessage` notification.
#[must_use]
pub fn log_message(kind: MessageType, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "window/logMessage",
        "params": { "type": kind as u8, "message": message },
    })
}

/// Build a `window/showMessage` notification, used for fatal conditions the
/// user must see (e.g. an incompatible compiler).
#[must_use]
pub fn show_message(kind: MessageType, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "window/showMessage",
        "params": { "type": kind as u8, "message": message },
    })
}

/// Build a `textDocument/publishDiagnostics` notification.
///
/// Diagnostic coordinates are already 0-based and are emitted verbatim.
#[must_use]
pub fn publish_diagnostics(workspace: &str, relative_path: &str, diagnostics: &[Diagnostic]) -> Value {
    let items: Vec<Value> = diagnostics
        .iter()
        .map(|d| {
            json!({
                "range": {
                    "start": { "line": d.range.start.line, "character": d.range.start.character },
                    "end": { "line": d.range.end.line, "character": d.range.end.character },
                },
                "severity": d.severity.as_lsp(),
                "message": d.message,
                "source": d.source,
            })
        })
        .collect();

    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": {
            "uri": file_uri(workspace, relative_path),
            "diagnostics": items,
        },
    })
}

/// Render a symbol-index [`Location`] as an LSP location value, converting
/// the internal 1-based coordinates back to the protocol's 0-based ones.
#[must_use]
pub fn location_value(workspace: &str, location: &Location) -> Value {
    json!({
        "uri": file_uri(workspace, &location.uri),
        "range": {
            "start": {
                "line": location.range.start.line - 1,
                "character": location.range.start.character - 1,
            },
            "end": {
                "line": location.range.end.line - 1,
                "character": location.range.end.character - 1,
            },
        },
    })
}

/// Form the emitted URI for a workspace-relative path.
#[must_use]
pub fn file_uri(workspace: &str, relative_path: &str) -> String {
    format!("file://{workspace}/{relative_path}")
}

/// Strip the `file://` scheme from a client-supplied URI.
///
/// Percent-encoded URIs are decoded through the `url` crate; anything that
/// does not parse falls back to plain prefix stripping so that a slightly
/// off-spec client still works.
#[must_use]
pub fn uri_to_path(uri: &str) -> String {
    if let Ok(parsed) = url::Url::parse(uri) {
        if parsed.scheme() == "file" {
            if let Ok(path) = parsed.to_file_path() {
                return path.to_string_lossy().into_owned();
            }
        }
    }
    match uri.strip_prefix("file://") {
        Some(path) => path.to_string(),
        None => {
            tracing::error!("URI does not use the file scheme: {uri}");
            uri.to_string()
        }
    }
}
