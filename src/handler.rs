//! Per-method LSP handling and session state.
//!
//! The handler owns everything mutable: the lifecycle state machine, the
//! session configuration established by `initialize`, the two symbol indices,
//! and the diagnostic store. All mutation happens from its methods, which the
//! dispatcher awaits one at a time, so nothing needs a lock.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::compiler::{CompilationManager, CompileError, CompileParams};
use crate::diagnostics::DiagnosticStore;
use crate::protocol::{self, MessageType};
use crate::types::{CapnpConfig, Position, SymbolIndices};

/// Server lifecycle. `Exited` is the process exit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    ShuttingDown,
}

/// Established once by `initialize`, read-only afterwards.
#[derive(Debug)]
struct Session {
    /// Absolute workspace path, no trailing slash.
    workspace_path: String,
    compiler_path: String,
    import_paths: Vec<String>,
}

/// Outcome of a request method; the dispatcher turns it into a reply frame.
#[derive(Debug)]
pub enum Reply {
    Result(Value),
    Error { code: i64, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    workspace_folders: Vec<WorkspaceFolder>,
    #[serde(default)]
    initialization_options: InitializationOptions,
}

#[derive(Debug, Deserialize)]
struct WorkspaceFolder {
    uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct InitializationOptions {
    #[serde(default)]
    capnp: CapnpConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextDocumentParams {
    text_document: TextDocumentIdentifier,
}

#[derive(Debug, Deserialize)]
struct TextDocumentIdentifier {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionParams {
    text_document: TextDocumentIdentifier,
    position: LspPosition,
}

#[derive(Debug, Deserialize)]
struct LspPosition {
    line: u32,
    character: u32,
}

#[derive(Debug, Deserialize)]
struct DidChangeWatchedFilesParams {
    #[serde(default)]
    changes: Vec<FileEvent>,
}

#[derive(Debug, Deserialize)]
struct FileEvent {
    uri: String,
}

pub struct LspHandler {
    state: LifecycleState,
    session: Option<Session>,
    indices: SymbolIndices,
    diagnostics: DiagnosticStore,
    compiler: CompilationManager,
    outbound: mpsc::Sender<Value>,
}

impl LspHandler {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Value>) -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            session: None,
            indices: SymbolIndices::default(),
            diagnostics: DiagnosticStore::new(),
            compiler: CompilationManager::new(),
            outbound,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Force the shutdown transition (input EOF, signal, protocol error).
    pub fn force_shutdown(&mut self) {
        if self.state != LifecycleState::ShuttingDown {
            tracing::info!("entering shutdown");
            self.state = LifecycleState::ShuttingDown;
        }
    }

    /// Handle a request; the returned [`Reply`] must be written back.
    pub async fn handle_request(&mut self, method: &str, params: Value) -> Reply {
        match method {
            "initialize" => self.on_initialize(params),
            "shutdown" => {
                tracing::info!("shutdown requested");
                self.state = LifecycleState::ShuttingDown;
                Reply::Result(Value::Null)
            }
            "textDocument/definition" => Reply::Result(self.on_definition(params)),
            "textDocument/completion" => {
                // Advertised in capabilities; no completions are computed yet.
                Reply::Result(json!({ "isIncomplete": false, "items": [] }))
            }
            // Document events are notifications in practice, but a frame that
            // carries an id still gets the same treatment plus a null reply.
            "textDocument/didOpen" | "textDocument/didSave" | "workspace/didChangeWatchedFiles" => {
                self.handle_notification(method, params).await;
                Reply::Result(Value::Null)
            }
            other => {
                tracing::error!(method = other, "unknown request method");
                Reply::Result(Value::Null)
            }
        }
    }

    /// Handle a notification; nothing is ever written in reply.
    pub async fn handle_notification(&mut self, method: &str, params: Value) {
        match method {
            "textDocument/didOpen" | "textDocument/didSave" => {
                match serde_json::from_value::<TextDocumentParams>(params) {
                    Ok(p) => self.compile_capnp_file(&p.text_document.uri).await,
                    Err(e) => tracing::error!(method, "malformed params: {e}"),
                }
            }
            "workspace/didChangeWatchedFiles" => {
                match serde_json::from_value::<DidChangeWatchedFilesParams>(params) {
                    Ok(p) => {
                        for change in &p.changes {
                            self.compile_capnp_file(&change.uri).await;
                        }
                    }
                    Err(e) => tracing::error!(method, "malformed params: {e}"),
                }
            }
            "initialized" | "$/setTrace" | "$/cancelRequest" | "textDocument/didChange" => {
                tracing::info!(method, "ignoring method");
            }
            other => {
                tracing::error!(method = other, "unknown notification method");
            }
        }
    }

    fn on_initialize(&mut self, params: Value) -> Reply {
        if self.state != LifecycleState::Uninitialized {
            return Reply::Error {
                code: -32600,
                message: "server is already initialized".to_string(),
            };
        }

        let params: InitializeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return Reply::Error {
                    code: -32602,
                    message: format!("malformed initialize params: {e}"),
                };
            }
        };

        let Some(folder) = params.workspace_folders.first() else {
            return Reply::Error {
                code: -32602,
                message: "workspaceFolders is required".to_string(),
            };
        };

        let workspace_path = protocol::uri_to_path(&folder.uri)
            .trim_end_matches('/')
            .to_string();
        let capnp = params.initialization_options.capnp;
        tracing::info!(
            workspace = %workspace_path,
            compiler = %capnp.compiler_path,
            "initialized"
        );

        self.session = Some(Session {
            workspace_path,
            compiler_path: capnp.compiler_path,
            import_paths: capnp.import_paths,
        });
        self.state = LifecycleState::Initialized;

        Reply::Result(json!({
            "capabilities": {
                "textDocumentSync": { "openClose": true, "change": 1, "save": true },
                "definitionProvider": true,
                "completionProvider": true,
                "workspace/didChangeWatchedFiles": true,
            }
        }))
    }

    fn on_definition(&mut self, params: Value) -> Value {
        let params: DefinitionParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("malformed definition params: {e}");
                return Value::Null;
            }
        };
        let Some(session) = &self.session else {
            tracing::error!("definition request before initialize");
            return Value::Null;
        };

        // LSP positions are 0-based; the indices are 1-based.
        let position = Position::new(params.position.line + 1, params.position.character + 1);

        let path = protocol::uri_to_path(&params.text_document.uri);
        let Some(relative) = strip_workspace_prefix(&path, &session.workspace_path) else {
            tracing::warn!(uri = %params.text_document.uri, "URI is not in workspace");
            return Value::Null;
        };

        let Some(node_id) = self.indices.node_at(relative, position) else {
            return Value::Null;
        };
        match self.indices.location_of(node_id) {
            Some(location) => protocol::location_value(&session.workspace_path, location),
            None => Value::Null,
        }
    }

    /// Compile `uri` if it is a `.capnp` file, then publish diagnostics.
    async fn compile_capnp_file(&mut self, uri: &str) {
        let Some(session) = &self.session else {
            tracing::error!("file event before initialize");
            return;
        };

        let path = protocol::uri_to_path(uri);
        let relative = match strip_workspace_prefix(&path, &session.workspace_path) {
            Some(stripped) => stripped.to_string(),
            None => {
                tracing::warn!(uri, "file event outside workspace");
                path.clone()
            }
        };
        if !relative.ends_with(".capnp") {
            return;
        }

        let workspace = std::path::PathBuf::from(&session.workspace_path);
        let result = self
            .compiler
            .compile(CompileParams {
                compiler_path: &session.compiler_path,
                import_paths: &session.import_paths,
                file_name: &relative,
                workspace: &workspace,
                indices: &mut self.indices,
                diagnostics: &mut self.diagnostics,
            })
            .await;

        match result {
            Ok(_) => self.publish_diagnostics(&relative).await,
            Err(CompileError::IncompatibleVersion(detail)) => {
                tracing::error!(file = %relative, "compile blocked: {detail}");
                self.send(protocol::show_message(
                    MessageType::Error,
                    &format!("capnp compiler version check failed: {detail}"),
                ))
                .await;
            }
            Err(e) => {
                tracing::error!(file = %relative, "compile error: {e}");
                self.send(protocol::log_message(
                    MessageType::Error,
                    &format!("failed to compile {relative}: {e}"),
                ))
                .await;
            }
        }
    }

    /// Emit `publishDiagnostics` for everything in the store, or an explicit
    /// empty list for `compiled_file` so the editor clears stale markers.
    async fn publish_diagnostics(&mut self, compiled_file: &str) {
        let workspace = match &self.session {
            Some(session) => session.workspace_path.clone(),
            None => return,
        };

        if self.diagnostics.is_empty() {
            self.send(protocol::publish_diagnostics(&workspace, compiled_file, &[]))
                .await;
            return;
        }

        let notifications: Vec<Value> = self
            .diagnostics
            .iter()
            .map(|(file, items)| protocol::publish_diagnostics(&workspace, file, items))
            .collect();
        for notification in notifications {
            self.send(notification).await;
        }
    }

    async fn send(&self, frame: Value) {
        if self.outbound.send(frame).await.is_err() {
            tracing::warn!("outbound channel closed; dropping frame");
        }
    }
}

/// Strip `<workspace>/` from an absolute path, yielding the relative form
/// used as an index key.
fn strip_workspace_prefix<'a>(path: &'a str, workspace: &str) -> Option<&'a str> {
    path.strip_prefix(workspace)
        .and_then(|rest| rest.strip_prefix('/'))
}
