//! Compilation management: version-gating the compiler, assembling the
//! command line, and routing results into symbol resolution or diagnostic
//! parsing.

use std::path::Path;
use std::sync::OnceLock;

use capnp::schema_capnp::code_generator_request;
use regex::Regex;
use thiserror::Error;

use crate::diagnostics::{self, DiagnosticStore};
use crate::resolver::{self, ResolveError};
use crate::subprocess::{self, RunParams, SubprocessError};
use crate::types::SymbolIndices;

/// Minimum supported compiler version; `fileSourceInfo` appeared in 1.1.
const MIN_VERSION: (u32, u32) = (1, 1);

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compiler path must end with 'capnp': {0}")]
    InvalidCompilerPath(String),
    #[error("capnp compiler not found: {0}")]
    CompilerNotFound(#[from] which::Error),
    #[error("incompatible capnp compiler: {0}")]
    IncompatibleVersion(String),
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("compiler produced no output")]
    MissingOutput,
}

/// How a compile ended, from the handler's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Exit 0; the symbol indices were updated.
    Indexed,
    /// Nonzero exit; diagnostics were parsed from stderr.
    /// `diagnostics_found` is false when no stderr line matched the file.
    Failed { diagnostics_found: bool },
}

pub struct CompileParams<'a> {
    /// Configured compiler path; empty means `capnp` on PATH.
    pub compiler_path: &'a str,
    pub import_paths: &'a [String],
    /// Workspace-relative path of the file to compile.
    pub file_name: &'a str,
    pub workspace: &'a Path,
    pub indices: &'a mut SymbolIndices,
    pub diagnostics: &'a mut DiagnosticStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionGate {
    Unchecked,
    Verified,
    /// A failed probe blocks all further compiles for this session.
    Rejected,
}

/// Owns the version gate and drives individual compiles.
pub struct CompilationManager {
    version_gate: VersionGate,
}

impl CompilationManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version_gate: VersionGate::Unchecked,
        }
    }

    /// Compile one file and fold the results into the given indices or
    /// diagnostic store.
    pub async fn compile(&mut self, params: CompileParams<'_>) -> Result<CompileOutcome, CompileError> {
        tracing::info!(file = params.file_name, "compiling");

        let compiler = resolve_compiler_path(params.compiler_path)?;
        self.check_version(&compiler, params.workspace).await?;

        params.diagnostics.clear();

        let argv = build_argv(&compiler, params.import_paths, params.file_name);
        let outcome = subprocess::run(RunParams {
            argv: &argv,
            working_dir: params.workspace,
            expect_binary_stdout: true,
        })
        .await?;

        if outcome.exit_code != 0 {
            tracing::error!(
                file = params.file_name,
                exit_code = outcome.exit_code,
                stderr = %outcome.stderr_text,
                "compile failed"
            );
            let found = diagnostics::parse_compiler_errors(
                params.file_name,
                &outcome.stderr_text,
                params.diagnostics,
            );
            if !found {
                tracing::error!(
                    file = params.file_name,
                    "no parseable errors in compiler output"
                );
            }
            return Ok(CompileOutcome::Failed {
                diagnostics_found: found,
            });
        }

        let message = outcome.message.ok_or(CompileError::MissingOutput)?;
        let request = message
            .get_root::<code_generator_request::Reader>()
            .map_err(ResolveError::from)?;
        let resolved = resolver::resolve(request, params.import_paths, params.workspace)?;
        resolved.apply(params.indices);

        Ok(CompileOutcome::Indexed)
    }

    /// Probe `<compiler> --version` once per session and require ≥ 1.1.
    async fn check_version(&mut self, compiler: &str, workspace: &Path) -> Result<(), CompileError> {
        match self.version_gate {
            VersionGate::Verified => return Ok(()),
            VersionGate::Rejected => {
                return Err(CompileError::IncompatibleVersion(
                    "compiler version check already failed this session".to_string(),
                ));
            }
            VersionGate::Unchecked => {}
        }

        let argv = vec![compiler.to_string(), "--version".to_string()];
        let outcome = subprocess::run(RunParams {
            argv: &argv,
            working_dir: workspace,
            expect_binary_stdout: false,
        })
        .await?;

        let stdout = outcome.stdout_text.unwrap_or_default();
        match parse_version(&stdout) {
            Some((major, minor)) if (major, minor) >= MIN_VERSION => {
                tracing::info!(version = %format!("{major}.{minor}"), "compiler version verified");
                self.version_gate = VersionGate::Verified;
                Ok(())
            }
            Some((major, minor)) => {
                self.version_gate = VersionGate::Rejected;
                Err(CompileError::IncompatibleVersion(format!(
                    "found {major}.{minor}, need at least {}.{}",
                    MIN_VERSION.0, MIN_VERSION.1
                )))
            }
            None => {
                self.version_gate = VersionGate::Rejected;
                Err(CompileError::IncompatibleVersion(format!(
                    "could not parse version from {stdout:?}"
                )))
            }
        }
    }
}

impl Default for CompilationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the compiler executable. An empty configured path falls back to
/// `capnp` on PATH; anything else must end with the literal `capnp`.
fn resolve_compiler_path(configured: &str) -> Result<String, CompileError> {
    if configured.is_empty() {
        let found = which::which("capnp")?;
        return Ok(found.to_string_lossy().into_owned());
    }
    if !configured.ends_with("capnp") {
        return Err(CompileError::InvalidCompilerPath(configured.to_string()));
    }
    Ok(configured.to_string())
}

/// `<compiler> compile -I<dir>... -o- <file>`, as an argv vector handed
/// straight to exec, so there is no quoting layer.
fn build_argv(compiler: &str, import_paths: &[String], file_name: &str) -> Vec<String> {
    let mut argv = Vec::with_capacity(3 + import_paths.len());
    argv.push(compiler.to_string());
    argv.push("compile".to_string());
    for path in import_paths {
        argv.push(format!("-I{path}"));
    }
    argv.push("-o-".to_string());
    argv.push(file_name.to_string());
    argv
}

fn parse_version(stdout: &str) -> Option<(u32, u32)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"Cap'n Proto version (\d+)\.(\d+)").expect("valid pattern"));
    let captures = pattern.captures(stdout)?;
    let major = captures[1].parse().ok()?;
    let minor = captures[2].parse().ok()?;
    Some((major, minor))
}
