//! Compiler subprocess execution.
//!
//! Spawns a command with its own stdout/stderr pipes, drains both streams
//! concurrently, and reaps the child only after both drains complete; a
//! child that writes more than one pipe buffer would otherwise deadlock
//! against a premature wait.
//!
//! The working directory is applied per spawn (`Command::current_dir` plus a
//! matching `PWD` override); the server's own process CWD is never changed.

use std::path::{Path, PathBuf};

use capnp::message::ReaderOptions;
use capnp::serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Generous traversal limit for compiler output: schema graphs are small, but
/// the default limit is sized for untrusted network input.
const IR_TRAVERSAL_LIMIT_WORDS: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("working directory {} is not usable: {source}", dir.display())]
    Workdir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to execute {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} terminated by signal {signal}")]
    Signaled { command: String, signal: i32 },
    #[error("i/o error while running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} produced unreadable output: {source}")]
    MalformedOutput {
        command: String,
        #[source]
        source: capnp::Error,
    },
}

/// One subprocess invocation.
pub struct RunParams<'a> {
    /// argv, argv[0] first. Absolute paths exec directly; bare names get a
    /// PATH lookup.
    pub argv: &'a [String],
    pub working_dir: &'a Path,
    /// When set, stdout is expected to carry a single serialized Cap'n Proto
    /// message; otherwise stdout is collected as text.
    pub expect_binary_stdout: bool,
}

/// Collected results of a finished subprocess.
pub struct RunOutcome {
    pub exit_code: i32,
    /// Present iff `expect_binary_stdout` was set and the child exited 0.
    pub message: Option<capnp::message::Reader<serialize::OwnedSegments>>,
    /// Present iff `expect_binary_stdout` was not set.
    pub stdout_text: Option<String>,
    pub stderr_text: String,
}

/// Run a command to completion, draining stdout and stderr concurrently.
pub async fn run(params: RunParams<'_>) -> Result<RunOutcome, SubprocessError> {
    let command_name = params
        .argv
        .first()
        .cloned()
        .unwrap_or_else(|| "<empty command>".to_string());

    if let Err(source) = std::fs::metadata(params.working_dir) {
        return Err(SubprocessError::Workdir {
            dir: params.working_dir.to_path_buf(),
            source,
        });
    }

    let mut command = Command::new(&command_name);
    command
        .args(&params.argv[1..])
        .current_dir(params.working_dir)
        .env("PWD", params.working_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(command = %params.argv.join(" "), "executing command");

    let mut child = command.spawn().map_err(|source| SubprocessError::Exec {
        command: command_name.clone(),
        source,
    })?;

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let stdout_drain = async {
        let mut bytes = Vec::new();
        stdout.read_to_end(&mut bytes).await.map(|_| bytes)
    };
    let stderr_drain = async {
        let mut text = String::new();
        stderr.read_to_string(&mut text).await.map(|_| text)
    };

    // Both pipes must be fully drained before the child is reaped.
    let (stdout_result, stderr_result) = tokio::join!(stdout_drain, stderr_drain);
    let stdout_bytes = stdout_result.map_err(|source| SubprocessError::Io {
        command: command_name.clone(),
        source,
    })?;
    let stderr_text = stderr_result.map_err(|source| SubprocessError::Io {
        command: command_name.clone(),
        source,
    })?;

    let status = child.wait().await.map_err(|source| SubprocessError::Io {
        command: command_name.clone(),
        source,
    })?;

    #[cfg(unix)]
    if status.code().is_none() {
        use std::os::unix::process::ExitStatusExt;
        return Err(SubprocessError::Signaled {
            command: command_name,
            signal: status.signal().unwrap_or(0),
        });
    }
    let exit_code = status.code().unwrap_or(-1);

    if exit_code != 0 {
        tracing::error!(command = %command_name, exit_code, "process failed");
    }

    let mut outcome = RunOutcome {
        exit_code,
        message: None,
        stdout_text: None,
        stderr_text,
    };

    if params.expect_binary_stdout {
        if exit_code == 0 {
            let mut options = ReaderOptions::new();
            options.traversal_limit_in_words(Some(IR_TRAVERSAL_LIMIT_WORDS));
            let message = serialize::read_message(stdout_bytes.as_slice(), options).map_err(
                |source| SubprocessError::MalformedOutput {
                    command: command_name,
                    source,
                },
            )?;
            outcome.message = Some(message);
        }
    } else {
        outcome.stdout_text = Some(String::from_utf8_lossy(&stdout_bytes).into_owned());
    }

    Ok(outcome)
}
