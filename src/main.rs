//! capnp-ls binary entry point.
//!
//! Wires the IO loop to stdin/stdout, sets up file-based logging (stdout
//! carries the LSP wire, so it must stay clean), masks SIGPIPE so a
//! disconnected editor surfaces as write errors instead of killing the
//! process, and exits 0 once the server drains.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "capnp-ls.log";

/// Map `CPP_LOG=lsp_server=<error|warning|info>` onto a tracing filter.
/// Unset or unrecognized values default to warnings.
fn log_filter() -> EnvFilter {
    let level = std::env::var("CPP_LOG")
        .ok()
        .and_then(|value| value.strip_prefix("lsp_server=").map(str::to_string));
    let directive = match level.as_deref() {
        Some("error") => "error",
        Some("info") => "info",
        _ => "warn",
    };
    EnvFilter::new(directive)
}

fn init_logging() {
    let filter = log_filter();

    match OpenOptions::new().create(true).append(true).open(LOG_FILE) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .init();
            tracing::info!("logging initialized");
        }
        Err(_) => {
            // No log file, no logs: stdout and stderr belong to the editor.
            tracing_subscriber::registry().with(filter).init();
        }
    }
}

#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();
    #[cfg(unix)]
    ignore_sigpipe();

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = capnp_ls::server::run(stdin, stdout) => result?,
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = capnp_ls::server::run(stdin, stdout) => result?,
            _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c, shutting down"),
        }
    }

    tracing::info!("server shutdown complete");
    Ok(())
}
