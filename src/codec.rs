//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module provides [`FrameReader`] and [`FrameWriter`] for async
//! reading and writing of framed JSON-RPC messages.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Initial read-buffer capacity; bodies larger than this are still read in
/// full, they just cross more buffer refills.
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Outcome of scanning one header block.
enum HeaderBlock {
    /// Headers parsed; body of this many bytes follows.
    ContentLength(usize),
    /// A complete header block arrived without a usable `Content-Length`.
    /// The caller skips it and resynchronizes on the next block.
    Malformed,
    /// Clean EOF before any header byte.
    Eof,
}

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers, reads exactly that many body bytes, and
/// deserializes the body as JSON. Partial reads and several frames per read
/// are handled by the underlying buffering.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF (clean shutdown).
    /// Returns `Err` on a truncated frame, an oversized frame, or a body that
    /// is not valid JSON.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let content_length = loop {
            match self.read_headers().await? {
                HeaderBlock::ContentLength(len) => break len,
                HeaderBlock::Malformed => {
                    tracing::warn!("skipping header block without Content-Length");
                }
                HeaderBlock::Eof => return Ok(None),
            }
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        let value = serde_json::from_slice(&body).context("parsing JSON-RPC frame")?;
        Ok(Some(value))
    }

    /// Parse one header block, up to and including the empty separator line.
    async fn read_headers(&mut self) -> Result<HeaderBlock> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;

            if bytes_read == 0 {
                // EOF — only valid if we haven't started reading headers at all.
                if !saw_any_header_bytes {
                    return Ok(HeaderBlock::Eof);
                }
                bail!("unexpected EOF while reading headers");
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Empty line = end of headers
                break;
            }

            // LSP spec uses "Content-Length" but parse case-insensitively for robustness.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    content_length = trimmed[colon_pos + 1..].trim().parse().ok();
                }
            }
            // Ignore other headers (e.g. Content-Type)
        }

        match content_length {
            Some(len) => Ok(HeaderBlock::ContentLength(len)),
            None => Ok(HeaderBlock::Malformed),
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header. A single writer
/// task owns the output stream, so frames never interleave.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(msg).context("serializing JSON-RPC frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(body.as_bytes())
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;

        Ok(())
    }
}
