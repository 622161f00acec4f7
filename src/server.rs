//! The IO loop: reads frames, dispatches them, writes replies.
//!
//! Frames are dispatched strictly in arrival order and each handler future is
//! awaited to completion before the next frame is read. That sequencing is
//! what serializes rapid recompiles of the same file and removes any need for
//! locks around the indices. All outbound frames (replies and notifications)
//! funnel through one channel into a single writer task, so writes never
//! interleave.

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::{FrameReader, FrameWriter};
use crate::handler::{LifecycleState, LspHandler, Reply};
use crate::protocol::{self, IncomingMessage};

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Run the server over the given transport until shutdown.
///
/// Returns once the lifecycle reaches `ShuttingDown` (via a `shutdown`
/// request, input EOF, or a protocol error) and the outbound queue has
/// drained.
pub async fn run<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(OUTBOUND_CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(output);
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.write_frame(&frame).await {
                // The editor may simply have disconnected.
                tracing::warn!("failed to write frame: {e}");
                break;
            }
        }
    });

    let mut handler = LspHandler::new(outbound_tx.clone());
    let mut reader = FrameReader::new(input);

    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                dispatch(&frame, &mut handler, &outbound_tx).await;
            }
            Ok(None) => {
                tracing::info!("EOF on input, initiating shutdown");
                handler.force_shutdown();
            }
            Err(e) => {
                // The editor is speaking something other than LSP.
                tracing::error!("protocol error: {e:#}");
                handler.force_shutdown();
            }
        }

        if handler.state() == LifecycleState::ShuttingDown {
            break;
        }
    }

    // Close the channel so the writer drains and exits.
    drop(handler);
    drop(outbound_tx);
    let _ = writer_task.await;

    Ok(())
}

/// Route one decoded frame. A reply is written if and only if the frame
/// carried a numeric id.
async fn dispatch(frame: &Value, handler: &mut LspHandler, outbound: &mpsc::Sender<Value>) {
    if !frame.is_object() {
        tracing::error!("frame body is not a JSON object");
        handler.force_shutdown();
        return;
    }

    let Some(message) = protocol::classify(frame) else {
        tracing::error!("ignoring unroutable frame");
        return;
    };

    match message {
        IncomingMessage::Request { id, method, params } => {
            tracing::info!(method = %method, "request");
            let reply = handler.handle_request(&method, params).await;
            let frame = match reply {
                Reply::Result(result) => protocol::response(&id, result),
                Reply::Error { code, message } => protocol::error_response(&id, code, &message),
            };
            if outbound.send(frame).await.is_err() {
                tracing::warn!("outbound channel closed; dropping reply");
            }
        }
        IncomingMessage::Notification { method, params } => {
            tracing::info!(method = %method, "notification");
            handler.handle_notification(&method, params).await;
        }
    }
}
