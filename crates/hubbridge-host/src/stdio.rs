//! The stdio host channel.
//!
//! Requests are read from the input stream, decoded and dispatched. A writer
//! task drains the outbound stream and writes every event and reply as one
//! length-prefixed frame, in queue order.

use crate::dispatch::Dispatcher;
use crate::metrics;
use anyhow::{Context, Result};
use bytes::BytesMut;
use hubbridge_core::{OutboundStream, Outbound};
use hubbridge_protocol::{codec, ErrorCode, Frame, ProtocolError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::{debug, error, warn};

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long pending replies may still be written after the host hangs up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Serve the host channel until the input stream ends.
///
/// # Errors
///
/// Returns an error if reading fails, the host sends an oversized frame, or
/// writing to the host fails.
pub async fn serve<R, W>(
    dispatcher: Dispatcher,
    stream: OutboundStream,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer_task = tokio::spawn(write_loop(stream, writer));

    let read_result = read_loop(&dispatcher, reader).await;

    let stopped = dispatcher.shutdown();
    debug!(connections = stopped, "Stopped connections after host hung up");
    drop(dispatcher);

    // The stream ends once every sink is gone; in-flight invocations may
    // still hold one, so the writer only gets a grace period.
    let write_result = match time::timeout(SHUTDOWN_GRACE, &mut writer_task).await {
        Ok(joined) => joined.context("Writer task panicked")?,
        Err(_) => {
            debug!("Outbound stream still open, abandoning writer");
            writer_task.abort();
            Ok(())
        }
    };

    read_result.and(write_result)
}

async fn read_loop<R>(dispatcher: &Dispatcher, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let read = reader
            .read_buf(&mut buffer)
            .await
            .context("Failed to read from host")?;

        if read == 0 {
            if !buffer.is_empty() {
                warn!(remaining = buffer.len(), "Host closed the channel mid-frame");
            }
            return Ok(());
        }

        loop {
            let before = buffer.len();
            match codec::decode_from(&mut buffer) {
                Ok(Some(frame)) => {
                    metrics::record_frame_bytes(before - buffer.len(), "inbound");
                    dispatcher.handle_frame(frame);
                }
                Ok(None) => break,
                // The frame was consumed; carry on with the next one.
                Err(ProtocolError::Decode(e)) => {
                    warn!(error = %e, "Dropping undecodable frame from host");
                }
                Err(e) => return Err(e).context("Unrecoverable framing error"),
            }
        }
    }
}

async fn write_loop<W>(mut stream: OutboundStream, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    while let Some(item) = stream.recv().await {
        metrics::record_outbound(&item);

        buffer.clear();
        encode_outbound(item, &mut buffer);
        if buffer.is_empty() {
            continue;
        }

        metrics::record_frame_bytes(buffer.len(), "outbound");
        writer
            .write_all(&buffer)
            .await
            .context("Failed to write to host")?;

        // Flush once the queue is momentarily empty.
        if stream.is_empty() {
            writer.flush().await.context("Failed to flush host channel")?;
        }
    }

    writer.flush().await.context("Failed to flush host channel")?;
    Ok(())
}

/// Encode one outbound item. A reply that cannot be encoded is replaced by
/// an error reply so the request still gets its single answer. The
/// replacement carries the `Transport` code whatever the command was, since
/// the failure is in delivering the reply rather than in the command.
fn encode_outbound(item: Outbound, buffer: &mut BytesMut) {
    let seq = match &item {
        Outbound::Reply(reply) => Some(reply.seq),
        Outbound::Event(_) => None,
    };
    let frame = item.into_frame();

    if let Err(e) = codec::encode_into(&frame, buffer) {
        error!(frame_type = frame.frame_type(), error = %e, "Failed to encode frame");
        buffer.clear();
        if let Some(seq) = seq {
            let fallback = Frame::error(
                seq,
                ErrorCode::Transport,
                format!("Reply could not be encoded: {e}"),
            );
            if let Err(e) = codec::encode_into(&fallback, buffer) {
                error!(seq, error = %e, "Failed to encode fallback reply");
                buffer.clear();
            }
        }
    }
}
