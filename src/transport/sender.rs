use std::borrow::Cow;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace, warn};

use super::{MessageReceiver, MetricsSnapshot, TransportMetrics, TransportOptions};
use crate::error::{Result, TransmissionError};
use crate::protocol::ProtocolValidator;

/// Outbound half of the stdio transport.
///
/// Every frame passes pre-transmission validation before any byte is
/// written, and is written under the writer lock in one `write_all`.
#[derive(Debug)]
pub struct StdioTransport<W> {
    writer: Mutex<W>,
    options: TransportOptions,
    validator: ProtocolValidator,
    metrics: Arc<TransportMetrics>,
    in_flight: watch::Sender<usize>,
}

impl StdioTransport<Stdout> {
    /// Transport writing to the process's stdout.
    #[must_use]
    pub fn stdio(options: TransportOptions) -> Self {
        Self::new(tokio::io::stdout(), options)
    }
}

impl<W: AsyncWrite + Unpin + Send> StdioTransport<W> {
    /// Wraps `writer` with the default validator.
    pub fn new(writer: W, options: TransportOptions) -> Self {
        Self::with_validator(writer, options, ProtocolValidator::default())
    }

    /// Wraps `writer`, validating frames with `validator`.
    pub fn with_validator(
        writer: W,
        options: TransportOptions,
        validator: ProtocolValidator,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            options,
            validator,
            metrics: Arc::new(TransportMetrics::default()),
            in_flight: watch::Sender::new(0),
        }
    }

    /// Configured options.
    pub const fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Validates, frames and writes one message.
    ///
    /// A send still running after `send_timeout` is counted as a timeout and
    /// logged, then allowed to finish.
    ///
    /// # Errors
    ///
    /// Serialization and validation failures are returned before anything is
    /// written. Oversize frames fail with [`TransmissionError::MessageTooLarge`]
    /// and write errors with [`TransmissionError::Io`]. Every failure is
    /// counted in `errors`.
    pub async fn send_message<T: ?Sized + Serialize>(&self, message: &T) -> Result<()> {
        let _tracked = InFlight::enter(&self.in_flight);
        let outcome = self.send_tracked(message).await;
        if let Err(err) = &outcome {
            self.metrics.record_error();
            debug!(error = %err, "send failed");
        }
        outcome
    }

    async fn send_tracked<T: ?Sized + Serialize>(&self, message: &T) -> Result<()> {
        let value = self.validator.serializer().to_value(message)?;
        let text = self.validator.validate_pre_transmission(&value)?;
        let frame = self.frame(&text)?;
        let len = frame.len();

        let write = self.write_frame(&frame);
        tokio::pin!(write);
        let deadline = tokio::time::sleep(self.options.send_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            written = &mut write => written?,
            () = &mut deadline => {
                self.metrics.record_timeout();
                warn!(
                    bytes = len,
                    timeout_ms = self.options.send_timeout.as_millis(),
                    "send exceeded its deadline; still writing"
                );
                write.await?;
            }
        }
        self.metrics.record_sent(len);
        trace!(bytes = len, "frame sent");
        Ok(())
    }

    fn frame(&self, text: &str) -> Result<Bytes> {
        let body = normalize_line_breaks(text);
        let terminator = self.options.line_ending.as_str();
        let size = body.len() + terminator.len();

        if size <= self.options.large_message_threshold {
            let mut frame = BytesMut::with_capacity(size);
            frame.extend_from_slice(body.as_bytes());
            frame.extend_from_slice(terminator.as_bytes());
            return Ok(frame.freeze());
        }

        let mut buffer = ChunkBuffer::new(self.options.max_buffer_size);
        for piece in body
            .as_bytes()
            .chunks(self.options.chunk_size.max(1))
            .chain(std::iter::once(terminator.as_bytes()))
        {
            buffer.push(Bytes::copy_from_slice(piece))?;
        }
        self.metrics.record_large_message();
        debug!(bytes = size, chunks = buffer.chunks(), "assembled large frame");
        Ok(buffer.into_contiguous())
    }

    async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Waits for outstanding sends, then flushes the writer.
    ///
    /// Sends still outstanding after `send_timeout` are abandoned with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns [`TransmissionError::Io`] if flushing fails.
    pub async fn flush(&self) -> Result<()> {
        let mut in_flight = self.in_flight.subscribe();
        let settled = tokio::time::timeout(
            self.options.send_timeout,
            in_flight.wait_for(|pending| *pending == 0),
        )
        .await
        .is_ok_and(|changed| changed.is_ok());
        if !settled {
            warn!(
                outstanding = *self.in_flight.borrow(),
                "sends still outstanding at flush; not waiting further"
            );
        }
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(TransmissionError::from)?;
        Ok(())
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zeroes the counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Receiver over `reader` sharing this transport's counters and limits.
    pub fn create_message_receiver<R: AsyncRead>(&self, reader: R) -> MessageReceiver<R> {
        MessageReceiver::new(
            reader,
            self.options.max_buffer_size,
            Arc::clone(&self.metrics),
        )
    }

    /// Consumes the transport and returns the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Folds raw CR/LF into single spaces.
///
/// Compact JSON can only carry them as whitespace between tokens, so the
/// replacement preserves meaning.
pub fn normalize_line_breaks(text: &str) -> Cow<'_, str> {
    if !text.contains(['\r', '\n']) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", " ").replace(['\r', '\n'], " "))
}

/// Counts a send as outstanding until dropped.
struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|pending| *pending += 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// Gathers a large frame piece by piece up to a size bound.
#[derive(Debug)]
struct ChunkBuffer {
    chunks: Vec<Bytes>,
    len: usize,
    limit: usize,
}

impl ChunkBuffer {
    const fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: Bytes) -> std::result::Result<(), TransmissionError> {
        let size = self.len + chunk.len();
        if size > self.limit {
            return Err(TransmissionError::MessageTooLarge {
                size,
                limit: self.limit,
            });
        }
        self.len = size;
        self.chunks.push(chunk);
        Ok(())
    }

    fn chunks(&self) -> usize {
        self.chunks.len()
    }

    fn into_contiguous(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}
