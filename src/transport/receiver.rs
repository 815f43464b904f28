use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::Stream;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{trace, warn};

use super::TransportMetrics;
use crate::error::TransmissionError;

/// Splits bytes on `\r?\n` and parses each non-blank line as JSON.
///
/// Unparseable lines are counted and dropped. A line longer than
/// `max_length` is discarded through its terminating newline.
#[derive(Debug)]
pub struct JsonLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
    metrics: Arc<TransportMetrics>,
}

impl JsonLineCodec {
    /// Codec with the given line bound, counting into `metrics`.
    pub const fn new(max_length: usize, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
            metrics,
        }
    }

    fn parse_line(&self, line: &[u8]) -> Option<Value> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(value) => {
                self.metrics.record_received();
                trace!(bytes = line.len(), "line received");
                Some(value)
            }
            Err(err) => {
                self.metrics.record_error();
                warn!(bytes = line.len(), error = %err, "dropping malformed line");
                None
            }
        }
    }

    fn reject_oversize(&mut self, size: usize) {
        self.metrics.record_error();
        warn!(
            bytes = size,
            limit = self.max_length,
            "dropping oversize line"
        );
    }
}

impl Decoder for JsonLineCodec {
    type Item = Value;
    type Error = TransmissionError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, TransmissionError> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    self.metrics.record_bytes_received(end + 1);
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    self.metrics.record_bytes_received(buf.len());
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    self.metrics.record_bytes_received(line.len());
                    if end > self.max_length {
                        self.reject_oversize(end);
                        continue;
                    }
                    if let Some(value) = self.parse_line(&line[..end]) {
                        return Ok(Some(value));
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    self.reject_oversize(buf.len());
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, TransmissionError> {
        if let Some(value) = self.decode(buf)? {
            return Ok(Some(value));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let tail = buf.split();
        self.metrics.record_bytes_received(tail.len());
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(self.parse_line(&tail))
    }
}

/// Stream of inbound JSON values read line by line from `R`.
#[derive(Debug)]
pub struct MessageReceiver<R> {
    inner: FramedRead<R, JsonLineCodec>,
}

impl<R: AsyncRead> MessageReceiver<R> {
    /// Receiver over `reader`.
    pub fn new(reader: R, max_line_length: usize, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            inner: FramedRead::new(reader, JsonLineCodec::new(max_line_length, metrics)),
        }
    }

    /// Consumes the receiver and returns the reader.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: AsyncRead + Unpin> Stream for MessageReceiver<R> {
    type Item = Result<Value, TransmissionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    fn codec(max_length: usize) -> (JsonLineCodec, Arc<TransportMetrics>) {
        let metrics = Arc::new(TransportMetrics::default());
        (JsonLineCodec::new(max_length, Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_line_split_across_reads() {
        let (mut codec, metrics) = codec(1024);
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"me"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"thod\":\"ping\",\"id\":1}\r\n{\"id\"");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["method"], "ping");
        assert_eq!(&buf[..], b"{\"id\"");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(metrics.snapshot().messages_received, 1);
    }

    #[test]
    fn test_blank_and_malformed_lines_are_skipped() {
        let (mut codec, metrics) = codec(1024);
        let mut buf = BytesMut::from(&b"\n   \r\nnot json\n{\"a\":1}\n"[..]);
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, json!({"a": 1}));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.messages_received, 1);
    }

    #[test]
    fn test_oversize_line_is_discarded() {
        let (mut codec, metrics) = codec(8);
        let mut buf = BytesMut::from(&b"[1,2,3,4,5,6"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b",7,8]\n{\"b\":2}\n");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, json!({"b": 2}));
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[test]
    fn test_complete_oversize_line_is_discarded() {
        let (mut codec, metrics) = codec(4);
        let mut buf = BytesMut::from(&b"{\"long\":true}\n{}\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({}));
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[test]
    fn test_unterminated_tail_parsed_at_eof() {
        let (mut codec, _) = codec(1024);
        let mut buf = BytesMut::from(&b"{\"tail\":true}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let value = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(value, json!({"tail": true}));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receiver_yields_each_valid_line() {
        let input: &[u8] = b"{\"id\":1}\n{broken\n\n{\"id\":2}\r\n{\"id\":3}";
        let metrics = Arc::new(TransportMetrics::default());
        let receiver = MessageReceiver::new(input, 1024, Arc::clone(&metrics));
        let ids: Vec<_> = receiver
            .map(|item| item.unwrap()["id"].as_i64().unwrap())
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2, 3]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 3);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.bytes_received, input.len() as u64);
    }
}
