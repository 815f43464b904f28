//! Newline-delimited JSON over stdio.
//!
//! Outbound, [`StdioTransport`] validates and serializes each message,
//! frames it with one line terminator and writes it in a single locked
//! `write_all`, so frames from concurrent senders never interleave.
//! Inbound, [`MessageReceiver`] splits the byte stream on `\r?\n` and yields
//! one parsed [`serde_json::Value`] per well-formed line.

mod receiver;
mod sender;

pub use receiver::{JsonLineCodec, MessageReceiver};
pub use sender::{StdioTransport, normalize_line_breaks};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

/// Default size above which outbound frames go through the chunk buffer.
pub const DEFAULT_LARGE_MESSAGE_THRESHOLD: usize = 1024 * 1024;
/// Default chunk size for large frames.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Default bound on a buffered frame, and on an inbound line.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Default deadline after which a send counts as timed out.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Line terminator appended to each outbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    Crlf,
    /// The platform convention.
    Auto,
}

impl LineEnding {
    /// Terminator bytes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::Crlf => "\r\n",
            Self::Auto => {
                if cfg!(windows) {
                    "\r\n"
                } else {
                    "\n"
                }
            }
        }
    }
}

impl FromStr for LineEnding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::Crlf),
            "auto" => Ok(Self::Auto),
            other => Err(Error::config(format!(
                "unknown line ending '{other}' (expected lf, crlf or auto)"
            ))),
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lf => "lf",
            Self::Crlf => "crlf",
            Self::Auto => "auto",
        })
    }
}

/// Transport tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Terminator for outbound frames.
    pub line_ending: LineEnding,
    /// Frames larger than this are assembled through the chunk buffer.
    pub large_message_threshold: usize,
    /// Piece size used by the chunk buffer.
    pub chunk_size: usize,
    /// Largest frame the chunk buffer accepts; also the longest inbound line.
    pub max_buffer_size: usize,
    /// Deadline after which a send is counted as timed out.
    pub send_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::default(),
            large_message_threshold: DEFAULT_LARGE_MESSAGE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Live counters, shared between a transport and its receivers.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_transmitted: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    large_messages: AtomicU64,
}

/// Point-in-time copy of [`TransportMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Frames written.
    pub messages_sent: u64,
    /// Inbound lines parsed.
    pub messages_received: u64,
    /// Bytes written, terminators included.
    pub bytes_transmitted: u64,
    /// Bytes consumed from the reader.
    pub bytes_received: u64,
    /// Failed sends plus malformed or oversize inbound lines.
    pub errors: u64,
    /// Sends that outlived the send timeout.
    pub timeouts: u64,
    /// Frames routed through the chunk buffer.
    pub large_messages: u64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(u64::try_from(by).unwrap_or(u64::MAX), Ordering::Relaxed);
}

impl TransportMetrics {
    pub(crate) fn record_sent(&self, bytes: usize) {
        bump(&self.messages_sent, 1);
        bump(&self.bytes_transmitted, bytes);
    }

    pub(crate) fn record_received(&self) {
        bump(&self.messages_received, 1);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        bump(&self.bytes_received, bytes);
    }

    pub(crate) fn record_error(&self) {
        bump(&self.errors, 1);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts, 1);
    }

    pub(crate) fn record_large_message(&self) {
        bump(&self.large_messages, 1);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            large_messages: self.large_messages.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_received,
            &self.bytes_transmitted,
            &self.bytes_received,
            &self.errors,
            &self.timeouts,
            &self.large_messages,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
