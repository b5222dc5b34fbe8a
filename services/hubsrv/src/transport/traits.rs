//! Bus transport abstraction
//!
//! The router link is one duplex byte stream. Reading and writing are
//! independent: the event watcher may sit in a read while a mode change
//! writes STOP_EVENTS, so implementations lock the two halves separately.

use async_trait::async_trait;
use errors::HubError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Stream reached EOF or the device vanished
    #[error("Link closed: {0}")]
    Closed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => Self::Closed(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<TransportError> for HubError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed(msg) => HubError::LinkClosed(msg),
            TransportError::Timeout(after) => HubError::ProtocolTimeout {
                target: "router".to_string(),
                timeout_ms: after.as_millis() as u64,
            },
            TransportError::Config(msg) => HubError::Configuration(msg),
            TransportError::ConnectionFailed(reason) => HubError::ConnectionFailed {
                endpoint: "router".to_string(),
                reason,
            },
            TransportError::Io(msg) => HubError::Transport(msg),
        }
    }
}

/// Byte counters shared by all transport implementations
#[derive(Debug, Default)]
pub struct TransportCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    writes: AtomicU64,
    discarded: AtomicU64,
}

impl TransportCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, bytes: usize) {
        self.discarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub writes: u64,
    /// Bytes dropped by [`BusTransport::discard_pending`]
    pub bytes_discarded: u64,
}

/// Duplex byte stream to the router
#[async_trait]
pub trait BusTransport: Send + Sync + fmt::Debug {
    /// Human-readable identifier (device path, "mock")
    fn name(&self) -> &str;

    /// Write all of `data` and flush; never a partial write
    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Fill `buf` completely, waiting at most `timeout` (forever if `None`)
    async fn read_exact(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(), TransportError>;

    /// Drop whatever input is already buffered, returning the byte count
    async fn discard_pending(&self) -> Result<usize, TransportError>;

    fn stats(&self) -> TransportStats;
}
