//! Serial link: framed send and receive with resynchronisation
//!
//! Exactly one consumer may read at a time. Ownership is a single atomic flag
//! claimed by compare-and-swap; the claim is released when the returned guard
//! drops, which also covers an aborted event watcher task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::serial::{MIN_RESP_LEN, RESP_PREFIX_LEN, SYNC_MARKER};
use crate::transport::{BusTransport, TransportError, TransportStats};

/// Current reader of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ReadOwner {
    Idle = 0,
    Correlator = 1,
    Watcher = 2,
}

impl ReadOwner {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Correlator,
            2 => Self::Watcher,
            _ => Self::Idle,
        }
    }
}

/// Held while a consumer owns the reader
#[derive(Debug)]
pub struct ReadClaim<'a> {
    link: &'a SerialLink,
    owner: ReadOwner,
}

impl ReadClaim<'_> {
    pub fn owner(&self) -> ReadOwner {
        self.owner
    }
}

impl Drop for ReadClaim<'_> {
    fn drop(&mut self) {
        let _ = self.link.owner.compare_exchange(
            self.owner as u8,
            ReadOwner::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    resyncs: AtomicU64,
    too_short: AtomicU64,
}

/// Frame-level link statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub resyncs: u64,
    pub too_short: u64,
    pub transport: TransportStats,
}

/// The one serial link to the router
#[derive(Debug)]
pub struct SerialLink {
    transport: Arc<dyn BusTransport>,
    owner: AtomicU8,
    counters: LinkCounters,
}

impl SerialLink {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            owner: AtomicU8::new(ReadOwner::Idle as u8),
            counters: LinkCounters::default(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.transport
    }

    pub fn read_owner(&self) -> ReadOwner {
        ReadOwner::from_u8(self.owner.load(Ordering::Acquire))
    }

    /// Take the reader; fails with the current owner if it is taken
    pub fn claim_reader(&self, who: ReadOwner) -> Result<ReadClaim<'_>, ReadOwner> {
        self.owner
            .compare_exchange(
                ReadOwner::Idle as u8,
                who as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ReadClaim { link: self, owner: who })
            .map_err(ReadOwner::from_u8)
    }

    /// Write one complete command frame
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.transport.write_all(frame).await?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop everything the router has queued so far
    pub async fn discard_pending(&self) -> Result<usize, TransportError> {
        self.transport.discard_pending().await
    }

    /// Read one response or event frame
    ///
    /// Returns the bytes from the `23` marker through the checksum. A zero
    /// length or a missing `FF 23` marker triggers a byte-wise resync;
    /// frames too short to carry a code are dropped with a warning. The whole
    /// call, resync included, is bounded by `timeout` when given.
    pub async fn receive_frame(
        &self,
        _claim: &ReadClaim<'_>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));

        let mut prefix = [0u8; RESP_PREFIX_LEN];
        self.read(&mut prefix, deadline).await?;

        loop {
            if prefix[3] == 0 || prefix[..2] != SYNC_MARKER {
                warn!(
                    "Router message with length={} or bad marker {:02X} {:02X}, resync",
                    prefix[3], prefix[0], prefix[1]
                );
                self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
                let mut carried = self.resync(&prefix[1..], deadline).await?;
                while carried.len() < 2 {
                    let mut byte = [0u8; 1];
                    self.read(&mut byte, deadline).await?;
                    carried.push(byte[0]);
                }
                prefix = [SYNC_MARKER[0], SYNC_MARKER[1], carried[0], carried[1]];
                continue;
            }

            let len = prefix[3];
            if len < MIN_RESP_LEN {
                self.counters.too_short.fetch_add(1, Ordering::Relaxed);
                // A four byte frame still carries its checksum
                if len + 1 == MIN_RESP_LEN {
                    let mut checksum = [0u8; 1];
                    self.read(&mut checksum, deadline).await?;
                }
                warn!("Router message too short: {} bytes", len);
                self.read(&mut prefix, deadline).await?;
                continue;
            }

            let mut frame = Vec::with_capacity(usize::from(len));
            frame.extend_from_slice(&prefix[1..]);
            frame.resize(usize::from(len), 0);
            self.read(&mut frame[3..], deadline).await?;
            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }
    }

    /// Scan for `FF 23`, starting with bytes already read
    ///
    /// Returns the bytes that followed the marker in the carried-over input
    /// (at most two).
    async fn resync(
        &self,
        carried: &[u8],
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Vec<u8>, TransportError> {
        let mut window = carried.to_vec();
        let mut discarded = 0usize;
        loop {
            if let Some(pos) = window.windows(2).position(|w| w == SYNC_MARKER) {
                discarded += pos;
                debug!("Resynced after discarding {} bytes", discarded);
                return Ok(window.split_off(pos + 2));
            }
            let keep_lead = window.last() == Some(&SYNC_MARKER[0]);
            discarded += window.len() - usize::from(keep_lead);
            window.clear();
            if keep_lead {
                window.push(SYNC_MARKER[0]);
            }
            let mut byte = [0u8; 1];
            self.read(&mut byte, deadline).await?;
            window.push(byte[0]);
        }
    }

    async fn read(
        &self,
        buf: &mut [u8],
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), TransportError> {
        match deadline {
            Some((at, limit)) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TransportError::Timeout(limit));
                }
                self.transport
                    .read_exact(buf, Some(remaining))
                    .await
                    .map_err(|e| match e {
                        TransportError::Timeout(_) => TransportError::Timeout(limit),
                        other => other,
                    })
            },
            None => self.transport.read_exact(buf, None).await,
        }
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            resyncs: self.counters.resyncs.load(Ordering::Relaxed),
            too_short: self.counters.too_short.load(Ordering::Relaxed),
            transport: self.transport.stats(),
        }
    }
}
