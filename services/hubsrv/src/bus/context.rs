//! Shared bus state
//!
//! One `BusLinkContext` exists per process. It owns the serial link, the
//! exclusive command token, the bus mode and the network block flag, and is
//! handed to every component as `Arc<BusLinkContext>`.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::info;

use super::link::{LinkStats, SerialLink};

/// Bus mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusMode {
    /// Before the boot sequence has run
    Uninitialized,
    /// Synchronous command/response; the correlator reads
    ClientServer,
    EnteringOperate,
    /// Router streams events; the watcher reads
    Operate,
    ExitingOperate,
}

impl BusMode {
    pub fn is_transition(self) -> bool {
        matches!(self, Self::EnteringOperate | Self::ExitingOperate)
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::ClientServer => "ClientServer",
            Self::EnteringOperate => "EnteringOperate",
            Self::Operate => "Operate",
            Self::ExitingOperate => "ExitingOperate",
        };
        f.write_str(name)
    }
}

/// Mode plus block flag, published together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub mode: BusMode,
    pub network_blocked: bool,
}

impl LinkState {
    /// Network commands may start
    pub fn accepts_commands(&self) -> bool {
        !self.network_blocked && !self.mode.is_transition() && self.mode != BusMode::Uninitialized
    }
}

/// Bus timing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BusTiming {
    /// Bound on one serial response
    pub response_timeout: Duration,
    /// Pause between a command and reading its answer
    pub settle: Duration,
    /// Pause after each mode command
    pub mode_settle: Duration,
    /// Grace period for the watcher to exit on its own
    pub watcher_stop: Duration,
    pub boot_retry_delay: Duration,
    pub boot_attempts: u32,
    /// START_MIRROR cycle in seconds
    pub mirror_cycle_secs: f64,
    pub mirror_enabled: bool,
    pub events_enabled: bool,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(2000),
            settle: Duration::from_millis(50),
            mode_settle: Duration::from_millis(200),
            watcher_stop: Duration::from_secs(1),
            boot_retry_delay: Duration::from_secs(5),
            boot_attempts: 3,
            mirror_cycle_secs: 0.5,
            mirror_enabled: true,
            events_enabled: true,
        }
    }
}

impl BusTiming {
    /// START_MIRROR argument in units of 10 ms, saturating at 255
    pub fn mirror_cycle(&self) -> u8 {
        (self.mirror_cycle_secs * 100.0).round().clamp(0.0, 255.0) as u8
    }
}

/// Shared link context
pub struct BusLinkContext {
    pub(crate) link: Arc<SerialLink>,
    pub(crate) token: Mutex<()>,
    state: watch::Sender<LinkState>,
    in_flight: AtomicUsize,
    drained: Notify,
    timing: BusTiming,
}

impl fmt::Debug for BusLinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusLinkContext")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.load(Ordering::Acquire))
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl BusLinkContext {
    /// New context: Uninitialized with the network blocked
    pub fn new(link: Arc<SerialLink>, timing: BusTiming) -> Self {
        let (state, _) = watch::channel(LinkState {
            mode: BusMode::Uninitialized,
            network_blocked: true,
        });
        Self {
            link,
            token: Mutex::new(()),
            state,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            timing,
        }
    }

    pub fn link(&self) -> &Arc<SerialLink> {
        &self.link
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn mode(&self) -> BusMode {
        self.state.borrow().mode
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub(crate) fn set_mode(&self, mode: BusMode) {
        self.state.send_if_modified(|state| {
            if state.mode == mode {
                return false;
            }
            info!("Bus mode {} -> {}", state.mode, mode);
            state.mode = mode;
            true
        });
    }

    pub(crate) fn set_network_blocked(&self, blocked: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.network_blocked != blocked;
            state.network_blocked = blocked;
            changed
        });
    }

    /// Wait until network commands may start
    pub async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        // Sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(LinkState::accepts_commands).await;
    }

    /// Mark an API command as being processed until the guard drops
    pub fn begin_api_command(&self) -> ApiCommandGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ApiCommandGuard { ctx: self }
    }

    pub fn api_commands_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait for every running API command to finish
    pub(crate) async fn drain_api_commands(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }
}

/// In-flight marker for one API command
#[derive(Debug)]
pub struct ApiCommandGuard<'a> {
    ctx: &'a BusLinkContext,
}

impl Drop for ApiCommandGuard<'_> {
    fn drop(&mut self) {
        if self.ctx.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ctx.drained.notify_waiters();
        }
    }
}
