//! Event watcher
//!
//! Runs while the bus is in Operate mode and owns the link reader for its
//! whole lifetime. Every frame is split into events which are dispatched to
//! the mirror registry, the router state, the forward relay and the notifier.
//! The watcher ends on its own when the router acknowledges the mirror stop.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::forward::ForwardRelay;
use crate::mirror::{changes_to_events, ModuleRegistry};
use crate::notify::Notifier;
use crate::protocol::serial::decode_serial_frame;
use crate::router_status::RouterState;
use crate::transport::TransportError;

use super::context::BusLinkContext;
use super::events::{split_events, RouterEvent};
use super::link::ReadOwner;

/// Consecutive read failures after which the link is treated as gone
pub const MAX_READ_FAILURES: u32 = 10;

/// Why a watcher run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherExit {
    /// Router acknowledged the mirror stop
    MirrorStopped,
    Cancelled,
    LinkClosed,
    /// Reader was owned by someone else
    ReaderBusy(ReadOwner),
}

/// Consumers of decoded events
#[derive(Debug, Clone)]
pub struct EventSinks {
    pub notifier: Arc<dyn Notifier>,
    pub registry: Arc<ModuleRegistry>,
    pub router: Arc<RouterState>,
    pub relay: Option<Arc<ForwardRelay>>,
}

/// A running watcher task
#[derive(Debug)]
pub struct WatcherHandle {
    task: JoinHandle<WatcherExit>,
    cancel: CancellationToken,
}

impl WatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `limit` for the task to end by itself, then cancel it
    pub async fn stop_within(self, limit: std::time::Duration) -> WatcherExit {
        let WatcherHandle { mut task, cancel } = self;
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(exit)) => {
                info!(
                    "Event watcher terminated after {:.1} sec: {:?}",
                    started.elapsed().as_secs_f32(),
                    exit
                );
                exit
            },
            Ok(Err(e)) => {
                error!("Event watcher task failed: {}", e);
                WatcherExit::Cancelled
            },
            Err(_) => {
                cancel.cancel();
                match task.await {
                    Ok(exit) => {
                        info!("Event watcher cancelled after {:?}", limit);
                        exit
                    },
                    Err(e) => {
                        error!("Event watcher task failed: {}", e);
                        WatcherExit::Cancelled
                    },
                }
            },
        }
    }

    /// Cancel without waiting for the router
    pub async fn abort(self) -> WatcherExit {
        self.cancel.cancel();
        self.task.await.unwrap_or(WatcherExit::Cancelled)
    }
}

/// Start a watcher on `ctx`
///
/// `shutdown` is the process token; the watcher also stops when it fires.
pub fn spawn_watcher(
    ctx: Arc<BusLinkContext>,
    sinks: EventSinks,
    router_id: u8,
    shutdown: &CancellationToken,
) -> WatcherHandle {
    let cancel = shutdown.child_token();
    let task = tokio::spawn(watch_events(ctx, sinks, router_id, cancel.clone()));
    WatcherHandle { task, cancel }
}

async fn watch_events(
    ctx: Arc<BusLinkContext>,
    sinks: EventSinks,
    router_id: u8,
    cancel: CancellationToken,
) -> WatcherExit {
    let link = ctx.link().clone();
    let claim = match link.claim_reader(ReadOwner::Watcher) {
        Ok(claim) => claim,
        Err(owner) => {
            error!("Event watcher could not take the reader, owned by {:?}", owner);
            return WatcherExit::ReaderBusy(owner);
        },
    };
    info!("Event watcher running for router {}", router_id);

    let mut failures = 0u32;
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return WatcherExit::Cancelled,
            received = link.receive_frame(&claim, None) => received,
        };
        let raw = match received {
            Ok(raw) => {
                failures = 0;
                raw
            },
            Err(TransportError::Closed(reason)) => {
                error!("Serial link closed, event watcher ends: {}", reason);
                return WatcherExit::LinkClosed;
            },
            Err(e) => {
                failures += 1;
                if failures >= MAX_READ_FAILURES {
                    error!(
                        "Event watcher giving up after {} read failures: {}",
                        failures, e
                    );
                    return WatcherExit::LinkClosed;
                }
                warn!("Event watcher read failed ({}): {}", failures, e);
                tokio::select! {
                    _ = cancel.cancelled() => return WatcherExit::Cancelled,
                    _ = tokio::time::sleep(ctx.timing().settle) => {},
                }
                continue;
            },
        };
        let frame = match decode_serial_frame(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Router event frame rejected: {}", e);
                continue;
            },
        };
        if !frame.checksum_ok {
            warn!("Invalid router message checksum");
        }

        for event in split_events(&frame) {
            if dispatch(&sinks, router_id, event).await {
                info!("Mirror stopped, event watcher ends");
                return WatcherExit::MirrorStopped;
            }
        }
    }
}

/// Handle one event; true when the watcher should end
async fn dispatch(sinks: &EventSinks, router_id: u8, event: RouterEvent) -> bool {
    match event {
        RouterEvent::MirrorStopped => return true,
        RouterEvent::OperateStarted => info!("Router confirmed Operate mode"),
        RouterEvent::EventModeStarted => info!("Router event mode started"),
        RouterEvent::EventModeStopped => info!("Router event mode stopped"),
        RouterEvent::ChannelStatus(status) => {
            sinks.router.set_channel_status(&status);
        },
        RouterEvent::SystemMode(mode) => {
            debug!("Router system mode {:#04x}", mode);
            sinks.router.set_system_mode(mode);
        },
        RouterEvent::ConfigMode => sinks.router.set_system_mode(crate::router_status::CONFIG_MODE),
        RouterEvent::DirectCommand { module, command } => {
            info!(
                "Direct command from module {}: {}",
                module,
                common::hex::encode_spaced(&command)
            );
        },
        RouterEvent::ForwardResponse(payload) => match &sinks.relay {
            Some(relay) => {
                // First byte is the response code, the rest belongs to the remote hub
                let body = payload.get(1..).unwrap_or(&[]);
                if let Err(e) = relay.send_forward_response(body).await {
                    warn!("Forward response not delivered: {}", e);
                }
            },
            None => debug!("Forward response without relay dropped"),
        },
        RouterEvent::Module(event) => {
            for event in event.expand() {
                sinks.notifier.notify(router_id, event).await;
            }
        },
        RouterEvent::Mirror { module, status } => {
            let changes = sinks.registry.apply_mirror(module, &status);
            for event in changes_to_events(&changes) {
                sinks.notifier.notify(router_id, event).await;
            }
        },
        RouterEvent::Ignored { code, reason } => debug!("Event {} ignored: {}", code, reason),
    }
    false
}
