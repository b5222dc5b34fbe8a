//! Bus mode manager
//!
//! Switches the link between ClientServer (the correlator reads answers) and
//! Operate (the router streams events, the watcher reads). All transitions
//! run under one async lock, so at most one is in progress and the watcher
//! handle is only touched while it is held.
//!
//! Network API commands run one at a time under a second lock, taken before
//! the command's own mode change. A transition requested by one client can
//! therefore never start underneath another client's bus exchange.

use errors::{HubError, HubResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mirror::fetch_modules;
use crate::protocol::commands::{code, RouterCommand};

use super::context::{BusLinkContext, BusMode, LinkState};
use super::link::LinkStats;
use super::watcher::{spawn_watcher, EventSinks, WatcherExit, WatcherHandle};

/// Mode overview for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    #[serde(flatten)]
    pub state: LinkState,
    pub watcher_running: bool,
    pub api_commands_in_flight: usize,
    pub link: LinkStats,
}

#[derive(Debug)]
pub struct ModeManager {
    ctx: Arc<BusLinkContext>,
    sinks: EventSinks,
    router_id: u8,
    /// Transition lock and the watcher of the current Operate session
    watcher: Mutex<Option<WatcherHandle>>,
    /// Held by the network API command being executed
    commands: Mutex<()>,
    shutdown: CancellationToken,
}

impl ModeManager {
    pub fn new(
        ctx: Arc<BusLinkContext>,
        sinks: EventSinks,
        router_id: u8,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            sinks,
            router_id,
            watcher: Mutex::new(None),
            commands: Mutex::new(()),
            shutdown,
        }
    }

    /// Exclusive right to run one API command, mode changes included
    ///
    /// Never taken by the transitions themselves, so a holder may start or
    /// stop Operate.
    pub async fn lock_commands(&self) -> MutexGuard<'_, ()> {
        self.commands.lock().await
    }

    pub fn context(&self) -> &Arc<BusLinkContext> {
        &self.ctx
    }

    pub fn sinks(&self) -> &EventSinks {
        &self.sinks
    }

    pub fn mode(&self) -> BusMode {
        self.ctx.mode()
    }

    pub async fn status(&self) -> ModeStatus {
        let watcher_running = self
            .watcher
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.is_finished());
        ModeStatus {
            state: self.ctx.state(),
            watcher_running,
            api_commands_in_flight: self.ctx.api_commands_in_flight(),
            link: self.ctx.stats(),
        }
    }

    /// Boot sequence: wait for the router, flush it, leave it in ClientServer
    pub async fn initialize(&self) -> HubResult<()> {
        let _guard = self.watcher.lock().await;
        let router = self.router_id;
        let timing = self.ctx.timing().clone();

        let mut available = false;
        for attempt in 1..=timing.boot_attempts {
            match self.ctx.send_and_await(router, &RouterCommand::StopMirror).await {
                Ok(frame) if frame.code == code::ROUTER_BOOTING => {
                    info!(
                        "Router {} still booting (attempt {}/{}), waiting",
                        router, attempt, timing.boot_attempts
                    );
                },
                Ok(frame) => {
                    if frame.code != code::ROUTER_AVAILABLE {
                        debug!("Router probe answered with code {}", frame.code);
                    }
                    available = true;
                    break;
                },
                Err(e @ HubError::ProtocolTimeout { .. }) => {
                    warn!("Router probe attempt {} failed: {}", attempt, e);
                },
                Err(e) => return Err(e),
            }
            if attempt < timing.boot_attempts {
                tokio::time::sleep(timing.boot_retry_delay).await;
            }
        }
        if !available {
            return Err(HubError::StartupFailed(format!(
                "Router {} not available after {} attempts",
                router, timing.boot_attempts
            )));
        }
        info!("Router {} available", router);

        self.ctx
            .send_only(router, &RouterCommand::ClearSendBuffer)
            .await?;
        tokio::time::sleep(timing.settle).await;
        let dropped = self.ctx.link().discard_pending().await?;
        if dropped > 0 {
            debug!("Discarded {} pending bytes", dropped);
        }
        self.ctx
            .send_and_await(router, &RouterCommand::StopEvents)
            .await?;
        self.ctx
            .send_and_await(router, &RouterCommand::StopMirror)
            .await?;
        if let Err(e) = fetch_modules(&self.ctx, router, &self.sinks.registry).await {
            // The mirror fills the registry once Operate runs
            warn!("Module list of router {} not read: {}", router, e);
        }

        self.ctx.set_mode(BusMode::ClientServer);
        self.ctx.set_network_blocked(false);
        info!("Bus initialized in ClientServer mode");
        Ok(())
    }

    /// Enter Operate mode
    ///
    /// A no-op when already in Operate with a live watcher; a dead watcher is
    /// restarted and the streams are re-enabled.
    pub async fn start_operate(&self) -> HubResult<()> {
        let mut watcher = self.watcher.lock().await;
        let router = self.router_id;

        match self.ctx.mode() {
            BusMode::Operate => {
                if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
                    debug!("Already in Operate mode");
                    return Ok(());
                }
                warn!("Event watcher not running in Operate mode, restarting it");
                if let Some(old) = watcher.take() {
                    old.abort().await;
                }
                *watcher = Some(self.spawn_watcher());
                tokio::time::sleep(self.ctx.timing().settle).await;
                return self.enable_streams().await;
            },
            BusMode::ClientServer => {},
            current => {
                return Err(HubError::ModeConflict {
                    operation: "start Operate".to_string(),
                    required: BusMode::ClientServer.to_string(),
                    current: current.to_string(),
                });
            },
        }

        self.ctx.set_mode(BusMode::EnteringOperate);
        let timing = self.ctx.timing();
        let command = RouterCommand::SetOperateMode {
            mirror: timing.mirror_enabled,
            events: timing.events_enabled,
        };
        match self.ctx.send_and_await(router, &command).await {
            Ok(ack) if ack.code == code::MODE_ACK && ack.data.first() == Some(&1) => {},
            Ok(ack) => {
                self.ctx.set_mode(BusMode::ClientServer);
                warn!(
                    "Router {} refused Operate mode: code {} data {:?}",
                    router, ack.code, ack.data
                );
                return Err(HubError::RouterError {
                    router,
                    code: ack.code,
                });
            },
            Err(e) => {
                self.ctx.set_mode(BusMode::ClientServer);
                return Err(e);
            },
        }

        self.ctx.set_mode(BusMode::Operate);
        *watcher = Some(self.spawn_watcher());
        tokio::time::sleep(timing.settle).await;
        self.enable_streams().await?;
        info!("Switched from ClientServer to Operate mode");
        Ok(())
    }

    fn spawn_watcher(&self) -> WatcherHandle {
        spawn_watcher(
            self.ctx.clone(),
            self.sinks.clone(),
            self.router_id,
            &self.shutdown,
        )
    }

    async fn enable_streams(&self) -> HubResult<()> {
        let timing = self.ctx.timing();
        if timing.mirror_enabled {
            self.ctx
                .send_only(
                    self.router_id,
                    &RouterCommand::StartMirror {
                        cycle: timing.mirror_cycle(),
                    },
                )
                .await?;
            tokio::time::sleep(timing.mode_settle).await;
        }
        if timing.events_enabled {
            self.ctx
                .send_only(self.router_id, &RouterCommand::StartEvents)
                .await?;
            tokio::time::sleep(timing.mode_settle).await;
        }
        Ok(())
    }

    /// Leave Operate mode
    ///
    /// Events are stopped before the mirror; the watcher sees the mirror stop
    /// ack and ends, or is cancelled after the grace period.
    pub async fn stop_operate(&self) -> HubResult<()> {
        let mut watcher = self.watcher.lock().await;
        if self.ctx.mode() != BusMode::Operate {
            return Ok(());
        }
        let router = self.router_id;
        let timing = self.ctx.timing().clone();

        self.ctx.set_mode(BusMode::ExitingOperate);
        let streams = async {
            self.ctx
                .send_only(router, &RouterCommand::StopEvents)
                .await?;
            tokio::time::sleep(timing.mode_settle).await;
            self.ctx
                .send_only(router, &RouterCommand::StopMirror)
                .await?;
            tokio::time::sleep(timing.mode_settle).await;
            Ok::<_, HubError>(())
        };
        if let Err(e) = streams.await {
            warn!("Stopping router streams failed: {}", e);
        }

        let exit = match watcher.take() {
            Some(handle) => handle.stop_within(timing.watcher_stop).await,
            None => WatcherExit::Cancelled,
        };
        if exit != WatcherExit::MirrorStopped {
            warn!("Event watcher ended without mirror stop ack: {:?}", exit);
        }

        // Reader is free again; drop whatever the router still had queued
        if let Err(e) = self
            .ctx
            .send_only(router, &RouterCommand::ClearSendBuffer)
            .await
        {
            warn!("Clearing router send buffer failed: {}", e);
        }
        tokio::time::sleep(timing.settle).await;
        if let Err(e) = self.ctx.link().discard_pending().await {
            warn!("Discarding pending input failed: {}", e);
        }

        self.ctx.set_mode(BusMode::ClientServer);
        info!("Switched from Operate to ClientServer mode");
        Ok(())
    }

    /// Block network commands, wait for running ones, then stop Operate
    pub async fn block_network(&self) -> HubResult<()> {
        self.ctx.set_network_blocked(true);
        let running = self.ctx.api_commands_in_flight();
        if running > 0 {
            info!("Waiting for {} API command(s) to finish", running);
        }
        self.ctx.drain_api_commands().await;
        let _commands = self.lock_commands().await;
        self.stop_operate().await?;
        info!("Network API blocked");
        Ok(())
    }

    /// Release the block and resume Operate
    ///
    /// Released clients queue on the command lock until Operate is up.
    pub async fn unblock_network(&self) -> HubResult<()> {
        let _commands = self.lock_commands().await;
        self.ctx.set_network_blocked(false);
        info!("Network API block released");
        self.start_operate().await
    }

    /// Leave the router quiet before the process exits
    pub async fn shutdown(&self) -> HubResult<()> {
        self.stop_operate().await?;
        self.ctx
            .send_only(self.router_id, &RouterCommand::ClearSendBuffer)
            .await?;
        info!("Bus shut down");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::context::BusTiming;
    use crate::bus::link::{ReadOwner, SerialLink};
    use crate::mirror::{MirrorIndex, ModuleRegistry, MIRROR_LEN};
    use crate::notify::LogNotifier;
    use crate::protocol::commands::opcode;
    use crate::router_status::RouterState;
    use crate::transport::{MockTransport, RouterSim};
    use std::time::Duration;

    fn fast_timing() -> BusTiming {
        BusTiming {
            response_timeout: Duration::from_millis(200),
            settle: Duration::from_millis(1),
            mode_settle: Duration::from_millis(5),
            watcher_stop: Duration::from_millis(500),
            boot_retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn manager(sim: RouterSim) -> (Arc<MockTransport>, ModeManager) {
        let mock = Arc::new(MockTransport::with_responder(sim.into_responder()));
        let ctx = Arc::new(BusLinkContext::new(
            Arc::new(SerialLink::new(mock.clone())),
            fast_timing(),
        ));
        let sinks = EventSinks {
            notifier: Arc::new(LogNotifier),
            registry: Arc::new(ModuleRegistry::new()),
            router: Arc::new(RouterState::new()),
            relay: None,
        };
        (mock, ModeManager::new(ctx, sinks, 1, CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_initialize_waits_for_boot() {
        let (mock, mgr) = manager(RouterSim::new().booting_for(2));
        assert!(!mgr.context().state().accepts_commands());
        mgr.initialize().await.unwrap();

        assert_eq!(mgr.mode(), BusMode::ClientServer);
        assert!(mgr.context().state().accepts_commands());
        assert_eq!(
            mock.sent_opcodes(),
            vec![
                opcode::STOP_MIRROR,
                opcode::STOP_MIRROR,
                opcode::STOP_MIRROR,
                opcode::CLEAR_RT_SENDBUF,
                opcode::STOP_EVENTS,
                opcode::STOP_MIRROR,
                opcode::GET_RT_MODULES,
            ]
        );
    }

    #[tokio::test]
    async fn test_initialize_loads_modules() {
        let mut block = vec![0u8; MIRROR_LEN];
        block[MirrorIndex::MOD_ID] = 6;
        block[MirrorIndex::MOD_DESC] = 10;
        let (mock, mgr) = manager(RouterSim::new().with_module(block));
        mgr.initialize().await.unwrap();

        assert_eq!(mgr.sinks().registry.ids(), vec![6]);
        assert_eq!(
            mgr.sinks().registry.status(6, true).unwrap()[MirrorIndex::MOD_ID],
            6
        );
        assert_eq!(
            mock.sent_opcodes().last().copied(),
            Some(opcode::GET_MOD_STATUS)
        );
        assert_eq!(mgr.mode(), BusMode::ClientServer);
    }

    #[tokio::test]
    async fn test_initialize_gives_up() {
        let (_mock, mgr) = manager(RouterSim::new().booting_for(10));
        let err = mgr.initialize().await.unwrap_err();
        assert!(matches!(err, HubError::StartupFailed(_)));
        assert_eq!(mgr.mode(), BusMode::Uninitialized);
    }

    #[tokio::test]
    async fn test_start_and_stop_operate() {
        let (mock, mgr) = manager(RouterSim::new());
        mgr.initialize().await.unwrap();
        mock.clear_ops();

        mgr.start_operate().await.unwrap();
        assert_eq!(mgr.mode(), BusMode::Operate);
        assert!(mgr.status().await.watcher_running);
        assert_eq!(mgr.context().link().read_owner(), ReadOwner::Watcher);
        assert_eq!(
            mock.sent_opcodes(),
            vec![opcode::SET_OPR_MODE, opcode::START_MIRROR, opcode::START_EVENTS]
        );

        mock.clear_ops();
        mgr.stop_operate().await.unwrap();
        assert_eq!(mgr.mode(), BusMode::ClientServer);
        assert_eq!(mgr.context().link().read_owner(), ReadOwner::Idle);
        assert!(!mgr.status().await.watcher_running);
        // Events stop before the mirror, the buffer is cleared last
        assert_eq!(
            mock.sent_opcodes(),
            vec![
                opcode::STOP_EVENTS,
                opcode::STOP_MIRROR,
                opcode::CLEAR_RT_SENDBUF
            ]
        );
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (mock, mgr) = manager(RouterSim::new());
        mgr.initialize().await.unwrap();
        mgr.start_operate().await.unwrap();
        mock.clear_ops();
        mgr.start_operate().await.unwrap();
        assert!(mock.sent_frames().is_empty());
        assert_eq!(mgr.mode(), BusMode::Operate);
    }

    #[tokio::test]
    async fn test_refused_operate_reverts() {
        let (_mock, mgr) = manager(RouterSim::new().rejecting_operate());
        mgr.initialize().await.unwrap();
        let err = mgr.start_operate().await.unwrap_err();
        assert!(matches!(err, HubError::RouterError { .. }));
        assert_eq!(mgr.mode(), BusMode::ClientServer);
        assert_eq!(mgr.context().link().read_owner(), ReadOwner::Idle);
    }

    #[tokio::test]
    async fn test_start_before_initialize_conflicts() {
        let (mock, mgr) = manager(RouterSim::new());
        assert!(matches!(
            mgr.start_operate().await,
            Err(HubError::ModeConflict { .. })
        ));
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let (_mock, mgr) = manager(RouterSim::new());
        mgr.initialize().await.unwrap();
        mgr.start_operate().await.unwrap();

        mgr.block_network().await.unwrap();
        let state = mgr.context().state();
        assert!(state.network_blocked);
        assert_eq!(state.mode, BusMode::ClientServer);

        mgr.unblock_network().await.unwrap();
        let state = mgr.context().state();
        assert!(!state.network_blocked);
        assert_eq!(state.mode, BusMode::Operate);
    }

    #[tokio::test]
    async fn test_block_waits_for_running_command() {
        let (_mock, mgr) = manager(RouterSim::new());
        mgr.initialize().await.unwrap();
        let mgr = Arc::new(mgr);

        let ctx = mgr.context().clone();
        let guard_task = tokio::spawn(async move {
            let _guard = ctx.begin_api_command();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let started = tokio::time::Instant::now();
        mgr.block_network().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(mgr.context().api_commands_in_flight(), 0);
        guard_task.await.unwrap();
    }
}
