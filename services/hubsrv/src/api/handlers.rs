//! Command execution
//!
//! Runs a parsed [`ApiCommand`] against the bus and the in-memory state and
//! produces the response payload. Mode policy is applied by the server
//! before and after; handlers only leave Operate themselves when a command
//! needs a synchronous router answer.

use errors::{HubError, HubResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::{BusMode, ModeManager};
use crate::forward::FORWARD_TIMEOUT;
use crate::mirror::{ModuleKind, ModuleRegistry, ModuleState};
use crate::protocol::commands::{output_mask, RouterCommand};
use crate::protocol::network::status_section;
use crate::protocol::SerialFrame;
use crate::router_status::{fetch_router_status, RouterState};

use super::commands::{
    group, spec, ActionCommand, AdminCommand, ApiCommand, DataCommand, ForwardCommand,
    ModuleSelector, SettingsCommand,
};

/// Default answer of commands without data
pub const OK: &[u8] = b"OK";
/// Answer to file and setup commands
pub const NOT_SUPPORTED: &[u8] = b"not supported";

/// Status flag pushed when a settings upload starts
const UPLOAD_STARTED: u8 = 1;

/// Pause between a dimmer value and switching its output on
const DIMMER_SWITCH_DELAY: Duration = Duration::from_millis(100);
/// Controllers number their dimmer outputs after the ten relay outputs
const CONTROLLER_DIMMER_OFFSET: u8 = 10;

#[derive(Debug, Clone)]
pub struct ApiHandler {
    manager: Arc<ModeManager>,
}

impl ApiHandler {
    pub fn new(manager: Arc<ModeManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModeManager> {
        &self.manager
    }

    fn registry(&self) -> &ModuleRegistry {
        &self.manager.sinks().registry
    }

    fn router_state(&self) -> &RouterState {
        &self.manager.sinks().router
    }

    pub async fn execute(&self, command: &ApiCommand) -> HubResult<Vec<u8>> {
        self.execute_with_status(command, &mut Vec::new()).await
    }

    /// Like [`execute`](Self::execute); progress sections to push ahead of
    /// the response are appended to `status`
    pub async fn execute_with_status(
        &self,
        command: &ApiCommand,
        status: &mut Vec<Vec<u8>>,
    ) -> HubResult<Vec<u8>> {
        match command {
            ApiCommand::Data(cmd) => self.data(cmd).await,
            ApiCommand::Settings(cmd) => self.settings(cmd, status).await,
            ApiCommand::Actions(cmd) => self.action(cmd).await,
            ApiCommand::Files { spec } | ApiCommand::Setup { spec } => {
                info!(
                    "Command {:#06x} of group {} not supported",
                    spec,
                    command.group()
                );
                Ok(NOT_SUPPORTED.to_vec())
            },
            ApiCommand::Admin(cmd) => self.admin(cmd).await,
            ApiCommand::Forward(cmd) => self.forward(cmd).await,
        }
    }

    // ------------------------------------------------------------------
    // DATA
    // ------------------------------------------------------------------

    async fn data(&self, cmd: &DataCommand) -> HubResult<Vec<u8>> {
        match *cmd {
            DataCommand::RouterStatus { router } => {
                if self.manager.mode() == BusMode::Operate {
                    // The watcher keeps the channel status current
                    debug!("Returning stored router status");
                    let mut resp = vec![router];
                    resp.extend(self.router_state().channel_status());
                    Ok(resp)
                } else {
                    let status = fetch_router_status(self.manager.context(), router).await?;
                    let resp = status.as_bytes().to_vec();
                    self.router_state().set_full_status(status);
                    debug!("Length of router status: {}", resp.len());
                    Ok(resp)
                }
            },
            DataCommand::ModuleStatus { modules, full, .. } => {
                let mut resp = Vec::new();
                for module in self.selected(modules) {
                    let block = self
                        .registry()
                        .status(module, full)
                        .ok_or_else(|| module_not_found(module))?;
                    let len = u8::try_from(block.len()).map_err(|_| {
                        HubError::Internal(format!("status block of {} bytes", block.len()))
                    })?;
                    resp.push(len);
                    resp.extend(block);
                }
                Ok(resp)
            },
            DataCommand::ModuleOverview { .. } => {
                let mut resp = Vec::new();
                for module in self.registry().overview() {
                    resp.push(module.id);
                    resp.extend_from_slice(&module.type_code);
                    push_counted(&mut resp, module.name.as_bytes());
                    push_counted(&mut resp, module.sw_version.as_bytes());
                }
                Ok(resp)
            },
            DataCommand::ModuleSettings { modules, .. } => {
                let mut resp = Vec::new();
                for module in self.selected(modules) {
                    let smg = self
                        .registry()
                        .settings_block(module)
                        .ok_or_else(|| module_not_found(module))?;
                    resp.extend(smg);
                }
                Ok(resp)
            },
        }
    }

    fn selected(&self, modules: ModuleSelector) -> Vec<u8> {
        match modules {
            ModuleSelector::All => self.registry().ids(),
            ModuleSelector::One(module) => vec![module],
        }
    }

    // ------------------------------------------------------------------
    // SETTINGS
    // ------------------------------------------------------------------

    async fn settings(
        &self,
        cmd: &SettingsCommand,
        status: &mut Vec<Vec<u8>>,
    ) -> HubResult<Vec<u8>> {
        match *cmd {
            SettingsCommand::ConnectionTest => {
                debug!("Connection test");
                Ok(OK.to_vec())
            },
            SettingsCommand::GetGlobalMode { router } => {
                let command = RouterCommand::GetGlobalMode;
                let answer = self.query(router, &command).await?;
                if let Some(&mode) = answer.first() {
                    self.router_state().set_system_mode(mode);
                }
                Ok(answer)
            },
            SettingsCommand::SetGlobalMode { router, mode } => {
                let answer = self
                    .query(router, &RouterCommand::SetGlobalMode { mode })
                    .await?;
                self.router_state().set_system_mode(mode);
                Ok(answer)
            },
            SettingsCommand::StartMirror => {
                self.manager.start_operate().await?;
                Ok(OK.to_vec())
            },
            SettingsCommand::StopMirror => {
                self.manager.stop_operate().await?;
                Ok(OK.to_vec())
            },
            SettingsCommand::WriteModuleSettings {
                router,
                module,
                ref mirror,
            } => {
                self.write_module_settings(router, module, mirror, status)
                    .await
            },
        }
    }

    /// Upload changed module settings; answers `[module, uploaded]`
    async fn write_module_settings(
        &self,
        router: u8,
        module: u8,
        mirror: &[u8],
        status: &mut Vec<Vec<u8>>,
    ) -> HubResult<Vec<u8>> {
        let state = ModuleState::apply(mirror)?;
        if state.id != module {
            return Err(HubError::Validation(format!(
                "Settings of module {} sent for module {}",
                state.id, module
            )));
        }
        let Some(smg) = self.registry().changed_settings(module, &state)? else {
            info!("Module {} settings unchanged, upload skipped", module);
            return Ok(vec![module, 0]);
        };

        self.manager.stop_operate().await?;
        status.push(status_section(
            group::SETTINGS,
            spec::settings::MODULE_SETTINGS,
            router,
            module,
            &[UPLOAD_STARTED],
        ));
        info!("Uploading {} settings bytes to module {}", smg.len(), module);
        let frame = self
            .manager
            .context()
            .send_and_await(router, &RouterCommand::SendModuleSettings { module, smg })
            .await?;
        check_router_answer(router, &frame)?;
        self.registry().set_state(module, &state)?;
        Ok(vec![module, 1])
    }

    /// Leave Operate, exchange one command and return the answer part
    async fn query(&self, router: u8, command: &RouterCommand) -> HubResult<Vec<u8>> {
        self.manager.stop_operate().await?;
        let frame = self
            .manager
            .context()
            .send_and_await(router, command)
            .await?;
        check_router_answer(router, &frame)?;
        Ok(frame.message(command.frame_len()).to_vec())
    }

    // ------------------------------------------------------------------
    // ACTIONS
    // ------------------------------------------------------------------

    async fn action(&self, cmd: &ActionCommand) -> HubResult<Vec<u8>> {
        match *cmd {
            ActionCommand::OutputOn {
                router,
                module,
                output,
            } => {
                debug!("Router {}, module {}: turn output {} on", router, module, output);
                let command = RouterCommand::SetOutputOn {
                    module,
                    mask: output_mask(output),
                };
                self.send_action(router, &command).await?;
            },
            ActionCommand::OutputOff {
                router,
                module,
                output,
            } => {
                debug!("Router {}, module {}: turn output {} off", router, module, output);
                let command = RouterCommand::SetOutputOff {
                    module,
                    mask: output_mask(output),
                };
                self.send_action(router, &command).await?;
            },
            ActionCommand::SetDimmer {
                router,
                module,
                output,
                value,
            } => {
                debug!(
                    "Router {}, module {}: set dimm value output {} to {}",
                    router, module, output, value
                );
                let command = RouterCommand::SetDimmerValue {
                    module,
                    output,
                    value,
                };
                self.send_action(router, &command).await?;
                tokio::time::sleep(DIMMER_SWITCH_DELAY).await;

                let offset = match self.registry().kind(module) {
                    Some(ModuleKind::Controller) => CONTROLLER_DIMMER_OFFSET,
                    _ => 0,
                };
                let switch_on = RouterCommand::SetOutputOn {
                    module,
                    mask: output_mask(output + offset),
                };
                self.send_action(router, &switch_on).await?;
            },
            ActionCommand::CallDirectCommand {
                router,
                module,
                command,
            } => {
                debug!("Router {}, module {}: direct command {}", router, module, command);
                self.send_action(router, &RouterCommand::CallDirectCommand { module, command })
                    .await?;
            },
            ActionCommand::SetFlag {
                router,
                module,
                flag,
            } => {
                self.send_action(router, &RouterCommand::SetFlag { module, flag })
                    .await?;
            },
            ActionCommand::ResetFlag {
                router,
                module,
                flag,
            } => {
                self.send_action(router, &RouterCommand::ResetFlag { module, flag })
                    .await?;
            },
        }
        Ok(OK.to_vec())
    }

    /// Fire-and-forget in Operate, checked exchange otherwise
    async fn send_action(&self, router: u8, command: &RouterCommand) -> HubResult<()> {
        let ctx = self.manager.context();
        if ctx.mode() == BusMode::Operate {
            return ctx.send_only(router, command).await;
        }
        let frame = ctx.send_and_await(router, command).await?;
        check_router_answer(router, &frame)
    }

    // ------------------------------------------------------------------
    // ADMIN
    // ------------------------------------------------------------------

    async fn admin(&self, cmd: &AdminCommand) -> HubResult<Vec<u8>> {
        let ctx = self.manager.context();
        match *cmd {
            AdminCommand::WrapperSend { router, ref body } => {
                debug!(
                    "Wrapped command for router {}: {}",
                    router,
                    common::hex::encode_spaced(body)
                );
                let frame = ctx
                    .send_and_await(router, &RouterCommand::Raw(body.clone()))
                    .await?;
                Ok(frame.raw().to_vec())
            },
            AdminCommand::WrapperReceive { router } => {
                let frame = ctx.await_only(router).await?;
                Ok(frame.raw().to_vec())
            },
            AdminCommand::RouterReboot { router } => {
                info!("Router {} reboot requested", router);
                let frame = ctx.send_and_await(router, &RouterCommand::Reboot).await?;
                Ok(frame.raw().to_vec())
            },
            AdminCommand::ClearSendBuffer { router } => {
                ctx.send_only(router, &RouterCommand::ClearSendBuffer)
                    .await?;
                tokio::time::sleep(ctx.timing().settle).await;
                let dropped = ctx.link().discard_pending().await?;
                debug!("Router send buffer cleared, {} bytes discarded", dropped);
                Ok(OK.to_vec())
            },
            AdminCommand::StartForward { router } => {
                let modules = self.registry().ids();
                for &module in &modules {
                    let frame = ctx
                        .send_and_await(router, &RouterCommand::StartForward { module })
                        .await?;
                    check_router_answer(router, &frame)?;
                }
                info!("Forwarding started for {} modules", modules.len());
                Ok(OK.to_vec())
            },
        }
    }

    // ------------------------------------------------------------------
    // FORWARD
    // ------------------------------------------------------------------

    async fn forward(&self, cmd: &ForwardCommand) -> HubResult<Vec<u8>> {
        let ForwardCommand::Forward { router, body } = cmd;
        if body.is_empty() {
            return Err(HubError::ArgumentRange(
                "Error: empty forward command".to_string(),
            ));
        }
        debug!(
            "Forwarded message for router {}: {}",
            router,
            common::hex::encode_spaced(body)
        );
        let frame = self
            .manager
            .context()
            .send_and_await_within(*router, &RouterCommand::Raw(body.clone()), FORWARD_TIMEOUT)
            .await?;
        Ok(frame.raw().to_vec())
    }
}

fn module_not_found(module: u8) -> HubError {
    HubError::NotFound {
        resource: format!("module {module}"),
    }
}

fn check_router_answer(router: u8, frame: &SerialFrame) -> HubResult<()> {
    match frame.router_error() {
        Some(code) => Err(HubError::RouterError { router, code }),
        None => Ok(()),
    }
}

/// Length-prefixed field, truncated to 255 bytes
fn push_counted(buf: &mut Vec<u8>, field: &[u8]) {
    let field = &field[..field.len().min(u8::MAX as usize)];
    buf.push(field.len() as u8);
    buf.extend_from_slice(field);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::{BusLinkContext, BusTiming, EventSinks, SerialLink};
    use crate::mirror::layout::{put_text, MirrorIndex, MIRROR_LEN, NAME_LEN};
    use crate::notify::LogNotifier;
    use crate::protocol::commands::{code, opcode};
    use crate::protocol::serial::encode_serial_response;
    use crate::transport::{MockTransport, RouterSim};
    use tokio_util::sync::CancellationToken;

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

    async fn handler() -> (Arc<MockTransport>, ApiHandler) {
        handler_with(RouterSim::new()).await
    }

    async fn handler_with(sim: RouterSim) -> (Arc<MockTransport>, ApiHandler) {
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
        let manager = Arc::new(ModeManager::new(ctx, sinks, 1, CancellationToken::new()));
        manager.initialize().await.unwrap();
        mock.clear_ops();
        (mock, ApiHandler::new(manager))
    }

    fn mirror(id: u8, type_code: [u8; 2], name: &str) -> Vec<u8> {
        let mut status = vec![0u8; MIRROR_LEN];
        status[MirrorIndex::MOD_ID] = id;
        status[MirrorIndex::MOD_DESC] = type_code[0];
        status[MirrorIndex::MOD_DESC + 1] = type_code[1];
        put_text(&mut status, MirrorIndex::MOD_NAME, NAME_LEN, name);
        status
    }

    #[tokio::test]
    async fn test_output_on_in_client_server() {
        let (mock, handler) = handler().await;
        let cmd = ApiCommand::Actions(ActionCommand::OutputOn {
            router: 1,
            module: 5,
            output: 3,
        });
        assert_eq!(handler.execute(&cmd).await.unwrap(), OK);
        let frames = mock.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][3..8], &[opcode::SET_OUT_ON, 5, 0x04, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_dimmer_switches_controller_output() {
        let (mock, handler) = handler().await;
        handler.registry().apply_mirror(4, &mirror(4, [1, 2], "Controller"));
        let cmd = ApiCommand::Actions(ActionCommand::SetDimmer {
            router: 1,
            module: 4,
            output: 1,
            value: 40,
        });
        handler.execute(&cmd).await.unwrap();
        let frames = mock.sent_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][3..7], &[opcode::SET_DIMM_VAL, 4, 1, 40]);
        // Dimmer 1 of a controller is output 11
        assert_eq!(&frames[1][3..8], &[opcode::SET_OUT_ON, 4, 0x00, 0x04, 0x00]);
    }

    #[tokio::test]
    async fn test_module_status_blocks() {
        let (mock, handler) = handler().await;
        handler.registry().apply_mirror(3, &mirror(3, [10, 1], "Out"));
        handler.registry().apply_mirror(7, &mirror(7, [11, 1], "In"));

        let all = ApiCommand::Data(DataCommand::ModuleStatus {
            router: 1,
            modules: ModuleSelector::All,
            full: true,
        });
        let resp = handler.execute(&all).await.unwrap();
        assert_eq!(resp.len(), 2 * (1 + MIRROR_LEN));
        assert_eq!(resp[0] as usize, MIRROR_LEN);
        assert_eq!(resp[1 + MirrorIndex::MOD_ID], 3);
        assert_eq!(resp[2 + MIRROR_LEN + MirrorIndex::MOD_ID], 7);

        let missing = ApiCommand::Data(DataCommand::ModuleStatus {
            router: 1,
            modules: ModuleSelector::One(9),
            full: false,
        });
        assert!(matches!(
            handler.execute(&missing).await,
            Err(HubError::NotFound { .. })
        ));
        // Status reads never touch the bus
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_module_overview_layout() {
        let (_mock, handler) = handler().await;
        handler.registry().apply_mirror(2, &mirror(2, [10, 1], "Kitchen"));
        let resp = handler
            .execute(&ApiCommand::Data(DataCommand::ModuleOverview { router: 1 }))
            .await
            .unwrap();
        assert_eq!(&resp[..4], &[2, 10, 1, 7]);
        assert_eq!(&resp[4..11], b"Kitchen");
    }

    #[tokio::test]
    async fn test_router_status_read_in_client_server() {
        let (mock, handler) = handler().await;
        let resp = handler
            .execute(&ApiCommand::Data(DataCommand::RouterStatus { router: 1 }))
            .await
            .unwrap();
        assert_eq!(resp[0], 1);
        assert_eq!(mock.sent_frames().len(), 10);
        assert_eq!(handler.router_state().full_status().as_bytes(), &resp[..]);
    }

    #[tokio::test]
    async fn test_global_mode_query_leaves_operate() {
        let (mock, handler) = handler().await;
        handler.manager().start_operate().await.unwrap();
        mock.clear_ops();

        let resp = handler
            .execute(&ApiCommand::Settings(SettingsCommand::SetGlobalMode {
                router: 1,
                mode: 0x22,
            }))
            .await
            .unwrap();
        assert_eq!(handler.manager().mode(), BusMode::ClientServer);
        assert!(resp.ends_with(b"OK"));
        assert_eq!(
            mock.sent_opcodes().last().copied(),
            Some(opcode::SET_GLOB_MODE)
        );
        assert_eq!(handler.router_state().mode0(), 0x22);
    }

    #[tokio::test]
    async fn test_files_not_supported() {
        let (mock, handler) = handler().await;
        let resp = handler
            .execute(&ApiCommand::Files { spec: 0x0101 })
            .await
            .unwrap();
        assert_eq!(resp, NOT_SUPPORTED);
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_forward_passes_raw_body() {
        let (mock, handler) = handler().await;
        let cmd = ApiCommand::Forward(ForwardCommand::Forward {
            router: 1,
            body: vec![opcode::SET_OUT_OFF, 5, 1, 0, 0],
        });
        let resp = handler.execute(&cmd).await.unwrap();
        assert_eq!(mock.sent_opcodes(), vec![opcode::SET_OUT_OFF]);
        // Router answer is passed back unchanged
        assert_eq!(resp[0], 0x23);
        assert_eq!(resp[3], opcode::SET_OUT_OFF);
        assert!(resp[..resp.len() - 1].ends_with(b"OK"));

        let empty = ApiCommand::Forward(ForwardCommand::Forward {
            router: 1,
            body: Vec::new(),
        });
        assert!(matches!(
            handler.execute(&empty).await,
            Err(HubError::ArgumentRange(_))
        ));
    }

    #[tokio::test]
    async fn test_module_status_after_boot() {
        let sim = RouterSim::new().with_module(mirror(6, [10, 1], "Bad"));
        let (mock, handler) = handler_with(sim).await;
        assert_eq!(handler.manager().mode(), BusMode::ClientServer);

        let cmd = ApiCommand::Data(DataCommand::ModuleStatus {
            router: 1,
            modules: ModuleSelector::One(6),
            full: true,
        });
        let resp = handler.execute(&cmd).await.unwrap();
        assert_eq!(resp[0] as usize, MIRROR_LEN);
        assert_eq!(&resp[1..], &mirror(6, [10, 1], "Bad")[..]);
        assert!(mock.sent_frames().is_empty());
    }

    fn write_settings(module: u8, mirror: Vec<u8>) -> ApiCommand {
        ApiCommand::Settings(SettingsCommand::WriteModuleSettings {
            router: 1,
            module,
            mirror,
        })
    }

    #[tokio::test]
    async fn test_unchanged_settings_skip_upload() {
        let (mock, handler) = handler().await;
        handler.manager().start_operate().await.unwrap();
        handler.registry().apply_mirror(6, &mirror(6, [10, 1], "Bad"));
        mock.clear_ops();

        let mut status = Vec::new();
        let resp = handler
            .execute_with_status(&write_settings(6, mirror(6, [10, 1], "Bad")), &mut status)
            .await
            .unwrap();
        assert_eq!(resp, vec![6, 0]);
        assert!(status.is_empty());
        assert!(mock.sent_frames().is_empty());
        assert_eq!(handler.manager().mode(), BusMode::Operate);

        handler.manager().stop_operate().await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_settings_upload_smg() {
        let (mock, handler) = handler().await;
        handler.manager().start_operate().await.unwrap();
        handler.registry().apply_mirror(6, &mirror(6, [10, 1], "Bad"));
        mock.clear_ops();

        let mut changed = mirror(6, [10, 1], "Bad");
        changed[MirrorIndex::T_SHORT] = 40;
        let mut status = Vec::new();
        let resp = handler
            .execute_with_status(&write_settings(6, changed), &mut status)
            .await
            .unwrap();
        assert_eq!(resp, vec![6, 1]);
        assert_eq!(
            mock.sent_opcodes(),
            vec![
                opcode::STOP_EVENTS,
                opcode::STOP_MIRROR,
                opcode::CLEAR_RT_SENDBUF,
                opcode::SEND_MOD_SMG
            ]
        );
        let upload = mock.sent_frames().pop().unwrap();
        assert_eq!(&upload[4..6], &[6, 40]);

        assert_eq!(status.len(), 1);
        assert_eq!(status[0][0], group::SETTINGS);
        assert_eq!(
            u16::from_be_bytes([status[0][1], status[0][2]]),
            spec::settings::MODULE_SETTINGS
        );
        assert_eq!(status[0].last(), Some(&UPLOAD_STARTED));

        assert_eq!(handler.registry().state(6).unwrap().t_short_ms, 400);
        // A second identical write finds nothing to upload
        mock.clear_ops();
        let mut again = mirror(6, [10, 1], "Bad");
        again[MirrorIndex::T_SHORT] = 40;
        let resp = handler.execute(&write_settings(6, again)).await.unwrap();
        assert_eq!(resp, vec![6, 0]);
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_settings_for_other_module_rejected() {
        let (mock, handler) = handler().await;
        handler.registry().apply_mirror(6, &mirror(6, [10, 1], "Bad"));
        assert!(matches!(
            handler.execute(&write_settings(6, mirror(7, [10, 1], "Bad"))).await,
            Err(HubError::Validation(_))
        ));
        assert!(matches!(
            handler.execute(&write_settings(8, mirror(8, [10, 1], "Neu"))).await,
            Err(HubError::NotFound { .. })
        ));
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_wrapper_send_and_receive() {
        let (mock, handler) = handler().await;
        let send = ApiCommand::Admin(AdminCommand::WrapperSend {
            router: 1,
            body: vec![opcode::GET_MOD_STATUS, 5],
        });
        let resp = handler.execute(&send).await.unwrap();
        assert_eq!(&resp[..5], &[0x23, 1, resp[2], opcode::GET_MOD_STATUS, 5]);

        mock.add_receive_data(&encode_serial_response(1, code::ROUTER_AVAILABLE, &[]));
        let receive = ApiCommand::Admin(AdminCommand::WrapperReceive { router: 1 });
        let resp = handler.execute(&receive).await.unwrap();
        assert_eq!(resp[0], 0x23);
        assert_eq!(resp[3], code::ROUTER_AVAILABLE);
        assert_eq!(mock.sent_opcodes(), vec![opcode::GET_MOD_STATUS]);
    }
}
