//! Network API server
//!
//! Accepts TCP clients and serves one request at a time per connection:
//! wait while the network is blocked or a mode transition runs, read a
//! frame, check its CRC, apply the command group's mode policy, execute and
//! answer with a frame echoing the request header. Commands of all clients
//! execute one at a time under the mode manager's command lock.

use errors::HubResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusLinkContext, BusMode, ModeManager};
use crate::protocol::network::{
    decode_network_frame, encode_network_response, encode_network_status, read_raw_frame,
    NetworkHeader, CRC_ERROR_TEXT,
};

use super::commands::{ApiCommand, ModePolicy};
use super::handlers::ApiHandler;

/// Result of serving one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status pushes, written ahead of the response
    pub status: Vec<Vec<u8>>,
    /// Encoded response frame
    pub frame: Vec<u8>,
    /// Start Operate again once the reply is written
    pub restart_operate: bool,
}

#[derive(Debug, Clone)]
pub struct ApiServer {
    handler: ApiHandler,
}

impl ApiServer {
    pub fn new(manager: Arc<ModeManager>) -> Self {
        Self {
            handler: ApiHandler::new(manager),
        }
    }

    pub fn manager(&self) -> &Arc<ModeManager> {
        self.handler.manager()
    }

    /// Accept clients until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> HubResult<()> {
        let local = listener.local_addr()?;
        info!("API server listening on {}", local);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY on {}: {}", peer, e);
                    }
                    let server = self.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        server.handle_client(stream, peer, cancel).await;
                    });
                },
                Err(e) => {
                    error!("API accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                },
            }
        }
        info!("API server stopped");
        Ok(())
    }

    /// Serve requests from one client until it disconnects
    pub async fn handle_client<S>(&self, stream: S, peer: SocketAddr, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("API client connected: {}", peer);
        let ctx = self.manager().context().clone();
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            if !ctx.state().accepts_commands() && !wait_released(&ctx, &cancel).await {
                return;
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = read_raw_frame(&mut reader) => read,
            };
            let raw = match read {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("API client disconnected: {}", peer);
                    return;
                },
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Stream position is lost; answer once and drop the client
                    warn!("Unreadable frame from {}: {}", peer, e);
                    let frame = respond(&NetworkHeader::default(), CRC_ERROR_TEXT.as_bytes());
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!("CRC error reply to {} not written: {}", peer, e);
                    }
                    return;
                },
                Err(e) => {
                    warn!("API client {} read failed: {}", peer, e);
                    return;
                },
            };

            // A block or transition may have started while the frame was read.
            // Registering first lets a blocker's drain see this command.
            let _in_flight = loop {
                let guard = ctx.begin_api_command();
                if ctx.state().accepts_commands() {
                    break guard;
                }
                drop(guard);
                if !wait_released(&ctx, &cancel).await {
                    return;
                }
            };

            let reply = self.process(&raw).await;
            for frame in reply.status.iter().chain(std::iter::once(&reply.frame)) {
                if let Err(e) = writer.write_all(frame).await {
                    warn!("API response to {} failed: {}", peer, e);
                    return;
                }
            }
            if reply.restart_operate {
                let _commands = self.manager().lock_commands().await;
                if self.manager().mode() != BusMode::Operate {
                    if let Err(e) = self.manager().start_operate().await {
                        warn!("Operate restart after API call failed: {}", e);
                    }
                }
            }
        }
    }

    /// Serve one raw request frame
    pub async fn process(&self, raw: &[u8]) -> Reply {
        let frame = match decode_network_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("API call failed: {} ({})", CRC_ERROR_TEXT, e);
                return Reply::immediate(&NetworkHeader::default(), CRC_ERROR_TEXT.as_bytes());
            },
        };
        let header = &frame.header;

        let command = match ApiCommand::parse(&frame) {
            Ok(command) => command,
            Err(e) => {
                warn!("API call failed: {}", e);
                return Reply::immediate(header, e.to_string().as_bytes());
            },
        };
        info!(
            "Processing network API command: {} {} {}",
            header.group,
            header.spec >> 8,
            header.spec & 0xFF
        );

        let _commands = self.manager().lock_commands().await;
        let policy = command.mode_policy();
        match policy {
            ModePolicy::OperateFirst => {
                if let Err(e) = self.manager().start_operate().await {
                    warn!("Operate mode not entered, continuing: {}", e);
                }
            },
            ModePolicy::ClientServerFirst => {
                if let Err(e) = self.manager().stop_operate().await {
                    warn!("API call failed: {}", e);
                    return Reply::immediate(header, e.to_string().as_bytes());
                }
            },
            ModePolicy::RestartOperateAfter | ModePolicy::Unchanged => {},
        }

        let mut sections = Vec::new();
        let payload = match self.handler.execute_with_status(&command, &mut sections).await {
            Ok(payload) => {
                debug!("API call returned {} bytes", payload.len());
                payload
            },
            Err(e) => {
                warn!("API call failed: {}", e);
                e.to_string().into_bytes()
            },
        };

        Reply {
            status: sections
                .iter()
                .filter_map(|section| push_status(header, section))
                .collect(),
            frame: respond(header, &payload),
            restart_operate: policy == ModePolicy::RestartOperateAfter
                && !command.suppresses_restart(),
        }
    }
}

impl Reply {
    /// Answer without bus work and without a restart
    fn immediate(header: &NetworkHeader, payload: &[u8]) -> Self {
        Self {
            status: Vec::new(),
            frame: respond(header, payload),
            restart_operate: false,
        }
    }
}

/// Wait until commands are accepted again; false when the client is cancelled
async fn wait_released(ctx: &BusLinkContext, cancel: &CancellationToken) -> bool {
    let waited = tokio::time::Instant::now();
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = ctx.wait_ready() => {},
    }
    info!(
        "Waited {:.1} s for the network API to be released",
        waited.elapsed().as_secs_f32()
    );
    true
}

fn push_status(header: &NetworkHeader, section: &[u8]) -> Option<Vec<u8>> {
    match encode_network_status(header, section) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Status push not encodable: {}", e);
            None
        },
    }
}

/// Encode a response; an oversized payload is replaced by its error text
fn respond(header: &NetworkHeader, payload: &[u8]) -> Vec<u8> {
    match encode_network_response(header, payload) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Response not encodable: {}", e);
            encode_network_response(header, e.to_string().as_bytes()).unwrap_or_default()
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::api::commands::{group, spec};
    use crate::bus::{BusLinkContext, BusTiming, EventSinks, SerialLink};
    use crate::mirror::{MirrorIndex, ModuleRegistry, MIRROR_LEN};
    use crate::notify::LogNotifier;
    use crate::protocol::commands::opcode;
    use crate::protocol::network::NetworkFrame;
    use crate::router_status::RouterState;
    use crate::transport::{MockTransport, RouterSim};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fast_timing() -> BusTiming {
        BusTiming {
            response_timeout: Duration::from_millis(200),
            settle: Duration::from_millis(1),
            mode_settle: Duration::from_millis(5),
            watcher_stop: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn server() -> (Arc<MockTransport>, ApiServer) {
        server_with(fast_timing()).await
    }

    async fn server_with(timing: BusTiming) -> (Arc<MockTransport>, ApiServer) {
        let mock = Arc::new(MockTransport::with_responder(
            RouterSim::new().into_responder(),
        ));
        let ctx = Arc::new(BusLinkContext::new(
            Arc::new(SerialLink::new(mock.clone())),
            timing,
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
        (mock, ApiServer::new(manager))
    }

    fn request(group: u8, spec: u16, p4: u8, p5: u8, data: &[u8]) -> Vec<u8> {
        let header = NetworkHeader::new(group, spec, p4, p5).with_credentials(b"user", b"pw");
        encode_network_response(&header, data).unwrap()
    }

    fn answer(reply: &Reply) -> NetworkFrame {
        decode_network_frame(&reply.frame).unwrap()
    }

    #[tokio::test]
    async fn test_crc_error_answered_without_bus_io() {
        let (mock, server) = server().await;
        let mut raw = request(group::ACTIONS, spec::actions::OUTPUT_ON, 1, 5, &[3]);
        let crc_pos = raw.len() - 3;
        raw[crc_pos] ^= 0xFF;

        let reply = server.process(&raw).await;
        assert_eq!(answer(&reply).data, CRC_ERROR_TEXT.as_bytes());
        assert!(!reply.restart_operate);
        assert!(mock.sent_frames().is_empty());
        assert_eq!(server.manager().mode(), BusMode::ClientServer);
    }

    #[tokio::test]
    async fn test_argument_error_skips_mode_policy() {
        let (mock, server) = server().await;
        let reply = server
            .process(&request(group::ACTIONS, spec::actions::OUTPUT_ON, 1, 5, &[30]))
            .await;
        let frame = answer(&reply);
        assert_eq!(frame.data, b"Error: output out of range 1..24");
        assert_eq!(frame.header.user, b"user");
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let (_mock, server) = server().await;
        let reply = server.process(&request(99, 1, 1, 0, &[])).await;
        assert_eq!(answer(&reply).data, b"Unknown API command group: 99");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_actions_enter_operate_first() {
        let (mock, server) = server().await;
        let reply = server
            .process(&request(group::ACTIONS, spec::actions::OUTPUT_ON, 1, 5, &[3]))
            .await;
        assert_eq!(answer(&reply).data, b"OK");
        assert!(logs_contain("Processing network API command: 30 1 1"));
        assert_eq!(server.manager().mode(), BusMode::Operate);
        assert_eq!(
            mock.sent_opcodes(),
            vec![
                opcode::SET_OPR_MODE,
                opcode::START_MIRROR,
                opcode::START_EVENTS,
                opcode::SET_OUT_ON
            ]
        );
        server.manager().stop_operate().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_leaves_operate_and_data_restarts() {
        let (mock, server) = server().await;
        server.manager().start_operate().await.unwrap();

        let reply = server
            .process(&request(group::ADMIN, spec::admin::CLEAR_SEND_BUFFER, 1, 0, &[]))
            .await;
        assert_eq!(answer(&reply).data, b"OK");
        assert_eq!(server.manager().mode(), BusMode::ClientServer);
        assert!(!reply.restart_operate);

        mock.clear_ops();
        let reply = server
            .process(&request(group::SETTINGS, spec::settings::CONNECTION_TEST, 1, 0, &[]))
            .await;
        assert_eq!(answer(&reply).data, b"OK");
        assert!(reply.restart_operate);
        assert!(mock.sent_frames().is_empty());

        let reply = server
            .process(&request(group::SETTINGS, spec::settings::MIRROR_STOP, 1, 0, &[]))
            .await;
        assert!(!reply.restart_operate);
    }

    #[tokio::test]
    async fn test_data_command_waits_for_exit_from_operate() {
        // Slow stream stops keep the admin command inside ExitingOperate
        let timing = BusTiming {
            mode_settle: Duration::from_millis(25),
            ..fast_timing()
        };
        let (_mock, server) = server_with(timing).await;
        let server = Arc::new(server);
        server.manager().start_operate().await.unwrap();

        let admin = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .process(&request(group::ADMIN, spec::admin::CLEAR_SEND_BUFFER, 1, 0, &[]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reply = server
            .process(&request(group::DATA, spec::data::ROUTER_STATUS, 1, 0, &[]))
            .await;
        let status = answer(&reply);
        assert!(
            !String::from_utf8_lossy(&status.data).contains("idle reader"),
            "router status failed: {:?}",
            String::from_utf8_lossy(&status.data)
        );
        assert_eq!(status.data[0], 1);
        assert!(status.data.len() > 1);
        assert!(reply.restart_operate);

        assert_eq!(answer(&admin.await.unwrap()).data, b"OK");
        assert_eq!(server.manager().mode(), BusMode::ClientServer);
    }

    #[tokio::test]
    async fn test_frame_read_during_block_waits_for_release() {
        let (_mock, server) = server().await;
        let server = Arc::new(server);
        let (client, service) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .handle_client(service, peer, CancellationToken::new())
                    .await
            })
        };
        // Let the client loop pass its readiness check and start reading
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.manager().block_network().await.unwrap();

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(&request(group::SETTINGS, spec::settings::CONNECTION_TEST, 1, 0, &[]))
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), read_raw_frame(&mut rx))
                .await
                .is_err(),
            "answered while the network was blocked"
        );

        server.manager().unblock_network().await.unwrap();
        let raw = tokio::time::timeout(Duration::from_secs(2), read_raw_frame(&mut rx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_network_frame(&raw).unwrap().data, b"OK");

        drop(tx);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        server.manager().stop_operate().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_upload_pushes_progress_first() {
        let (mock, server) = server().await;
        let mut block = vec![0u8; MIRROR_LEN];
        block[MirrorIndex::MOD_ID] = 6;
        block[MirrorIndex::MOD_DESC] = 10;
        server.manager().sinks().registry.apply_mirror(6, &block);
        block[MirrorIndex::T_SHORT] = 25;

        let (client, service) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        let task = tokio::spawn(async move {
            server
                .handle_client(service, peer, CancellationToken::new())
                .await;
            server
        });

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(&request(group::SETTINGS, spec::settings::MODULE_SETTINGS, 1, 6, &block))
            .await
            .unwrap();
        let push = decode_network_frame(&read_raw_frame(&mut rx).await.unwrap()).unwrap();
        assert_eq!(push.header.spec, spec::settings::MODULE_SETTINGS);
        assert_eq!(push.header.p5, 6);
        assert_eq!(push.data, vec![1]);
        let done = decode_network_frame(&read_raw_frame(&mut rx).await.unwrap()).unwrap();
        assert_eq!(done.data, vec![6, 1]);
        assert!(mock.sent_opcodes().contains(&opcode::SEND_MOD_SMG));

        drop(tx);
        drop(rx);
        let server = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        server.manager().stop_operate().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_crc_reply_to_vanished_client_is_logged() {
        let (mock, server) = server().await;
        let (mut client, service) = tokio::io::duplex(64);
        client.write_all(&[0x00, 0x01, 0x02]).await.unwrap();
        drop(client);

        let peer: SocketAddr = "127.0.0.1:40004".parse().unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            server.handle_client(service, peer, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(logs_contain("CRC error reply to 127.0.0.1:40004 not written"));
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_connection_serves_until_eof() {
        let (_mock, server) = server().await;
        let (client, service) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(async move {
            server
                .handle_client(service, peer, CancellationToken::new())
                .await;
            server
        });

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(&request(group::SETTINGS, spec::settings::CONNECTION_TEST, 1, 0, &[]))
            .await
            .unwrap();
        let raw = read_raw_frame(&mut rx).await.unwrap();
        assert_eq!(decode_network_frame(&raw).unwrap().data, b"OK");

        drop(tx);
        drop(rx);
        let server = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        // The connection test asked for Operate afterwards
        assert_eq!(server.manager().mode(), BusMode::Operate);
        server.manager().stop_operate().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_prefix_closes_connection() {
        let (_mock, server) = server().await;
        let (client, service) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let task = tokio::spawn(async move {
            server
                .handle_client(service, peer, CancellationToken::new())
                .await
        });

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(&[0x55, 0x10, 0x00]).await.unwrap();
        let raw = read_raw_frame(&mut rx).await.unwrap();
        assert_eq!(
            decode_network_frame(&raw).unwrap().data,
            CRC_ERROR_TEXT.as_bytes()
        );
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
