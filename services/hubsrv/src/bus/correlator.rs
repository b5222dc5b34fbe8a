//! Command/response correlation
//!
//! Every bus exchange goes through the context's token, a FIFO async mutex
//! held across the physical read, so at most one command is in flight.

use errors::{HubError, HubResult};
use std::time::Duration;
use tracing::{debug, warn};

use crate::protocol::commands::RouterCommand;
use crate::protocol::serial::{decode_serial_frame, encode_serial_command, SerialFrame};

use super::context::{BusLinkContext, BusMode};
use super::link::ReadOwner;

impl BusLinkContext {
    /// Send `command` and return the router's answer
    ///
    /// In Operate mode the watcher owns the reader: the command is still
    /// sent, a warning is logged and a degraded zeroed frame is returned.
    pub async fn send_and_await(
        &self,
        router: u8,
        command: &RouterCommand,
    ) -> HubResult<SerialFrame> {
        self.exchange(router, command, self.timing().response_timeout)
            .await
    }

    /// [`send_and_await`](Self::send_and_await) with a caller supplied bound
    pub async fn send_and_await_within(
        &self,
        router: u8,
        command: &RouterCommand,
        limit: Duration,
    ) -> HubResult<SerialFrame> {
        self.exchange(router, command, limit).await
    }

    async fn exchange(
        &self,
        router: u8,
        command: &RouterCommand,
        limit: Duration,
    ) -> HubResult<SerialFrame> {
        let frame = encode_serial_command(command, router)?;
        let _token = self.token.lock().await;

        if self.mode() == BusMode::Operate {
            self.link.send(&frame).await?;
            warn!(
                "{} sent in Operate mode, no response possible",
                command.name()
            );
            return Ok(SerialFrame::degraded());
        }

        let claim = self
            .link
            .claim_reader(ReadOwner::Correlator)
            .map_err(|owner| HubError::ModeConflict {
                operation: command.name().to_string(),
                required: "idle reader".to_string(),
                current: format!("{} ({owner:?} reading)", self.mode()),
            })?;

        self.link.send(&frame).await?;
        tokio::time::sleep(self.timing().settle).await;
        let raw = self.link.receive_frame(&claim, Some(limit)).await?;
        let response = decode_serial_frame(&raw)?;
        debug!(
            "{} answered with code {} ({} data bytes)",
            command.name(),
            response.code,
            response.data.len()
        );
        Ok(response)
    }

    /// Send without collecting an answer; the token covers the write only
    pub async fn send_only(&self, router: u8, command: &RouterCommand) -> HubResult<()> {
        let frame = encode_serial_command(command, router)?;
        let _token = self.token.lock().await;
        self.link.send(&frame).await?;
        debug!("{} sent", command.name());
        Ok(())
    }

    /// Collect one frame without sending
    ///
    /// Degraded in Operate like [`send_and_await`](Self::send_and_await);
    /// refused while a mode transition runs, the reader is not ours to take.
    pub async fn await_only(&self, router: u8) -> HubResult<SerialFrame> {
        let _token = self.token.lock().await;
        match self.mode() {
            BusMode::Operate => {
                warn!("Response from router {} awaited in Operate mode, none possible", router);
                return Ok(SerialFrame::degraded());
            },
            mode if mode.is_transition() => {
                return Err(HubError::ModeConflict {
                    operation: format!("await response from router {router}"),
                    required: BusMode::ClientServer.to_string(),
                    current: mode.to_string(),
                });
            },
            _ => {},
        }
        let claim = self
            .link
            .claim_reader(ReadOwner::Correlator)
            .map_err(|owner| HubError::ModeConflict {
                operation: format!("await response from router {router}"),
                required: "idle reader".to_string(),
                current: format!("{} ({owner:?} reading)", self.mode()),
            })?;
        let raw = self
            .link
            .receive_frame(&claim, Some(self.timing().response_timeout))
            .await?;
        Ok(decode_serial_frame(&raw)?)
    }
}
