//! Serial bus frame codec
//!
//! Command (hub → router): `2A router len body.. xor`, `len` counts the whole
//! frame including the checksum, XOR covers every preceding byte.
//!
//! Response/event (router → hub): `FF 23 router len code data.. xor`. `len`
//! counts the bytes from `23` through the checksum; the XOR covers the same
//! range minus the checksum itself.

use errors::{HubError, HubResult};
use tracing::{error, warn};

use super::checksum::xor_checksum;
use super::commands::RouterCommand;
use super::network::FrameError;

pub const CMD_PREFIX: u8 = 0x2A;
pub const SYNC_MARKER: [u8; 2] = [0xFF, 0x23];

/// `FF 23 router len`
pub const RESP_PREFIX_LEN: usize = 4;
/// Smallest `len` value carrying a code byte: `23 router len code xor`
pub const MIN_RESP_LEN: u8 = 5;

/// Codes the router uses to reject a command
pub const ROUTER_ERROR_CODES: [u8; 4] = [250, 251, 253, 254];

const MAX_COMMAND_LEN: usize = u8::MAX as usize;

/// Build the wire bytes for `command` addressed to `router_id`
///
/// Fails only if the body does not fit the one-byte length field, which is a
/// programming error in the command table.
pub fn encode_serial_command(command: &RouterCommand, router_id: u8) -> HubResult<Vec<u8>> {
    let body = command.body();
    let total = 3 + body.len() + 1;
    if total > MAX_COMMAND_LEN {
        return Err(HubError::Internal(format!(
            "router command {} is {} bytes, limit {}",
            command.name(),
            total,
            MAX_COMMAND_LEN
        )));
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[CMD_PREFIX, router_id, total as u8]);
    frame.extend_from_slice(&body);
    frame.push(xor_checksum(&frame));
    Ok(frame)
}

/// Build a router response/event frame including the `FF` lead byte
///
/// The hub never sends these; the mock link and tests script the router side
/// with it.
pub fn encode_serial_response(router_id: u8, code: u8, data: &[u8]) -> Vec<u8> {
    let len = (5 + data.len()) as u8;
    let mut frame = Vec::with_capacity(1 + usize::from(len));
    frame.extend_from_slice(&[SYNC_MARKER[0], SYNC_MARKER[1], router_id, len, code]);
    frame.extend_from_slice(data);
    frame.push(xor_checksum(&frame[1..]));
    frame
}

/// A router response or event, starting at the `23` marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub router: u8,
    pub code: u8,
    /// Bytes between the code and the checksum
    pub data: Vec<u8>,
    /// XOR mismatch is tolerated; the frame is still delivered
    pub checksum_ok: bool,
    /// Placeholder handed out when no synchronous answer is possible
    pub degraded: bool,
    raw: Vec<u8>,
}

impl SerialFrame {
    /// Zeroed result returned by the correlator while the bus is in Operate mode
    pub fn degraded() -> Self {
        Self {
            router: 0,
            code: 0,
            data: vec![0],
            checksum_ok: true,
            degraded: true,
            raw: vec![0, 0],
        }
    }

    /// Frame bytes from the `23` marker through the checksum
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Answer payload following the echoed command bytes
    ///
    /// The router repeats the command after the code; for a command of
    /// `command_len` bytes the answer starts at offset `command_len - 1`.
    pub fn message(&self, command_len: usize) -> &[u8] {
        if self.degraded {
            return &self.data;
        }
        let start = command_len.saturating_sub(1);
        let end = self.raw.len().saturating_sub(1);
        self.raw.get(start..end).unwrap_or(&[])
    }

    pub fn router_error(&self) -> Option<u8> {
        ROUTER_ERROR_CODES.contains(&self.code).then_some(self.code)
    }
}

/// Split a frame starting at the `23` marker
///
/// Only a frame too short to hold a code byte is rejected; checksum problems
/// are logged and flagged.
pub fn decode_serial_frame(raw: &[u8]) -> Result<SerialFrame, FrameError> {
    if raw.len() < usize::from(MIN_RESP_LEN) {
        return Err(FrameError::Truncated { len: raw.len() });
    }

    let (body, checksum) = raw.split_at(raw.len() - 1);
    let checksum_ok = xor_checksum(body) == checksum[0];
    if !checksum_ok {
        warn!(
            "Router frame checksum mismatch: {}",
            common::hex::encode_spaced(raw)
        );
    }

    let frame = SerialFrame {
        router: raw[1],
        code: raw[3],
        data: raw[4..raw.len() - 1].to_vec(),
        checksum_ok,
        degraded: false,
        raw: raw.to_vec(),
    };

    if let Some(code) = frame.router_error() {
        error!("Router {} returned error {}", frame.router, code);
    }
    Ok(frame)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let cmd = RouterCommand::StopMirror;
        let frame = encode_serial_command(&cmd, 1).unwrap();
        assert_eq!(frame[0], CMD_PREFIX);
        assert_eq!(frame[1], 1);
        assert_eq!(usize::from(frame[2]), frame.len());
        assert_eq!(xor_checksum(&frame), 0);
    }

    #[test]
    fn test_router_id_substituted() {
        let a = encode_serial_command(&RouterCommand::ClearSendBuffer, 1).unwrap();
        let b = encode_serial_command(&RouterCommand::ClearSendBuffer, 7).unwrap();
        assert_eq!(a[1], 1);
        assert_eq!(b[1], 7);
        assert_eq!(a[2..a.len() - 1], b[2..b.len() - 1]);
        assert_ne!(a.last(), b.last());
    }

    #[test]
    fn test_oversized_command_is_internal_error() {
        let cmd = RouterCommand::Raw(vec![0u8; 252]);
        assert!(matches!(
            encode_serial_command(&cmd, 1),
            Err(HubError::Internal(_))
        ));
        assert!(encode_serial_command(&RouterCommand::Raw(vec![0u8; 251]), 1).is_ok());
    }

    #[test]
    fn test_decode_response() {
        let wire = encode_serial_response(1, 0x87, &[0x10, 0x20]);
        let frame = decode_serial_frame(&wire[1..]).unwrap();
        assert_eq!(frame.router, 1);
        assert_eq!(frame.code, 0x87);
        assert_eq!(frame.data, vec![0x10, 0x20]);
        assert!(frame.checksum_ok);
        assert!(frame.router_error().is_none());
    }

    #[test]
    fn test_checksum_mismatch_is_flagged_not_fatal() {
        let mut wire = encode_serial_response(1, 0x87, &[1, 2, 3]);
        let last = wire.len() - 1;
        wire[last] ^= 0x55;
        let frame = decode_serial_frame(&wire[1..]).unwrap();
        assert!(!frame.checksum_ok);
        assert_eq!(frame.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_message_skips_echoed_command() {
        // Command of 8 bytes: answer starts at raw offset 7
        let wire = encode_serial_response(1, 0x11, &[5, 0x04, 0, 0, b'O', b'K']);
        let frame = decode_serial_frame(&wire[1..]).unwrap();
        assert_eq!(frame.message(8), &[0, b'O', b'K']);
        assert_eq!(frame.message(100), &[] as &[u8]);
    }

    #[test]
    fn test_router_error_codes() {
        for code in ROUTER_ERROR_CODES {
            let wire = encode_serial_response(1, code, &[]);
            let frame = decode_serial_frame(&wire[1..]).unwrap();
            assert_eq!(frame.router_error(), Some(code));
        }
    }

    #[test]
    fn test_degraded_frame() {
        let frame = SerialFrame::degraded();
        assert!(frame.degraded);
        assert_eq!(frame.code, 0);
        assert_eq!(frame.message(8), &[0]);
    }

    #[test]
    fn test_too_short_frame() {
        assert_eq!(
            decode_serial_frame(&[0x23, 1, 4, 0]),
            Err(FrameError::Truncated { len: 4 })
        );
    }
}
