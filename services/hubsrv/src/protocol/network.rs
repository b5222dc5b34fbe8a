//! Network API frame codec
//!
//! Wire layout (all offsets relative to frame start):
//!
//! ```text
//! A8 len_lo len_hi ulen user.. plen pass.. r0 r1 grp spec_hi spec_lo p4 p5
//!    dlen_lo dlen_hi data.. crc_hi crc_lo 3F
//! ```
//!
//! `len` counts the whole frame. `r0 r1` are reserved and echoed untouched.
//! The CRC covers everything before the CRC bytes.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::checksum::{crc16, crc16_check};

pub const NET_PREFIX: u8 = 0xA8;
pub const NET_POSTFIX: u8 = 0x3F;

/// Frame with empty user, password and data
pub const MIN_FRAME_LEN: usize = 17;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Fixed payload answered to frames failing the CRC check
pub const CRC_ERROR_TEXT: &str = "Network crc error";

/// Bytes after the password up to the data: reserved(2) grp spec(2) p4 p5 dlen(2)
const COMMAND_HEAD_LEN: usize = 9;
/// CRC(2) and postfix
const TRAILER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes")]
    Truncated { len: usize },

    #[error("bad prefix 0x{0:02X}")]
    BadPrefix(u8),

    #[error("bad postfix 0x{0:02X}")]
    BadPostfix(u8),

    #[error("declared length {declared} but {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    BadCrc { received: u16, computed: u16 },

    #[error("{field} overruns frame end")]
    Overrun { field: &'static str },

    #[error("frame of {0} bytes exceeds length field")]
    Oversize(usize),
}

impl From<FrameError> for errors::HubError {
    fn from(err: FrameError) -> Self {
        errors::HubError::Frame(err.to_string())
    }
}

/// Everything in a request frame except the data payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkHeader {
    pub user: Vec<u8>,
    pub password: Vec<u8>,
    pub reserved: [u8; 2],
    pub group: u8,
    pub spec: u16,
    pub p4: u8,
    pub p5: u8,
}

impl NetworkHeader {
    pub fn new(group: u8, spec: u16, p4: u8, p5: u8) -> Self {
        Self {
            group,
            spec,
            p4,
            p5,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, user: &[u8], password: &[u8]) -> Self {
        self.user = user.to_vec();
        self.password = password.to_vec();
        self
    }

    /// User name, Latin-1 decoded
    pub fn user_name(&self) -> String {
        self.user.iter().map(|&b| b as char).collect()
    }

    /// Prefix, placeholder length, credentials and reserved bytes
    fn preamble(&self) -> Result<Vec<u8>, FrameError> {
        let ulen = u8::try_from(self.user.len()).map_err(|_| FrameError::Oversize(self.user.len()))?;
        let plen = u8::try_from(self.password.len())
            .map_err(|_| FrameError::Oversize(self.password.len()))?;

        let mut buf = Vec::with_capacity(7 + self.user.len() + self.password.len());
        buf.extend_from_slice(&[NET_PREFIX, 0, 0, ulen]);
        buf.extend_from_slice(&self.user);
        buf.push(plen);
        buf.extend_from_slice(&self.password);
        buf.extend_from_slice(&self.reserved);
        Ok(buf)
    }
}

/// A decoded, CRC-verified network request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFrame {
    pub header: NetworkHeader,
    pub data: Vec<u8>,
}

impl NetworkFrame {
    /// Router addressed by the request
    ///
    /// p4 when set; 0 for a bare command without data (connection test);
    /// otherwise the first data byte.
    pub fn router_id(&self) -> u8 {
        if self.header.p4 > 0 {
            self.header.p4
        } else {
            self.data.first().copied().unwrap_or(0)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_network_response(&self.header, &self.data)
    }
}

/// Total length announced by the first three bytes of a frame
pub fn declared_length(prefix: &[u8; 3]) -> Result<usize, FrameError> {
    if prefix[0] != NET_PREFIX {
        return Err(FrameError::BadPrefix(prefix[0]));
    }
    Ok(usize::from(u16::from_le_bytes([prefix[1], prefix[2]])))
}

/// Read one raw frame from a stream: the three byte prefix, then the
/// remainder announced by it. CRC and layout are left to the decoder.
pub async fn read_raw_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 3];
    reader.read_exact(&mut prefix).await?;
    let declared = declared_length(&prefix)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    if declared < MIN_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            FrameError::Truncated { len: declared }.to_string(),
        ));
    }
    let mut raw = vec![0u8; declared];
    raw[..3].copy_from_slice(&prefix);
    reader.read_exact(&mut raw[3..]).await?;
    Ok(raw)
}

/// Decode a complete network frame; the CRC is checked before any field is read
pub fn decode_network_frame(raw: &[u8]) -> Result<NetworkFrame, FrameError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated { len: raw.len() });
    }
    let declared = declared_length(&[raw[0], raw[1], raw[2]])?;
    if declared != raw.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: raw.len(),
        });
    }
    let postfix = raw[raw.len() - 1];
    if postfix != NET_POSTFIX {
        return Err(FrameError::BadPostfix(postfix));
    }

    let body_end = raw.len() - TRAILER_LEN;
    let received = u16::from_be_bytes([raw[body_end], raw[body_end + 1]]);
    if !crc16_check(&raw[..body_end], received) {
        return Err(FrameError::BadCrc {
            received,
            computed: crc16(&raw[..body_end]),
        });
    }

    let body = &raw[..body_end];
    let ulen = usize::from(body[3]);
    let user_end = 4 + ulen;
    let plen = usize::from(*body.get(user_end).ok_or(FrameError::Overrun { field: "user" })?);
    let pass_end = user_end + 1 + plen;
    let head = body
        .get(pass_end..pass_end + COMMAND_HEAD_LEN)
        .ok_or(FrameError::Overrun { field: "password" })?;

    let dlen = usize::from(u16::from_le_bytes([head[7], head[8]]));
    let data_start = pass_end + COMMAND_HEAD_LEN;
    let data = body
        .get(data_start..data_start + dlen)
        .ok_or(FrameError::Overrun { field: "data" })?;

    Ok(NetworkFrame {
        header: NetworkHeader {
            user: body[4..user_end].to_vec(),
            password: body[user_end + 1..pass_end].to_vec(),
            reserved: [head[0], head[1]],
            group: head[2],
            spec: u16::from_be_bytes([head[3], head[4]]),
            p4: head[5],
            p5: head[6],
        },
        data: data.to_vec(),
    })
}

/// Patch the total length, append CRC and postfix
fn seal(mut buf: Vec<u8>) -> Result<Vec<u8>, FrameError> {
    let total = buf.len() + TRAILER_LEN;
    if total > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(total));
    }
    buf[1..3].copy_from_slice(&(total as u16).to_le_bytes());
    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.push(NET_POSTFIX);
    Ok(buf)
}

/// Response to a request: original preamble and command head, new data
pub fn encode_network_response(
    header: &NetworkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let dlen = u16::try_from(payload.len()).map_err(|_| FrameError::Oversize(payload.len()))?;
    let mut buf = header.preamble()?;
    buf.push(header.group);
    buf.extend_from_slice(&header.spec.to_be_bytes());
    buf.extend_from_slice(&[header.p4, header.p5]);
    buf.extend_from_slice(&dlen.to_le_bytes());
    buf.extend_from_slice(payload);
    seal(buf)
}

/// Out-of-band status push while a request is still being served
///
/// `section` is a complete command section (`grp spec p4 p5 dlen data`)
/// supplied by the caller; only the preamble is taken from `header`.
pub fn encode_network_status(header: &NetworkHeader, section: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut buf = header.preamble()?;
    buf.extend_from_slice(section);
    seal(buf)
}

/// Command section for [`encode_network_status`]
pub fn status_section(group: u8, spec: u16, p4: u8, p5: u8, data: &[u8]) -> Vec<u8> {
    let mut section = Vec::with_capacity(7 + data.len());
    section.push(group);
    section.extend_from_slice(&spec.to_be_bytes());
    section.extend_from_slice(&[p4, p5]);
    section.extend_from_slice(&(data.len() as u16).to_le_bytes());
    section.extend_from_slice(data);
    section
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn sample_header() -> NetworkHeader {
        NetworkHeader::new(30, 0x0101, 1, 5).with_credentials(b"admin", b"pw")
    }

    #[test]
    fn test_response_round_trip() {
        let cases: Vec<(NetworkHeader, Vec<u8>)> = vec![
            (NetworkHeader::new(20, 0x0001, 0, 0), vec![]),
            (sample_header(), b"OK".to_vec()),
            (
                NetworkHeader {
                    reserved: [0x12, 0x34],
                    ..NetworkHeader::new(10, 0xBEEF, 255, 250)
                },
                (0..=255u8).collect(),
            ),
        ];

        for (header, payload) in cases {
            let raw = encode_network_response(&header, &payload).unwrap();
            let frame = decode_network_frame(&raw).unwrap();
            assert_eq!(frame.header, header);
            assert_eq!(frame.data, payload);
        }
    }

    #[test]
    fn test_wire_layout() {
        let raw = encode_network_response(&NetworkHeader::new(30, 0x0101, 1, 5), &[0x03]).unwrap();
        assert_eq!(raw.len(), MIN_FRAME_LEN + 1);
        assert_eq!(&raw[..3], &[0xA8, 18, 0]);
        // ulen plen reserved grp spec p4 p5 dlen data
        assert_eq!(
            &raw[3..15],
            &[0, 0, 0, 0, 30, 0x01, 0x01, 1, 5, 1, 0, 0x03]
        );
        let crc = crc16(&raw[..15]).to_be_bytes();
        assert_eq!(&raw[15..], &[crc[0], crc[1], 0x3F]);
    }

    #[test]
    fn test_bad_crc_rejected_before_fields() {
        let mut raw = encode_network_response(&sample_header(), b"data").unwrap();
        let crc_pos = raw.len() - 3;
        raw[crc_pos] ^= 0xFF;
        assert!(matches!(
            decode_network_frame(&raw),
            Err(FrameError::BadCrc { .. })
        ));
    }

    #[test]
    fn test_corrupted_body_detected() {
        let mut raw = encode_network_response(&sample_header(), b"data").unwrap();
        raw[10] ^= 0x01;
        assert!(matches!(
            decode_network_frame(&raw),
            Err(FrameError::BadCrc { .. })
        ));
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(
            decode_network_frame(&[0xA8, 3, 0]),
            Err(FrameError::Truncated { len: 3 })
        );

        let mut raw = encode_network_response(&sample_header(), b"x").unwrap();
        raw[0] = 0xA9;
        assert_eq!(decode_network_frame(&raw), Err(FrameError::BadPrefix(0xA9)));

        let raw = encode_network_response(&sample_header(), b"x").unwrap();
        let short = &raw[..raw.len() - 1];
        assert!(matches!(
            decode_network_frame(short),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_data_length_overrun_is_rejected() {
        // Valid CRC, but dlen claims more than the frame holds
        let mut body = vec![0xA8, 0, 0, 0, 0, 0, 0, 10, 0, 1, 0, 0, 9, 0];
        let total = body.len() + 3;
        body[1] = total as u8;
        let crc = crc16(&body).to_be_bytes();
        body.extend_from_slice(&[crc[0], crc[1], 0x3F]);
        assert_eq!(
            decode_network_frame(&body),
            Err(FrameError::Overrun { field: "data" })
        );
    }

    #[test]
    fn test_router_id_selection() {
        let with_p4 = NetworkFrame {
            header: NetworkHeader::new(30, 1, 1, 5),
            data: vec![9],
        };
        assert_eq!(with_p4.router_id(), 1);

        let bare = NetworkFrame {
            header: NetworkHeader::new(20, 1, 0, 0),
            data: vec![],
        };
        assert_eq!(bare.router_id(), 0);

        let from_data = NetworkFrame {
            header: NetworkHeader::new(10, 1, 0, 0),
            data: vec![1, 5],
        };
        assert_eq!(from_data.router_id(), 1);
    }

    #[test]
    fn test_status_push_keeps_preamble() {
        let header = sample_header();
        let section = status_section(60, 0x0301, 1, 0, &[1]);
        let raw = encode_network_status(&header, &section).unwrap();
        let frame = decode_network_frame(&raw).unwrap();
        assert_eq!(frame.header.user, b"admin");
        assert_eq!(frame.header.group, 60);
        assert_eq!(frame.header.spec, 0x0301);
        assert_eq!(frame.data, vec![1]);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        assert!(matches!(
            encode_network_response(&NetworkHeader::default(), &payload),
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_read_raw_frame_from_stream() {
        let frame = encode_network_response(&sample_header(), b"abc").unwrap();
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);
        let mut reader = stream.as_slice();
        assert_eq!(read_raw_frame(&mut reader).await.unwrap(), frame);
        assert_eq!(read_raw_frame(&mut reader).await.unwrap(), frame);
        assert!(read_raw_frame(&mut reader).await.is_err());

        let mut bad: &[u8] = &[0x55, 20, 0];
        let err = read_raw_frame(&mut bad).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
