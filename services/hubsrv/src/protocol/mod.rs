//! Wire formats: checksums, network API frames, serial bus frames

pub mod checksum;
pub mod commands;
pub mod network;
pub mod serial;

pub use checksum::{crc16, crc16_check, xor_checksum};
pub use commands::RouterCommand;
pub use network::{
    decode_network_frame, encode_network_response, encode_network_status, read_raw_frame,
    FrameError, NetworkFrame, NetworkHeader, CRC_ERROR_TEXT,
};
pub use serial::{decode_serial_frame, encode_serial_command, SerialFrame};
