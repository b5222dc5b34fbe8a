//! Hex rendering for frame dumps

use std::fmt::Write;

/// Uppercase hex without separators: `[0x12, 0xAB]` -> `"12AB"`
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Uppercase hex, space separated: `[0xFF, 0x23]` -> `"FF 23"`
///
/// Used for bus traffic lines so frame boundaries are readable.
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
