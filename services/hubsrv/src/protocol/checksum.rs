//! Frame checksums
//!
//! Network frames carry a Modbus CRC16 (poly 0xA001, init 0xFFFF). The value
//! returned by [`crc16`] is byte-swapped so that `to_be_bytes()` yields the
//! two bytes in wire order. Serial frames carry a plain XOR over all bytes.

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();

/// CRC16 over `data`, high/low bytes swapped for big-endian placement
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        let table_index = ((crc ^ u16::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC16_TABLE[table_index];
    }
    crc.swap_bytes()
}

/// Check `data` against a CRC read big-endian from the wire
pub fn crc16_check(data: &[u8], crc: u16) -> bool {
    crc16(data) == crc
}

/// XOR of all bytes
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vectors() {
        // Modbus read request: wire CRC bytes are C5 CD
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&data), 0xC5CD);
        assert_eq!(crc16(&data).to_be_bytes(), [0xC5, 0xCD]);

        // CRC-16/MODBUS check value 0x4B37, swapped
        assert_eq!(crc16(b"123456789"), 0x374B);
    }

    #[test]
    fn test_crc16_empty_is_init_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_check_accepts_own_value() {
        let samples: [&[u8]; 4] = [b"", b"\xA8", b"hub gateway", &[0u8; 300]];
        for sample in samples {
            assert!(crc16_check(sample, crc16(sample)));
        }
    }

    #[test]
    fn test_crc16_detects_single_bit_flips() {
        let original = b"\xA8\x15\x00\x00\x00\x00\x00\x14\x02\x01\x00\x00\x00\x00".to_vec();
        let crc = crc16(&original);
        for byte in 0..original.len() {
            for bit in 0..8 {
                let mut flipped = original.clone();
                flipped[byte] ^= 1 << bit;
                assert!(!crc16_check(&flipped, crc), "flip at {byte}:{bit} undetected");
            }
        }
    }

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0x2A, 0x01, 0x05]), 0x2A ^ 0x01 ^ 0x05);
        let frame = [0x2A, 0x01, 0x06, 0x11, 0x05];
        let chk = xor_checksum(&frame);
        let mut full = frame.to_vec();
        full.push(chk);
        assert_eq!(xor_checksum(&full), 0);
    }
}
