//! Mirror offset table
//!
//! Every reader and writer of a module mirror uses these offsets. Index 0
//! holds the module id, the router sends the block as the payload of a
//! mirror event (code 135).

/// Byte offsets into a module mirror
pub struct MirrorIndex;

impl MirrorIndex {
    pub const MOD_ID: usize = 0;
    /// Module type code, 2 bytes
    pub const MOD_DESC: usize = 1;
    /// Name, 32 bytes Latin-1
    pub const MOD_NAME: usize = 3;
    /// Serial number, 16 bytes
    pub const MOD_SERIAL: usize = 35;
    /// Firmware version, 22 bytes
    pub const SW_VERSION: usize = 51;
    /// CRC of the label/command list, big-endian
    pub const SMC_CRC: usize = 73;

    pub const INP_1_8: usize = 75;
    pub const INP_9_16: usize = 76;
    pub const INP_17_24: usize = 77;
    pub const OUT_1_8: usize = 78;
    pub const OUT_9_16: usize = 79;
    pub const OUT_17_24: usize = 80;

    pub const LUM: usize = 81;
    pub const MOV: usize = 82;
    /// Room temperature, 2 bytes
    pub const TEMP_ROOM: usize = 83;
    pub const TEMP_PWR: usize = 85;
    /// External temperature, 2 bytes
    pub const TEMP_EXT: usize = 86;
    pub const IR_H: usize = 88;
    pub const IR_L: usize = 89;
    pub const SMKEY_STAT: usize = 90;
    /// Local flags 1..16, low byte first
    pub const FLAG_LOC: usize = 91;
    /// 10 logic units of 3 bytes: mode, input count, max count
    pub const LOGIC: usize = 93;

    pub const T_SHORT: usize = 123;
    pub const T_LONG: usize = 124;
    pub const T_DIM: usize = 125;
    pub const SUPPLY_PRIO: usize = 126;
    pub const DISPL_CONTR: usize = 127;
    pub const MOD_LIGHT_TIM: usize = 128;
    pub const CLIM_SETTINGS: usize = 129;
    pub const TMP_CTL_MD: usize = 130;
    /// Switch modes, 3 bytes
    pub const SWMOD_1_8: usize = 131;
    pub const COVER_SETTINGS: usize = 134;
    /// Cover polarity mask, 2 bytes little-endian, bit `2*ci`
    pub const COVER_POL: usize = 135;

    /// Raw cover times, 8 bytes
    pub const COVER_T: usize = 140;
    /// Cover interpolation factors, 8 bytes
    pub const COVER_INTERP: usize = 148;
    /// Blade times, 8 bytes
    pub const BLAD_T: usize = 156;
    /// Dimmer values, 4 bytes
    pub const DIMM: usize = 164;

    pub const END: usize = 226;
}

pub const MIRROR_LEN: usize = MirrorIndex::END;
pub const NAME_LEN: usize = 32;
pub const SERIAL_LEN: usize = 16;
pub const SW_VERSION_LEN: usize = 22;
/// Settings slice starting at `T_SHORT`
pub const SETTINGS_LEN: usize = 17;
pub const COVER_COUNT: usize = 8;
pub const LOGIC_UNITS: usize = 10;
pub const LOGIC_SLOT_LEN: usize = 3;
pub const DIMMER_COUNT: usize = 4;

/// Ranges copied into the compact status
pub const COMPACT_BLOCKS: [(usize, usize); 2] = [
    (MirrorIndex::MOD_ID, MirrorIndex::MOD_NAME),
    (MirrorIndex::INP_1_8, MirrorIndex::T_SHORT),
];

/// Sensor bytes; they change continuously and are not reported
pub const SENSOR_BYTES: [usize; 7] = [
    MirrorIndex::LUM,
    MirrorIndex::MOV,
    MirrorIndex::TEMP_ROOM,
    MirrorIndex::TEMP_ROOM + 1,
    MirrorIndex::TEMP_PWR,
    MirrorIndex::TEMP_EXT,
    MirrorIndex::TEMP_EXT + 1,
];

/// Latin-1 text field with padding and NULs trimmed
pub fn text_field(status: &[u8], start: usize, len: usize) -> String {
    status
        .get(start..start + len)
        .unwrap_or(&[])
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Write `text` Latin-1 encoded, space padded to `len`
pub fn put_text(status: &mut [u8], start: usize, len: usize, text: &str) {
    let mut bytes: Vec<u8> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .take(len)
        .collect();
    bytes.resize(len, b' ');
    if let Some(slot) = status.get_mut(start..start + len) {
        slot.copy_from_slice(&bytes);
    }
}
