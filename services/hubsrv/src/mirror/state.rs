//! Structured view of a module mirror
//!
//! [`ModuleState::apply`] decodes the named fields of a raw mirror,
//! [`ModuleState::write_into`] replaces them in place. Bytes without a named
//! field (live inputs, outputs, sensors) are left untouched by writes.

use errors::{HubError, HubResult};
use serde::{Deserialize, Serialize};

use super::covers::{read_covers, write_covers, CoverTimes};
use super::layout::{
    put_text, text_field, MirrorIndex, COVER_COUNT, DIMMER_COUNT, LOGIC_SLOT_LEN, LOGIC_UNITS,
    MIRROR_LEN, NAME_LEN, SERIAL_LEN, SW_VERSION_LEN,
};

/// Logic mode of a counter unit
pub const LOGIC_MODE_COUNTER: u8 = 5;

/// One logic unit slot: `(mode, input_count, max_count)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicUnit {
    pub mode: u8,
    pub inputs: u8,
    /// Only meaningful for counters
    pub max_count: u8,
}

impl LogicUnit {
    pub fn is_counter(&self) -> bool {
        self.mode == LOGIC_MODE_COUNTER
    }
}

/// Decoded module configuration and identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    pub id: u8,
    pub type_code: [u8; 2],
    pub name: String,
    pub serial: String,
    pub sw_version: String,
    /// CRC of the label list, big-endian in the mirror
    pub smc_crc: u16,
    /// Short press time in ms (stored in units of 10 ms)
    pub t_short_ms: u16,
    pub t_long_ms: u16,
    pub t_dimm: u8,
    pub supply_prio: u8,
    pub displ_contr: u8,
    pub displ_time: u8,
    pub temp_ctl: u8,
    pub temp_1_2: u8,
    /// Input switch mode bits, 24 bits little-endian
    pub switch_modes: u32,
    /// Bit per cover output pair configured as shutter
    pub cover_settings: u8,
    pub covers: [CoverTimes; COVER_COUNT],
    pub logic: [LogicUnit; LOGIC_UNITS],
    pub dimmers: [u8; DIMMER_COUNT],
}

impl ModuleState {
    /// Decode a full mirror
    pub fn apply(raw: &[u8]) -> HubResult<Self> {
        if raw.len() < MIRROR_LEN {
            return Err(HubError::Validation(format!(
                "Mirror of {} bytes, expected {}",
                raw.len(),
                MIRROR_LEN
            )));
        }

        let mut logic = [LogicUnit::default(); LOGIC_UNITS];
        for (i, unit) in logic.iter_mut().enumerate() {
            let at = MirrorIndex::LOGIC + i * LOGIC_SLOT_LEN;
            *unit = LogicUnit {
                mode: raw[at],
                inputs: raw[at + 1],
                max_count: raw[at + 2],
            };
        }

        let mut dimmers = [0u8; DIMMER_COUNT];
        dimmers.copy_from_slice(&raw[MirrorIndex::DIMM..MirrorIndex::DIMM + DIMMER_COUNT]);

        Ok(Self {
            id: raw[MirrorIndex::MOD_ID],
            type_code: [raw[MirrorIndex::MOD_DESC], raw[MirrorIndex::MOD_DESC + 1]],
            name: text_field(raw, MirrorIndex::MOD_NAME, NAME_LEN),
            serial: text_field(raw, MirrorIndex::MOD_SERIAL, SERIAL_LEN),
            sw_version: text_field(raw, MirrorIndex::SW_VERSION, SW_VERSION_LEN),
            smc_crc: u16::from_be_bytes([raw[MirrorIndex::SMC_CRC], raw[MirrorIndex::SMC_CRC + 1]]),
            t_short_ms: u16::from(raw[MirrorIndex::T_SHORT]) * 10,
            t_long_ms: u16::from(raw[MirrorIndex::T_LONG]) * 10,
            t_dimm: raw[MirrorIndex::T_DIM],
            supply_prio: raw[MirrorIndex::SUPPLY_PRIO],
            displ_contr: raw[MirrorIndex::DISPL_CONTR],
            displ_time: raw[MirrorIndex::MOD_LIGHT_TIM],
            temp_ctl: raw[MirrorIndex::CLIM_SETTINGS],
            temp_1_2: raw[MirrorIndex::TMP_CTL_MD],
            switch_modes: u32::from_le_bytes([
                raw[MirrorIndex::SWMOD_1_8],
                raw[MirrorIndex::SWMOD_1_8 + 1],
                raw[MirrorIndex::SWMOD_1_8 + 2],
                0,
            ]),
            cover_settings: raw[MirrorIndex::COVER_SETTINGS],
            covers: read_covers(raw),
            logic,
            dimmers,
        })
    }

    /// Fresh mirror holding only the named fields
    pub fn build(&self) -> HubResult<Vec<u8>> {
        let mut status = vec![0u8; MIRROR_LEN];
        self.write_into(&mut status)?;
        Ok(status)
    }

    /// Replace the named fields of `status` in place
    pub fn write_into(&self, status: &mut [u8]) -> HubResult<()> {
        if status.len() < MIRROR_LEN {
            return Err(HubError::Validation(format!(
                "Mirror of {} bytes, expected {}",
                status.len(),
                MIRROR_LEN
            )));
        }
        status[MirrorIndex::MOD_ID] = self.id;
        status[MirrorIndex::MOD_DESC..MirrorIndex::MOD_DESC + 2].copy_from_slice(&self.type_code);
        put_text(status, MirrorIndex::MOD_NAME, NAME_LEN, &self.name);
        put_text(status, MirrorIndex::MOD_SERIAL, SERIAL_LEN, &self.serial);
        put_text(status, MirrorIndex::SW_VERSION, SW_VERSION_LEN, &self.sw_version);
        status[MirrorIndex::SMC_CRC..MirrorIndex::SMC_CRC + 2]
            .copy_from_slice(&self.smc_crc.to_be_bytes());

        status[MirrorIndex::T_SHORT] = to_ticks(self.t_short_ms);
        status[MirrorIndex::T_LONG] = to_ticks(self.t_long_ms);
        status[MirrorIndex::T_DIM] = self.t_dimm;
        status[MirrorIndex::SUPPLY_PRIO] = self.supply_prio;
        status[MirrorIndex::DISPL_CONTR] = self.displ_contr;
        status[MirrorIndex::MOD_LIGHT_TIM] = self.displ_time;
        status[MirrorIndex::CLIM_SETTINGS] = self.temp_ctl;
        status[MirrorIndex::TMP_CTL_MD] = self.temp_1_2;
        status[MirrorIndex::SWMOD_1_8..MirrorIndex::SWMOD_1_8 + 3]
            .copy_from_slice(&self.switch_modes.to_le_bytes()[..3]);
        status[MirrorIndex::COVER_SETTINGS] = self.cover_settings;
        write_covers(self.id, status, &self.covers)?;

        for (i, unit) in self.logic.iter().enumerate() {
            let at = MirrorIndex::LOGIC + i * LOGIC_SLOT_LEN;
            status[at] = unit.mode;
            status[at + 1] = unit.inputs;
            status[at + 2] = unit.max_count;
        }
        status[MirrorIndex::DIMM..MirrorIndex::DIMM + DIMMER_COUNT].copy_from_slice(&self.dimmers);
        Ok(())
    }

    /// Counter units with their max count
    pub fn counters(&self) -> Vec<(usize, u8)> {
        self.logic
            .iter()
            .enumerate()
            .filter(|(_, unit)| unit.is_counter())
            .map(|(i, unit)| (i + 1, unit.max_count))
            .collect()
    }

    /// Switch mode bit for an input; inputs are counted after the buttons
    pub fn is_switch(&self, bit: u8) -> bool {
        bit < 24 && self.switch_modes & (1 << bit) != 0
    }
}

fn to_ticks(ms: u16) -> u8 {
    (ms / 10).min(255) as u8
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn sample_mirror() -> Vec<u8> {
        let mut status = vec![0u8; MIRROR_LEN];
        status[MirrorIndex::MOD_ID] = 5;
        status[MirrorIndex::MOD_DESC] = 1;
        status[MirrorIndex::MOD_DESC + 1] = 2;
        put_text(&mut status, MirrorIndex::MOD_NAME, NAME_LEN, "Flur");
        put_text(&mut status, MirrorIndex::SW_VERSION, SW_VERSION_LEN, "SC 3.4.1");
        status[MirrorIndex::SMC_CRC] = 0x12;
        status[MirrorIndex::SMC_CRC + 1] = 0x34;
        status[MirrorIndex::T_SHORT] = 30;
        status[MirrorIndex::T_LONG] = 100;
        status[MirrorIndex::OUT_1_8] = 0b0000_0101;
        status[MirrorIndex::LOGIC + 3] = LOGIC_MODE_COUNTER;
        status[MirrorIndex::LOGIC + 5] = 12;
        status[MirrorIndex::SWMOD_1_8 + 1] = 0x01;
        status
    }

    #[test]
    fn test_apply_reads_named_fields() {
        let state = ModuleState::apply(&sample_mirror()).unwrap();
        assert_eq!(state.id, 5);
        assert_eq!(state.type_code, [1, 2]);
        assert_eq!(state.name, "Flur");
        assert_eq!(state.sw_version, "SC 3.4.1");
        assert_eq!(state.serial, "");
        assert_eq!(state.smc_crc, 0x1234);
        assert_eq!(state.t_short_ms, 300);
        assert_eq!(state.t_long_ms, 1000);
        assert_eq!(state.counters(), vec![(2, 12)]);
        assert!(state.is_switch(8));
        assert!(!state.is_switch(0));
    }

    #[test]
    fn test_write_into_keeps_live_bytes() {
        let mut status = sample_mirror();
        let mut state = ModuleState::apply(&status).unwrap();
        state.name = "Bad".to_string();
        state.t_short_ms = 500;
        state.logic[0] = LogicUnit {
            mode: LOGIC_MODE_COUNTER,
            inputs: 2,
            max_count: 9,
        };
        state.write_into(&mut status).unwrap();

        assert_eq!(status[MirrorIndex::OUT_1_8], 0b0000_0101);
        assert_eq!(status[MirrorIndex::T_SHORT], 50);
        assert_eq!(text_field(&status, MirrorIndex::MOD_NAME, NAME_LEN), "Bad");
        assert_eq!(&status[MirrorIndex::LOGIC..MirrorIndex::LOGIC + 3], &[5, 2, 9]);
    }

    #[test]
    fn test_build_then_apply_preserves_state() {
        let mut state = ModuleState::apply(&sample_mirror()).unwrap();
        state.covers[2] = CoverTimes {
            t_a: 20,
            blade_a: 1,
            ..Default::default()
        };
        let back = ModuleState::apply(&state.build().unwrap()).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_short_mirror_rejected() {
        assert!(matches!(
            ModuleState::apply(&[0u8; 100]),
            Err(HubError::Validation(_))
        ));
    }
}
