//! Module mirror state and change detection

use errors::HubResult;
use serde::Serialize;
use tracing::{debug, info};

use crate::bus::events::{BusEvent, EventType};
use crate::protocol::checksum::crc16;

use super::covers::cover_time_table;
use super::layout::{
    text_field, MirrorIndex, COMPACT_BLOCKS, MIRROR_LEN, NAME_LEN, SENSOR_BYTES, SERIAL_LEN,
    SETTINGS_LEN, SW_VERSION_LEN,
};
use super::state::ModuleState;

/// Module family, derived from the first type code byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModuleKind {
    Controller,
    Out,
    In,
    Detect,
    Ekey,
    Nature,
}

impl ModuleKind {
    pub fn from_type_code(type_code: [u8; 2]) -> Self {
        match type_code[0] {
            10 => Self::Out,
            11 => Self::In,
            20 => Self::Detect,
            30 => Self::Ekey,
            80 => Self::Nature,
            _ => Self::Controller,
        }
    }

    /// Mirror range watched for changes, end exclusive
    pub fn watched_range(self) -> Option<(usize, usize)> {
        match self {
            Self::Out => Some((MirrorIndex::OUT_1_8, MirrorIndex::OUT_1_8 + 1)),
            Self::In => Some((MirrorIndex::INP_1_8, MirrorIndex::INP_1_8 + 1)),
            Self::Detect => Some((MirrorIndex::LUM, MirrorIndex::MOV + 1)),
            Self::Ekey => Some((MirrorIndex::IR_H, MirrorIndex::SMKEY_STAT + 1)),
            Self::Nature => None,
            Self::Controller => Some((MirrorIndex::INP_1_8, MirrorIndex::T_SHORT)),
        }
    }
}

/// Interface counts of a module type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoProperties {
    pub buttons: u8,
    pub leds: u8,
    pub inputs: u8,
    pub inputs_230v: u8,
    pub inputs_24v: u8,
    pub outputs: u8,
    pub outputs_230v: u8,
    pub outputs_dimm: u8,
    pub outputs_24v: u8,
    pub outputs_relais: u8,
    pub covers: u8,
    pub logic: u8,
    pub flags: u8,
    pub dir_cmds: u8,
    pub vis_cmds: u8,
}

impl IoProperties {
    pub fn for_type(type_code: [u8; 2]) -> Self {
        let logic_and_flags = Self {
            logic: 10,
            flags: 16,
            vis_cmds: 16,
            ..Default::default()
        };
        match type_code {
            [1, _] => Self {
                buttons: 8,
                leds: 8,
                inputs: 10,
                inputs_230v: 4,
                inputs_24v: 6,
                outputs: 15,
                outputs_230v: 10,
                outputs_dimm: 2,
                outputs_24v: 2,
                outputs_relais: 1,
                covers: 5,
                dir_cmds: 25,
                ..logic_and_flags
            },
            [10, 1 | 50 | 51] => Self {
                outputs: 8,
                outputs_relais: 8,
                covers: 4,
                ..logic_and_flags
            },
            [10, 2] => Self {
                outputs: 8,
                outputs_230v: 8,
                covers: 4,
                ..logic_and_flags
            },
            [10, 20 | 21 | 22] => Self {
                outputs: 4,
                outputs_dimm: 4,
                ..logic_and_flags
            },
            [11, 1] => Self {
                inputs: 8,
                inputs_230v: 8,
                ..Default::default()
            },
            [11, 30 | 31] => Self {
                inputs: 8,
                inputs_24v: 8,
                ..Default::default()
            },
            [50, _] => Self {
                buttons: 2,
                leds: 4,
                inputs: 4,
                inputs_24v: 4,
                outputs: 2,
                outputs_24v: 2,
                ..logic_and_flags
            },
            _ => Self::default(),
        }
    }

    /// Number of interface groups present
    pub fn key_count(&self) -> usize {
        [
            self.buttons,
            self.leds,
            self.inputs,
            self.outputs,
            self.covers,
            self.logic,
            self.flags,
            self.dir_cmds,
        ]
        .iter()
        .filter(|&&n| n > 0)
        .count()
    }
}

/// One byte that changed between two mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub module: u8,
    pub index: usize,
    pub old: u8,
    pub new: u8,
}

impl StatusChange {
    /// Wire form used by the status push: `module, index, old, new`
    pub fn to_bytes(&self) -> [u8; 4] {
        [self.module, self.index as u8, self.old, self.new]
    }
}

/// Latest mirror of one module
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    id: u8,
    kind: ModuleKind,
    status: Vec<u8>,
    compact: Vec<u8>,
    smg_crc: u16,
}

impl ModuleStatus {
    pub fn new(id: u8, status: Vec<u8>) -> Self {
        let type_code = [
            status.get(MirrorIndex::MOD_DESC).copied().unwrap_or(0),
            status.get(MirrorIndex::MOD_DESC + 1).copied().unwrap_or(0),
        ];
        let mut module = Self {
            id,
            kind: ModuleKind::from_type_code(type_code),
            status,
            compact: Vec::new(),
            smg_crc: 0,
        };
        module.refresh();
        module
    }

    fn refresh(&mut self) {
        self.compact = compact_of(&self.status);
        if self.status.len() >= MIRROR_LEN {
            self.smg_crc = crc16(&self.build_smg());
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn type_code(&self) -> [u8; 2] {
        [
            self.byte(MirrorIndex::MOD_DESC),
            self.byte(MirrorIndex::MOD_DESC + 1),
        ]
    }

    fn byte(&self, index: usize) -> u8 {
        self.status.get(index).copied().unwrap_or(0)
    }

    pub fn name(&self) -> String {
        text_field(&self.status, MirrorIndex::MOD_NAME, NAME_LEN)
    }

    pub fn serial(&self) -> String {
        text_field(&self.status, MirrorIndex::MOD_SERIAL, SERIAL_LEN)
    }

    pub fn sw_version(&self) -> String {
        text_field(&self.status, MirrorIndex::SW_VERSION, SW_VERSION_LEN)
    }

    /// Label list CRC, stored big-endian
    pub fn smc_crc(&self) -> u16 {
        u16::from_be_bytes([
            self.byte(MirrorIndex::SMC_CRC),
            self.byte(MirrorIndex::SMC_CRC + 1),
        ])
    }

    pub fn set_smc_crc(&mut self, crc: u16) {
        if let Some(slot) = self
            .status
            .get_mut(MirrorIndex::SMC_CRC..MirrorIndex::SMC_CRC + 2)
        {
            slot.copy_from_slice(&crc.to_be_bytes());
        }
    }

    /// Store the CRC of a label list
    pub fn calc_smc_crc(&mut self, list: &[u8]) -> u16 {
        let crc = crc16(list);
        self.set_smc_crc(crc);
        crc
    }

    pub fn smg_crc(&self) -> u16 {
        self.smg_crc
    }

    /// Full mirror
    pub fn status(&self) -> &[u8] {
        &self.status
    }

    /// Decoded configuration of this module
    pub fn state(&self) -> HubResult<ModuleState> {
        ModuleState::apply(&self.status)
    }

    /// Write changed settings into the mirror in place
    pub fn set_state(&mut self, state: &ModuleState) -> HubResult<()> {
        state.write_into(&mut self.status)?;
        self.refresh();
        Ok(())
    }

    /// SMG block after applying `state`, or `None` when its CRC is unchanged
    pub fn changed_smg(&self, state: &ModuleState) -> HubResult<Option<Vec<u8>>> {
        let mut candidate = self.clone();
        candidate.set_state(state)?;
        if candidate.smg_crc == self.smg_crc {
            return Ok(None);
        }
        Ok(Some(candidate.build_smg()))
    }

    pub fn compact_status(&self) -> &[u8] {
        &self.compact
    }

    pub fn settings(&self) -> &[u8] {
        self.status
            .get(MirrorIndex::T_SHORT..MirrorIndex::T_SHORT + SETTINGS_LEN)
            .unwrap_or(&[])
    }

    pub fn io_properties(&self) -> IoProperties {
        IoProperties::for_type(self.type_code())
    }

    /// SMG block: first four settings bytes, cover time table, rest of settings
    pub fn build_smg(&self) -> Vec<u8> {
        let settings = self.settings();
        if settings.len() < SETTINGS_LEN {
            return Vec::new();
        }
        let mut smg = Vec::with_capacity(SETTINGS_LEN + 32);
        smg.extend_from_slice(&settings[..4]);
        smg.extend(cover_time_table(&self.status));
        smg.extend_from_slice(&settings[4..]);
        smg
    }

    /// Replace the mirror and return the changes in the watched range
    ///
    /// Blocks shorter than a full mirror are kept as the compact status only
    /// and never produce changes.
    pub fn update_status(&mut self, new_status: &[u8]) -> Vec<StatusChange> {
        if new_status.len() < MIRROR_LEN {
            self.compact = new_status.to_vec();
            debug!("Compact status of module {} updated", self.id);
            return Vec::new();
        }

        let mut changes = Vec::new();
        if let Some((i0, i1)) = self.kind.watched_range() {
            if self.status.len() >= MIRROR_LEN {
                for index in i0..i1 {
                    if self.kind == ModuleKind::Controller && SENSOR_BYTES.contains(&index) {
                        continue;
                    }
                    let (old, new) = (self.status[index], new_status[index]);
                    if old != new {
                        info!(
                            "Update in module {}: {}: Byte {} - new: {}",
                            self.id,
                            self.name(),
                            index,
                            new
                        );
                        changes.push(StatusChange {
                            module: self.id,
                            index,
                            old,
                            new,
                        });
                    }
                }
            }
        }

        self.status = new_status.to_vec();
        self.refresh();
        changes
    }
}

fn compact_of(status: &[u8]) -> Vec<u8> {
    COMPACT_BLOCKS
        .iter()
        .filter_map(|&(i0, i1)| status.get(i0..i1))
        .flatten()
        .copied()
        .collect()
}

/// Events for the subscriber derived from mirror changes
///
/// Output and input bytes yield one event per changed bit, the flag bytes
/// yield one multi-flag event that expands per bit.
pub fn changes_to_events(changes: &[StatusChange]) -> Vec<BusEvent> {
    let mut events = Vec::new();
    for change in changes {
        let diff = change.old ^ change.new;
        match change.index {
            i @ MirrorIndex::OUT_1_8..=MirrorIndex::OUT_17_24 => {
                events.extend(bit_events(change, EventType::Output, i - MirrorIndex::OUT_1_8));
            },
            i @ MirrorIndex::INP_1_8..=MirrorIndex::INP_17_24 => {
                events.extend(bit_events(change, EventType::Switch, i - MirrorIndex::INP_1_8));
            },
            i if i == MirrorIndex::FLAG_LOC || i == MirrorIndex::FLAG_LOC + 1 => {
                let base = if i == MirrorIndex::FLAG_LOC { 1000 } else { 2000 };
                let multi = BusEvent::new(
                    change.module,
                    EventType::Flag,
                    base + u16::from(diff),
                    u16::from(change.new),
                );
                events.extend(multi.expand());
            },
            _ => {},
        }
    }
    events
}

fn bit_events(change: &StatusChange, kind: EventType, byte_no: usize) -> Vec<BusEvent> {
    let diff = change.old ^ change.new;
    (0..8u16)
        .filter(|bit| diff & (1 << bit) != 0)
        .map(|bit| {
            let nmbr = (byte_no * 8) as u16 + bit + 1;
            let value = u16::from(change.new & (1 << bit) != 0);
            BusEvent::new(change.module, kind, nmbr, value)
        })
        .collect()
}
