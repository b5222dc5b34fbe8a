//! Router command table
//!
//! Each variant knows its own body bytes (everything between the length byte
//! and the checksum). Bodies are `opcode, args..`; the opcode values are kept
//! together in [`opcode`] so the whole table can be audited in one place.

/// Router command opcodes
pub mod opcode {
    pub const SET_OUT_ON: u8 = 0x11;
    pub const SET_OUT_OFF: u8 = 0x12;
    pub const SET_DIMM_VAL: u8 = 0x13;
    pub const CALL_DIR_CMD: u8 = 0x14;
    pub const SET_FLAG: u8 = 0x15;
    pub const RESET_FLAG: u8 = 0x16;

    pub const SET_OPR_MODE: u8 = 0x81;
    pub const START_MIRROR: u8 = 0x82;
    pub const STOP_MIRROR: u8 = 0x83;
    pub const START_EVENTS: u8 = 0x84;
    pub const STOP_EVENTS: u8 = 0x85;
    pub const CLEAR_RT_SENDBUF: u8 = 0x86;

    pub const GET_RT_STATUS: u8 = 0x90;
    pub const GET_GLOB_MODE: u8 = 0x91;
    pub const SET_GLOB_MODE: u8 = 0x92;
    pub const GET_RT_NAME: u8 = 0x93;
    pub const GET_RT_SERNO: u8 = 0x94;
    pub const GET_RT_SW_VERSION: u8 = 0x95;
    pub const GET_RT_CHANNELS: u8 = 0x96;
    pub const GET_RT_TIMEOUT: u8 = 0x97;
    pub const GET_RT_GROUPS: u8 = 0x98;
    pub const GET_RT_GRP_DEPS: u8 = 0x99;
    pub const GET_RT_MODE_NAMES: u8 = 0x9A;
    pub const GET_RT_DAY_NIGHT: u8 = 0x9B;
    pub const GET_RT_DATE: u8 = 0x9C;
    pub const GET_RT_MODULES: u8 = 0x9D;
    pub const GET_MOD_STATUS: u8 = 0xA0;
    pub const START_FWD_MOD: u8 = 0xA1;
    pub const SEND_MOD_SMG: u8 = 0xA2;

    pub const RT_REBOOT: u8 = 0xF0;
}

/// Response and event codes sent by the router
pub mod code {
    /// Answer to STOP_MIRROR when the router is up
    pub const ROUTER_AVAILABLE: u8 = 0x87;
    /// Router still booting
    pub const ROUTER_BOOTING: u8 = 0xFD;

    pub const DIRECT_COMMAND: u8 = 68;
    pub const FORWARD_RESPONSE: u8 = 87;
    pub const CHANNEL_STATUS: u8 = 100;
    /// Operate mode ack; data 1 = started, 0 = mirror and events stopped
    pub const MODE_ACK: u8 = 133;
    pub const SYSTEM_EVENT: u8 = 134;
    pub const MIRROR_STATUS: u8 = 135;
    pub const SYSTEM_MODE: u8 = 137;
}

/// Commands the hub issues to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterCommand {
    /// Switch outputs on; `mask` is the 24-bit output mask, low byte first
    SetOutputOn { module: u8, mask: [u8; 3] },
    SetOutputOff { module: u8, mask: [u8; 3] },
    /// Dimmer output 1..=4, value in percent
    SetDimmerValue { module: u8, output: u8, value: u8 },
    CallDirectCommand { module: u8, command: u8 },
    SetFlag { module: u8, flag: u8 },
    ResetFlag { module: u8, flag: u8 },

    SetOperateMode { mirror: bool, events: bool },
    /// Mirror cycle in units of 10 ms
    StartMirror { cycle: u8 },
    StopMirror,
    StartEvents,
    StopEvents,
    ClearSendBuffer,

    GetStatus,
    GetGlobalMode,
    SetGlobalMode { mode: u8 },
    GetName,
    GetSerialNumber,
    GetFirmwareVersion,
    GetChannels,
    GetTimeout,
    GetGroups,
    GetGroupDependencies,
    GetModeNames,
    GetDayNight,
    GetDate,
    /// Answer: module count followed by the module ids
    GetModules,
    GetModuleStatus { module: u8 },
    /// Route the module's forward traffic through this hub
    StartForward { module: u8 },
    /// Replace a module's general settings with an SMG block
    SendModuleSettings { module: u8, smg: Vec<u8> },

    Reboot,

    /// Pre-built body, used for relayed commands
    Raw(Vec<u8>),
}

impl RouterCommand {
    pub fn body(&self) -> Vec<u8> {
        use opcode::*;
        match self {
            Self::SetOutputOn { module, mask } => {
                vec![SET_OUT_ON, *module, mask[0], mask[1], mask[2]]
            },
            Self::SetOutputOff { module, mask } => {
                vec![SET_OUT_OFF, *module, mask[0], mask[1], mask[2]]
            },
            Self::SetDimmerValue {
                module,
                output,
                value,
            } => vec![SET_DIMM_VAL, *module, *output, *value],
            Self::CallDirectCommand { module, command } => vec![CALL_DIR_CMD, *module, *command],
            Self::SetFlag { module, flag } => vec![SET_FLAG, *module, *flag],
            Self::ResetFlag { module, flag } => vec![RESET_FLAG, *module, *flag],

            Self::SetOperateMode { mirror, events } => {
                vec![SET_OPR_MODE, u8::from(*mirror), u8::from(*events)]
            },
            Self::StartMirror { cycle } => vec![START_MIRROR, *cycle],
            Self::StopMirror => vec![STOP_MIRROR],
            Self::StartEvents => vec![START_EVENTS],
            Self::StopEvents => vec![STOP_EVENTS],
            Self::ClearSendBuffer => vec![CLEAR_RT_SENDBUF],

            Self::GetStatus => vec![GET_RT_STATUS],
            Self::GetGlobalMode => vec![GET_GLOB_MODE],
            Self::SetGlobalMode { mode } => vec![SET_GLOB_MODE, *mode],
            Self::GetName => vec![GET_RT_NAME],
            Self::GetSerialNumber => vec![GET_RT_SERNO],
            Self::GetFirmwareVersion => vec![GET_RT_SW_VERSION],
            Self::GetChannels => vec![GET_RT_CHANNELS],
            Self::GetTimeout => vec![GET_RT_TIMEOUT],
            Self::GetGroups => vec![GET_RT_GROUPS],
            Self::GetGroupDependencies => vec![GET_RT_GRP_DEPS],
            Self::GetModeNames => vec![GET_RT_MODE_NAMES],
            Self::GetDayNight => vec![GET_RT_DAY_NIGHT],
            Self::GetDate => vec![GET_RT_DATE],
            Self::GetModules => vec![GET_RT_MODULES],
            Self::GetModuleStatus { module } => vec![GET_MOD_STATUS, *module],
            Self::StartForward { module } => vec![START_FWD_MOD, *module],
            Self::SendModuleSettings { module, smg } => {
                let mut body = Vec::with_capacity(2 + smg.len());
                body.extend_from_slice(&[SEND_MOD_SMG, *module]);
                body.extend_from_slice(smg);
                body
            },

            Self::Reboot => vec![RT_REBOOT],

            Self::Raw(body) => body.clone(),
        }
    }

    /// Length of the framed command, needed to locate the answer in the response
    pub fn frame_len(&self) -> usize {
        self.body().len() + 4
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SetOutputOn { .. } => "SET_OUT_ON",
            Self::SetOutputOff { .. } => "SET_OUT_OFF",
            Self::SetDimmerValue { .. } => "SET_DIMM_VAL",
            Self::CallDirectCommand { .. } => "CALL_DIR_CMD",
            Self::SetFlag { .. } => "SET_FLAG",
            Self::ResetFlag { .. } => "RESET_FLAG",
            Self::SetOperateMode { .. } => "SET_OPR_MODE",
            Self::StartMirror { .. } => "START_MIRROR",
            Self::StopMirror => "STOP_MIRROR",
            Self::StartEvents => "START_EVENTS",
            Self::StopEvents => "STOP_EVENTS",
            Self::ClearSendBuffer => "CLEAR_RT_SENDBUF",
            Self::GetStatus => "GET_RT_STATUS",
            Self::GetGlobalMode => "GET_GLOB_MODE",
            Self::SetGlobalMode { .. } => "SET_GLOB_MODE",
            Self::GetName => "GET_RT_NAME",
            Self::GetSerialNumber => "GET_RT_SERNO",
            Self::GetFirmwareVersion => "GET_RT_SW_VERSION",
            Self::GetChannels => "GET_RT_CHANNELS",
            Self::GetTimeout => "GET_RT_TIMEOUT",
            Self::GetGroups => "GET_RT_GROUPS",
            Self::GetGroupDependencies => "GET_RT_GRP_DEPS",
            Self::GetModeNames => "GET_RT_MODE_NAMES",
            Self::GetDayNight => "GET_RT_DAY_NIGHT",
            Self::GetDate => "GET_RT_DATE",
            Self::GetModules => "GET_RT_MODULES",
            Self::GetModuleStatus { .. } => "GET_MOD_STATUS",
            Self::StartForward { .. } => "START_FWD_MOD",
            Self::SendModuleSettings { .. } => "SEND_MOD_SMG",
            Self::Reboot => "RT_REBOOT",
            Self::Raw(_) => "RAW",
        }
    }
}

/// 24-bit output mask for output `1..=24`, low byte first
pub fn output_mask(output: u8) -> [u8; 3] {
    let bits = 1u32 << (u32::from(output.clamp(1, 24)) - 1);
    [bits as u8, (bits >> 8) as u8, (bits >> 16) as u8]
}
