//! Typed API commands
//!
//! A network request is classified by its command group and spec into one
//! closed enum per group. Arguments are range-checked while parsing, so a
//! command that parses is safe to put on the bus.

use errors::HubError;
use std::fmt;
use thiserror::Error;

use crate::mirror::MIRROR_LEN;
use crate::protocol::network::NetworkFrame;

/// Command groups of the network API
pub mod group {
    pub const DATA: u8 = 10;
    pub const SETTINGS: u8 = 20;
    pub const ACTIONS: u8 = 30;
    pub const FILES: u8 = 40;
    pub const SETUP: u8 = 50;
    pub const ADMIN: u8 = 60;
    pub const FORWARD: u8 = 70;
}

/// Command specs per group, high byte first as on the wire
pub mod spec {
    pub mod data {
        pub const MODULE_OVERVIEW: u16 = 0x0101;
        pub const MODULE_SETTINGS: u16 = 0x0201;
        pub const MODULE_STATUS: u16 = 0x0301;
        pub const MODULE_STATUS_COMPACT: u16 = 0x0302;
        pub const ROUTER_STATUS: u16 = 0x0404;
    }

    pub mod settings {
        pub const CONNECTION_TEST: u16 = 0x0000;
        pub const GET_GLOBAL_MODE: u16 = 0x0201;
        pub const SET_GLOBAL_MODE: u16 = 0x0202;
        /// Write a module's settings, data is its full mirror
        pub const MODULE_SETTINGS: u16 = 0x0301;
        pub const MIRROR_START: u16 = 0x0A01;
        pub const MIRROR_STOP: u16 = 0x0A02;
    }

    pub mod actions {
        pub const OUTPUT_ON: u16 = 0x0101;
        pub const OUTPUT_OFF: u16 = 0x0102;
        pub const DIMMER_SET: u16 = 0x0103;
        pub const DIRECT_COMMAND: u16 = 0x0201;
        pub const FLAG_SET: u16 = 0x0301;
        pub const FLAG_RESET: u16 = 0x0302;
    }

    pub mod admin {
        pub const ROUTER_REBOOT: u16 = 0x0101;
        pub const CLEAR_SEND_BUFFER: u16 = 0x0102;
        pub const START_FORWARD: u16 = 0x0103;
        pub const WRAPPER_SEND: u16 = 0x0201;
        pub const WRAPPER_RECEIVE: u16 = 0x0202;
    }

    pub mod forward {
        pub const FORWARD: u16 = crate::forward::FORWARD_SPEC;
    }
}

/// Module number addressing every module of a router
pub const ALL_MODULES: u8 = 255;

/// Why a request could not be turned into a command
///
/// The display text is sent back to the client as the response payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown API command group: {0}")]
    UnknownGroup(u8),

    #[error("Unknown API command: group {group}, spec {spec:#06x}")]
    UnknownCommand { group: u8, spec: u16 },

    /// Argument outside its protocol range
    #[error("{0}")]
    Argument(String),
}

impl From<CommandError> for HubError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Argument(msg) => HubError::ArgumentRange(msg),
            other => HubError::Validation(other.to_string()),
        }
    }
}

type ParseResult<T> = Result<T, CommandError>;

fn check_arg(value: u8, ok: bool, msg: &str) -> ParseResult<u8> {
    if ok {
        Ok(value)
    } else {
        Err(CommandError::Argument(msg.to_string()))
    }
}

/// Only router 1 exists on this hub
pub fn check_router_no(router: u8) -> ParseResult<u8> {
    check_arg(
        router,
        router == 1,
        "Error: currently only one router supported, id must be 1",
    )
}

pub fn check_module_no(module: u8) -> ParseResult<u8> {
    check_arg(
        module,
        (1..=250).contains(&module),
        "Error: module no out of range 1..250",
    )
}

/// Router and module a request is aimed at, plus the remaining arguments
///
/// A non-zero p4/p5 pair carries the address; otherwise the first two data
/// bytes do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target<'a> {
    router: u8,
    module: u8,
    args: &'a [u8],
}

impl<'a> Target<'a> {
    fn of(frame: &'a NetworkFrame) -> Self {
        let header = &frame.header;
        if header.p4 == 0 && frame.data.len() >= 2 {
            Self {
                router: frame.data[0],
                module: frame.data[1],
                args: &frame.data[2..],
            }
        } else {
            Self {
                router: header.p4,
                module: header.p5,
                args: &frame.data,
            }
        }
    }

    fn arg(&self, i: usize, name: &str) -> ParseResult<u8> {
        self.args
            .get(i)
            .copied()
            .ok_or_else(|| CommandError::Argument(format!("Error: missing argument {name}")))
    }
}

/// Module selection for status reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSelector {
    All,
    One(u8),
}

impl ModuleSelector {
    fn parse(module: u8) -> ParseResult<Self> {
        if module == ALL_MODULES {
            Ok(Self::All)
        } else {
            check_module_no(module).map(Self::One)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataCommand {
    RouterStatus { router: u8 },
    /// Mirror blocks, full (226 bytes) or compact
    ModuleStatus {
        router: u8,
        modules: ModuleSelector,
        full: bool,
    },
    ModuleOverview { router: u8 },
    /// Settings blocks (SMG) with the cover table spliced in
    ModuleSettings { router: u8, modules: ModuleSelector },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsCommand {
    ConnectionTest,
    GetGlobalMode { router: u8 },
    SetGlobalMode { router: u8, mode: u8 },
    /// Named settings taken from a full mirror image
    WriteModuleSettings {
        router: u8,
        module: u8,
        mirror: Vec<u8>,
    },
    StartMirror,
    StopMirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionCommand {
    /// Output 1..=24
    OutputOn { router: u8, module: u8, output: u8 },
    OutputOff { router: u8, module: u8, output: u8 },
    /// Dimmer output 1..=4, value 0..=100 percent
    SetDimmer {
        router: u8,
        module: u8,
        output: u8,
        value: u8,
    },
    CallDirectCommand { router: u8, module: u8, command: u8 },
    /// Module 0 addresses the router's global flags
    SetFlag { router: u8, module: u8, flag: u8 },
    ResetFlag { router: u8, module: u8, flag: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    RouterReboot { router: u8 },
    ClearSendBuffer { router: u8 },
    StartForward { router: u8 },
    /// Raw router command body, answered with the router's raw frame
    WrapperSend { router: u8, body: Vec<u8> },
    /// Collect one pending router frame
    WrapperReceive { router: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardCommand {
    /// Raw router command relayed by a remote hub
    Forward { router: u8, body: Vec<u8> },
}

/// Every command the network API understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCommand {
    Data(DataCommand),
    Settings(SettingsCommand),
    Actions(ActionCommand),
    /// File transfers are recognised but not served
    Files { spec: u16 },
    /// Module setup is recognised but not served
    Setup { spec: u16 },
    Admin(AdminCommand),
    Forward(ForwardCommand),
}

/// What the API server does with the bus mode around a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// Run in the current mode and restart Operate after responding
    RestartOperateAfter,
    /// Enter Operate before running
    OperateFirst,
    /// Leave Operate before running
    ClientServerFirst,
    /// Leave the mode alone
    Unchanged,
}

impl ModePolicy {
    pub fn for_group(group: u8) -> Option<Self> {
        match group {
            group::DATA | group::SETTINGS => Some(Self::RestartOperateAfter),
            group::ACTIONS => Some(Self::OperateFirst),
            group::FILES | group::SETUP | group::ADMIN => Some(Self::ClientServerFirst),
            group::FORWARD => Some(Self::Unchanged),
            _ => None,
        }
    }
}

impl ApiCommand {
    /// Classify and validate a request
    pub fn parse(frame: &NetworkFrame) -> ParseResult<Self> {
        let header = &frame.header;
        let unknown = || CommandError::UnknownCommand {
            group: header.group,
            spec: header.spec,
        };
        let target = Target::of(frame);

        match header.group {
            group::DATA => {
                use spec::data::*;
                let cmd = match header.spec {
                    ROUTER_STATUS => DataCommand::RouterStatus {
                        router: check_router_no(target.router)?,
                    },
                    MODULE_STATUS | MODULE_STATUS_COMPACT => DataCommand::ModuleStatus {
                        router: check_router_no(target.router)?,
                        modules: ModuleSelector::parse(target.module)?,
                        full: header.spec == MODULE_STATUS,
                    },
                    MODULE_OVERVIEW => DataCommand::ModuleOverview {
                        router: check_router_no(target.router)?,
                    },
                    MODULE_SETTINGS => DataCommand::ModuleSettings {
                        router: check_router_no(target.router)?,
                        modules: ModuleSelector::parse(target.module)?,
                    },
                    _ => return Err(unknown()),
                };
                Ok(Self::Data(cmd))
            },
            group::SETTINGS => {
                use spec::settings::*;
                let cmd = match header.spec {
                    CONNECTION_TEST => SettingsCommand::ConnectionTest,
                    GET_GLOBAL_MODE => SettingsCommand::GetGlobalMode {
                        router: check_router_no(header.p4)?,
                    },
                    SET_GLOBAL_MODE => SettingsCommand::SetGlobalMode {
                        router: check_router_no(header.p4)?,
                        mode: target.arg(0, "mode")?,
                    },
                    MODULE_SETTINGS => {
                        if frame.data.len() != MIRROR_LEN {
                            return Err(CommandError::Argument(format!(
                                "Error: module settings need {} bytes, got {}",
                                MIRROR_LEN,
                                frame.data.len()
                            )));
                        }
                        SettingsCommand::WriteModuleSettings {
                            router: check_router_no(header.p4)?,
                            module: check_module_no(header.p5)?,
                            mirror: frame.data.clone(),
                        }
                    },
                    MIRROR_START => SettingsCommand::StartMirror,
                    MIRROR_STOP => SettingsCommand::StopMirror,
                    _ => return Err(unknown()),
                };
                Ok(Self::Settings(cmd))
            },
            group::ACTIONS => Self::parse_action(header.spec, &target)
                .and_then(|cmd| cmd.ok_or_else(unknown))
                .map(Self::Actions),
            group::FILES => Ok(Self::Files { spec: header.spec }),
            group::SETUP => Ok(Self::Setup { spec: header.spec }),
            group::ADMIN => {
                use spec::admin::*;
                let router = check_router_no(header.p4)?;
                let cmd = match header.spec {
                    ROUTER_REBOOT => AdminCommand::RouterReboot { router },
                    CLEAR_SEND_BUFFER => AdminCommand::ClearSendBuffer { router },
                    START_FORWARD => AdminCommand::StartForward { router },
                    WRAPPER_SEND if frame.data.is_empty() => {
                        return Err(CommandError::Argument(
                            "Error: empty router command".to_string(),
                        ))
                    },
                    WRAPPER_SEND => AdminCommand::WrapperSend {
                        router,
                        body: frame.data.clone(),
                    },
                    WRAPPER_RECEIVE => AdminCommand::WrapperReceive { router },
                    _ => return Err(unknown()),
                };
                Ok(Self::Admin(cmd))
            },
            group::FORWARD => match header.spec {
                spec::forward::FORWARD => Ok(Self::Forward(ForwardCommand::Forward {
                    router: check_router_no(header.p4)?,
                    body: frame.data.clone(),
                })),
                _ => Err(unknown()),
            },
            other => Err(CommandError::UnknownGroup(other)),
        }
    }

    fn parse_action(spec: u16, target: &Target<'_>) -> ParseResult<Option<ActionCommand>> {
        use spec::actions::*;

        let cmd = match spec {
            OUTPUT_ON | OUTPUT_OFF => {
                let router = check_router_no(target.router)?;
                let module = check_module_no(target.module)?;
                let output = target.arg(0, "output")?;
                let output = check_arg(
                    output,
                    (1..=24).contains(&output),
                    "Error: output out of range 1..24",
                )?;
                if spec == OUTPUT_ON {
                    ActionCommand::OutputOn {
                        router,
                        module,
                        output,
                    }
                } else {
                    ActionCommand::OutputOff {
                        router,
                        module,
                        output,
                    }
                }
            },
            DIMMER_SET => {
                let router = check_router_no(target.router)?;
                let module = check_module_no(target.module)?;
                let output = target.arg(0, "output")?;
                let output = check_arg(
                    output,
                    (1..=4).contains(&output),
                    "Error: output out of range 1..4",
                )?;
                let value = target.arg(1, "value")?;
                let value = check_arg(value, value <= 100, "Error: output out of range 0..100")?;
                ActionCommand::SetDimmer {
                    router,
                    module,
                    output,
                    value,
                }
            },
            DIRECT_COMMAND => {
                let router = check_router_no(target.router)?;
                let module = check_module_no(target.module)?;
                let command = target.arg(0, "command")?;
                let command = check_arg(
                    command,
                    (1..=25).contains(&command),
                    "Error: direct command no out of range 1..25",
                )?;
                ActionCommand::CallDirectCommand {
                    router,
                    module,
                    command,
                }
            },
            FLAG_SET | FLAG_RESET => {
                let router = check_router_no(target.router)?;
                let module = check_arg(
                    target.module,
                    target.module <= 250,
                    "Error: module no out of range 0..250",
                )?;
                let flag = target.arg(0, "flag")?;
                let flag = check_arg(
                    flag,
                    (1..=16).contains(&flag),
                    "Error: flag out of range 1..16",
                )?;
                if spec == FLAG_SET {
                    ActionCommand::SetFlag {
                        router,
                        module,
                        flag,
                    }
                } else {
                    ActionCommand::ResetFlag {
                        router,
                        module,
                        flag,
                    }
                }
            },
            _ => return Ok(None),
        };
        Ok(Some(cmd))
    }

    pub fn group(&self) -> u8 {
        match self {
            Self::Data(_) => group::DATA,
            Self::Settings(_) => group::SETTINGS,
            Self::Actions(_) => group::ACTIONS,
            Self::Files { .. } => group::FILES,
            Self::Setup { .. } => group::SETUP,
            Self::Admin(_) => group::ADMIN,
            Self::Forward(_) => group::FORWARD,
        }
    }

    pub fn mode_policy(&self) -> ModePolicy {
        ModePolicy::for_group(self.group()).unwrap_or(ModePolicy::Unchanged)
    }

    /// An explicit mirror stop must not be undone by the group's restart
    pub fn suppresses_restart(&self) -> bool {
        matches!(self, Self::Settings(SettingsCommand::StopMirror))
    }
}

impl fmt::Display for ApiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(cmd) => write!(f, "DATA {cmd:?}"),
            Self::Settings(cmd) => write!(f, "SETTINGS {cmd:?}"),
            Self::Actions(cmd) => write!(f, "ACTIONS {cmd:?}"),
            Self::Files { spec } => write!(f, "FILES {spec:#06x}"),
            Self::Setup { spec } => write!(f, "SETUP {spec:#06x}"),
            Self::Admin(cmd) => write!(f, "ADMIN {cmd:?}"),
            Self::Forward(ForwardCommand::Forward { router, body }) => {
                write!(f, "FORWARD router {} ({} bytes)", router, body.len())
            },
        }
    }
}
