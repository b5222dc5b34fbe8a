//! Router status record
//!
//! The full router status is the concatenation of several router reads. An
//! index table keeps the start offset of each section so single sections can
//! be served without re-reading the router.

use errors::HubResult;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::BusLinkContext;
use crate::protocol::commands::RouterCommand;

/// Minimum length of a plausible channel status block
pub const CHANNEL_STATUS_MIN: usize = 40;
/// Channel status length without the optional extra byte
pub const CHANNEL_STATUS_LEN: usize = 42;
/// Last channel status byte while mirroring is active
pub const MIRROR_ACTIVE: u8 = 0x01;
/// System mode reported while the router is configured
pub const CONFIG_MODE: u8 = 75;

/// Sections of the full status, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusSection {
    RouterId,
    Channels,
    Timeout,
    Groups,
    GroupDependencies,
    Name,
    ModeNames,
    Serial,
    DayNight,
    Version,
    Date,
}

impl StatusSection {
    pub const ALL: [StatusSection; 11] = [
        Self::RouterId,
        Self::Channels,
        Self::Timeout,
        Self::Groups,
        Self::GroupDependencies,
        Self::Name,
        Self::ModeNames,
        Self::Serial,
        Self::DayNight,
        Self::Version,
        Self::Date,
    ];

    /// Router read that fills this section; the id is local
    fn command(self) -> Option<RouterCommand> {
        match self {
            Self::RouterId => None,
            Self::Channels => Some(RouterCommand::GetChannels),
            Self::Timeout => Some(RouterCommand::GetTimeout),
            Self::Groups => Some(RouterCommand::GetGroups),
            Self::GroupDependencies => Some(RouterCommand::GetGroupDependencies),
            Self::Name => Some(RouterCommand::GetName),
            Self::ModeNames => Some(RouterCommand::GetModeNames),
            Self::Serial => Some(RouterCommand::GetSerialNumber),
            Self::DayNight => Some(RouterCommand::GetDayNight),
            Self::Version => Some(RouterCommand::GetFirmwareVersion),
            Self::Date => Some(RouterCommand::GetDate),
        }
    }

    fn position(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

/// Concatenated router status with section offsets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    bytes: Vec<u8>,
    /// `index[i]..index[i + 1]` is section `i`
    index: Vec<usize>,
}

impl RouterStatus {
    /// Build from sections given in [`StatusSection::ALL`] order
    pub fn from_sections<I>(sections: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut status = Self {
            bytes: Vec::new(),
            index: vec![0],
        };
        for section in sections {
            status.bytes.extend(section);
            status.index.push(status.bytes.len());
        }
        status
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn section(&self, section: StatusSection) -> &[u8] {
        let i = section.position();
        match (self.index.get(i), self.index.get(i + 1)) {
            (Some(&start), Some(&end)) => &self.bytes[start..end],
            _ => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read every section from the router
pub async fn fetch_router_status(ctx: &BusLinkContext, router: u8) -> HubResult<RouterStatus> {
    let mut sections = Vec::with_capacity(StatusSection::ALL.len());
    for section in StatusSection::ALL {
        match section.command() {
            None => sections.push(vec![router]),
            Some(cmd) => {
                let frame = ctx.send_and_await(router, &cmd).await?;
                sections.push(frame.message(cmd.frame_len()).to_vec());
            },
        }
    }
    let status = RouterStatus::from_sections(sections);
    debug!(
        "Router {} status read: {} bytes in {} sections",
        router,
        status.as_bytes().len(),
        StatusSection::ALL.len()
    );
    Ok(status)
}

#[derive(Debug, Default, Clone, Serialize)]
struct RouterInfo {
    chan_status: Vec<u8>,
    mode0: u8,
    config_mode: bool,
    full: RouterStatus,
}

/// Latest known router state, shared by the watcher and the handlers
#[derive(Debug, Default)]
pub struct RouterState {
    inner: RwLock<RouterInfo>,
}

/// Snapshot for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub channel_status: String,
    pub mode0: u8,
    pub config_mode: bool,
    pub mirror_running: bool,
    pub status_len: usize,
}

impl RouterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a channel status block; short blocks keep the previous value
    pub fn set_channel_status(&self, status: &[u8]) -> bool {
        if status.len() < CHANNEL_STATUS_MIN {
            warn!(
                "Router channel status with wrong length {}, keeping stored value",
                status.len()
            );
            return false;
        }
        self.inner.write().chan_status = status.to_vec();
        true
    }

    pub fn channel_status(&self) -> Vec<u8> {
        self.inner.read().chan_status.clone()
    }

    pub fn mirror_running(&self) -> bool {
        let info = self.inner.read();
        info.chan_status.len() > CHANNEL_STATUS_MIN
            && info.chan_status.last() == Some(&MIRROR_ACTIVE)
    }

    /// Record a system mode report; config mode is tracked separately so
    /// the previous user mode survives it
    pub fn set_system_mode(&self, mode: u8) {
        let mut info = self.inner.write();
        if mode == CONFIG_MODE {
            info.config_mode = true;
            info!("Router in config mode");
        } else {
            info.config_mode = false;
            info.mode0 = mode;
        }
    }

    pub fn mode0(&self) -> u8 {
        self.inner.read().mode0
    }

    pub fn in_config_mode(&self) -> bool {
        self.inner.read().config_mode
    }

    pub fn set_full_status(&self, status: RouterStatus) {
        self.inner.write().full = status;
    }

    pub fn full_status(&self) -> RouterStatus {
        self.inner.read().full.clone()
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let info = self.inner.read();
        RouterSnapshot {
            channel_status: common::hex::encode_spaced(&info.chan_status),
            mode0: info.mode0,
            config_mode: info.config_mode,
            mirror_running: info.chan_status.len() > CHANNEL_STATUS_MIN
                && info.chan_status.last() == Some(&MIRROR_ACTIVE),
            status_len: info.full.as_bytes().len(),
        }
    }
}
