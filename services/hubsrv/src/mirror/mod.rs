//! Module status mirror
//!
//! The router keeps a 226 byte image of every module. This module decodes
//! it, writes settings back into it and detects live changes.

pub mod covers;
pub mod layout;
pub mod module;
pub mod registry;
pub mod state;

pub use covers::{
    decode_cover_time, encode_cover_settings, interpolation_factor, CoverEncoding, CoverTimes,
};
pub use layout::{MirrorIndex, MIRROR_LEN};
pub use module::{changes_to_events, IoProperties, ModuleKind, ModuleStatus, StatusChange};
pub use registry::{fetch_modules, ModuleRegistry, ModuleSummary};
pub use state::{LogicUnit, ModuleState};
