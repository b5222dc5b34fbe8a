//! Bus side of the hub: link, correlation, modes and events

pub mod context;
pub mod correlator;
pub mod events;
pub mod link;
pub mod mode;
pub mod watcher;

pub use context::{ApiCommandGuard, BusLinkContext, BusMode, BusTiming, LinkState};
pub use events::{split_events, BusEvent, EventType, RouterEvent};
pub use link::{LinkStats, ReadOwner, SerialLink};
pub use mode::{ModeManager, ModeStatus};
pub use watcher::{spawn_watcher, EventSinks, WatcherExit, WatcherHandle, MAX_READ_FAILURES};
