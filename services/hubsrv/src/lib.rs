//! Gateway between a home-automation bus router and network clients
//!
//! The router hangs off a serial line and speaks a checksummed command
//! protocol. This crate keeps the line in one of two modes (synchronous
//! ClientServer or the event streaming Operate mode), mirrors module state,
//! pushes live events to a notifier and serves the binary TCP API plus a
//! small admin HTTP API.

pub mod api;
pub mod bus;
pub mod config;
pub mod forward;
pub mod mirror;
pub mod notify;
pub mod protocol;
pub mod router_status;
pub mod transport;

pub use config::HubConfig;
