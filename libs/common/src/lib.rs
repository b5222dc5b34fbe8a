//! Shared building blocks for the hub services
//!
//! - logging (console, rolling files, bus traffic split, runtime level)
//! - shutdown signal handling
//! - startup arguments and bootstrap helpers
//! - hex rendering of frames

pub mod bootstrap_args;
pub mod hex;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
