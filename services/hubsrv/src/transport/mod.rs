//! Byte-stream transports to the bus router

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::{LinkOp, MockTransport, RouterSim};
pub use serial::{open_serial, SerialLinkConfig, StreamTransport};
pub use traits::{BusTransport, TransportError, TransportStats};
