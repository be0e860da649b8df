//! The streaming channel: wire envelopes, transport, and the connection manager.

pub mod frame;
pub mod manager;
pub mod transport;

pub use frame::{Envelope, FrameError};
pub use manager::{ConnectionManager, ConnectionState, StreamEvent};
pub use transport::{Connector, StreamChannel, WsConnector};
