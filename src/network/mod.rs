//! Tokio adapter for the engine.
//!
//! - `SocketReader`: pulls exactly the bytes the engine asks for
//! - `ChannelTransport`: queues engine writes for a per-connection writer task

pub use reader::SocketReader;
pub use transport::{write_loop, ChannelTransport, TransportCommand};

mod reader;
mod transport;
