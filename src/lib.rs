pub mod engine;
pub mod network;
pub mod protocol;
mod service;
mod utils;

pub use engine::{
    Connection, ConnectionEvent, ConnectionState, Container, Delivery, LinkInfo, MemoryContainer,
    MemoryTransport, Transport,
};
pub use service::{
    setup_local_tracing, setup_tracing, AmqpConfig, AppError, AppResult, Broker, BrokerConfig,
    GeneralConfig, NetworkConfig, Shutdown,
};
pub use utils::{BufferHandle, BufferPool, ByteCursor, ChannelTable};
