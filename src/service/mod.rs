pub use app_error::{AppError, AppResult};
pub use broker::Broker;
pub use config::{AmqpConfig, BrokerConfig, GeneralConfig, NetworkConfig};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod broker;
mod config;
mod server;
mod shutdown;
mod tracing_config;
