// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::protocol::MIN_MAX_FRAME_SIZE;

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// Container id announced in Open; a random one is generated when absent.
    pub container_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 5672,
            max_connection: 1024,
        }
    }
}

/// Limits this side offers during Open/Begin/Attach. The peer's values are
/// clamped against these.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub max_frame_size: u32,
    /// Highest channel number, so `channel_max + 1` sessions.
    pub channel_max: u16,
    /// Zero disables idle detection.
    pub idle_timeout_ms: u32,
    pub handle_max: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    /// Credit window granted to receiving links unless the container says otherwise.
    pub link_credit: u32,
    /// Number of frame buffers pre-allocated per connection.
    pub buffer_pool_size: usize,
    /// Largest message a receiving link accepts. Zero means unlimited.
    pub max_message_size: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            max_frame_size: 64 * 1024,
            channel_max: 255,
            idle_timeout_ms: 60_000,
            handle_max: 255,
            incoming_window: 2048,
            outgoing_window: 2048,
            link_credit: 100,
            buffer_pool_size: 4,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl AmqpConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(AppError::InvalidValue(format!(
                "max_frame_size {} is below the protocol minimum {}",
                self.max_frame_size, MIN_MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    pub fn max_message_size(&self) -> Option<u64> {
        (self.max_message_size > 0).then_some(self.max_message_size)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms as u64))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub amqp: AmqpConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONEAMQP").separator("__"))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.amqp.validate()?;

        Ok(broker_config)
    }

    pub fn container_id(&self) -> String {
        self.general
            .container_id
            .clone()
            .unwrap_or_else(|| format!("stoneamqp-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn load_partial_config_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.toml");
        fs::write(
            &path,
            r#"
[general]
container_id = "broker-1"

[network]
port = 15672

[amqp]
max_frame_size = 4096
channel_max = 10
"#,
        )
        .unwrap();

        let config = BrokerConfig::set_up_config(&path).unwrap();
        assert_eq!(config.container_id(), "broker-1");
        assert_eq!(config.network.port, 15672);
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.amqp.max_frame_size, 4096);
        assert_eq!(config.amqp.channel_max, 10);
        assert_eq!(config.amqp.idle_timeout_ms, 60_000);
    }

    #[test]
    fn tiny_frame_size_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.toml");
        fs::write(&path, "[amqp]\nmax_frame_size = 100\n").unwrap();
        assert!(matches!(
            BrokerConfig::set_up_config(&path),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        assert!(matches!(
            BrokerConfig::set_up_config(&path),
            Err(AppError::ConfigFileError(_))
        ));
    }

    #[test]
    fn generated_container_id_and_idle_timeout() {
        let config = BrokerConfig::default();
        assert!(config.container_id().starts_with("stoneamqp-"));
        assert_eq!(
            config.amqp.idle_timeout(),
            Some(Duration::from_millis(60_000))
        );
        let disabled = AmqpConfig {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(disabled.idle_timeout(), None);
    }
}
