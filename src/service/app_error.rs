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

use crate::protocol::{condition, AmqpError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// amqp endpoint errors, carrying the condition sent to the peer
    #[error("no link credit: {0}")]
    NoCredit(String),

    #[error("connection error: {0}")]
    ConnectionError(AmqpError),

    #[error("session error: {0}")]
    SessionError(AmqpError),

    #[error("link error: {0}")]
    LinkError(AmqpError),
}

impl AppError {
    /// The error condition reported to the peer for this failure.
    pub fn to_amqp_error(&self) -> AmqpError {
        let condition = match self {
            AppError::ConnectionError(error)
            | AppError::SessionError(error)
            | AppError::LinkError(error) => return error.clone(),
            AppError::IllegalStateError(_) => condition::ILLEGAL_STATE,
            AppError::MalformedProtocol(_) => condition::DECODE_ERROR,
            AppError::FramingError(_) => condition::FRAMING_ERROR,
            AppError::InvalidValue(_) => condition::INVALID_FIELD,
            AppError::ResourceLimitExceeded(_) => condition::RESOURCE_LIMIT_EXCEEDED,
            AppError::NoCredit(_) => condition::TRANSFER_LIMIT_EXCEEDED,
            _ => condition::INTERNAL_ERROR,
        };
        AmqpError::new(condition, self.to_string())
    }

    /// Errors after which the inbound byte stream can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(self, AppError::FramingError(_))
    }
}
