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

use crate::{AppError, AppResult};

pub const PROTOCOL_HEADER_SIZE: usize = 8;
pub const AMQP_MAGIC: &[u8; 4] = b"AMQP";
/// The header this engine sends: plain AMQP 1.0.0.
pub const AMQP_HEADER: [u8; PROTOCOL_HEADER_SIZE] = *b"AMQP\x00\x01\x00\x00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Amqp,
    Tls,
    Sasl,
}

impl ProtocolId {
    pub fn to_byte(self) -> u8 {
        match self {
            ProtocolId::Amqp => 0x00,
            ProtocolId::Tls => 0x02,
            ProtocolId::Sasl => 0x03,
        }
    }
}

/// The 8-byte preamble exchanged before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub protocol_id: ProtocolId,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtocolHeader {
    pub fn amqp() -> Self {
        ProtocolHeader {
            protocol_id: ProtocolId::Amqp,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    /// Parses and validates a received header.
    ///
    /// Only version 1.0.0 with protocol id `0x00` (plain) or `0x03` (SASL) is
    /// accepted. TLS (`0x02`) is recognised but refused, everything else is a
    /// framing error.
    pub fn parse(bytes: &[u8]) -> AppResult<ProtocolHeader> {
        if bytes.len() < PROTOCOL_HEADER_SIZE {
            return Err(AppError::FramingError(format!(
                "protocol header truncated to {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..4] != AMQP_MAGIC {
            return Err(AppError::FramingError(format!(
                "bad protocol magic {:02x?}",
                &bytes[..4]
            )));
        }
        let protocol_id = match bytes[4] {
            0x00 => ProtocolId::Amqp,
            0x03 => ProtocolId::Sasl,
            0x02 => {
                return Err(AppError::FramingError(
                    "TLS protocol header is not supported".to_string(),
                ))
            }
            other => {
                return Err(AppError::FramingError(format!(
                    "unknown protocol id {:#04x}",
                    other
                )))
            }
        };
        if bytes[5..8] != [1, 0, 0] {
            return Err(AppError::FramingError(format!(
                "unsupported protocol version {}.{}.{}",
                bytes[5], bytes[6], bytes[7]
            )));
        }
        Ok(ProtocolHeader {
            protocol_id,
            major: bytes[5],
            minor: bytes[6],
            revision: bytes[7],
        })
    }

    pub fn to_bytes(&self) -> [u8; PROTOCOL_HEADER_SIZE] {
        let mut bytes = [0u8; PROTOCOL_HEADER_SIZE];
        bytes[..4].copy_from_slice(AMQP_MAGIC);
        bytes[4] = self.protocol_id.to_byte();
        bytes[5] = self.major;
        bytes[6] = self.minor;
        bytes[7] = self.revision;
        bytes
    }
}
