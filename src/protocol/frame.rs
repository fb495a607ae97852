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

use bytes::{Buf, Bytes, BytesMut};

use super::performatives::Performative;
use crate::utils::ByteCursor;
use crate::{AppError, AppResult};

/// size(4) + doff(1) + type(1) + channel(2)
pub const FRAME_HEADER_SIZE: usize = 8;
pub const FRAME_TYPE_AMQP: u8 = 0x00;
pub const FRAME_TYPE_SASL: u8 = 0x01;
/// Every peer must accept frames of at least this size.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;
const DEFAULT_DOFF: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size, the size field itself included.
    pub size: u32,
    /// Data offset in 4-byte words.
    pub doff: u8,
    pub frame_type: u8,
    pub channel: u16,
}

impl FrameHeader {
    pub fn header_len(&self) -> usize {
        self.doff as usize * 4
    }

    pub fn body_len(&self) -> usize {
        self.size as usize - self.header_len()
    }
}

/// A decoded AMQP frame. No performative means the empty (heartbeat) frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub performative: Option<Performative>,
    /// Raw bytes after the performative, Transfer only.
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(channel: u16, performative: impl Into<Performative>) -> Self {
        Frame {
            channel,
            performative: Some(performative.into()),
            payload: None,
        }
    }

    pub fn empty() -> Self {
        Frame {
            channel: 0,
            performative: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.performative.is_none()
    }
}

/// Validates the 4-byte size prefix on its own, before the rest of the frame
/// has been read.
pub fn check_frame_size(size: u32, max_frame_size: u32) -> AppResult<()> {
    if (size as usize) < FRAME_HEADER_SIZE {
        return Err(AppError::FramingError(format!(
            "frame size {} is smaller than the frame header",
            size
        )));
    }
    if size > max_frame_size {
        return Err(AppError::FramingError(format!(
            "frame of length {} exceeds max frame size {}",
            size, max_frame_size
        )));
    }
    Ok(())
}

/// Reads the frame header and skips any extended header, leaving the cursor at
/// the start of the frame body.
pub fn decode_frame_header(cursor: &mut ByteCursor, max_frame_size: u32) -> AppResult<FrameHeader> {
    if cursor.readable_len() < FRAME_HEADER_SIZE {
        return Err(AppError::FramingError(format!(
            "truncated frame header: {} bytes",
            cursor.readable_len()
        )));
    }
    let size = cursor.get_u32();
    check_frame_size(size, max_frame_size)?;
    let doff = cursor.get_u8();
    let frame_type = cursor.get_u8();
    let channel = cursor.get_u16();
    let header = FrameHeader {
        size,
        doff,
        frame_type,
        channel,
    };
    let header_len = header.header_len();
    if header_len < FRAME_HEADER_SIZE || header_len > size as usize {
        return Err(AppError::FramingError(format!(
            "invalid data offset {} for frame of {} bytes",
            doff, size
        )));
    }
    let extended = header_len - FRAME_HEADER_SIZE;
    if cursor.readable_len() < extended {
        return Err(AppError::FramingError(
            "truncated extended frame header".to_string(),
        ));
    }
    cursor.complete_read(extended);
    Ok(header)
}

/// Decodes one complete frame from the cursor.
pub fn decode_frame(cursor: &mut ByteCursor, max_frame_size: u32) -> AppResult<Frame> {
    let header = decode_frame_header(cursor, max_frame_size)?;
    let body_len = header.body_len();
    if cursor.readable_len() < body_len {
        return Err(AppError::FramingError(format!(
            "truncated frame: {} of {} body bytes",
            cursor.readable_len(),
            body_len
        )));
    }
    if header.frame_type != FRAME_TYPE_AMQP {
        return Err(AppError::FramingError(format!(
            "unsupported frame type {:#04x}",
            header.frame_type
        )));
    }
    if body_len == 0 {
        return Ok(Frame {
            channel: header.channel,
            performative: None,
            payload: None,
        });
    }

    let mut body = cursor.copy_to_bytes(body_len);
    let performative = Performative::decode(&mut body)?;
    let payload = if body.has_remaining() {
        if !matches!(performative, Performative::Transfer(_)) {
            return Err(AppError::MalformedProtocol(format!(
                "{} frame carries {} trailing bytes",
                performative.name(),
                body.remaining()
            )));
        }
        Some(body)
    } else {
        None
    };
    Ok(Frame {
        channel: header.channel,
        performative: Some(performative),
        payload,
    })
}

/// Writes one frame: header with a placeholder size, performative, optional
/// payload, then backpatches the size. `None` writes the empty frame.
pub fn encode_frame(
    cursor: &mut ByteCursor,
    channel: u16,
    performative: Option<&Performative>,
    payload: Option<&[u8]>,
) {
    let start = cursor.write_offset();
    cursor.put_u32(0);
    cursor.put_u8(DEFAULT_DOFF);
    cursor.put_u8(FRAME_TYPE_AMQP);
    cursor.put_u16(channel);
    if let Some(performative) = performative {
        let mut body = BytesMut::new();
        performative.encode(&mut body);
        cursor.put_slice(&body);
    }
    if let Some(payload) = payload {
        cursor.put_slice(payload);
    }
    let size = cursor.write_offset() - start;
    cursor.patch_u32(start, size as u32);
}

/// Encoded size of a frame carrying `performative` and no payload.
pub fn frame_overhead(performative: &Performative) -> usize {
    let mut body = BytesMut::new();
    performative.encode(&mut body);
    FRAME_HEADER_SIZE + body.len()
}
