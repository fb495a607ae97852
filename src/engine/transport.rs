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

use bytes::{Bytes, BytesMut};

/// Outbound side of the byte stream a [`Connection`](super::Connection) drives.
///
/// Writes are fire-and-forget and must reach the peer in call order. The
/// engine never waits for a write to complete.
pub trait Transport: Send {
    fn write(&mut self, data: Bytes);

    /// Stop reading; the peer's remaining bytes are dropped.
    fn close_read(&mut self);

    /// Half-close: flush pending writes and shut the write side down.
    fn close_write(&mut self);

    fn close(&mut self);
}

/// Transport that keeps everything written to it, for driving a connection
/// without a socket.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    written: BytesMut,
    writes: usize,
    read_closed: bool,
    write_closed: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Bytes written since the last call.
    pub fn take_written(&mut self) -> Bytes {
        self.written.split().freeze()
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Number of `write` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn is_closed(&self) -> bool {
        self.read_closed && self.write_closed
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: Bytes) {
        self.writes += 1;
        self.written.extend_from_slice(&data);
    }

    fn close_read(&mut self) {
        self.read_closed = true;
    }

    fn close_write(&mut self) {
        self.write_closed = true;
    }

    fn close(&mut self) {
        self.read_closed = true;
        self.write_closed = true;
    }
}
