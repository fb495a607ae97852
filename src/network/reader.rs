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

use std::io::{self, ErrorKind};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::AppResult;

/// Read half of a connection socket, driven by the engine's pull contract:
/// the caller asks for exactly the number of bytes that complete the current
/// read stage and never gets more.
#[derive(Debug)]
pub struct SocketReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> SocketReader<R> {
    pub fn new(reader: R, capacity: usize) -> Self {
        SocketReader {
            reader,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Reads exactly `count` bytes.
    ///
    /// Returns `None` when the peer closed the stream cleanly before the first
    /// byte. A close in the middle of a read stage is a connection reset.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call with
    /// the same `count`.
    pub async fn read_exact(&mut self, count: usize) -> AppResult<Option<Bytes>> {
        while self.buffer.len() < count {
            let missing = (count - self.buffer.len()) as u64;
            let read = (&mut self.reader)
                .take(missing)
                .read_buf(&mut self.buffer)
                .await?;
            if read == 0 {
                return if self.buffer.is_empty() {
                    // client has closed the connection gracefully
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )
                    .into())
                };
            }
        }
        Ok(Some(self.buffer.split_to(count).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[tokio::test]
    async fn reads_never_run_past_the_stage() {
        let data: &[u8] = b"AMQP\x00\x01\x00\x00\x00\x00\x00\x08";
        let mut reader = SocketReader::new(data, 16);
        assert_eq!(
            reader.read_exact(8).await.unwrap().as_deref(),
            Some(&b"AMQP\x00\x01\x00\x00"[..])
        );
        assert_eq!(
            reader.read_exact(4).await.unwrap().as_deref(),
            Some(&[0, 0, 0, 8][..])
        );
        assert_eq!(reader.read_exact(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_mid_stage_is_a_reset() {
        let data: &[u8] = b"AM";
        let mut reader = SocketReader::new(data, 16);
        match reader.read_exact(8).await {
            Err(AppError::IoError(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            other => panic!("unexpected {:?}", other),
        }
    }
}
