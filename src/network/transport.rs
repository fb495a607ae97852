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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::engine::Transport;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Write(Bytes),
    CloseWrite,
    Close,
}

/// [`Transport`] that queues writes for a writer task.
///
/// The engine runs under a synchronous lock, so writes go onto an unbounded
/// channel and never block. Read-side closes are signalled to the socket
/// reader through `read_closed`.
#[derive(Debug)]
pub struct ChannelTransport {
    commands: async_channel::Sender<TransportCommand>,
    read_closed: Arc<AtomicBool>,
    read_closed_notify: Arc<Notify>,
}

impl ChannelTransport {
    pub fn new() -> (ChannelTransport, async_channel::Receiver<TransportCommand>) {
        let (commands, receiver) = async_channel::unbounded();
        let transport = ChannelTransport {
            commands,
            read_closed: Arc::new(AtomicBool::new(false)),
            read_closed_notify: Arc::new(Notify::new()),
        };
        (transport, receiver)
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Notified once the read side is closed; lets a reader blocked on the
    /// socket give up.
    pub fn read_closed_notify(&self) -> Arc<Notify> {
        self.read_closed_notify.clone()
    }

    fn send(&self, command: TransportCommand) {
        if let Err(err) = self.commands.try_send(command) {
            trace!("writer task gone, dropping {:?}", err.into_inner());
        }
    }

    fn mark_read_closed(&self) {
        if !self.read_closed.swap(true, Ordering::AcqRel) {
            self.read_closed_notify.notify_one();
        }
    }
}

impl Transport for ChannelTransport {
    fn write(&mut self, data: Bytes) {
        self.send(TransportCommand::Write(data));
    }

    fn close_read(&mut self) {
        self.mark_read_closed();
    }

    fn close_write(&mut self) {
        self.send(TransportCommand::CloseWrite);
    }

    fn close(&mut self) {
        self.mark_read_closed();
        self.send(TransportCommand::Close);
        self.commands.close();
    }
}

/// Drains transport commands into the socket until the engine closes the
/// transport or every sender is gone.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    commands: async_channel::Receiver<TransportCommand>,
) -> AppResult<()> {
    let mut write_closed = false;
    while let Ok(command) = commands.recv().await {
        match command {
            TransportCommand::Write(data) => {
                if write_closed {
                    warn!("dropping {} bytes written after write side closed", data.len());
                    continue;
                }
                writer
                    .write_all(&data)
                    .await
                    .map_err(|e| AppError::DetailedIoError(format!("write frame error: {}", e)))?;
                if commands.is_empty() {
                    writer.flush().await.map_err(|e| {
                        AppError::DetailedIoError(format!("flush frame error: {}", e))
                    })?;
                }
            }
            TransportCommand::CloseWrite => {
                if !write_closed {
                    writer.shutdown().await?;
                    write_closed = true;
                }
            }
            TransportCommand::Close => break,
        }
    }
    if !write_closed {
        writer.shutdown().await?;
    }
    debug!("writer loop finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_reach_the_socket_in_order() {
        let (mut transport, commands) = ChannelTransport::new();
        transport.write(Bytes::from_static(b"AMQP"));
        transport.write(Bytes::from_static(b"\x00\x01\x00\x00"));
        transport.close();
        assert!(transport.is_read_closed());

        let mut writer = BufWriter::new(Vec::new());
        write_loop(&mut writer, commands).await.unwrap();
        assert_eq!(writer.get_ref().as_slice(), b"AMQP\x00\x01\x00\x00");
    }

    #[tokio::test]
    async fn writes_after_half_close_are_dropped() {
        let (mut transport, commands) = ChannelTransport::new();
        transport.write(Bytes::from_static(b"one"));
        transport.close_write();
        transport.write(Bytes::from_static(b"two"));
        drop(transport);

        let mut writer = BufWriter::new(Vec::new());
        write_loop(&mut writer, commands).await.unwrap();
        assert_eq!(writer.get_ref().as_slice(), b"one");
    }
}
