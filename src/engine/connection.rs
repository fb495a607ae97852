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

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, trace, warn};

use super::container::Container;
use super::event::{ConnectionEvent, Outbox};
use super::session::{Session, SessionState};
use super::transport::Transport;
use crate::protocol::{
    check_frame_size, condition, decode_frame, encode_frame, AmqpError, Begin, Close,
    DeliveryState, End, Frame, Open, Performative, ProtocolHeader, Role, Source, Target,
    AMQP_HEADER, AMQP_MAGIC, MIN_MAX_FRAME_SIZE, PROTOCOL_HEADER_SIZE,
};
use crate::service::AmqpConfig;
use crate::utils::{BufferPool, ChannelTable, MAX_TABLE_CAPACITY};
use crate::{AppError, AppResult};

const FRAME_SIZE_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    /// Headers exchanged, waiting for the peer's Open.
    HeaderExchanged,
    /// Our header and Open went out before the peer's header arrived.
    OpenPipe,
    OpenSent,
    Opened,
    CloseSent,
    CloseReceived,
    /// Closed with an error; inbound frames other than Close are dropped.
    Discarding,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStage {
    Header,
    Length,
    /// Waiting for the rest of a frame whose size prefix has been read.
    Body { size: u32 },
    Done,
}

/// One AMQP connection over one byte stream.
///
/// Sans-io: inbound bytes are pushed in with [`receive`](Self::receive),
/// outbound bytes leave through the [`Transport`], and time only advances
/// through the `now` arguments. All methods must be called under one lock per
/// connection; nothing here is shared with other connections.
pub struct Connection<T: Transport> {
    config: AmqpConfig,
    transport: T,
    container: Arc<dyn Container>,
    state: ConnectionState,
    read_stage: ReadStage,
    inbound: BytesMut,
    pool: BufferPool,
    out: Outbox,
    header_sent: bool,
    open_sent: bool,
    close_sent: bool,
    max_frame_size: u32,
    channel_max: u16,
    idle_timeout: Option<Duration>,
    remote_idle_timeout: Option<Duration>,
    remote_container_id: Option<String>,
    local_error: Option<AmqpError>,
    remote_error: Option<AmqpError>,
    last_received: Option<Instant>,
    last_sent: Option<Instant>,
    // latest instant handed in through receive or tick
    clock: Option<Instant>,
    // local channel -> session
    sessions: ChannelTable<Session>,
    // remote channel -> local channel
    remote_channels: ChannelTable<u16>,
}

impl<T: Transport> Connection<T> {
    pub fn new(config: AmqpConfig, transport: T, container: Arc<dyn Container>) -> Self {
        let max_sessions = config.channel_max as usize + 1;
        Connection {
            pool: BufferPool::new(config.buffer_pool_size, config.max_frame_size as usize),
            out: Outbox::new(config.max_frame_size),
            max_frame_size: config.max_frame_size,
            channel_max: config.channel_max,
            idle_timeout: config.idle_timeout(),
            sessions: ChannelTable::new(usize::min(8, max_sessions), max_sessions),
            remote_channels: ChannelTable::new(8, MAX_TABLE_CAPACITY),
            config,
            transport,
            container,
            state: ConnectionState::Start,
            read_stage: ReadStage::Header,
            inbound: BytesMut::with_capacity(PROTOCOL_HEADER_SIZE),
            header_sent: false,
            open_sent: false,
            close_sent: false,
            remote_idle_timeout: None,
            remote_container_id: None,
            local_error: None,
            remote_error: None,
            last_received: None,
            last_sent: None,
            clock: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::End
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    /// Effective idle timeout after negotiation; `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_container_id.as_deref()
    }

    pub fn remote_error(&self) -> Option<&AmqpError> {
        self.remote_error.as_ref()
    }

    pub fn session(&self, channel: u16) -> Option<&Session> {
        self.sessions.get(channel as usize)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.occupied()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.out.events.pop_front()
    }

    /// Bytes still missing to complete the current read stage: the protocol
    /// header, a frame's size prefix or a frame's remainder. Zero once the
    /// connection stopped reading.
    pub fn bytes_expected(&self) -> usize {
        let stage_len = match self.read_stage {
            ReadStage::Header => PROTOCOL_HEADER_SIZE,
            ReadStage::Length => FRAME_SIZE_PREFIX,
            ReadStage::Body { size } => size as usize,
            ReadStage::Done => return 0,
        };
        stage_len.saturating_sub(self.inbound.len()).max(1)
    }

    /// How often [`tick`](Self::tick) needs to run, if at all.
    pub fn tick_interval(&self) -> Option<Duration> {
        let heartbeat = self.remote_idle_timeout.map(|timeout| timeout / 2);
        match (self.idle_timeout, heartbeat) {
            (Some(idle), Some(heartbeat)) => Some(idle.min(heartbeat)),
            (idle, heartbeat) => idle.or(heartbeat),
        }
    }

    /// Feeds inbound bytes in any chunking. Every complete frame is decoded
    /// and handled, in order, before this returns.
    pub fn receive(&mut self, data: &[u8], now: Instant) {
        if self.read_stage == ReadStage::Done {
            trace!("dropping {} bytes received after close", data.len());
            return;
        }
        self.clock = Some(now);
        self.inbound.extend_from_slice(data);

        loop {
            match self.read_stage {
                ReadStage::Header => {
                    let available = self.inbound.len().min(AMQP_MAGIC.len());
                    let bad_magic = self.inbound[..available] != AMQP_MAGIC[..available];
                    if self.inbound.len() < PROTOCOL_HEADER_SIZE && !bad_magic {
                        break;
                    }
                    let take = self.inbound.len().min(PROTOCOL_HEADER_SIZE);
                    let header = self.inbound.split_to(take);
                    self.on_header(&header);
                }
                ReadStage::Length => {
                    if self.inbound.len() < FRAME_SIZE_PREFIX {
                        break;
                    }
                    let mut prefix = [0u8; FRAME_SIZE_PREFIX];
                    prefix.copy_from_slice(&self.inbound[..FRAME_SIZE_PREFIX]);
                    let size = u32::from_be_bytes(prefix);
                    match check_frame_size(size, self.max_frame_size) {
                        Ok(()) => self.read_stage = ReadStage::Body { size },
                        Err(err) => self.fail(err),
                    }
                }
                ReadStage::Body { size } => {
                    if self.inbound.len() < size as usize {
                        break;
                    }
                    let frame = self.inbound.split_to(size as usize);
                    self.read_stage = ReadStage::Length;
                    self.on_frame_bytes(&frame, now);
                }
                ReadStage::Done => {
                    self.inbound.clear();
                    break;
                }
            }
        }
        self.flush();
    }

    /// Sends our header (if needed) and Open without waiting for the peer.
    pub fn open(&mut self) -> AppResult<()> {
        match self.state {
            ConnectionState::Start => {
                self.write_header(Bytes::from_static(&AMQP_HEADER));
                self.send_open();
                self.state = ConnectionState::OpenPipe;
            }
            ConnectionState::HeaderExchanged => {
                self.send_open();
                self.state = ConnectionState::OpenSent;
            }
            state => {
                return Err(AppError::IllegalStateError(format!(
                    "cannot open connection in state {:?}",
                    state
                )))
            }
        }
        self.flush();
        Ok(())
    }

    /// Starts the close handshake. With an error the connection discards
    /// everything but the peer's Close from here on.
    pub fn close(&mut self, error: Option<AmqpError>) {
        match self.state {
            ConnectionState::Start => self.finish(error),
            ConnectionState::OpenPipe
            | ConnectionState::HeaderExchanged
            | ConnectionState::OpenSent
            | ConnectionState::Opened => {
                if !self.open_sent {
                    self.send_open();
                }
                self.local_error = error.clone();
                self.send_close(error.clone());
                self.flush();
                self.transport.close_write();
                self.state = if error.is_some() {
                    ConnectionState::Discarding
                } else {
                    ConnectionState::CloseSent
                };
                debug!("connection close sent, now {:?}", self.state);
            }
            state => trace!("close ignored in state {:?}", state),
        }
    }

    /// Runs the idle check and sends a heartbeat when the peer expects one.
    pub fn tick(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Opened | ConnectionState::CloseSent | ConnectionState::Discarding
        ) {
            return;
        }
        if let (Some(timeout), Some(last_received)) = (self.idle_timeout, self.last_received) {
            let silent = now.saturating_duration_since(last_received);
            if silent >= timeout * 2 {
                warn!(
                    "no frame received for {:?} (idle timeout {:?}), closing connection",
                    silent, timeout
                );
                self.close_with_error(
                    AmqpError::new(condition::CONNECTION_FORCED, "idle timeout expired"),
                    true,
                );
                return;
            }
        }

        self.clock = Some(now);
        if self.state == ConnectionState::Opened {
            if let (Some(remote), Some(last_sent)) = (self.remote_idle_timeout, self.last_sent) {
                if now.saturating_duration_since(last_sent) >= remote / 2 {
                    trace!("sending heartbeat");
                    self.out.send(Frame::empty());
                    self.flush();
                }
            }
        }
    }

    /// The transport failed: nothing more can be written.
    pub fn on_transport_error(&mut self, err: AppError) {
        if self.state == ConnectionState::End {
            return;
        }
        error!("transport error in state {:?}: {}", self.state, err);
        self.out.frames.clear();
        let error = err.to_amqp_error();
        self.local_error = Some(error.clone());
        self.finish(Some(error));
    }

    /// The peer closed the byte stream.
    pub fn on_transport_closed(&mut self) {
        if self.state == ConnectionState::End {
            return;
        }
        debug!("transport closed by peer in state {:?}", self.state);
        self.out.frames.clear();
        let error = self.local_error.clone().or_else(|| self.remote_error.clone());
        self.finish(error);
    }

    pub fn begin_session(&mut self) -> AppResult<u16> {
        if !matches!(
            self.state,
            ConnectionState::OpenPipe | ConnectionState::OpenSent | ConnectionState::Opened
        ) {
            return Err(self.illegal_state("begin a session"));
        }
        let local = self.free_channel()?;
        let mut session = Session::new(local, &self.config);
        session.begin(&mut self.out)?;
        self.sessions.set(local as usize, session)?;
        self.flush();
        Ok(local)
    }

    pub fn end_session(&mut self, channel: u16, error: Option<AmqpError>) -> AppResult<()> {
        self.require_opened("end a session")?;
        let session = lookup(&mut self.sessions, channel)?;
        let finished = session.end(error, &mut self.out, self.container.as_ref())?;
        if finished {
            self.release_session(channel);
        }
        self.flush();
        Ok(())
    }

    pub fn attach_link(
        &mut self,
        channel: u16,
        name: &str,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
    ) -> AppResult<u32> {
        self.require_opened("attach a link")?;
        let session = lookup(&mut self.sessions, channel)?;
        let handle = session.attach(name, role, source, target, &mut self.out)?;
        self.flush();
        Ok(handle)
    }

    pub fn detach_link(&mut self, channel: u16, handle: u32, error: Option<AmqpError>) -> AppResult<()> {
        self.require_opened("detach a link")?;
        let session = lookup(&mut self.sessions, channel)?;
        session.detach(handle, error, &mut self.out, self.container.as_ref())?;
        self.flush();
        Ok(())
    }

    /// Sends one message on a sending link and returns its delivery id.
    pub fn send_transfer(
        &mut self,
        channel: u16,
        handle: u32,
        payload: Bytes,
        settled: bool,
    ) -> AppResult<u32> {
        self.require_opened("send a transfer")?;
        let session = lookup(&mut self.sessions, channel)?;
        let delivery_id = session.transfer(handle, payload, settled, &mut self.out)?;
        self.flush();
        Ok(delivery_id)
    }

    pub fn settle(
        &mut self,
        channel: u16,
        handle: u32,
        delivery_id: u32,
        state: DeliveryState,
    ) -> AppResult<()> {
        self.require_opened("settle a delivery")?;
        let session = lookup(&mut self.sessions, channel)?;
        session.settle(handle, delivery_id, state, &mut self.out)?;
        self.flush();
        Ok(())
    }

    pub fn grant_credit(&mut self, channel: u16, handle: u32, credit: u32) -> AppResult<()> {
        self.require_opened("grant credit")?;
        let session = lookup(&mut self.sessions, channel)?;
        session.grant_credit(handle, credit, &mut self.out)?;
        self.flush();
        Ok(())
    }

    fn require_opened(&self, action: &str) -> AppResult<()> {
        if self.state == ConnectionState::Opened {
            Ok(())
        } else {
            Err(self.illegal_state(action))
        }
    }

    fn illegal_state(&self, action: &str) -> AppError {
        AppError::IllegalStateError(format!(
            "cannot {} in connection state {:?}",
            action, self.state
        ))
    }

    fn free_channel(&self) -> AppResult<u16> {
        match self.sessions.first_empty_slot() {
            Some(slot) if slot <= self.channel_max as usize => Ok(slot as u16),
            _ => Err(AppError::ResourceLimitExceeded(format!(
                "all {} channels are in use",
                self.channel_max as usize + 1
            ))),
        }
    }

    fn on_header(&mut self, bytes: &[u8]) {
        let header = match ProtocolHeader::parse(bytes) {
            Ok(header) => header,
            Err(err) => {
                warn!("rejecting protocol header {:02x?}: {}", bytes, err);
                if !self.header_sent {
                    self.write_header(Bytes::from_static(&AMQP_HEADER));
                }
                self.finish(None);
                return;
            }
        };
        if !self.header_sent {
            self.write_header(Bytes::copy_from_slice(bytes));
        }
        self.state = match self.state {
            ConnectionState::Start => ConnectionState::HeaderExchanged,
            ConnectionState::OpenPipe => ConnectionState::OpenSent,
            state => state,
        };
        self.read_stage = ReadStage::Length;
        debug!(
            "protocol header {:?} accepted, now {:?}",
            header.protocol_id, self.state
        );
    }

    fn on_frame_bytes(&mut self, bytes: &[u8], now: Instant) {
        let max_frame_size = self.max_frame_size;
        let handle = self.pool.acquire();
        let decoded = {
            let cursor = self.pool.get_mut(&handle);
            cursor.put_slice(bytes);
            cursor.set_read_only(true);
            decode_frame(cursor, max_frame_size)
        };
        self.pool.release(handle);

        match decoded {
            Ok(frame) => {
                self.last_received = Some(now);
                self.dispatch_guarded(frame, now);
            }
            Err(err) => self.fail(err),
        }
    }

    /// Dispatches one frame; any error or panic becomes a connection close.
    fn dispatch_guarded(&mut self, frame: Frame, now: Instant) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(frame, now)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fail(err),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("panic while handling frame: {}", message);
                self.fail(AppError::ConnectionError(AmqpError::new(
                    condition::INTERNAL_ERROR,
                    message,
                )));
            }
        }
    }

    fn dispatch(&mut self, frame: Frame, now: Instant) -> AppResult<()> {
        let Frame {
            channel,
            performative,
            payload,
        } = frame;

        match self.state {
            ConnectionState::CloseSent | ConnectionState::Discarding => {
                match performative {
                    Some(Performative::Close(close)) => self.on_close_reply(close),
                    Some(other) => trace!("{} dropped while closing", other.name()),
                    None => {}
                }
                return Ok(());
            }
            ConnectionState::End => return Ok(()),
            _ => {}
        }

        let Some(performative) = performative else {
            trace!("empty frame on channel {}", channel);
            return Ok(());
        };
        trace!("received {} on channel {}", performative.name(), channel);

        match performative {
            Performative::Open(open) => self.on_open(open, now),
            Performative::Close(close) => {
                self.on_close(close);
                Ok(())
            }
            other => {
                if self.state != ConnectionState::Opened {
                    return Err(AppError::IllegalStateError(format!(
                        "{} received in connection state {:?}",
                        other.name(),
                        self.state
                    )));
                }
                if channel > self.channel_max {
                    return Err(AppError::FramingError(format!(
                        "channel {} exceeds channel-max {}",
                        channel, self.channel_max
                    )));
                }
                match other {
                    Performative::Begin(begin) => self.on_begin(channel, begin),
                    Performative::End(end) => self.on_end(channel, end),
                    other => self.on_session_frame(channel, other, payload),
                }
            }
        }
    }

    fn on_open(&mut self, open: Open, now: Instant) -> AppResult<()> {
        if !matches!(
            self.state,
            ConnectionState::HeaderExchanged | ConnectionState::OpenSent
        ) {
            return Err(AppError::IllegalStateError(format!(
                "open received in connection state {:?}",
                self.state
            )));
        }
        if open.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(AppError::ConnectionError(AmqpError::new(
                condition::INVALID_FIELD,
                format!(
                    "max-frame-size {} is below the minimum {}",
                    open.max_frame_size, MIN_MAX_FRAME_SIZE
                ),
            )));
        }

        self.max_frame_size = self.config.max_frame_size.min(open.max_frame_size);
        self.channel_max = self.config.channel_max.min(open.channel_max);
        let peer_idle = open
            .idle_time_out
            .filter(|millis| *millis > 0)
            .map(|millis| Duration::from_millis(millis as u64));
        self.idle_timeout = match (self.config.idle_timeout(), peer_idle) {
            (Some(local), Some(peer)) => Some(local.min(peer)),
            (local, _) => local,
        };
        self.remote_idle_timeout = peer_idle;
        self.out.max_frame_size = self.max_frame_size;

        if !self.open_sent {
            self.send_open();
        }
        self.state = ConnectionState::Opened;
        self.last_received = Some(now);
        self.last_sent = Some(now);
        info!(
            "connection opened with {}: max frame size {}, channel max {}, idle timeout {:?}",
            open.container_id, self.max_frame_size, self.channel_max, self.idle_timeout
        );
        self.out.notify(ConnectionEvent::Opened {
            remote_container_id: open.container_id.clone(),
        });
        self.remote_container_id = Some(open.container_id);
        Ok(())
    }

    /// Peer-initiated close: answer it and shut the transport.
    fn on_close(&mut self, close: Close) {
        if let Some(error) = &close.error {
            warn!("peer closed connection with error: {}", error);
        }
        self.remote_error = close.error;
        self.state = ConnectionState::CloseReceived;
        if !self.open_sent {
            self.send_open();
        }
        self.send_close(None);
        self.flush();
        self.finish(self.remote_error.clone());
    }

    /// The peer's answer to our Close.
    fn on_close_reply(&mut self, close: Close) {
        debug!("close handshake complete");
        self.remote_error = close.error;
        let error = self.local_error.clone().or_else(|| self.remote_error.clone());
        self.finish(error);
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> AppResult<()> {
        if let Some(local) = self.remote_channels.get(channel as usize).copied() {
            let session = lookup(&mut self.sessions, local)?;
            if session.state() == SessionState::BeginSent {
                return session.on_begin(channel, &begin, &mut self.out);
            }
            warn!(
                "begin on remote channel {} which is already mapped to local channel {}",
                channel, local
            );
            self.out.send(Frame::new(
                local,
                End {
                    error: Some(AmqpError::new(
                        condition::ILLEGAL_STATE,
                        format!("remote channel {} is already in use", channel),
                    )),
                },
            ));
            return Ok(());
        }

        if let Some(local) = begin.remote_channel {
            return match self.sessions.get_mut(local as usize) {
                Some(session) if session.state() == SessionState::BeginSent => {
                    self.remote_channels.set(channel as usize, local)?;
                    session.on_begin(channel, &begin, &mut self.out)
                }
                _ => Err(AppError::IllegalStateError(format!(
                    "begin answers local channel {} which has no pending begin",
                    local
                ))),
            };
        }

        let local = self.free_channel()?;
        let mut session = Session::new(local, &self.config);
        session.on_begin(channel, &begin, &mut self.out)?;
        self.sessions.set(local as usize, session)?;
        self.remote_channels.set(channel as usize, local)?;
        Ok(())
    }

    fn on_end(&mut self, channel: u16, end: End) -> AppResult<()> {
        let local = self.local_channel(channel, "end")?;
        let session = lookup(&mut self.sessions, local)?;
        if session.on_end(&end, &mut self.out, self.container.as_ref())? {
            self.release_session(local);
        }
        Ok(())
    }

    fn on_session_frame(
        &mut self,
        channel: u16,
        performative: Performative,
        payload: Option<Bytes>,
    ) -> AppResult<()> {
        let local = self.local_channel(channel, performative.name())?;
        let container = self.container.clone();
        let session = lookup(&mut self.sessions, local)?;
        let finished = match session.handle_frame(performative, payload, &mut self.out, container.as_ref()) {
            Ok(()) => false,
            Err(AppError::SessionError(error)) => {
                session.end(Some(error), &mut self.out, container.as_ref())?
            }
            Err(err) => return Err(err),
        };
        if finished {
            self.release_session(local);
        }
        Ok(())
    }

    fn local_channel(&self, remote: u16, what: &str) -> AppResult<u16> {
        self.remote_channels
            .get(remote as usize)
            .copied()
            .ok_or_else(|| {
                AppError::IllegalStateError(format!(
                    "{} received on unmapped channel {}",
                    what, remote
                ))
            })
    }

    /// Frees both channel slots of a finished session.
    fn release_session(&mut self, local: u16) {
        let Some(session) = self.sessions.remove(local as usize) else {
            return;
        };
        if let Some(remote) = session.remote_channel() {
            if self.remote_channels.get(remote as usize) == Some(&local) {
                self.remote_channels.remove(remote as usize);
            }
        }
        debug!("session on channel {} released", local);
        self.out.notify(ConnectionEvent::SessionEnded {
            channel: local,
            error: session.error().cloned(),
        });
    }

    fn fail(&mut self, err: AppError) {
        let fatal = err.is_framing();
        match self.state {
            ConnectionState::Start | ConnectionState::OpenPipe => {
                warn!("connection failed before header exchange: {}", err);
                if !self.header_sent {
                    self.write_header(Bytes::from_static(&AMQP_HEADER));
                }
                self.finish(Some(err.to_amqp_error()));
            }
            _ => {
                error!("connection error in state {:?}: {}", self.state, err);
                self.close_with_error(err.to_amqp_error(), fatal);
            }
        }
    }

    /// Sends Close with `error`. A fatal error also closes the transport;
    /// otherwise the write side is shut and the connection discards input
    /// until the peer's Close.
    fn close_with_error(&mut self, error: AmqpError, fatal: bool) {
        match self.state {
            ConnectionState::End => {}
            ConnectionState::CloseSent
            | ConnectionState::Discarding
            | ConnectionState::CloseReceived => {
                self.flush();
                self.finish(Some(error));
            }
            _ => {
                if !self.open_sent {
                    self.send_open();
                }
                self.local_error = Some(error.clone());
                self.send_close(Some(error.clone()));
                self.flush();
                if fatal {
                    self.finish(Some(error));
                } else {
                    self.transport.close_write();
                    self.state = ConnectionState::Discarding;
                }
            }
        }
    }

    /// Closes the transport and drops every session.
    fn finish(&mut self, error: Option<AmqpError>) {
        self.transport.close();
        self.state = ConnectionState::End;
        self.read_stage = ReadStage::Done;
        self.inbound.clear();
        let container = self.container.clone();
        for (_, mut session) in self.sessions.drain() {
            session.abandon_links(error.as_ref(), &mut self.out, container.as_ref());
        }
        self.remote_channels.drain();
        self.out.frames.clear();
        info!("connection closed, error: {:?}", error);
        self.out.notify(ConnectionEvent::Closed { error });
    }

    fn send_open(&mut self) {
        let open = Open {
            container_id: self.container.container_id().to_string(),
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: self.idle_timeout.map(|timeout| timeout.as_millis() as u32),
            ..Default::default()
        };
        self.out.send(Frame::new(0, open));
        self.open_sent = true;
    }

    fn send_close(&mut self, error: Option<AmqpError>) {
        if self.close_sent {
            return;
        }
        self.out.send(Frame::new(0, Close { error }));
        self.close_sent = true;
    }

    fn write_header(&mut self, header: Bytes) {
        self.flush();
        self.transport.write(header);
        self.header_sent = true;
        self.last_sent = self.clock;
    }

    /// Encodes every pending frame into one pooled buffer and hands it to the
    /// transport as a single write.
    fn flush(&mut self) {
        if self.out.frames.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut self.out.frames);
        if self.state == ConnectionState::End {
            trace!("dropping {} frames after close", frames.len());
            return;
        }
        let handle = self.pool.acquire();
        let data = {
            let cursor = self.pool.get_mut(&handle);
            for frame in &frames {
                if let Some(performative) = &frame.performative {
                    trace!("sending {} on channel {}", performative.name(), frame.channel);
                }
                encode_frame(
                    cursor,
                    frame.channel,
                    frame.performative.as_ref(),
                    frame.payload.as_deref(),
                );
            }
            cursor.to_bytes()
        };
        self.pool.release(handle);
        self.transport.write(data);
        self.last_sent = self.clock;
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("remote_container_id", &self.remote_container_id)
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .field("sessions", &self.sessions.occupied())
            .finish()
    }
}

fn lookup(sessions: &mut ChannelTable<Session>, channel: u16) -> AppResult<&mut Session> {
    sessions
        .get_mut(channel as usize)
        .ok_or_else(|| AppError::InvalidValue(format!("no session on channel {}", channel)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
