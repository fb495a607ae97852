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

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::container::Container;
use super::event::{ConnectionEvent, Outbox};
use super::link::{Link, LinkState};
use crate::protocol::{
    condition, frame_overhead, AmqpError, Attach, Begin, DeliveryState, Detach, Disposition, End,
    Flow, Frame, Performative, Role, Source, Target, Transfer,
};
use crate::service::AmqpConfig;
use crate::utils::{ChannelTable, MAX_TABLE_CAPACITY};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmapped,
    BeginSent,
    BeginReceived,
    Mapped,
    EndSent,
    EndReceived,
    Discarding,
}

impl SessionState {
    pub fn can_send_frames(self) -> bool {
        matches!(
            self,
            SessionState::BeginSent | SessionState::Mapped | SessionState::EndReceived
        )
    }

    pub fn can_receive_frames(self) -> bool {
        matches!(
            self,
            SessionState::BeginReceived
                | SessionState::Mapped
                | SessionState::EndSent
                | SessionState::Discarding
        )
    }
}

/// One session, bound to a local channel and, once known, the peer's channel.
#[derive(Debug)]
pub struct Session {
    local_channel: u16,
    remote_channel: Option<u16>,
    state: SessionState,
    next_outgoing_id: u32,
    next_incoming_id: u32,
    incoming_window: u32,
    outgoing_window: u32,
    window_size: u32,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
    handle_max: u32,
    remote_handle_max: u32,
    max_message_size: Option<u64>,
    next_delivery_id: u32,
    links: ChannelTable<Link>,
    remote_handles: HashMap<u32, u32>,
    // delivery id -> local handle
    outgoing_unsettled: BTreeMap<u32, u32>,
    incoming_unsettled: BTreeMap<u32, u32>,
    error: Option<AmqpError>,
}

impl Session {
    pub fn new(local_channel: u16, config: &AmqpConfig) -> Self {
        let max_links = usize::min(config.handle_max as usize + 1, MAX_TABLE_CAPACITY);
        Session {
            local_channel,
            remote_channel: None,
            state: SessionState::Unmapped,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            incoming_window: config.incoming_window,
            outgoing_window: config.outgoing_window,
            window_size: config.incoming_window,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            handle_max: config.handle_max,
            remote_handle_max: u32::MAX,
            max_message_size: config.max_message_size(),
            next_delivery_id: 0,
            links: ChannelTable::new(usize::min(4, max_links), max_links),
            remote_handles: HashMap::new(),
            outgoing_unsettled: BTreeMap::new(),
            incoming_unsettled: BTreeMap::new(),
            error: None,
        }
    }

    pub fn local_channel(&self) -> u16 {
        self.local_channel
    }

    pub fn remote_channel(&self) -> Option<u16> {
        self.remote_channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Error the session ended with, from either side.
    pub fn error(&self) -> Option<&AmqpError> {
        self.error.as_ref()
    }

    pub fn link(&self, handle: u32) -> Option<&Link> {
        self.links.get(handle as usize)
    }

    pub fn link_count(&self) -> usize {
        self.links.occupied()
    }

    pub fn incoming_window(&self) -> u32 {
        self.incoming_window
    }

    pub fn remote_incoming_window(&self) -> u32 {
        self.remote_incoming_window
    }

    pub fn next_outgoing_id(&self) -> u32 {
        self.next_outgoing_id
    }

    pub fn next_incoming_id(&self) -> u32 {
        self.next_incoming_id
    }

    pub fn unsettled_outgoing(&self) -> usize {
        self.outgoing_unsettled.len()
    }

    pub fn unsettled_incoming(&self) -> usize {
        self.incoming_unsettled.len()
    }

    fn begin_frame(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max,
            ..Default::default()
        }
    }

    fn send(&self, out: &mut Outbox, performative: impl Into<Performative>) {
        out.send(Frame::new(self.local_channel, performative));
    }

    fn send_flow(&self, out: &mut Outbox, link_flow: Option<Flow>) {
        let flow = Flow {
            next_incoming_id: self.remote_channel.map(|_| self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..link_flow.unwrap_or_default()
        };
        self.send(out, flow);
    }

    /// Locally initiated Begin.
    pub(crate) fn begin(&mut self, out: &mut Outbox) -> AppResult<()> {
        if self.state != SessionState::Unmapped {
            return Err(self.illegal_state("begin"));
        }
        self.send(out, self.begin_frame());
        self.state = SessionState::BeginSent;
        Ok(())
    }

    /// The peer's Begin arrived on `remote_channel`: either the answer to our
    /// Begin or a new peer-initiated session, which is answered here.
    pub(crate) fn on_begin(&mut self, remote_channel: u16, begin: &Begin, out: &mut Outbox) -> AppResult<()> {
        match self.state {
            SessionState::BeginSent => {}
            SessionState::Unmapped => self.state = SessionState::BeginReceived,
            _ => return Err(self.illegal_state("receive begin")),
        }
        self.remote_channel = Some(remote_channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
        self.remote_handle_max = begin.handle_max;

        if self.state == SessionState::BeginReceived {
            self.send(out, self.begin_frame());
        }
        self.state = SessionState::Mapped;
        debug!(
            "session mapped, local channel {} remote channel {}",
            self.local_channel, remote_channel
        );
        out.notify(ConnectionEvent::SessionBegun {
            channel: self.local_channel,
        });
        Ok(())
    }

    /// Locally initiated End. Returns true when the session is finished and
    /// its channel slots can be released.
    pub(crate) fn end(
        &mut self,
        error: Option<AmqpError>,
        out: &mut Outbox,
        container: &dyn Container,
    ) -> AppResult<bool> {
        match self.state {
            SessionState::BeginSent | SessionState::Mapped => {
                if let Some(error) = &error {
                    warn!(
                        "ending session on channel {} with error: {}",
                        self.local_channel, error
                    );
                }
                self.abandon_links(error.as_ref(), out, container);
                self.send(out, End {
                    error: error.clone(),
                });
                self.state = if error.is_some() {
                    SessionState::Discarding
                } else {
                    SessionState::EndSent
                };
                self.error = error;
                Ok(false)
            }
            SessionState::EndReceived => {
                self.send(out, End { error });
                self.state = SessionState::Unmapped;
                Ok(true)
            }
            SessionState::EndSent | SessionState::Discarding => Ok(false),
            _ => Err(self.illegal_state("end")),
        }
    }

    /// Peer End. Answers it when we had not ended yet; always finishes the
    /// session.
    pub(crate) fn on_end(&mut self, end: &End, out: &mut Outbox, container: &dyn Container) -> AppResult<bool> {
        match self.state {
            SessionState::BeginSent | SessionState::Mapped => {
                self.state = SessionState::EndReceived;
                self.error = end.error.clone();
                self.abandon_links(end.error.as_ref(), out, container);
                self.end(None, out, container)
            }
            SessionState::EndSent | SessionState::Discarding => {
                if self.error.is_none() {
                    self.error = end.error.clone();
                }
                self.state = SessionState::Unmapped;
                Ok(true)
            }
            _ => Err(self.illegal_state("receive end")),
        }
    }

    /// Tears down every link without any exchange with the peer, as happens
    /// when the session or the whole connection goes away.
    pub(crate) fn abandon_links(
        &mut self,
        error: Option<&AmqpError>,
        out: &mut Outbox,
        container: &dyn Container,
    ) {
        for (handle, link) in self.links.drain() {
            if link.is_attached() {
                container.on_detach(&link.info(self.local_channel), error);
            }
            if link.state() != LinkState::Detached {
                out.notify(ConnectionEvent::LinkDetached {
                    channel: self.local_channel,
                    handle: handle as u32,
                    name: link.name().to_string(),
                    error: error.cloned(),
                });
            }
        }
        self.remote_handles.clear();
        self.outgoing_unsettled.clear();
        self.incoming_unsettled.clear();
    }

    /// Routes a link-scoped performative.
    pub(crate) fn handle_frame(
        &mut self,
        performative: Performative,
        payload: Option<Bytes>,
        out: &mut Outbox,
        container: &dyn Container,
    ) -> AppResult<()> {
        if self.state == SessionState::Discarding {
            trace!(
                "session on channel {} discarding {}",
                self.local_channel,
                performative.name()
            );
            return Ok(());
        }
        if !self.state.can_receive_frames() {
            return Err(self.illegal_state(&format!("receive {}", performative.name())));
        }
        match performative {
            Performative::Attach(attach) => self.on_attach(attach, out, container),
            Performative::Flow(flow) => self.on_flow(&flow, out, container),
            Performative::Transfer(transfer) => {
                self.on_transfer(&transfer, payload.unwrap_or_default(), out, container)
            }
            Performative::Disposition(disposition) => {
                self.on_disposition(&disposition, out, container)
            }
            Performative::Detach(detach) => self.on_detach(detach, out, container),
            other => Err(AppError::IllegalStateError(format!(
                "{} is not a link frame",
                other.name()
            ))),
        }
    }

    fn allocate_handle(&self) -> AppResult<u32> {
        let limit = u32::min(self.handle_max, self.remote_handle_max) as usize;
        match self.links.first_empty_slot() {
            Some(slot) if slot <= limit => Ok(slot as u32),
            _ => Err(AppError::ResourceLimitExceeded(format!(
                "session on channel {} has no free link handle",
                self.local_channel
            ))),
        }
    }

    fn local_handle(&self, remote_handle: u32) -> AppResult<u32> {
        self.remote_handles
            .get(&remote_handle)
            .copied()
            .ok_or_else(|| {
                AppError::SessionError(AmqpError::new(
                    condition::UNATTACHED_HANDLE,
                    format!("handle {} is not attached", remote_handle),
                ))
            })
    }

    /// Local link for `remote_handle`, refusing traffic for destroyed links.
    fn live_link(&mut self, remote_handle: u32) -> AppResult<(u32, &mut Link)> {
        let handle = self.local_handle(remote_handle)?;
        let link = self.links.get_mut(handle as usize).ok_or_else(|| {
            AppError::IllegalStateError(format!("handle {} maps to no link", handle))
        })?;
        if link.is_destroyed() {
            return Err(AppError::SessionError(AmqpError::new(
                condition::ERRANT_LINK,
                format!("link {} was detached with an error", link.name()),
            )));
        }
        Ok((handle, link))
    }

    fn local_link(&mut self, handle: u32) -> AppResult<&mut Link> {
        self.links
            .get_mut(handle as usize)
            .ok_or_else(|| AppError::InvalidValue(format!("no link with handle {}", handle)))
    }

    fn require_mapped(&self, action: &str) -> AppResult<()> {
        if self.state.can_send_frames() {
            Ok(())
        } else {
            Err(self.illegal_state(action))
        }
    }

    pub(crate) fn attach(
        &mut self,
        name: &str,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
        out: &mut Outbox,
    ) -> AppResult<u32> {
        self.require_mapped("attach a link")?;
        let handle = self.allocate_handle()?;
        let mut link = Link::new(name, role, handle, source, target)
            .with_max_message_size(self.max_message_size);
        let attach = link.attach()?;
        self.links.set(handle as usize, link)?;
        self.send(out, attach);
        Ok(handle)
    }

    pub(crate) fn detach(
        &mut self,
        handle: u32,
        error: Option<AmqpError>,
        out: &mut Outbox,
        container: &dyn Container,
    ) -> AppResult<()> {
        self.require_mapped("detach a link")?;
        let channel = self.local_channel;
        let link = self.local_link(handle)?;
        let was_attached = link.is_attached();
        let detach = link.detach(error)?;
        if was_attached {
            container.on_detach(&link.info(channel), detach.error.as_ref());
        }
        self.send(out, detach);
        Ok(())
    }

    /// Detaches a link with an error after it misbehaved.
    fn fail_link(&mut self, handle: u32, error: AmqpError, out: &mut Outbox, container: &dyn Container) {
        warn!(
            "detaching link {} on channel {}: {}",
            handle, self.local_channel, error
        );
        if let Err(err) = self.detach(handle, Some(error), out, container) {
            debug!("link {} already detaching: {}", handle, err);
        }
    }

    /// Sends one delivery on a sending link, split into as many Transfer
    /// frames as the negotiated frame size requires.
    pub(crate) fn transfer(
        &mut self,
        handle: u32,
        payload: Bytes,
        settled: bool,
        out: &mut Outbox,
    ) -> AppResult<u32> {
        if self.state != SessionState::Mapped {
            return Err(self.illegal_state("send a transfer"));
        }
        if self.remote_incoming_window == 0 {
            return Err(AppError::NoCredit(format!(
                "session window on channel {} is closed",
                self.local_channel
            )));
        }
        let link = self.local_link(handle)?;
        let tag = link.take_credit()?;
        let settled = link.send_settled(settled);
        let delivery_id = self.next_delivery_id;
        self.next_delivery_id = self.next_delivery_id.wrapping_add(1);

        let first = Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(tag),
            message_format: Some(0),
            settled: Some(settled),
            more: true,
            ..Default::default()
        };
        let overhead = frame_overhead(&Performative::Transfer(first.clone()));
        let chunk_size = (out.max_frame_size as usize).saturating_sub(overhead).max(1);

        let mut remaining = payload;
        let mut transfer = first;
        loop {
            let chunk = remaining.split_to(usize::min(chunk_size, remaining.len()));
            transfer.more = !remaining.is_empty();
            let more = transfer.more;
            out.send(Frame::new(self.local_channel, transfer).with_payload(chunk));
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);
            if !more {
                break;
            }
            transfer = Transfer {
                handle,
                ..Default::default()
            };
        }

        if !settled {
            self.outgoing_unsettled.insert(delivery_id, handle);
        }
        Ok(delivery_id)
    }

    /// Settles a delivery on either side of a link with a terminal state.
    pub(crate) fn settle(
        &mut self,
        handle: u32,
        delivery_id: u32,
        state: DeliveryState,
        out: &mut Outbox,
    ) -> AppResult<()> {
        self.require_mapped("settle a delivery")?;
        let role = self.local_link(handle)?.role();
        let unsettled = match role {
            Role::Sender => &mut self.outgoing_unsettled,
            Role::Receiver => &mut self.incoming_unsettled,
        };
        if unsettled.get(&delivery_id) != Some(&handle) {
            return Err(AppError::InvalidValue(format!(
                "delivery {} is not unsettled on link {}",
                delivery_id, handle
            )));
        }
        unsettled.remove(&delivery_id);
        self.send(out, Disposition {
            role,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(state),
            batchable: false,
        });
        Ok(())
    }

    pub(crate) fn grant_credit(&mut self, handle: u32, credit: u32, out: &mut Outbox) -> AppResult<()> {
        self.require_mapped("grant credit")?;
        let link = self.local_link(handle)?;
        if link.role() != Role::Receiver || !link.is_attached() {
            return Err(AppError::IllegalStateError(format!(
                "cannot grant credit on link {} in state {:?} as {:?}",
                link.name(),
                link.state(),
                link.role()
            )));
        }
        link.grant(credit);
        let flow = link.flow();
        self.send_flow(out, Some(flow));
        Ok(())
    }

    fn on_attach(&mut self, attach: Attach, out: &mut Outbox, container: &dyn Container) -> AppResult<()> {
        if self.remote_handles.contains_key(&attach.handle) {
            return Err(AppError::SessionError(AmqpError::new(
                condition::HANDLE_IN_USE,
                format!("handle {} is already attached", attach.handle),
            )));
        }
        if attach.handle > self.handle_max {
            return Err(AppError::SessionError(AmqpError::new(
                condition::RESOURCE_LIMIT_EXCEEDED,
                format!(
                    "handle {} exceeds handle-max {}",
                    attach.handle, self.handle_max
                ),
            )));
        }
        let channel = self.local_channel;

        let pending = self
            .links
            .iter()
            .find(|(_, link)| link.name() == attach.name && link.state() == LinkState::AttachSent)
            .map(|(handle, _)| handle as u32);
        if let Some(handle) = pending {
            let link = self.local_link(handle)?;
            link.on_remote_attach(&attach)?;
            let event = ConnectionEvent::LinkAttached {
                channel,
                handle,
                name: link.name().to_string(),
                role: link.role(),
            };
            self.remote_handles.insert(attach.handle, handle);
            out.notify(event);
            return Ok(());
        }

        let handle = self
            .allocate_handle()
            .map_err(|err| AppError::SessionError(err.to_amqp_error()))?;
        let mut link = Link::new(attach.name.clone(), attach.role.opposite(), handle, None, None)
            .with_max_message_size(self.max_message_size);
        link.on_remote_attach(&attach)?;
        let info = link.info(channel);
        self.remote_handles.insert(attach.handle, handle);

        match container.on_attach(&info) {
            Ok(window) => {
                let reply = link.complete_attach()?;
                self.send(out, reply);
                out.notify(ConnectionEvent::LinkAttached {
                    channel,
                    handle,
                    name: info.name.clone(),
                    role: info.role,
                });
                let role = link.role();
                if role == Role::Receiver && window > 0 {
                    link.grant(window);
                    let flow = link.flow();
                    self.links.set(handle as usize, link)?;
                    self.send_flow(out, Some(flow));
                } else {
                    self.links.set(handle as usize, link)?;
                }
                if role == Role::Sender {
                    self.pump(handle, out, container)?;
                }
            }
            Err(error) => {
                warn!("attach of link {} refused: {}", info.name, error);
                let (reply, detach) = link.refuse(error);
                self.links.set(handle as usize, link)?;
                self.send(out, reply);
                self.send(out, detach);
            }
        }
        Ok(())
    }

    /// Feeds a sending link from the container while it holds credit, then
    /// answers a drain request. Returns whether a Flow went out.
    fn pump(&mut self, handle: u32, out: &mut Outbox, container: &dyn Container) -> AppResult<bool> {
        let channel = self.local_channel;
        loop {
            let Some(link) = self.links.get(handle as usize) else {
                return Ok(false);
            };
            if !link.is_attached() || link.credit() == 0 || self.remote_incoming_window == 0 {
                break;
            }
            let Some(payload) = container.next_message(&link.info(channel)) else {
                break;
            };
            self.transfer(handle, payload, false, out)?;
        }
        if let Some(link) = self.links.get_mut(handle as usize) {
            if link.drain_credit() {
                let flow = link.flow();
                self.send_flow(out, Some(flow));
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn on_flow(&mut self, flow: &Flow, out: &mut Outbox, container: &dyn Container) -> AppResult<()> {
        self.remote_incoming_window = match flow.next_incoming_id {
            Some(next_incoming_id) => next_incoming_id
                .wrapping_add(flow.incoming_window)
                .wrapping_sub(self.next_outgoing_id),
            None => flow.incoming_window,
        };
        self.remote_outgoing_window = flow.outgoing_window;

        let Some(remote_handle) = flow.handle else {
            if flow.echo {
                self.send_flow(out, None);
            }
            let senders: Vec<u32> = self
                .links
                .iter()
                .filter(|(_, link)| link.role() == Role::Sender && link.credit() > 0)
                .map(|(handle, _)| handle as u32)
                .collect();
            for handle in senders {
                self.pump(handle, out, container)?;
            }
            return Ok(());
        };

        let channel = self.local_channel;
        let (handle, link) = self.live_link(remote_handle)?;
        if !link.is_attached() {
            trace!("flow for link {} in state {:?} ignored", link.name(), link.state());
            return Ok(());
        }
        link.on_flow(flow);
        if link.role() == Role::Sender {
            out.notify(ConnectionEvent::LinkCredit {
                channel,
                handle,
                credit: link.credit(),
            });
            let flow_sent = self.pump(handle, out, container)?;
            if flow.echo && !flow_sent {
                if let Some(link) = self.links.get(handle as usize) {
                    let flow = link.flow();
                    self.send_flow(out, Some(flow));
                }
            }
        } else if flow.echo {
            let flow = link.flow();
            self.send_flow(out, Some(flow));
        }
        Ok(())
    }

    fn on_transfer(
        &mut self,
        transfer: &Transfer,
        payload: Bytes,
        out: &mut Outbox,
        container: &dyn Container,
    ) -> AppResult<()> {
        if self.incoming_window == 0 {
            return Err(AppError::SessionError(AmqpError::new(
                condition::WINDOW_VIOLATION,
                "transfer received with a closed incoming window",
            )));
        }
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.incoming_window -= 1;
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);

        let channel = self.local_channel;
        let (handle, link) = self.live_link(transfer.handle)?;
        if !link.is_attached() {
            trace!("transfer for link {} in state {:?} dropped", link.name(), link.state());
            return Ok(());
        }
        match link.on_transfer(transfer, &payload) {
            Ok(Some(delivery)) => {
                let outcome = container.on_transfer(&link.info(channel), &delivery);
                let replenish = link.should_replenish().then(|| {
                    link.replenish();
                    link.flow()
                });
                if !delivery.settled {
                    match outcome {
                        Some(state) => self.send(out, Disposition {
                            role: Role::Receiver,
                            first: delivery.delivery_id,
                            last: None,
                            settled: true,
                            state: Some(state),
                            batchable: false,
                        }),
                        None => {
                            self.incoming_unsettled.insert(delivery.delivery_id, handle);
                        }
                    }
                }
                if let Some(flow) = replenish {
                    self.send_flow(out, Some(flow));
                }
            }
            Ok(None) => {}
            Err(AppError::LinkError(error)) => self.fail_link(handle, error, out, container),
            Err(err) => return Err(err),
        }

        if self.incoming_window <= self.window_size / 2 {
            self.incoming_window = self.window_size;
            self.send_flow(out, None);
        }
        Ok(())
    }

    fn on_disposition(
        &mut self,
        disposition: &Disposition,
        out: &mut Outbox,
        container: &dyn Container,
    ) -> AppResult<()> {
        let first = disposition.first;
        let last = disposition.last_id();
        if last < first {
            return Err(AppError::MalformedProtocol(format!(
                "disposition range {}..={} is reversed",
                first, last
            )));
        }
        let channel = self.local_channel;
        // the peer's role tells which of our deliveries it refers to
        let (unsettled, our_role) = match disposition.role {
            Role::Receiver => (&mut self.outgoing_unsettled, Role::Sender),
            Role::Sender => (&mut self.incoming_unsettled, Role::Receiver),
        };
        let affected: Vec<(u32, u32)> = unsettled
            .range(first..=last)
            .map(|(id, handle)| (*id, *handle))
            .collect();

        for (delivery_id, handle) in affected {
            let settle_back = !disposition.settled
                && our_role == Role::Sender
                && disposition.state.as_ref().is_some_and(DeliveryState::is_terminal);
            if disposition.settled || settle_back {
                unsettled.remove(&delivery_id);
            }
            if our_role == Role::Sender {
                if let Some(link) = self.links.get(handle as usize) {
                    container.on_disposition(
                        &link.info(channel),
                        delivery_id,
                        disposition.state.as_ref(),
                        disposition.settled,
                    );
                }
            }
            out.notify(ConnectionEvent::DeliverySettled {
                channel,
                handle,
                delivery_id,
                state: disposition.state.clone(),
            });
            if settle_back {
                out.send(Frame::new(channel, Disposition {
                    role: Role::Sender,
                    first: delivery_id,
                    last: None,
                    settled: true,
                    state: disposition.state.clone(),
                    batchable: false,
                }));
            }
        }
        Ok(())
    }

    fn on_detach(&mut self, detach: Detach, out: &mut Outbox, container: &dyn Container) -> AppResult<()> {
        let handle = self.local_handle(detach.handle)?;
        let channel = self.local_channel;
        let link = self.local_link(handle)?;
        let was_attached = link.is_attached();
        if was_attached {
            container.on_detach(&link.info(channel), detach.error.as_ref());
        }
        let reply = link.on_remote_detach(&detach);
        let name = link.name().to_string();

        self.links.remove(handle as usize);
        self.remote_handles.remove(&detach.handle);
        self.outgoing_unsettled.retain(|_, owner| *owner != handle);
        self.incoming_unsettled.retain(|_, owner| *owner != handle);

        if let Some(reply) = reply {
            self.send(out, reply);
        }
        if let Some(error) = &detach.error {
            debug!("peer detached link {} with error: {}", name, error);
        }
        out.notify(ConnectionEvent::LinkDetached {
            channel,
            handle,
            name,
            error: detach.error,
        });
        Ok(())
    }

    fn illegal_state(&self, action: &str) -> AppError {
        AppError::IllegalStateError(format!(
            "cannot {} on channel {} in session state {:?}",
            action, self.local_channel, self.state
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::container::{Delivery, LinkInfo, MemoryContainer};

    fn mapped(config: &AmqpConfig) -> (Session, Outbox) {
        let mut out = Outbox::new(config.max_frame_size);
        let mut session = Session::new(0, config);
        session.begin(&mut out).unwrap();
        session
            .on_begin(
                5,
                &Begin {
                    remote_channel: Some(0),
                    incoming_window: 100,
                    outgoing_window: 100,
                    ..Default::default()
                },
                &mut out,
            )
            .unwrap();
        out.frames.clear();
        out.events.clear();
        (session, out)
    }

    fn performatives(out: &mut Outbox) -> Vec<Performative> {
        out.frames
            .drain(..)
            .filter_map(|frame| frame.performative)
            .collect()
    }

    fn peer_sender_attach(name: &str, handle: u32, address: &str) -> Attach {
        let mut attach = Attach::new(name, handle, Role::Sender);
        attach.source = Some(Source::new(address));
        attach.target = Some(Target::new(address));
        attach.initial_delivery_count = Some(0);
        attach
    }

    fn peer_transfer(handle: u32, delivery_id: u32) -> Performative {
        Performative::Transfer(Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(Bytes::copy_from_slice(&delivery_id.to_be_bytes())),
            ..Default::default()
        })
    }

    #[test]
    fn begin_handshake_states() {
        let config = AmqpConfig::default();
        let mut out = Outbox::new(config.max_frame_size);
        let mut session = Session::new(3, &config);
        assert!(!session.state().can_send_frames());
        session.begin(&mut out).unwrap();
        assert_eq!(session.state(), SessionState::BeginSent);
        assert!(session.state().can_send_frames());
        assert!(!session.state().can_receive_frames());
        let begin = &out.frames[0];
        assert_eq!(begin.channel, 3);
        assert!(matches!(
            &begin.performative,
            Some(Performative::Begin(Begin { remote_channel: None, .. }))
        ));

        session
            .on_begin(9, &Begin::default(), &mut out)
            .unwrap();
        assert_eq!(session.state(), SessionState::Mapped);
        assert_eq!(session.remote_channel(), Some(9));
        assert_eq!(
            out.events.pop_front(),
            Some(ConnectionEvent::SessionBegun { channel: 3 })
        );
        // the answer to our own Begin is not answered again
        assert_eq!(out.frames.len(), 1);
    }

    #[test]
    fn peer_initiated_begin_is_answered() {
        let config = AmqpConfig::default();
        let mut out = Outbox::new(config.max_frame_size);
        let mut session = Session::new(0, &config);
        session.on_begin(4, &Begin::default(), &mut out).unwrap();
        assert_eq!(session.state(), SessionState::Mapped);
        match &out.frames[0].performative {
            Some(Performative::Begin(begin)) => {
                assert_eq!(begin.remote_channel, Some(4));
                assert_eq!(begin.incoming_window, config.incoming_window);
                assert_eq!(begin.handle_max, config.handle_max);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.on_begin(4, &Begin::default(), &mut out).is_err());
    }

    #[test]
    fn end_handshake_both_directions() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);

        let (mut session, mut out) = mapped(&config);
        assert!(!session.end(None, &mut out, &container).unwrap());
        assert_eq!(session.state(), SessionState::EndSent);
        assert!(session.on_end(&End::default(), &mut out, &container).unwrap());
        assert_eq!(session.state(), SessionState::Unmapped);

        let (mut session, mut out) = mapped(&config);
        let error = AmqpError::condition(condition::DETACH_FORCED);
        assert!(session
            .on_end(&End { error: Some(error.clone()) }, &mut out, &container)
            .unwrap());
        assert_eq!(session.error(), Some(&error));
        assert_eq!(
            performatives(&mut out),
            vec![Performative::End(End::default())]
        );
    }

    #[test]
    fn attach_from_peer_grants_credit_and_accepts_transfers() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);
        let (mut session, mut out) = mapped(&config);

        session
            .handle_frame(
                peer_sender_attach("in", 7, "orders").into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        let frames = performatives(&mut out);
        match &frames[..] {
            [Performative::Attach(attach), Performative::Flow(flow)] => {
                assert_eq!(attach.role, Role::Receiver);
                assert_eq!(attach.handle, 0);
                assert_eq!(flow.handle, Some(0));
                assert_eq!(flow.link_credit, Some(10));
                assert_eq!(flow.next_incoming_id, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }

        session
            .handle_frame(
                peer_transfer(7, 0),
                Some(Bytes::from_static(b"hello")),
                &mut out,
                &container,
            )
            .unwrap();
        assert_eq!(container.queue_len("orders"), 1);
        match &performatives(&mut out)[..] {
            [Performative::Disposition(disposition)] => {
                assert_eq!(disposition.role, Role::Receiver);
                assert_eq!(disposition.first, 0);
                assert!(disposition.settled);
                assert_eq!(disposition.state, Some(DeliveryState::Accepted));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.link(0).unwrap().credit(), 9);
        assert_eq!(session.next_incoming_id(), 1);
    }

    #[test]
    fn refused_attach_gets_null_terminus_and_detach() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);
        let (mut session, mut out) = mapped(&config);
        let mut attach = Attach::new("nowhere", 0, Role::Sender);
        attach.source = Some(Source::new("x"));

        session
            .handle_frame(attach.into(), None, &mut out, &container)
            .unwrap();
        match &performatives(&mut out)[..] {
            [Performative::Attach(attach), Performative::Detach(detach)] => {
                assert_eq!(attach.target, None);
                assert!(detach.closed);
                assert_eq!(
                    detach.error.as_ref().map(|e| e.condition.as_str()),
                    Some(condition::NOT_FOUND)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.link(0).unwrap().is_destroyed());

        // further traffic for the destroyed link is an errant-link error
        let flow = Flow {
            handle: Some(0),
            link_credit: Some(1),
            ..Default::default()
        };
        match session.handle_frame(flow.into(), None, &mut out, &container) {
            Err(AppError::SessionError(error)) => {
                assert_eq!(error.condition.as_str(), condition::ERRANT_LINK)
            }
            other => panic!("unexpected {:?}", other),
        }

        // its own detach still completes it
        session
            .handle_frame(
                Detach {
                    handle: 0,
                    closed: true,
                    error: None,
                }
                .into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        assert_eq!(session.link_count(), 0);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn duplicate_and_unknown_handles_are_session_errors() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);
        let (mut session, mut out) = mapped(&config);
        session
            .handle_frame(peer_sender_attach("a", 1, "q").into(), None, &mut out, &container)
            .unwrap();
        match session.handle_frame(
            peer_sender_attach("b", 1, "q").into(),
            None,
            &mut out,
            &container,
        ) {
            Err(AppError::SessionError(error)) => {
                assert_eq!(error.condition.as_str(), condition::HANDLE_IN_USE)
            }
            other => panic!("unexpected {:?}", other),
        }
        match session.handle_frame(
            peer_transfer(42, 0),
            None,
            &mut out,
            &container,
        ) {
            Err(AppError::SessionError(error)) => {
                assert_eq!(error.condition.as_str(), condition::UNATTACHED_HANDLE)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sender_link_pumps_container_on_credit() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);
        container.publish("news", Bytes::from_static(b"one"));
        container.publish("news", Bytes::from_static(b"two"));
        let (mut session, mut out) = mapped(&config);

        let mut attach = Attach::new("out", 2, Role::Receiver);
        attach.source = Some(Source::new("news"));
        session
            .handle_frame(attach.into(), None, &mut out, &container)
            .unwrap();
        match &performatives(&mut out)[..] {
            [Performative::Attach(attach)] => {
                assert_eq!(attach.role, Role::Sender);
                assert_eq!(attach.initial_delivery_count, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }

        session
            .handle_frame(
                Flow {
                    next_incoming_id: Some(0),
                    incoming_window: 100,
                    handle: Some(2),
                    delivery_count: Some(0),
                    link_credit: Some(5),
                    ..Default::default()
                }
                .into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        let payloads: Vec<Bytes> = out
            .frames
            .drain(..)
            .filter_map(|frame| frame.payload)
            .collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(session.link(0).unwrap().credit(), 3);
        assert_eq!(session.unsettled_outgoing(), 2);
        assert!(out.events.contains(&ConnectionEvent::LinkCredit {
            channel: 0,
            handle: 0,
            credit: 5
        }));

        // receiver accepts both without settling, we settle back
        session
            .handle_frame(
                Disposition {
                    role: Role::Receiver,
                    first: 0,
                    last: Some(1),
                    settled: false,
                    state: Some(DeliveryState::Accepted),
                    batchable: false,
                }
                .into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        let settles = performatives(&mut out);
        assert_eq!(settles.len(), 2);
        assert!(settles.iter().all(|p| matches!(
            p,
            Performative::Disposition(Disposition {
                role: Role::Sender,
                settled: true,
                ..
            })
        )));
        assert_eq!(session.unsettled_outgoing(), 0);
    }

    #[test]
    fn drain_with_empty_queue_reports_spent_credit() {
        let config = AmqpConfig::default();
        let container = MemoryContainer::new("c", 10);
        let (mut session, mut out) = mapped(&config);
        let mut attach = Attach::new("out", 0, Role::Receiver);
        attach.source = Some(Source::new("empty"));
        session
            .handle_frame(attach.into(), None, &mut out, &container)
            .unwrap();
        out.frames.clear();

        session
            .handle_frame(
                Flow {
                    next_incoming_id: Some(0),
                    incoming_window: 100,
                    handle: Some(0),
                    delivery_count: Some(0),
                    link_credit: Some(4),
                    drain: true,
                    ..Default::default()
                }
                .into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        match &performatives(&mut out)[..] {
            [Performative::Flow(flow)] => {
                assert_eq!(flow.link_credit, Some(0));
                assert_eq!(flow.delivery_count, Some(4));
                assert!(flow.drain);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn large_transfer_is_split_into_continuations() {
        let config = AmqpConfig {
            max_frame_size: 512,
            ..Default::default()
        };
        let container = MemoryContainer::new("c", 10);
        let (mut session, mut out) = mapped(&config);
        let handle = session
            .attach("big", Role::Sender, Some(Source::new("q")), None, &mut out)
            .unwrap();
        session
            .handle_frame(Attach::new("big", 0, Role::Receiver).into(), None, &mut out, &container)
            .unwrap();
        session
            .handle_frame(
                Flow {
                    next_incoming_id: Some(0),
                    incoming_window: 100,
                    handle: Some(0),
                    delivery_count: Some(0),
                    link_credit: Some(1),
                    ..Default::default()
                }
                .into(),
                None,
                &mut out,
                &container,
            )
            .unwrap();
        out.frames.clear();

        let payload = Bytes::from(vec![7u8; 1500]);
        let delivery_id = session
            .transfer(handle, payload.clone(), false, &mut out)
            .unwrap();
        assert_eq!(delivery_id, 0);
        assert!(out.frames.len() >= 3);
        let mut joined = Vec::new();
        let last = out.frames.len() - 1;
        for (index, frame) in out.frames.iter().enumerate() {
            let overhead = frame_overhead(frame.performative.as_ref().unwrap());
            let size = overhead + frame.payload.as_ref().map_or(0, Bytes::len);
            assert!(size <= 512);
            match &frame.performative {
                Some(Performative::Transfer(transfer)) => assert_eq!(transfer.more, index != last),
                other => panic!("unexpected {:?}", other),
            }
            joined.extend_from_slice(frame.payload.as_ref().unwrap());
        }
        assert_eq!(joined, payload);
        assert_eq!(session.next_outgoing_id() as usize, out.frames.len());
        assert!(matches!(
            session.transfer(handle, Bytes::new(), false, &mut out),
            Err(AppError::NoCredit(_))
        ));
    }

    #[test]
    fn deferred_settlement_through_settle() {
        struct Deferring(MemoryContainer);
        impl Container for Deferring {
            fn container_id(&self) -> &str {
                self.0.container_id()
            }
            fn on_attach(&self, link: &LinkInfo) -> Result<u32, AmqpError> {
                self.0.on_attach(link)
            }
            fn on_transfer(&self, _: &LinkInfo, _: &Delivery) -> Option<DeliveryState> {
                None
            }
            fn next_message(&self, link: &LinkInfo) -> Option<Bytes> {
                self.0.next_message(link)
            }
            fn on_disposition(&self, _: &LinkInfo, _: u32, _: Option<&DeliveryState>, _: bool) {}
            fn on_detach(&self, _: &LinkInfo, _: Option<&AmqpError>) {}
        }

        let config = AmqpConfig::default();
        let container = Deferring(MemoryContainer::new("c", 10));
        let (mut session, mut out) = mapped(&config);
        session
            .handle_frame(peer_sender_attach("in", 0, "q").into(), None, &mut out, &container)
            .unwrap();
        out.frames.clear();
        session
            .handle_frame(peer_transfer(0, 3), None, &mut out, &container)
            .unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(session.unsettled_incoming(), 1);

        session
            .settle(0, 3, DeliveryState::Released, &mut out)
            .unwrap();
        assert_eq!(session.unsettled_incoming(), 0);
        assert!(session
            .settle(0, 3, DeliveryState::Released, &mut out)
            .is_err());
    }

    #[test]
    fn incoming_window_is_replenished() {
        let config = AmqpConfig {
            incoming_window: 4,
            ..Default::default()
        };
        let container = MemoryContainer::new("c", 100);
        let (mut session, mut out) = mapped(&config);
        session
            .handle_frame(peer_sender_attach("in", 0, "q").into(), None, &mut out, &container)
            .unwrap();
        out.frames.clear();
        for id in 0..2 {
            session
                .handle_frame(peer_transfer(0, id), None, &mut out, &container)
                .unwrap();
        }
        assert_eq!(session.incoming_window(), 4);
        let session_flows = performatives(&mut out)
            .into_iter()
            .filter(|p| matches!(p, Performative::Flow(Flow { handle: None, .. })))
            .count();
        assert_eq!(session_flows, 1);
    }
}
