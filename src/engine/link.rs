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

use super::container::{Delivery, LinkInfo};
use crate::protocol::{
    condition, AmqpError, Attach, Detach, Flow, ReceiverSettleMode, Role, SenderSettleMode,
    Source, Target, Transfer,
};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Detached,
    AttachSent,
    AttachReceived,
    Attached,
    DetachSent,
    DetachReceived,
    /// Detached because of an error; only the peer's Detach may still
    /// reference the link.
    Destroyed,
}

#[derive(Debug)]
struct PartialDelivery {
    delivery_id: u32,
    delivery_tag: Bytes,
    message_format: u32,
    settled: bool,
    payload: BytesMut,
}

/// One end of a link, owned by its session and indexed by local handle.
///
/// Credit follows the usual AMQP bookkeeping: the receiver grants
/// `link_credit` relative to the sender's `delivery_count`, and every
/// delivery moves one unit of credit into the delivery count.
#[derive(Debug)]
pub struct Link {
    name: String,
    role: Role,
    handle: u32,
    remote_handle: Option<u32>,
    state: LinkState,
    source: Option<Source>,
    target: Option<Target>,
    snd_settle_mode: SenderSettleMode,
    rcv_settle_mode: ReceiverSettleMode,
    delivery_count: u32,
    link_credit: u32,
    /// Receiver only: the credit topped back up to when half of it is used.
    credit_window: u32,
    available: u32,
    drain: bool,
    next_tag: u32,
    /// Largest incoming message accepted; `None` is unlimited.
    max_message_size: Option<u64>,
    partial: Option<PartialDelivery>,
}

impl Link {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        handle: u32,
        source: Option<Source>,
        target: Option<Target>,
    ) -> Self {
        Link {
            name: name.into(),
            role,
            handle,
            remote_handle: None,
            state: LinkState::Detached,
            source,
            target,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            delivery_count: 0,
            link_credit: 0,
            credit_window: 0,
            available: 0,
            drain: false,
            next_tag: 0,
            max_message_size: None,
            partial: None,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: Option<u64>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn remote_handle(&self) -> Option<u32> {
        self.remote_handle
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.state == LinkState::Attached
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == LinkState::Destroyed
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn credit(&self) -> u32 {
        self.link_credit
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn max_message_size(&self) -> Option<u64> {
        self.max_message_size
    }

    pub fn credit_window(&self) -> u32 {
        self.credit_window
    }

    pub fn info(&self, channel: u16) -> LinkInfo {
        LinkInfo {
            channel,
            handle: self.handle,
            name: self.name.clone(),
            role: self.role,
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }

    fn attach_frame(&self) -> Attach {
        Attach {
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source.clone(),
            target: self.target.clone(),
            initial_delivery_count: (self.role == Role::Sender).then_some(self.delivery_count),
            max_message_size: self.max_message_size,
            ..Attach::new(self.name.clone(), self.handle, self.role)
        }
    }

    /// Locally initiated attach.
    pub fn attach(&mut self) -> AppResult<Attach> {
        if self.state != LinkState::Detached {
            return Err(self.illegal_state("attach"));
        }
        self.state = LinkState::AttachSent;
        Ok(self.attach_frame())
    }

    /// Either the peer's answer to our Attach or the start of a peer-initiated
    /// link; the latter still needs [`complete_attach`](Self::complete_attach)
    /// or [`refuse`](Self::refuse).
    pub fn on_remote_attach(&mut self, attach: &Attach) -> AppResult<()> {
        match self.state {
            LinkState::AttachSent => self.state = LinkState::Attached,
            LinkState::Detached => {
                self.state = LinkState::AttachReceived;
                self.source = attach.source.clone();
                self.target = attach.target.clone();
            }
            _ => return Err(self.illegal_state("receive attach")),
        }
        self.remote_handle = Some(attach.handle);
        match self.role {
            Role::Receiver => {
                self.snd_settle_mode = attach.snd_settle_mode;
                self.delivery_count = attach.initial_delivery_count.unwrap_or(0);
            }
            Role::Sender => self.rcv_settle_mode = attach.rcv_settle_mode,
        }
        Ok(())
    }

    pub fn complete_attach(&mut self) -> AppResult<Attach> {
        if self.state != LinkState::AttachReceived {
            return Err(self.illegal_state("accept attach"));
        }
        self.state = LinkState::Attached;
        Ok(self.attach_frame())
    }

    /// Answers a peer attach with a null local terminus followed by a closing
    /// Detach carrying `error`.
    pub fn refuse(&mut self, error: AmqpError) -> (Attach, Detach) {
        match self.role {
            Role::Sender => self.source = None,
            Role::Receiver => self.target = None,
        }
        let attach = self.attach_frame();
        self.state = LinkState::Destroyed;
        let detach = Detach {
            handle: self.handle,
            closed: true,
            error: Some(error),
        };
        (attach, detach)
    }

    /// Locally initiated detach. An error destroys the link.
    pub fn detach(&mut self, error: Option<AmqpError>) -> AppResult<Detach> {
        match self.state {
            LinkState::AttachSent | LinkState::AttachReceived | LinkState::Attached => {}
            _ => return Err(self.illegal_state("detach")),
        }
        self.state = if error.is_some() {
            LinkState::Destroyed
        } else {
            LinkState::DetachSent
        };
        Ok(Detach {
            handle: self.handle,
            closed: true,
            error,
        })
    }

    /// Returns the Detach to send back when the peer initiated the detach.
    pub fn on_remote_detach(&mut self, detach: &Detach) -> Option<Detach> {
        let reply = match self.state {
            LinkState::DetachSent | LinkState::Destroyed => None,
            _ => {
                self.state = LinkState::DetachReceived;
                Some(Detach {
                    handle: self.handle,
                    closed: detach.closed,
                    error: None,
                })
            }
        };
        self.state = LinkState::Detached;
        reply
    }

    /// Link half of a Flow; the session fills in its own fields.
    pub fn flow(&self) -> Flow {
        Flow {
            handle: Some(self.handle),
            delivery_count: Some(self.delivery_count),
            link_credit: Some(self.link_credit),
            available: Some(self.available),
            drain: self.drain,
            ..Default::default()
        }
    }

    pub fn on_flow(&mut self, flow: &Flow) {
        match self.role {
            Role::Sender => {
                let receiver_count = flow.delivery_count.unwrap_or(self.delivery_count);
                let limit = receiver_count.wrapping_add(flow.link_credit.unwrap_or(0));
                self.link_credit = limit.wrapping_sub(self.delivery_count);
                self.drain = flow.drain;
            }
            Role::Receiver => {
                if let Some(sender_count) = flow.delivery_count {
                    let advanced = sender_count.wrapping_sub(self.delivery_count);
                    self.link_credit = self.link_credit.saturating_sub(advanced);
                    self.delivery_count = sender_count;
                }
                self.available = flow.available.unwrap_or(self.available);
            }
        }
    }

    /// Sender in drain mode with nothing left to send: spend the remaining
    /// credit by advancing the delivery count. Returns whether credit changed.
    pub fn drain_credit(&mut self) -> bool {
        if !self.drain || self.link_credit == 0 {
            return false;
        }
        self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
        self.link_credit = 0;
        true
    }

    pub fn is_draining(&self) -> bool {
        self.drain
    }

    /// Spends one credit for an outgoing delivery and returns its tag.
    pub fn take_credit(&mut self) -> AppResult<Bytes> {
        if self.role != Role::Sender || self.state != LinkState::Attached {
            return Err(AppError::IllegalStateError(format!(
                "link {} cannot send in state {:?} as {:?}",
                self.name, self.state, self.role
            )));
        }
        if self.link_credit == 0 {
            return Err(AppError::NoCredit(format!("link {}", self.name)));
        }
        self.link_credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        let tag = Bytes::copy_from_slice(&self.next_tag.to_be_bytes());
        self.next_tag = self.next_tag.wrapping_add(1);
        Ok(tag)
    }

    /// Whether a delivery sent with `requested` settlement actually goes out
    /// settled under the negotiated sender settle mode.
    pub fn send_settled(&self, requested: bool) -> bool {
        match self.snd_settle_mode {
            SenderSettleMode::Settled => true,
            SenderSettleMode::Unsettled => false,
            SenderSettleMode::Mixed => requested,
        }
    }

    pub fn grant(&mut self, credit: u32) {
        self.link_credit = credit;
        self.credit_window = credit;
        self.drain = false;
    }

    pub fn should_replenish(&self) -> bool {
        self.role == Role::Receiver
            && self.credit_window > 0
            && self.link_credit <= self.credit_window / 2
    }

    pub fn replenish(&mut self) {
        self.link_credit = self.credit_window;
    }

    /// Feeds one Transfer frame into a receiving link. Returns the delivery
    /// once its last frame arrived.
    pub fn on_transfer(&mut self, transfer: &Transfer, payload: &[u8]) -> AppResult<Option<Delivery>> {
        if self.role != Role::Receiver {
            return Err(AppError::LinkError(AmqpError::new(
                condition::NOT_ALLOWED,
                format!("transfer received on sending link {}", self.name),
            )));
        }

        let mut partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                let delivery_id = transfer.delivery_id.ok_or_else(|| {
                    AppError::LinkError(AmqpError::new(
                        condition::INVALID_FIELD,
                        "first transfer of a delivery carries no delivery-id",
                    ))
                })?;
                if self.link_credit == 0 {
                    return Err(AppError::LinkError(AmqpError::new(
                        condition::TRANSFER_LIMIT_EXCEEDED,
                        format!("link {} has no credit", self.name),
                    )));
                }
                self.link_credit -= 1;
                self.delivery_count = self.delivery_count.wrapping_add(1);
                PartialDelivery {
                    delivery_id,
                    delivery_tag: transfer.delivery_tag.clone().unwrap_or_default(),
                    message_format: transfer.message_format.unwrap_or(0),
                    settled: false,
                    payload: BytesMut::new(),
                }
            }
        };

        if transfer.aborted {
            return Ok(None);
        }
        partial.settled |= transfer.settled.unwrap_or(false)
            || self.snd_settle_mode == SenderSettleMode::Settled;
        let size = (partial.payload.len() + payload.len()) as u64;
        if let Some(limit) = self.max_message_size.filter(|&limit| size > limit) {
            return Err(AppError::LinkError(AmqpError::new(
                condition::MESSAGE_SIZE_EXCEEDED,
                format!(
                    "delivery {} on link {} exceeds {} bytes",
                    partial.delivery_id, self.name, limit
                ),
            )));
        }
        partial.payload.extend_from_slice(payload);
        if transfer.more {
            self.partial = Some(partial);
            return Ok(None);
        }
        Ok(Some(Delivery {
            delivery_id: partial.delivery_id,
            delivery_tag: partial.delivery_tag,
            message_format: partial.message_format,
            settled: partial.settled,
            payload: partial.payload.freeze(),
        }))
    }

    fn illegal_state(&self, action: &str) -> AppError {
        AppError::IllegalStateError(format!(
            "cannot {} link {} in state {:?}",
            action, self.name, self.state
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(role: Role) -> Link {
        let mut link = Link::new("l", role, 0, Some(Source::new("q")), Some(Target::new("q")));
        link.attach().unwrap();
        let mut answer = Attach::new("l", 7, role.opposite());
        answer.initial_delivery_count = Some(0);
        link.on_remote_attach(&answer).unwrap();
        link
    }

    fn transfer(delivery_id: Option<u32>, more: bool) -> Transfer {
        Transfer {
            handle: 7,
            delivery_id,
            delivery_tag: delivery_id.map(|id| Bytes::copy_from_slice(&id.to_be_bytes())),
            more,
            ..Default::default()
        }
    }

    #[test]
    fn attach_handshake() {
        let mut link = Link::new("l", Role::Sender, 3, Some(Source::new("q")), None);
        let attach = link.attach().unwrap();
        assert_eq!(attach.handle, 3);
        assert_eq!(attach.initial_delivery_count, Some(0));
        assert_eq!(link.state(), LinkState::AttachSent);
        assert!(link.attach().is_err());

        link.on_remote_attach(&Attach::new("l", 9, Role::Receiver))
            .unwrap();
        assert!(link.is_attached());
        assert_eq!(link.remote_handle(), Some(9));
    }

    #[test]
    fn sender_credit_follows_receiver_flow() {
        let mut link = attached(Role::Sender);
        assert!(matches!(link.take_credit(), Err(AppError::NoCredit(_))));

        link.on_flow(&Flow {
            delivery_count: Some(0),
            link_credit: Some(2),
            ..Default::default()
        });
        assert_eq!(link.credit(), 2);
        assert_eq!(link.take_credit().unwrap(), Bytes::from_static(&[0, 0, 0, 0]));
        assert_eq!(link.take_credit().unwrap(), Bytes::from_static(&[0, 0, 0, 1]));
        assert_eq!(link.delivery_count(), 2);
        assert!(link.take_credit().is_err());

        // receiver saw only one delivery when it granted five more
        link.on_flow(&Flow {
            delivery_count: Some(1),
            link_credit: Some(5),
            ..Default::default()
        });
        assert_eq!(link.credit(), 4);
    }

    #[test]
    fn drain_spends_remaining_credit() {
        let mut link = attached(Role::Sender);
        link.on_flow(&Flow {
            delivery_count: Some(0),
            link_credit: Some(3),
            drain: true,
            ..Default::default()
        });
        assert!(link.drain_credit());
        assert_eq!(link.credit(), 0);
        assert_eq!(link.delivery_count(), 3);
        assert!(!link.drain_credit());
        assert_eq!(link.flow().delivery_count, Some(3));
    }

    #[test]
    fn receiver_reassembles_multi_frame_delivery() {
        let mut link = attached(Role::Receiver);
        link.grant(4);
        assert!(link
            .on_transfer(&transfer(Some(5), true), b"hel")
            .unwrap()
            .is_none());
        let delivery = link
            .on_transfer(&transfer(None, false), b"lo")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.delivery_id, 5);
        assert_eq!(delivery.payload, Bytes::from_static(b"hello"));
        assert!(!delivery.settled);
        assert_eq!(link.credit(), 3);
        assert_eq!(link.delivery_count(), 1);
    }

    #[test]
    fn aborted_delivery_is_dropped() {
        let mut link = attached(Role::Receiver);
        link.grant(4);
        link.on_transfer(&transfer(Some(0), true), b"partial")
            .unwrap();
        let mut abort = transfer(None, false);
        abort.aborted = true;
        assert!(link.on_transfer(&abort, b"").unwrap().is_none());
        let next = link
            .on_transfer(&transfer(Some(1), false), b"x")
            .unwrap()
            .unwrap();
        assert_eq!(next.delivery_id, 1);
        assert_eq!(next.payload, Bytes::from_static(b"x"));
    }

    #[test]
    fn receiver_without_credit_rejects_transfer() {
        let mut link = attached(Role::Receiver);
        match link.on_transfer(&transfer(Some(0), false), b"x") {
            Err(AppError::LinkError(error)) => {
                assert_eq!(error.condition.as_str(), condition::TRANSFER_LIMIT_EXCEEDED)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn replenish_at_half_window() {
        let mut link = attached(Role::Receiver);
        link.grant(4);
        link.on_transfer(&transfer(Some(0), false), b"").unwrap();
        assert!(!link.should_replenish());
        link.on_transfer(&transfer(Some(1), false), b"").unwrap();
        assert!(link.should_replenish());
        link.replenish();
        assert_eq!(link.credit(), 4);
    }

    #[test]
    fn refuse_nulls_local_terminus_and_destroys() {
        let mut link = Link::new("l", Role::Receiver, 0, None, None);
        let mut incoming = Attach::new("l", 1, Role::Sender);
        incoming.source = Some(Source::new("q"));
        incoming.target = Some(Target::new("q"));
        link.on_remote_attach(&incoming).unwrap();
        let (attach, detach) = link.refuse(AmqpError::condition(condition::NOT_FOUND));
        assert_eq!(attach.target, None);
        assert_eq!(attach.source, Some(Source::new("q")));
        assert!(detach.closed);
        assert!(link.is_destroyed());
        assert_eq!(link.on_remote_detach(&Detach::default()), None);
        assert_eq!(link.state(), LinkState::Detached);
    }

    #[test]
    fn remote_detach_is_answered() {
        let mut link = attached(Role::Sender);
        let reply = link
            .on_remote_detach(&Detach {
                handle: 7,
                closed: true,
                error: None,
            })
            .unwrap();
        assert_eq!(reply.handle, 0);
        assert!(reply.closed);
        assert_eq!(link.state(), LinkState::Detached);
    }
}
