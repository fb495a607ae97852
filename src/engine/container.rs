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

use std::collections::VecDeque;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::protocol::{condition, AmqpError, DeliveryState, Role, Source, Target};

/// What the container is told about a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub channel: u16,
    pub handle: u32,
    pub name: String,
    /// Role of this side of the link.
    pub role: Role,
    pub source: Option<Source>,
    pub target: Option<Target>,
}

impl LinkInfo {
    /// The node messages flow through on this side: the source when we send,
    /// the target when we receive.
    pub fn address(&self) -> Option<&str> {
        match self.role {
            Role::Sender => self.source.as_ref().and_then(|s| s.address.as_deref()),
            Role::Receiver => self.target.as_ref().and_then(|t| t.address.as_deref()),
        }
    }
}

/// A complete inbound delivery, continuation frames already joined.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: u32,
    pub delivery_tag: Bytes,
    pub message_format: u32,
    pub settled: bool,
    pub payload: Bytes,
}

/// Application side of the engine.
///
/// Called synchronously while the connection handles a frame, so
/// implementations must not call back into the same connection.
pub trait Container: Send + Sync {
    fn container_id(&self) -> &str;

    /// Authorises a peer-initiated attach. For a link on which we receive,
    /// the returned value is the credit window granted to the peer.
    fn on_attach(&self, link: &LinkInfo) -> Result<u32, AmqpError>;

    /// A delivery arrived on a receiving link. Returning an outcome settles
    /// it immediately; `None` leaves it unsettled until
    /// [`Connection::settle`](super::Connection::settle) is called.
    fn on_transfer(&self, link: &LinkInfo, delivery: &Delivery) -> Option<DeliveryState>;

    /// Next payload for a sending link that holds credit.
    fn next_message(&self, link: &LinkInfo) -> Option<Bytes>;

    /// The peer reported the state of one of our outgoing deliveries.
    fn on_disposition(
        &self,
        link: &LinkInfo,
        delivery_id: u32,
        state: Option<&DeliveryState>,
        settled: bool,
    );

    fn on_detach(&self, link: &LinkInfo, error: Option<&AmqpError>);
}

/// Container keeping one in-memory queue per address.
///
/// Shared by every connection of a broker; all state lives in a `DashMap`.
#[derive(Debug)]
pub struct MemoryContainer {
    container_id: String,
    credit_window: u32,
    queues: DashMap<String, VecDeque<Bytes>>,
}

impl MemoryContainer {
    pub fn new(container_id: impl Into<String>, credit_window: u32) -> Self {
        MemoryContainer {
            container_id: container_id.into(),
            credit_window,
            queues: DashMap::new(),
        }
    }

    pub fn publish(&self, address: &str, payload: Bytes) {
        self.queues
            .entry(address.to_string())
            .or_default()
            .push_back(payload);
    }

    pub fn pop(&self, address: &str) -> Option<Bytes> {
        self.queues
            .get_mut(address)
            .and_then(|mut queue| queue.pop_front())
    }

    pub fn queue_len(&self, address: &str) -> usize {
        self.queues.get(address).map_or(0, |queue| queue.len())
    }
}

impl Container for MemoryContainer {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn on_attach(&self, link: &LinkInfo) -> Result<u32, AmqpError> {
        let address = link.address().ok_or_else(|| {
            AmqpError::new(
                condition::NOT_FOUND,
                format!("link {} names no address", link.name),
            )
        })?;
        self.queues.entry(address.to_string()).or_default();
        debug!(
            "link {} attached to {} as {:?}",
            link.name, address, link.role
        );
        Ok(match link.role {
            Role::Receiver => self.credit_window,
            Role::Sender => 0,
        })
    }

    fn on_transfer(&self, link: &LinkInfo, delivery: &Delivery) -> Option<DeliveryState> {
        match link.address() {
            Some(address) => {
                self.publish(address, delivery.payload.clone());
                Some(DeliveryState::Accepted)
            }
            None => Some(DeliveryState::Rejected {
                error: Some(AmqpError::condition(condition::NOT_FOUND)),
            }),
        }
    }

    fn next_message(&self, link: &LinkInfo) -> Option<Bytes> {
        link.address().and_then(|address| self.pop(address))
    }

    fn on_disposition(
        &self,
        link: &LinkInfo,
        delivery_id: u32,
        state: Option<&DeliveryState>,
        settled: bool,
    ) {
        trace!(
            "delivery {} on {} is {:?}, settled: {}",
            delivery_id,
            link.name,
            state,
            settled
        );
    }

    fn on_detach(&self, link: &LinkInfo, error: Option<&AmqpError>) {
        debug!("link {} detached, error: {:?}", link.name, error);
    }
}
