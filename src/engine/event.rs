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

use crate::protocol::{AmqpError, DeliveryState, Frame, Role};

/// Lifecycle notifications queued by a connection, drained with
/// [`Connection::poll_event`](super::Connection::poll_event).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened {
        remote_container_id: String,
    },
    SessionBegun {
        channel: u16,
    },
    SessionEnded {
        channel: u16,
        error: Option<AmqpError>,
    },
    LinkAttached {
        channel: u16,
        handle: u32,
        name: String,
        role: Role,
    },
    LinkDetached {
        channel: u16,
        handle: u32,
        name: String,
        error: Option<AmqpError>,
    },
    /// The peer changed the credit of a sending link.
    LinkCredit {
        channel: u16,
        handle: u32,
        credit: u32,
    },
    /// The peer settled (or updated the state of) one of our deliveries.
    DeliverySettled {
        channel: u16,
        handle: u32,
        delivery_id: u32,
        state: Option<DeliveryState>,
    },
    Closed {
        error: Option<AmqpError>,
    },
}

/// Frames and events produced while handling one input, flushed by the
/// connection once the handler returns.
#[derive(Debug)]
pub(crate) struct Outbox {
    pub frames: Vec<Frame>,
    pub events: VecDeque<ConnectionEvent>,
    /// Negotiated frame size, used to split outgoing transfers.
    pub max_frame_size: u32,
}

impl Outbox {
    pub fn new(max_frame_size: u32) -> Self {
        Outbox {
            frames: Vec::new(),
            events: VecDeque::new(),
            max_frame_size,
        }
    }

    pub fn send(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn notify(&mut self, event: ConnectionEvent) {
        self.events.push_back(event);
    }
}
