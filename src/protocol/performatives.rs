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

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use super::types::{
    described_list, map_value, split_described, symbols_value, Fields, Symbol, Value,
};
use crate::{AppError, AppResult};

pub type FieldMap = Vec<(Value, Value)>;

/// Numeric descriptors of the described lists this engine understands.
pub mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const RECEIVED: u64 = 0x23;
    pub const ACCEPTED: u64 = 0x24;
    pub const REJECTED: u64 = 0x25;
    pub const RELEASED: u64 = 0x26;
    pub const MODIFIED: u64 = 0x27;
    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;
}

/// Standard error condition symbols.
pub mod condition {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const ERRANT_LINK: &str = "amqp:session:errant-link";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
}

///
/// A described list with a fixed, ordered field list.
///
/// `to_fields` lists every field in wire order; trailing nulls are dropped by
/// [`Composite::to_value`]. `from_fields` reads them back in the same order and
/// applies the documented default for each omitted field.
pub trait Composite: Sized {
    const DESCRIPTOR: u64;
    const NAME: &'static str;

    fn to_fields(&self) -> Vec<Value>;
    fn from_fields(fields: &mut Fields) -> AppResult<Self>;

    fn to_value(&self) -> Value {
        described_list(Self::DESCRIPTOR, self.to_fields())
    }

    fn from_value(value: Value) -> AppResult<Self> {
        let (code, body) = split_described(value)?;
        if code != Self::DESCRIPTOR {
            return Err(AppError::MalformedProtocol(format!(
                "expected {} ({:#x}), found descriptor {:#x}",
                Self::NAME,
                Self::DESCRIPTOR,
                code
            )));
        }
        Self::from_fields(&mut Fields::new(Self::NAME, body)?)
    }
}

fn optional<T: Composite>(value: Value) -> AppResult<Option<T>> {
    match value {
        Value::Null => Ok(None),
        other => T::from_value(other).map(Some),
    }
}

fn optional_value<T: Composite>(value: &Option<T>) -> Value {
    value.as_ref().map_or(Value::Null, Composite::to_value)
}

/// The `error` composite carried by Detach, End, Close and Rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpError {
    pub condition: Symbol,
    pub description: Option<String>,
    pub info: Option<FieldMap>,
}

impl AmqpError {
    pub fn new(condition: &str, description: impl Into<String>) -> Self {
        AmqpError {
            condition: Symbol::from(condition),
            description: Some(description.into()),
            info: None,
        }
    }

    pub fn condition(condition: &str) -> Self {
        AmqpError {
            condition: Symbol::from(condition),
            description: None,
            info: None,
        }
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl Composite for AmqpError {
    const DESCRIPTOR: u64 = descriptor::ERROR;
    const NAME: &'static str = "error";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::Symbol(self.condition.clone()),
            self.description.clone().into(),
            map_value(&self.info),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(AmqpError {
            condition: fields.mandatory("condition", Fields::symbol)?,
            description: fields.string("description")?,
            info: fields.map("info")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn from_bool(is_receiver: bool) -> Role {
        if is_receiver {
            Role::Receiver
        } else {
            Role::Sender
        }
    }

    pub fn as_bool(self) -> bool {
        self == Role::Receiver
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    #[default]
    Mixed,
}

impl SenderSettleMode {
    fn from_u8(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(AppError::MalformedProtocol(format!(
                "invalid sender settle mode {}",
                other
            ))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SenderSettleMode::Unsettled => 0,
            SenderSettleMode::Settled => 1,
            SenderSettleMode::Mixed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

impl ReceiverSettleMode {
    fn from_u8(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(AppError::MalformedProtocol(format!(
                "invalid receiver settle mode {}",
                other
            ))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ReceiverSettleMode::First => 0,
            ReceiverSettleMode::Second => 1,
        }
    }
}

/// Delivery states, the last five of which are terminal outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Received {
        section_number: u32,
        section_offset: u64,
    },
    Accepted,
    Rejected {
        error: Option<AmqpError>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Option<FieldMap>,
    },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Received { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            DeliveryState::Received {
                section_number,
                section_offset,
            } => described_list(
                descriptor::RECEIVED,
                vec![Value::Uint(*section_number), Value::Ulong(*section_offset)],
            ),
            DeliveryState::Accepted => described_list(descriptor::ACCEPTED, vec![]),
            DeliveryState::Rejected { error } => {
                described_list(descriptor::REJECTED, vec![optional_value(error)])
            }
            DeliveryState::Released => described_list(descriptor::RELEASED, vec![]),
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => described_list(
                descriptor::MODIFIED,
                vec![
                    Value::Bool(*delivery_failed),
                    Value::Bool(*undeliverable_here),
                    map_value(message_annotations),
                ],
            ),
        }
    }

    pub fn from_value(value: Value) -> AppResult<Self> {
        let (code, body) = split_described(value)?;
        let mut fields = Fields::new("delivery-state", body)?;
        let state = match code {
            descriptor::RECEIVED => DeliveryState::Received {
                section_number: fields.mandatory("section-number", Fields::uint)?,
                section_offset: fields.mandatory("section-offset", Fields::ulong)?,
            },
            descriptor::ACCEPTED => DeliveryState::Accepted,
            descriptor::REJECTED => DeliveryState::Rejected {
                error: optional(fields.next_value())?,
            },
            descriptor::RELEASED => DeliveryState::Released,
            descriptor::MODIFIED => DeliveryState::Modified {
                delivery_failed: fields.bool("delivery-failed")?.unwrap_or(false),
                undeliverable_here: fields.bool("undeliverable-here")?.unwrap_or(false),
                message_annotations: fields.map("message-annotations")?,
            },
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown delivery state {:#x}",
                    other
                )))
            }
        };
        Ok(state)
    }

    fn optional_from(value: Value) -> AppResult<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            other => DeliveryState::from_value(other).map(Some),
        }
    }
}

fn optional_state(state: &Option<DeliveryState>) -> Value {
    state.as_ref().map_or(Value::Null, DeliveryState::to_value)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Source {
    pub address: Option<String>,
    pub durable: u32,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<FieldMap>,
    pub distribution_mode: Option<Symbol>,
    pub filter: Option<FieldMap>,
    pub default_outcome: Option<DeliveryState>,
    pub outcomes: Vec<Symbol>,
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub fn new(address: impl Into<String>) -> Self {
        Source {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl Composite for Source {
    const DESCRIPTOR: u64 = descriptor::SOURCE;
    const NAME: &'static str = "source";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            Value::Uint(self.durable),
            self.expiry_policy.clone().into(),
            Value::Uint(self.timeout),
            Value::Bool(self.dynamic),
            map_value(&self.dynamic_node_properties),
            self.distribution_mode.clone().into(),
            map_value(&self.filter),
            optional_state(&self.default_outcome),
            symbols_value(&self.outcomes),
            symbols_value(&self.capabilities),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Source {
            address: fields.string("address")?,
            durable: fields.uint("durable")?.unwrap_or(0),
            expiry_policy: fields.symbol("expiry-policy")?,
            timeout: fields.uint("timeout")?.unwrap_or(0),
            dynamic: fields.bool("dynamic")?.unwrap_or(false),
            dynamic_node_properties: fields.map("dynamic-node-properties")?,
            distribution_mode: fields.symbol("distribution-mode")?,
            filter: fields.map("filter")?,
            default_outcome: DeliveryState::optional_from(fields.next_value())?,
            outcomes: fields.symbols("outcomes")?,
            capabilities: fields.symbols("capabilities")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub address: Option<String>,
    pub durable: u32,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<FieldMap>,
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Target {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl Composite for Target {
    const DESCRIPTOR: u64 = descriptor::TARGET;
    const NAME: &'static str = "target";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            Value::Uint(self.durable),
            self.expiry_policy.clone().into(),
            Value::Uint(self.timeout),
            Value::Bool(self.dynamic),
            map_value(&self.dynamic_node_properties),
            symbols_value(&self.capabilities),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Target {
            address: fields.string("address")?,
            durable: fields.uint("durable")?.unwrap_or(0),
            expiry_policy: fields.symbol("expiry-policy")?,
            timeout: fields.uint("timeout")?.unwrap_or(0),
            dynamic: fields.bool("dynamic")?.unwrap_or(false),
            dynamic_node_properties: fields.map("dynamic-node-properties")?,
            capabilities: fields.symbols("capabilities")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Milliseconds; `None` means the peer does not time out.
    pub idle_time_out: Option<u32>,
    pub outgoing_locales: Vec<Symbol>,
    pub incoming_locales: Vec<Symbol>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<FieldMap>,
}

impl Default for Open {
    fn default() -> Self {
        Open {
            container_id: String::new(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
            outgoing_locales: Vec::new(),
            incoming_locales: Vec::new(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl Composite for Open {
    const DESCRIPTOR: u64 = descriptor::OPEN;
    const NAME: &'static str = "open";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::String(self.container_id.clone()),
            self.hostname.clone().into(),
            Value::Uint(self.max_frame_size),
            Value::Ushort(self.channel_max),
            self.idle_time_out.into(),
            symbols_value(&self.outgoing_locales),
            symbols_value(&self.incoming_locales),
            symbols_value(&self.offered_capabilities),
            symbols_value(&self.desired_capabilities),
            map_value(&self.properties),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Open {
            container_id: fields.mandatory("container-id", Fields::string)?,
            hostname: fields.string("hostname")?,
            max_frame_size: fields.uint("max-frame-size")?.unwrap_or(u32::MAX),
            channel_max: fields.ushort("channel-max")?.unwrap_or(u16::MAX),
            idle_time_out: fields.uint("idle-time-out")?,
            outgoing_locales: fields.symbols("outgoing-locales")?,
            incoming_locales: fields.symbols("incoming-locales")?,
            offered_capabilities: fields.symbols("offered-capabilities")?,
            desired_capabilities: fields.symbols("desired-capabilities")?,
            properties: fields.map("properties")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<FieldMap>,
}

impl Default for Begin {
    fn default() -> Self {
        Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 0,
            outgoing_window: 0,
            handle_max: u32::MAX,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl Composite for Begin {
    const DESCRIPTOR: u64 = descriptor::BEGIN;
    const NAME: &'static str = "begin";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            self.remote_channel.into(),
            Value::Uint(self.next_outgoing_id),
            Value::Uint(self.incoming_window),
            Value::Uint(self.outgoing_window),
            Value::Uint(self.handle_max),
            symbols_value(&self.offered_capabilities),
            symbols_value(&self.desired_capabilities),
            map_value(&self.properties),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Begin {
            remote_channel: fields.ushort("remote-channel")?,
            next_outgoing_id: fields.mandatory("next-outgoing-id", Fields::uint)?,
            incoming_window: fields.mandatory("incoming-window", Fields::uint)?,
            outgoing_window: fields.mandatory("outgoing-window", Fields::uint)?,
            handle_max: fields.uint("handle-max")?.unwrap_or(u32::MAX),
            offered_capabilities: fields.symbols("offered-capabilities")?,
            desired_capabilities: fields.symbols("desired-capabilities")?,
            properties: fields.map("properties")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub unsettled: Option<FieldMap>,
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<u32>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<FieldMap>,
}

impl Attach {
    pub fn new(name: impl Into<String>, handle: u32, role: Role) -> Self {
        Attach {
            name: name.into(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl Composite for Attach {
    const DESCRIPTOR: u64 = descriptor::ATTACH;
    const NAME: &'static str = "attach";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::String(self.name.clone()),
            Value::Uint(self.handle),
            Value::Bool(self.role.as_bool()),
            Value::Ubyte(self.snd_settle_mode.to_u8()),
            Value::Ubyte(self.rcv_settle_mode.to_u8()),
            optional_value(&self.source),
            optional_value(&self.target),
            map_value(&self.unsettled),
            Value::Bool(self.incomplete_unsettled),
            self.initial_delivery_count.into(),
            self.max_message_size.into(),
            symbols_value(&self.offered_capabilities),
            symbols_value(&self.desired_capabilities),
            map_value(&self.properties),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Attach {
            name: fields.mandatory("name", Fields::string)?,
            handle: fields.mandatory("handle", Fields::uint)?,
            role: Role::from_bool(fields.mandatory("role", Fields::bool)?),
            snd_settle_mode: match fields.ubyte("snd-settle-mode")? {
                Some(mode) => SenderSettleMode::from_u8(mode)?,
                None => SenderSettleMode::default(),
            },
            rcv_settle_mode: match fields.ubyte("rcv-settle-mode")? {
                Some(mode) => ReceiverSettleMode::from_u8(mode)?,
                None => ReceiverSettleMode::default(),
            },
            source: optional(fields.next_value())?,
            target: optional(fields.next_value())?,
            unsettled: fields.map("unsettled")?,
            incomplete_unsettled: fields.bool("incomplete-unsettled")?.unwrap_or(false),
            initial_delivery_count: fields.uint("initial-delivery-count")?,
            max_message_size: fields.ulong("max-message-size")?,
            offered_capabilities: fields.symbols("offered-capabilities")?,
            desired_capabilities: fields.symbols("desired-capabilities")?,
            properties: fields.map("properties")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<FieldMap>,
}

impl Composite for Flow {
    const DESCRIPTOR: u64 = descriptor::FLOW;
    const NAME: &'static str = "flow";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            self.next_incoming_id.into(),
            Value::Uint(self.incoming_window),
            Value::Uint(self.next_outgoing_id),
            Value::Uint(self.outgoing_window),
            self.handle.into(),
            self.delivery_count.into(),
            self.link_credit.into(),
            self.available.into(),
            Value::Bool(self.drain),
            Value::Bool(self.echo),
            map_value(&self.properties),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Flow {
            next_incoming_id: fields.uint("next-incoming-id")?,
            incoming_window: fields.mandatory("incoming-window", Fields::uint)?,
            next_outgoing_id: fields.mandatory("next-outgoing-id", Fields::uint)?,
            outgoing_window: fields.mandatory("outgoing-window", Fields::uint)?,
            handle: fields.uint("handle")?,
            delivery_count: fields.uint("delivery-count")?,
            link_credit: fields.uint("link-credit")?,
            available: fields.uint("available")?,
            drain: fields.bool("drain")?.unwrap_or(false),
            echo: fields.bool("echo")?.unwrap_or(false),
            properties: fields.map("properties")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    pub resume: bool,
    pub aborted: bool,
    pub batchable: bool,
}

impl Composite for Transfer {
    const DESCRIPTOR: u64 = descriptor::TRANSFER;
    const NAME: &'static str = "transfer";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::Uint(self.handle),
            self.delivery_id.into(),
            self.delivery_tag.clone().into(),
            self.message_format.into(),
            self.settled.into(),
            Value::Bool(self.more),
            self.rcv_settle_mode.map(ReceiverSettleMode::to_u8).into(),
            optional_state(&self.state),
            Value::Bool(self.resume),
            Value::Bool(self.aborted),
            Value::Bool(self.batchable),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Transfer {
            handle: fields.mandatory("handle", Fields::uint)?,
            delivery_id: fields.uint("delivery-id")?,
            delivery_tag: fields.binary("delivery-tag")?,
            message_format: fields.uint("message-format")?,
            settled: fields.bool("settled")?,
            more: fields.bool("more")?.unwrap_or(false),
            rcv_settle_mode: fields
                .ubyte("rcv-settle-mode")?
                .map(ReceiverSettleMode::from_u8)
                .transpose()?,
            state: DeliveryState::optional_from(fields.next_value())?,
            resume: fields.bool("resume")?.unwrap_or(false),
            aborted: fields.bool("aborted")?.unwrap_or(false),
            batchable: fields.bool("batchable")?.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
    pub batchable: bool,
}

impl Disposition {
    /// Last delivery id covered, `first` when `last` is omitted.
    pub fn last_id(&self) -> u32 {
        self.last.unwrap_or(self.first)
    }
}

impl Composite for Disposition {
    const DESCRIPTOR: u64 = descriptor::DISPOSITION;
    const NAME: &'static str = "disposition";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::Bool(self.role.as_bool()),
            Value::Uint(self.first),
            self.last.into(),
            Value::Bool(self.settled),
            optional_state(&self.state),
            Value::Bool(self.batchable),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Disposition {
            role: Role::from_bool(fields.mandatory("role", Fields::bool)?),
            first: fields.mandatory("first", Fields::uint)?,
            last: fields.uint("last")?,
            settled: fields.bool("settled")?.unwrap_or(false),
            state: DeliveryState::optional_from(fields.next_value())?,
            batchable: fields.bool("batchable")?.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<AmqpError>,
}

impl Composite for Detach {
    const DESCRIPTOR: u64 = descriptor::DETACH;
    const NAME: &'static str = "detach";

    fn to_fields(&self) -> Vec<Value> {
        vec![
            Value::Uint(self.handle),
            Value::Bool(self.closed),
            optional_value(&self.error),
        ]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Detach {
            handle: fields.mandatory("handle", Fields::uint)?,
            closed: fields.bool("closed")?.unwrap_or(false),
            error: optional(fields.next_value())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct End {
    pub error: Option<AmqpError>,
}

impl Composite for End {
    const DESCRIPTOR: u64 = descriptor::END;
    const NAME: &'static str = "end";

    fn to_fields(&self) -> Vec<Value> {
        vec![optional_value(&self.error)]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(End {
            error: optional(fields.next_value())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Close {
    pub error: Option<AmqpError>,
}

impl Composite for Close {
    const DESCRIPTOR: u64 = descriptor::CLOSE;
    const NAME: &'static str = "close";

    fn to_fields(&self) -> Vec<Value> {
        vec![optional_value(&self.error)]
    }

    fn from_fields(fields: &mut Fields) -> AppResult<Self> {
        Ok(Close {
            error: optional(fields.next_value())?,
        })
    }
}

/// One frame body, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => Open::NAME,
            Performative::Begin(_) => Begin::NAME,
            Performative::Attach(_) => Attach::NAME,
            Performative::Flow(_) => Flow::NAME,
            Performative::Transfer(_) => Transfer::NAME,
            Performative::Disposition(_) => Disposition::NAME,
            Performative::Detach(_) => Detach::NAME,
            Performative::End(_) => End::NAME,
            Performative::Close(_) => Close::NAME,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(p) => p.to_value(),
            Performative::Begin(p) => p.to_value(),
            Performative::Attach(p) => p.to_value(),
            Performative::Flow(p) => p.to_value(),
            Performative::Transfer(p) => p.to_value(),
            Performative::Disposition(p) => p.to_value(),
            Performative::Detach(p) => p.to_value(),
            Performative::End(p) => p.to_value(),
            Performative::Close(p) => p.to_value(),
        }
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        self.to_value().encode(writer);
    }

    /// Reads one performative from the front of `buffer`; whatever follows is
    /// left in place (the Transfer payload).
    pub fn decode(buffer: &mut impl Buf) -> AppResult<Performative> {
        let (code, body) = split_described(Value::decode(buffer)?)?;
        let fields = &mut Fields::new(Performative::name_of(code)?, body)?;
        let performative = match code {
            descriptor::OPEN => Performative::Open(Open::from_fields(fields)?),
            descriptor::BEGIN => Performative::Begin(Begin::from_fields(fields)?),
            descriptor::ATTACH => Performative::Attach(Attach::from_fields(fields)?),
            descriptor::FLOW => Performative::Flow(Flow::from_fields(fields)?),
            descriptor::TRANSFER => Performative::Transfer(Transfer::from_fields(fields)?),
            descriptor::DISPOSITION => {
                Performative::Disposition(Disposition::from_fields(fields)?)
            }
            descriptor::DETACH => Performative::Detach(Detach::from_fields(fields)?),
            descriptor::END => Performative::End(End::from_fields(fields)?),
            _ => Performative::Close(Close::from_fields(fields)?),
        };
        Ok(performative)
    }

    fn name_of(code: u64) -> AppResult<&'static str> {
        match code {
            descriptor::OPEN => Ok(Open::NAME),
            descriptor::BEGIN => Ok(Begin::NAME),
            descriptor::ATTACH => Ok(Attach::NAME),
            descriptor::FLOW => Ok(Flow::NAME),
            descriptor::TRANSFER => Ok(Transfer::NAME),
            descriptor::DISPOSITION => Ok(Disposition::NAME),
            descriptor::DETACH => Ok(Detach::NAME),
            descriptor::END => Ok(End::NAME),
            descriptor::CLOSE => Ok(Close::NAME),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown performative descriptor {:#x}",
                other
            ))),
        }
    }
}

macro_rules! performative_from {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl From<$variant> for Performative {
                fn from(value: $variant) -> Self {
                    Performative::$variant(value)
                }
            }
        )+
    };
}

performative_from!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);
