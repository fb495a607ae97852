#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use stoneamqp::protocol::{
    decode_frame, encode_frame, AmqpError, Begin, DeliveryState, Frame, Open, Performative,
    AMQP_HEADER,
};
use stoneamqp::{
    AmqpConfig, ByteCursor, Connection, ConnectionEvent, Container, Delivery, LinkInfo,
    MemoryContainer, MemoryTransport,
};

/// Everything the engine told the container, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerCall {
    Attach(String),
    Transfer(String, Bytes),
    Disposition(u32, Option<DeliveryState>, bool),
    Detach(String, Option<AmqpError>),
}

pub struct RecordingContainer {
    inner: MemoryContainer,
    pub calls: Mutex<Vec<ContainerCall>>,
}

impl RecordingContainer {
    pub fn new(credit_window: u32) -> Self {
        RecordingContainer {
            inner: MemoryContainer::new("test-broker", credit_window),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, address: &str, payload: &'static [u8]) {
        self.inner.publish(address, Bytes::from_static(payload));
    }

    pub fn queue_len(&self, address: &str) -> usize {
        self.inner.queue_len(address)
    }

    pub fn calls(&self) -> Vec<ContainerCall> {
        self.calls.lock().clone()
    }
}

impl Container for RecordingContainer {
    fn container_id(&self) -> &str {
        self.inner.container_id()
    }

    fn on_attach(&self, link: &LinkInfo) -> Result<u32, AmqpError> {
        self.calls.lock().push(ContainerCall::Attach(link.name.clone()));
        self.inner.on_attach(link)
    }

    fn on_transfer(&self, link: &LinkInfo, delivery: &Delivery) -> Option<DeliveryState> {
        self.calls.lock().push(ContainerCall::Transfer(
            link.name.clone(),
            delivery.payload.clone(),
        ));
        self.inner.on_transfer(link, delivery)
    }

    fn next_message(&self, link: &LinkInfo) -> Option<Bytes> {
        self.inner.next_message(link)
    }

    fn on_disposition(
        &self,
        link: &LinkInfo,
        delivery_id: u32,
        state: Option<&DeliveryState>,
        settled: bool,
    ) {
        self.calls.lock().push(ContainerCall::Disposition(
            delivery_id,
            state.cloned(),
            settled,
        ));
        self.inner.on_disposition(link, delivery_id, state, settled)
    }

    fn on_detach(&self, link: &LinkInfo, error: Option<&AmqpError>) {
        self.calls
            .lock()
            .push(ContainerCall::Detach(link.name.clone(), error.cloned()));
        self.inner.on_detach(link, error)
    }
}

pub fn encode(channel: u16, performative: impl Into<Performative>) -> Vec<u8> {
    encode_with_payload(channel, performative, None)
}

pub fn encode_with_payload(
    channel: u16,
    performative: impl Into<Performative>,
    payload: Option<&[u8]>,
) -> Vec<u8> {
    let mut cursor = ByteCursor::growable(128);
    encode_frame(&mut cursor, channel, Some(&performative.into()), payload);
    cursor.readable().to_vec()
}

/// Decodes every frame in `bytes`, skipping a leading protocol header.
pub fn decode_all(bytes: &[u8]) -> Vec<Frame> {
    let body = if bytes.starts_with(b"AMQP") {
        &bytes[8..]
    } else {
        bytes
    };
    let mut cursor = ByteCursor::from_slice(body);
    let mut frames = Vec::new();
    while cursor.readable_len() > 0 {
        frames.push(decode_frame(&mut cursor, u32::MAX).unwrap());
    }
    frames
}

/// The remote end of a connection under test.
pub struct Peer {
    pub connection: Connection<MemoryTransport>,
    pub container: Arc<RecordingContainer>,
    pub now: Instant,
}

impl Peer {
    pub fn new(config: AmqpConfig) -> Self {
        let container = Arc::new(RecordingContainer::new(config.link_credit));
        Peer {
            connection: Connection::new(config, MemoryTransport::new(), container.clone()),
            container,
            now: Instant::now(),
        }
    }

    /// A peer whose connection is already OPENED, with output and events
    /// drained.
    pub fn opened(config: AmqpConfig) -> Self {
        let mut peer = Peer::new(config);
        peer.send_raw(&AMQP_HEADER);
        peer.send(
            0,
            Open {
                container_id: "client".to_string(),
                ..Default::default()
            },
        );
        peer.take_written();
        peer.events();
        peer
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.connection.receive(bytes, self.now);
    }

    pub fn send(&mut self, channel: u16, performative: impl Into<Performative>) {
        let bytes = encode(channel, performative);
        self.send_raw(&bytes);
    }

    pub fn send_with_payload(
        &mut self,
        channel: u16,
        performative: impl Into<Performative>,
        payload: &[u8],
    ) {
        let bytes = encode_with_payload(channel, performative, Some(payload));
        self.send_raw(&bytes);
    }

    pub fn take_written(&mut self) -> Bytes {
        self.connection.transport_mut().take_written()
    }

    pub fn frames(&mut self) -> Vec<Frame> {
        let written = self.take_written();
        decode_all(&written)
    }

    pub fn performatives(&mut self) -> Vec<(u16, Performative)> {
        self.frames()
            .into_iter()
            .filter_map(|frame| frame.performative.map(|p| (frame.channel, p)))
            .collect()
    }

    pub fn events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.connection.poll_event() {
            events.push(event);
        }
        events
    }

    /// Begins a session from the peer on `remote_channel` and returns the
    /// local channel the engine answered on.
    pub fn begin(&mut self, remote_channel: u16) -> u16 {
        self.send(
            remote_channel,
            Begin {
                incoming_window: 100,
                outgoing_window: 100,
                ..Default::default()
            },
        );
        match self.performatives().as_slice() {
            [(local, Performative::Begin(reply))] => {
                assert_eq!(reply.remote_channel, Some(remote_channel));
                *local
            }
            other => panic!("expected a Begin reply, got {:?}", other),
        }
    }
}
