//! AMQP 1.0 wire format.
//!
//! - `header`: the 8-byte protocol header exchanged before any frame
//! - `types`: the AMQP value encoding used for performative fields
//! - `performatives`: Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End,
//!   Close and the composites they carry
//! - `frame`: the frame envelope (size, data offset, type, channel)

pub use frame::{
    check_frame_size, decode_frame, decode_frame_header, encode_frame, frame_overhead, Frame,
    FrameHeader, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP, FRAME_TYPE_SASL, MIN_MAX_FRAME_SIZE,
};
pub use header::{ProtocolHeader, ProtocolId, AMQP_HEADER, AMQP_MAGIC, PROTOCOL_HEADER_SIZE};
pub use performatives::{
    condition, descriptor, AmqpError, Attach, Begin, Close, Composite, DeliveryState, Detach,
    Disposition, End, FieldMap, Flow, Open, Performative, ReceiverSettleMode, Role,
    SenderSettleMode, Source, Target, Transfer,
};
pub use types::{Symbol, Value};

mod frame;
mod header;
mod performatives;
pub mod types;
