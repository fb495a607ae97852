//! Sans-io AMQP 1.0 endpoint state machines.
//!
//! A [`Connection`] owns its sessions through a channel table and each
//! [`Session`] owns its links through a handle table. Inbound bytes are pushed
//! into the connection, outbound frames leave through a [`Transport`], and the
//! application takes part through the [`Container`] trait and the
//! [`ConnectionEvent`] queue.

pub use connection::{Connection, ConnectionState};
pub use container::{Container, Delivery, LinkInfo, MemoryContainer};
pub use event::ConnectionEvent;
pub use link::{Link, LinkState};
pub use session::{Session, SessionState};
pub use transport::{MemoryTransport, Transport};

mod connection;
mod container;
mod event;
mod link;
mod session;
mod transport;
