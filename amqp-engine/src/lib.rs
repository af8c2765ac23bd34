//! AMQP 1.0 connection, session and link engine.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`]: performatives and the frame envelope.
//! - [`transport`]: resumable frame reads and queued frame writes.
//! - [`delivery`] and [`link`]: unsettled windows and credit accounting.
//! - [`session`]: link multiplexing and delivery ids.
//! - [`connection`]: frame dispatch and the per-connection read loop.
//! - [`server`] and [`client`]: threads and sockets around the above.
//!
//! Applications plug in through [`factory::LinkFactory`]; the bundled
//! [`QueueRegistry`] serves in-memory queues.

pub mod client;
pub mod connection;
pub mod delivery;
pub mod factory;
pub mod link;
pub mod net;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

mod trace;

pub use client::{Client, ClientConfig, ClientError, ReceiverId, SenderId};
pub use connection::{Connection, ConnectionConfig, ConnectionError, ConnectionHandler, Pump};
pub use delivery::{DeliveryRecord, Settlement, UnsettledWindow};
pub use factory::{LinkFactory, MessageSink, MessageSource, QueueRegistry};
pub use server::{Server, ServerConfig, ServerError};
pub use session::{Session, SessionConfig, SessionError};
pub use trace::init_tracing;
