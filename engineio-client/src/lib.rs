//! An Engine.IO v3 client.
//!
//! Engine.IO is the transport layer beneath Socket.IO: a long-lived,
//! bidirectional packet channel that starts out as HTTP long-polling and
//! transparently upgrades itself to a websocket when both sides support it.
//!
//! The entry point is [`EngineSocket`]. It owns the current
//! [transport](transport), drives the handshake and the ping/pong liveness
//! cycle, and publishes its lifecycle as named events on an
//! [`Observable`]:
//!
//! ```no_run
//! use engineio_client::{Config, EngineArg, EngineSocket};
//! use url::Url;
//!
//! let url = Url::parse("http://localhost:3000").unwrap();
//! let engine = EngineSocket::new(&url, Config::default());
//! engine.events().on(engineio_client::socket::MESSAGE, |arg| {
//!     if let EngineArg::Data(data) = arg {
//!         println!("received: {data:?}");
//!     }
//! });
//! engine.open().unwrap();
//! ```
//!
//! All state mutation for a session runs on a single worker thread (see
//! [`worker`]); callbacks from the HTTP and websocket libraries are handed
//! off to it before they touch session state.

pub mod config;
pub mod errors;
pub mod handshake;
pub mod observable;
pub mod packet;
pub mod parser;
pub mod socket;
pub mod transport;
pub mod worker;

pub use config::Config;
pub use errors::Error;
pub use handshake::HandshakeData;
pub use observable::{Handle, Observable};
pub use packet::{Data, Packet, PacketType};
pub use socket::{EngineArg, EngineSocket};
pub use transport::TransportKind;

/// Engine.IO protocol version spoken by this client, sent as the `EIO`
/// query parameter.
pub const PROTOCOL_VERSION: &str = "3";
