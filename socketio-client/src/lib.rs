//! A Socket.IO client.
//!
//! Builds on [`engineio_client`] for the transport layer (HTTP long-polling
//! with a transparent websocket upgrade) and adds the Socket.IO semantics
//! on top: namespaces multiplexed over one connection, named events with
//! JSON-plus-binary payloads, per-emit acknowledgements, and automatic
//! reconnection with randomized exponential backoff.
//!
//! ## Example
//!
//! ```no_run
//! use socketio_client::{io, Value};
//!
//! let socket = io::of("http://localhost:3000/admin")
//!     .unwrap()
//!     .query("token", "abc123")
//!     .socket();
//!
//! socket.on(socketio_client::socket::CONNECT, |_| {
//!     println!("connected");
//! });
//! socket.on("chat-message", |args| {
//!     println!("received: {:?}", args.data);
//!     if let Some(ack) = &args.ack {
//!         ack.send(vec![Value::from("seen")]);
//!     }
//! });
//!
//! socket.connect().unwrap();
//! socket.emit_with_ack("join", vec![Value::from("room-1")], |reply| {
//!     println!("server replied: {reply:?}");
//! });
//! ```
//!
//! The URL path is the *namespace*; the request path defaults to
//! `/socket.io/` and is set with [`IO::path`](io::IO::path). Sockets for
//! the same host and path share one connection unless
//! [`no_multiplex`](io::IO::no_multiplex) is used.

pub mod config;
pub mod errors;
pub mod io;
pub mod manager;
pub mod packet;
pub mod parser;
pub mod socket;
mod state;
pub mod value;

pub use config::ClientConfig;
pub use errors::Error;
pub use io::{of, IO};
pub use manager::Manager;
pub use packet::{Packet, Type};
pub use socket::{AckSender, Socket, SocketArgs};
pub use value::Value;

pub use engineio_client;
