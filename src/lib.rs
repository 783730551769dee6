//! # framelink
//!
//! A frame-based TCP messaging layer: an abstract client/server transport
//! that turns a raw or TLS-secured byte stream into discrete, identifiable
//! messages, and back. Higher-level components exchange opaque payloads
//! through it without ever touching socket plumbing.
//!
//! ## What it owns
//!
//! - Connection lifecycle for outbound ([`SocketClient`]) and inbound
//!   ([`SocketServer`]) connections
//! - Optional TLS negotiation beneath the framing layer ([`tls`])
//! - Wire framing with correlation identifiers ([`message`])
//! - Two delivery disciplines per connection ([`DeliveryMode`]): direct
//!   blocking receive and queued asynchronous receive
//!
//! ## What it does not do
//!
//! No content routing, no request/response dispatch, no persistence, no
//! retries. Payloads are opaque bytes; interpretation belongs to the
//! collaborator calling `send`/`receive`.

pub mod client;
pub mod error;
pub mod handler;
pub mod message;
pub mod queue;
pub mod server;
pub mod stream;
pub mod tls;

pub use client::SocketClient;
pub use error::TransportError;
pub use handler::{ClientHandler, DeliveryMode, HandlerOptions, HandlerState};
pub use message::{
    BasicHeaderCodec, ClientUid, HeaderCodec, Message, MessageHeader, MessageUid,
};
pub use queue::ReceiveQueue;
pub use server::SocketServer;
pub use stream::TransportStream;
pub use tls::{TlsClientConfig, TlsServerConfig};
