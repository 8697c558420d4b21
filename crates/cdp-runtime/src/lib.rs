//! CDP Runtime - connection multiplexing, target sessions, and event dispatch
//!
//! This crate provides the low-level plumbing for driving a browser over the
//! Chrome DevTools Protocol:
//!
//! - **Transport**: bidirectional communication over WebSocket (or an
//!   in-memory loopback for tests)
//! - **Connection**: command/reply correlation and demultiplexing of one
//!   physical channel across many logical targets
//! - **Session**: target-scoped command/event surface with the
//!   Open → Crashed/Closed lifecycle
//! - **Event emitter**: pub/sub fan-out with cancellable subscriptions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ domain layer │  Browser, Page, Frame objects (out of scope here)
//! └──────┬───────┘
//!        │ execute / on
//! ┌──────▼───────┐
//! │   Session    │  per-target surface, lifecycle state machine
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │  Connection  │  id allocation, pending table, session registry
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │  Transport   │  ordered duplex message channel
//! └──────────────┘
//! ```
//!
//! Every outbound command carries a connection-unique id; inbound envelopes
//! are routed by field presence (`id` ⇒ reply, `method` ⇒ event) and by
//! session id. A single malformed message never tears down the connection;
//! transport failure closes every session and resolves every in-flight
//! command with a connection-closed error.

pub mod connection;
pub mod emitter;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

// Re-export key types at crate root
pub use connection::Connection;
pub use emitter::{DEFAULT_QUEUE_CAPACITY, Event, EventEmitter, Subscription, WILDCARD};
pub use error::{Error, Result};
pub use message::{Message, MessageKind, RemoteError, SessionId, TargetId};
pub use session::{Session, SessionState};
pub use transport::{
    LoopbackPeer, Transport, TransportParts, TransportReceiver, WebSocketTransport, loopback,
};
