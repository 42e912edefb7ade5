//! procbus — named channels and a request/response event protocol for
//! cooperating endpoints.
//!
//! ARCHITECTURE
//! ============
//! Three layers, bottom up:
//! - [`transport`]: the connection seam (`Transport`), with [`memory`]
//!   providing the in-process implementation.
//! - [`client`] / [`service`]: the channel layer — client endpoints and the
//!   hub-side per-channel handler registry.
//! - [`events`]: the protocol layer — fire-and-forget events plus the
//!   request/ack/execute/result handshake, over one reserved channel.
//!
//! Dispatch is cooperative and tick-driven: each participant drains its own
//! inbox, processing one message fully before the next. Registries live
//! behind mutexes so a multi-threaded host is safe; no lock is held across a
//! handler invocation or a transport send.

pub mod client;
pub mod events;
pub mod handler;
pub mod memory;
pub mod service;
pub mod transport;

pub use client::{ChannelClient, ClientPool};
pub use events::{
    EVENTS_CHANNEL, EventService, RequestError, RequestFuture, RequestOptions, WILDCARD_EVENT,
    install_event_relay,
};
pub use handler::{HandlerError, HandlerResult, HandlerToken};
pub use memory::MemoryTransport;
pub use service::ChannelService;
pub use transport::{ChannelId, ConnectionId, HubDelivery, Transport, TransportError};
