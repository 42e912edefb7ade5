//! Transport seam — the external connection layer the bus is built over.
//!
//! ARCHITECTURE
//! ============
//! The bus never talks to a concrete transport directly; every layer holds an
//! `Arc<dyn Transport>`. One hub owns the channels; any number of client
//! endpoints bind to a channel by name. Delivery is pull-based: the hub and
//! each client drain their own inboxes on tick, so one message is fully
//! dispatched before the next is considered.

use std::fmt;

// =============================================================================
// IDS
// =============================================================================

/// Opaque id of a named channel, assigned by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque id of one client endpoint, assigned by the transport.
///
/// Doubles as the `senderId` stamped on every wire envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport refused to create a channel with this name.
    #[error("channel `{0}` cannot be created")]
    ChannelUnavailable(String),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The endpoint exists but has not connected yet (or was closed).
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),
}

// =============================================================================
// DELIVERY
// =============================================================================

/// One message drained from the hub side of the transport.
#[derive(Clone, Debug)]
pub struct HubDelivery {
    /// Channel the sending endpoint is bound to.
    pub channel: ChannelId,
    /// Originating endpoint.
    pub sender: ConnectionId,
    /// Raw payload.
    pub bytes: Vec<u8>,
}

// =============================================================================
// TRAIT
// =============================================================================

/// Connection primitives the bus is layered over.
///
/// Implementations must be safe to call from multiple threads; the bus holds
/// no lock while calling into the transport.
pub trait Transport: Send + Sync {
    /// Resolve an existing channel id by name.
    fn channel_from_name(&self, name: &str) -> Option<ChannelId>;

    /// Resolve a channel's name from its id.
    fn channel_name_from_id(&self, id: ChannelId) -> Option<String>;

    /// Create the hub-side channel with the given name, or return the
    /// existing one.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelUnavailable`] if the channel cannot
    /// be created.
    fn open_channel(&self, name: &str) -> Result<ChannelId, TransportError>;

    /// Tear down a channel and disconnect its clients.
    fn close_channel(&self, id: ChannelId);

    /// Create a client endpoint bound to the named channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelUnavailable`] if the channel cannot
    /// be resolved or created.
    fn open_client(&self, channel_name: &str) -> Result<ConnectionId, TransportError>;

    /// Mark a client endpoint as connected.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownConnection`] for an id this transport
    /// never issued (or already closed).
    fn connect(&self, id: ConnectionId) -> Result<(), TransportError>;

    fn is_connected(&self, id: ConnectionId) -> bool;

    /// Release a client endpoint. Pending inbound messages are discarded.
    fn close_client(&self, id: ConnectionId);

    /// Client → hub.
    ///
    /// # Errors
    ///
    /// Fails for unknown or not-yet-connected endpoints.
    fn send_to_hub(&self, from: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Hub → one client.
    ///
    /// # Errors
    ///
    /// Fails for unknown or not-yet-connected endpoints.
    fn send_to_client(&self, to: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Hub → every connected client of a channel. Returns how many clients
    /// the payload was queued for.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownChannel`] for a channel this
    /// transport never issued.
    fn broadcast(&self, channel: ChannelId, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Drain pending inbound bytes for one client endpoint.
    fn drain_client(&self, id: ConnectionId) -> Vec<Vec<u8>>;

    /// Drain pending inbound messages on the hub side.
    fn drain_hub(&self) -> Vec<HubDelivery>;
}
