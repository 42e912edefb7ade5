//! In-process transport — every endpoint lives in one process.
//!
//! DESIGN
//! ======
//! A mutex-guarded table of channels and client slots. Each client owns a
//! bounded inbox; the hub owns one bounded inbox fed by every client. Sends
//! into a full inbox drop the new payload with a structured warning, so a
//! stalled consumer cannot wedge its producers.
//!
//! Opening a client auto-creates its channel entry: endpoint startup order
//! does not matter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::transport::{ChannelId, ConnectionId, HubDelivery, Transport, TransportError};

const DEFAULT_CLIENT_INBOX_CAPACITY: usize = 256;
const DEFAULT_HUB_INBOX_CAPACITY: usize = 1024;

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// STATE
// =============================================================================

struct ClientSlot {
    channel: ChannelId,
    connected: bool,
    inbox: VecDeque<Vec<u8>>,
}

struct HubState {
    next_channel: u32,
    next_connection: u32,
    /// Channel name → id. Ids stay unique for the transport's lifetime.
    channels: HashMap<String, ChannelId>,
    clients: HashMap<ConnectionId, ClientSlot>,
    hub_inbox: VecDeque<HubDelivery>,
}

// =============================================================================
// TRANSPORT
// =============================================================================

pub struct MemoryTransport {
    state: Mutex<HubState>,
    client_inbox_capacity: usize,
    hub_inbox_capacity: usize,
}

impl MemoryTransport {
    /// Create a transport with env-tunable inbox capacities
    /// (`BUS_CLIENT_INBOX_CAPACITY`, `BUS_HUB_INBOX_CAPACITY`).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacities(
            env_parse("BUS_CLIENT_INBOX_CAPACITY", DEFAULT_CLIENT_INBOX_CAPACITY),
            env_parse("BUS_HUB_INBOX_CAPACITY", DEFAULT_HUB_INBOX_CAPACITY),
        )
    }

    /// Create a transport with explicit inbox capacities.
    #[must_use]
    pub fn with_capacities(client_inbox_capacity: usize, hub_inbox_capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                next_channel: 1,
                next_connection: 1,
                channels: HashMap::new(),
                clients: HashMap::new(),
                hub_inbox: VecDeque::new(),
            }),
            client_inbox_capacity,
            hub_inbox_capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_channel_locked(state: &mut HubState, name: &str) -> Result<ChannelId, TransportError> {
        if name.is_empty() {
            return Err(TransportError::ChannelUnavailable(name.to_owned()));
        }
        if let Some(id) = state.channels.get(name) {
            return Ok(*id);
        }
        let id = ChannelId(state.next_channel);
        state.next_channel += 1;
        state.channels.insert(name.to_owned(), id);
        Ok(id)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn channel_from_name(&self, name: &str) -> Option<ChannelId> {
        self.state().channels.get(name).copied()
    }

    fn channel_name_from_id(&self, id: ChannelId) -> Option<String> {
        let state = self.state();
        state
            .channels
            .iter()
            .find(|(_, channel)| **channel == id)
            .map(|(name, _)| name.clone())
    }

    fn open_channel(&self, name: &str) -> Result<ChannelId, TransportError> {
        Self::open_channel_locked(&mut self.state(), name)
    }

    fn close_channel(&self, id: ChannelId) {
        let mut state = self.state();
        state.channels.retain(|_, channel| *channel != id);
        for slot in state.clients.values_mut() {
            if slot.channel == id {
                slot.connected = false;
                slot.inbox.clear();
            }
        }
    }

    fn open_client(&self, channel_name: &str) -> Result<ConnectionId, TransportError> {
        let mut state = self.state();
        let channel = Self::open_channel_locked(&mut state, channel_name)?;
        let id = ConnectionId(state.next_connection);
        state.next_connection += 1;
        state
            .clients
            .insert(id, ClientSlot { channel, connected: false, inbox: VecDeque::new() });
        Ok(id)
    }

    fn connect(&self, id: ConnectionId) -> Result<(), TransportError> {
        let mut state = self.state();
        let Some(slot) = state.clients.get_mut(&id) else {
            return Err(TransportError::UnknownConnection(id));
        };
        slot.connected = true;
        Ok(())
    }

    fn is_connected(&self, id: ConnectionId) -> bool {
        self.state().clients.get(&id).is_some_and(|slot| slot.connected)
    }

    fn close_client(&self, id: ConnectionId) {
        self.state().clients.remove(&id);
    }

    fn send_to_hub(&self, from: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state();
        let Some(slot) = state.clients.get(&from) else {
            return Err(TransportError::UnknownConnection(from));
        };
        if !slot.connected {
            return Err(TransportError::NotConnected(from));
        }
        let channel = slot.channel;

        if state.hub_inbox.len() >= self.hub_inbox_capacity {
            warn!(sender = %from, %channel, "hub inbox full; dropping payload");
            return Ok(());
        }
        state.hub_inbox.push_back(HubDelivery { channel, sender: from, bytes });
        Ok(())
    }

    fn send_to_client(&self, to: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state();
        let Some(slot) = state.clients.get_mut(&to) else {
            return Err(TransportError::UnknownConnection(to));
        };
        if !slot.connected {
            return Err(TransportError::NotConnected(to));
        }
        if slot.inbox.len() >= self.client_inbox_capacity {
            warn!(client = %to, "client inbox full; dropping payload");
            return Ok(());
        }
        slot.inbox.push_back(bytes);
        Ok(())
    }

    fn broadcast(&self, channel: ChannelId, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if !state.channels.values().any(|id| *id == channel) {
            return Err(TransportError::UnknownChannel(channel));
        }

        let mut reached = 0;
        for (id, slot) in &mut state.clients {
            if slot.channel != channel || !slot.connected {
                continue;
            }
            if slot.inbox.len() >= self.client_inbox_capacity {
                warn!(client = %id, %channel, "client inbox full; dropping broadcast payload");
                continue;
            }
            slot.inbox.push_back(bytes.to_vec());
            reached += 1;
        }
        Ok(reached)
    }

    fn drain_client(&self, id: ConnectionId) -> Vec<Vec<u8>> {
        let mut state = self.state();
        let Some(slot) = state.clients.get_mut(&id) else {
            return Vec::new();
        };
        slot.inbox.drain(..).collect()
    }

    fn drain_hub(&self) -> Vec<HubDelivery> {
        self.state().hub_inbox.drain(..).collect()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
