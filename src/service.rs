//! Hub-side channel service — per-channel handler registry and fan-out.
//!
//! DESIGN
//! ======
//! The service owns the hub end of every channel: a map from channel id to an
//! ordered handler list. `tick()` drains the hub inbox and invokes each
//! handler of the delivery's channel with `(sender, bytes)`. Handlers are
//! isolated: a failing handler is logged and the remaining handlers still run.
//!
//! A channel's handler list is removed entirely once its last handler is
//! unregistered, so an idle channel costs nothing at dispatch time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::handler::{HandlerResult, HandlerToken};
use crate::transport::{ChannelId, ConnectionId, Transport, TransportError};

type ChannelHandler = Arc<dyn Fn(ConnectionId, &[u8]) -> HandlerResult + Send + Sync>;

// =============================================================================
// CHANNEL SERVICE
// =============================================================================

struct ServiceInner {
    handlers: HashMap<ChannelId, Vec<(HandlerToken, ChannelHandler)>>,
    ticker: Option<JoinHandle<()>>,
}

pub struct ChannelService {
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<ServiceInner>>,
}

impl ChannelService {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            inner: Arc::new(Mutex::new(ServiceInner { handlers: HashMap::new(), ticker: None })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ServiceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared handle to the transport this service was built over.
    #[must_use]
    pub fn transport_handle(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    // -------------------------------------------------------------------------
    // Channels and handlers
    // -------------------------------------------------------------------------

    /// Open (or resolve) the named channel and register a handler for it.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure when the channel cannot be created.
    pub fn get_or_create_channel<F>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<(ChannelId, HandlerToken), TransportError>
    where
        F: Fn(ConnectionId, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        let token = self.register_message_handler(name, handler)?;
        // register_message_handler just opened or resolved the channel.
        let channel = self
            .transport
            .channel_from_name(name)
            .ok_or_else(|| TransportError::ChannelUnavailable(name.to_owned()))?;
        Ok((channel, token))
    }

    /// Register an additional handler on the named channel, opening the
    /// channel if needed.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure when the channel cannot be created.
    pub fn register_message_handler<F>(&self, name: &str, handler: F) -> Result<HandlerToken, TransportError>
    where
        F: Fn(ConnectionId, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        let channel = self.transport.open_channel(name)?;
        let token = HandlerToken::next();
        self.inner()
            .handlers
            .entry(channel)
            .or_default()
            .push((token, Arc::new(handler)));
        Ok(token)
    }

    /// Remove exactly the handler the token was issued for. Empties out the
    /// channel's handler list when it was the last one. Returns whether
    /// anything was removed.
    pub fn unregister_message_handler(&self, token: HandlerToken) -> bool {
        let mut inner = self.inner();
        let mut removed = false;
        inner.handlers.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(t, _)| *t != token);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Resolve a channel id by name.
    #[must_use]
    pub fn channel_from_name(&self, name: &str) -> Option<ChannelId> {
        self.transport.channel_from_name(name)
    }

    /// Resolve a channel's name from its id.
    #[must_use]
    pub fn channel_name_from_id(&self, id: ChannelId) -> Option<String> {
        self.transport.channel_name_from_id(id)
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send a payload to every connected client of a channel. Returns how
    /// many clients it was queued for.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure for an unknown channel.
    pub fn broadcast(&self, channel: ChannelId, bytes: &[u8]) -> Result<usize, TransportError> {
        self.transport.broadcast(channel, bytes)
    }

    /// Send a payload to one client.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure for an unknown or not-connected
    /// endpoint.
    pub fn send(&self, to: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.transport.send_to_client(to, bytes)
    }

    // -------------------------------------------------------------------------
    // Lifecycle and dispatch
    // -------------------------------------------------------------------------

    /// Spawn a background ticker draining the hub on the given interval.
    /// Requires a Tokio runtime.
    pub fn start(&self, auto_tick: Duration) {
        let transport = Arc::clone(&self.transport);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(auto_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                drain_hub_and_dispatch(&transport, &inner);
            }
        });
        let mut inner = self.inner();
        if let Some(old) = inner.ticker.replace(handle) {
            old.abort();
        }
    }

    /// Abort the background ticker, if any.
    pub fn stop(&self) {
        if let Some(handle) = self.inner().ticker.take() {
            handle.abort();
        }
    }

    /// Stop ticking, drop every handler, and close every channel.
    pub fn close(&self) {
        self.stop();
        let channels: Vec<ChannelId> = {
            let mut inner = self.inner();
            let channels = inner.handlers.keys().copied().collect();
            inner.handlers.clear();
            channels
        };
        for channel in channels {
            self.transport.close_channel(channel);
        }
        debug!("channel service closed");
    }

    /// Drain the hub inbox and dispatch every pending delivery.
    pub fn tick(&self) {
        drain_hub_and_dispatch(&self.transport, &self.inner);
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, channel: ChannelId) -> usize {
        self.inner().handlers.get(&channel).map_or(0, Vec::len)
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

fn drain_hub_and_dispatch(transport: &Arc<dyn Transport>, inner: &Mutex<ServiceInner>) {
    for delivery in transport.drain_hub() {
        let handlers = inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(&delivery.channel)
            .cloned()
            .unwrap_or_default();

        for (token, handler) in &handlers {
            if let Err(e) = handler(delivery.sender, &delivery.bytes) {
                warn!(
                    channel = %delivery.channel,
                    sender = %delivery.sender,
                    %token,
                    error = %e,
                    "channel handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "service_test.rs"]
mod tests;
