//! Client endpoint of a named channel.
//!
//! DESIGN
//! ======
//! A `ChannelClient` owns one connection and multiplexes inbound bytes to its
//! registered handlers. Dispatch is pull-based: `tick()` drains the transport
//! and processes one message at a time. Handler lists are cloned out of the
//! lock before invocation, so a handler may register, unregister, or send
//! from inside its callback.
//!
//! `ClientPool` is the per-process registry: at most one client exists per
//! channel name, and `get_or_create` returns the shared instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::handler::{HandlerResult, HandlerToken};
use crate::transport::{ConnectionId, Transport, TransportError};

type StringHandler = Arc<dyn Fn(&str) -> HandlerResult + Send + Sync>;
type BinaryHandler = Arc<dyn Fn(&[u8]) -> HandlerResult + Send + Sync>;

// =============================================================================
// CHANNEL CLIENT
// =============================================================================

struct ClientInner {
    string_handlers: Vec<(HandlerToken, StringHandler)>,
    binary_handlers: Vec<(HandlerToken, BinaryHandler)>,
    ticker: Option<JoinHandle<()>>,
}

pub struct ChannelClient {
    name: String,
    connection: ConnectionId,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<ClientInner>>,
}

impl ChannelClient {
    fn new(name: String, connection: ConnectionId, transport: Arc<dyn Transport>) -> Self {
        Self {
            name,
            connection,
            transport,
            inner: Arc::new(Mutex::new(ClientInner {
                string_handlers: Vec::new(),
                binary_handlers: Vec::new(),
                ticker: None,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel name this client is bound to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport-assigned connection id.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    /// Register a handler invoked with each inbound message decoded as UTF-8.
    pub fn register_string_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&str) -> HandlerResult + Send + Sync + 'static,
    {
        let token = HandlerToken::next();
        self.inner().string_handlers.push((token, Arc::new(handler)));
        token
    }

    /// Register a handler invoked with each inbound message's raw bytes.
    pub fn register_binary_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        let token = HandlerToken::next();
        self.inner().binary_handlers.push((token, Arc::new(handler)));
        token
    }

    /// Remove exactly the handler the token was issued for. Returns whether
    /// anything was removed.
    pub fn unregister_handler(&self, token: HandlerToken) -> bool {
        let mut inner = self.inner();
        let before = inner.string_handlers.len() + inner.binary_handlers.len();
        inner.string_handlers.retain(|(t, _)| *t != token);
        inner.binary_handlers.retain(|(t, _)| *t != token);
        before != inner.string_handlers.len() + inner.binary_handlers.len()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send raw bytes to the hub.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure (unknown or not-connected endpoint).
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.transport.send_to_hub(self.connection, bytes.into())
    }

    /// Send a text payload to the hub.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure (unknown or not-connected endpoint).
    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(text.as_bytes().to_vec())
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect the endpoint.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure for an unknown endpoint.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.transport.connect(self.connection)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected(self.connection)
    }

    /// Connect and, when `auto_tick` is set, spawn a background ticker that
    /// drains the transport on that interval. Requires a Tokio runtime when
    /// `auto_tick` is set.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure for an unknown endpoint.
    pub fn start(&self, auto_tick: Option<Duration>) -> Result<(), TransportError> {
        self.connect()?;
        if let Some(period) = auto_tick {
            let transport = Arc::clone(&self.transport);
            let connection = self.connection;
            let name = self.name.clone();
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    drain_and_dispatch(&transport, connection, &name, &inner);
                }
            });
            let mut inner = self.inner();
            if let Some(old) = inner.ticker.replace(handle) {
                old.abort();
            }
        }
        Ok(())
    }

    /// Abort the background ticker, if any.
    pub fn stop(&self) {
        if let Some(handle) = self.inner().ticker.take() {
            handle.abort();
        }
    }

    /// Stop ticking, drop every handler, and release the transport endpoint.
    pub fn close(&self) {
        self.stop();
        {
            let mut inner = self.inner();
            inner.string_handlers.clear();
            inner.binary_handlers.clear();
        }
        self.transport.close_client(self.connection);
        debug!(channel = %self.name, connection = %self.connection, "channel client closed");
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Drain the transport and dispatch every pending inbound message.
    pub fn tick(&self) {
        drain_and_dispatch(&self.transport, self.connection, &self.name, &self.inner);
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        let inner = self.inner();
        inner.string_handlers.len() + inner.binary_handlers.len()
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

fn drain_and_dispatch(
    transport: &Arc<dyn Transport>,
    connection: ConnectionId,
    name: &str,
    inner: &Mutex<ClientInner>,
) {
    for bytes in transport.drain_client(connection) {
        dispatch_payload(name, inner, &bytes);
    }
}

fn dispatch_payload(name: &str, inner: &Mutex<ClientInner>, bytes: &[u8]) {
    // Clone the handler lists out of the lock: a handler may register,
    // unregister, or send from inside its callback.
    let (string_handlers, binary_handlers) = {
        let guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        (guard.string_handlers.clone(), guard.binary_handlers.clone())
    };

    // Decode UTF-8 at most once, and only when someone wants text.
    if !string_handlers.is_empty() {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                for (token, handler) in &string_handlers {
                    if let Err(e) = handler(text) {
                        warn!(channel = %name, %token, error = %e, "string handler failed");
                    }
                }
            }
            Err(e) => {
                warn!(channel = %name, error = %e, "inbound payload is not utf-8; skipping string handlers");
            }
        }
    }

    for (token, handler) in &binary_handlers {
        if let Err(e) = handler(bytes) {
            warn!(channel = %name, %token, error = %e, "binary handler failed");
        }
    }
}

// =============================================================================
// CLIENT POOL
// =============================================================================

/// Per-process client registry: one `ChannelClient` per channel name.
pub struct ClientPool {
    transport: Arc<dyn Transport>,
    clients: Mutex<HashMap<String, Arc<ChannelClient>>>,
}

impl ClientPool {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, clients: Mutex::new(HashMap::new()) }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared handle to the transport this pool was built over.
    #[must_use]
    pub fn transport_handle(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Return the singleton client for a channel name, creating it on first
    /// use.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure when the endpoint cannot be created.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<ChannelClient>, TransportError> {
        let mut clients = self.clients();
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }
        let connection = self.transport.open_client(name)?;
        let client = Arc::new(ChannelClient::new(name.to_owned(), connection, Arc::clone(&self.transport)));
        clients.insert(name.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    /// Look up an existing client by channel name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ChannelClient>> {
        self.clients().get(name).cloned()
    }

    /// Look up an existing client by its connection id.
    #[must_use]
    pub fn find(&self, connection: ConnectionId) -> Option<Arc<ChannelClient>> {
        self.clients()
            .values()
            .find(|client| client.connection() == connection)
            .cloned()
    }

    /// Tick every client in the pool.
    pub fn tick_all(&self) {
        let clients: Vec<Arc<ChannelClient>> = self.clients().values().cloned().collect();
        for client in clients {
            client.tick();
        }
    }

    /// Close and remove one client. Returns whether it existed.
    pub fn close(&self, name: &str) -> bool {
        let Some(client) = self.clients().remove(name) else {
            return false;
        };
        client.close();
        true
    }

    /// Close every client and empty the pool.
    pub fn shutdown(&self) {
        let clients: Vec<Arc<ChannelClient>> = self.clients().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close();
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
