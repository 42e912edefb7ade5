//! Event service — request/response protocol over the reserved `events`
//! channel.
//!
//! ARCHITECTURE
//! ============
//! Every endpoint runs one `EventService` over its own `ChannelClient`; the
//! hub relays every payload on the `events` channel to every client (see
//! [`install_event_relay`]), and receivers drop their own echoes by sender id.
//!
//! A remote request is a four-message handshake: `request` probes for an
//! endpoint holding a matching handler, `requestAck` volunteers one,
//! `requestExecute` replays the full payload to the volunteer, and
//! `requestResult` carries the handler results back. The probe is cheap on
//! purpose: the payload only travels once a responder has committed.
//!
//! LIFECYCLE
//! =========
//! 1. `request` sent → pending entry tracked by event type
//! 2. Concurrent callers for the same type coalesce onto the entry, each with
//!    its own completion promise and deadline
//! 3. Ack marks the entry acknowledged and triggers the execute replay
//! 4. Result resolves every promise; unacknowledged promises time out
//!    individually on tick
//!
//! ERROR HANDLING
//! ==============
//! Malformed inbound payloads are logged and dropped, never fatal. Handler
//! failures are isolated: logged, and for the synchronous local-request path
//! surfaced as a rejection. A correlation mismatch drops the stale entry and
//! rejects its promises as superseded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use envelope::{
    DataInfo, Envelope, EventArg, MessageKind, decode_args, decode_envelope, encode_args,
    encode_envelope,
};

use crate::client::{ChannelClient, ClientPool};
use crate::handler::{HandlerError, HandlerToken};
use crate::service::ChannelService;
use crate::transport::{ChannelId, ConnectionId, Transport, TransportError};

/// Channel name reserved for the event protocol.
pub const EVENTS_CHANNEL: &str = "events";

/// Listeners registered under this event type observe every emitted event.
pub const WILDCARD_EVENT: &str = "*";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 700;
const CONNECT_POLL_TICKS: u32 = 100;
const CONNECT_POLL_SLEEP_MS: u64 = 10;

/// How long responder-side ack bookkeeping survives without a matching
/// execute before it is pruned.
const ACK_RETENTION: Duration = Duration::from_secs(30);

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
// TYPES
// =============================================================================

/// Event/request handler. Returning `Ok(Some(value))` contributes one entry
/// to a request's result array; `Ok(None)` contributes nothing.
type EventHandler = Arc<dyn Fn(&str, &[Value]) -> Result<Option<Value>, HandlerError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request `{event_type}` timed out after {timeout_ms}ms")]
    Timeout { event_type: String, timeout_ms: u64 },
    #[error("request `{event_type}` was cancelled: {message}")]
    Cancelled { event_type: String, message: String },
    #[error("request `{event_type}` was superseded by a newer request")]
    Superseded { event_type: String },
    #[error("local handler failed for `{event_type}`: {message}")]
    Handler { event_type: String, message: String },
    #[error("result payload for `{event_type}` could not be decoded: {message}")]
    Payload { event_type: String, message: String },
    #[error("transport send failed for `{event_type}`: {message}")]
    Transport { event_type: String, message: String },
    #[error("event service closed before `{event_type}` resolved")]
    Closed { event_type: String },
}

/// Per-request knobs.
#[derive(Clone, Copy, Debug)]
pub struct RequestOptions {
    /// How long to wait for a `requestAck` before rejecting.
    pub timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS) }
    }
}

/// Completion of one [`EventService::request`] call.
pub struct RequestFuture {
    event_type: String,
    rx: oneshot::Receiver<Result<Vec<Value>, RequestError>>,
}

impl Future for RequestFuture {
    type Output = Result<Vec<Value>, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(RequestError::Closed { event_type: this.event_type.clone() }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One caller waiting on an in-flight request.
struct PromiseSlot {
    tx: oneshot::Sender<Result<Vec<Value>, RequestError>>,
    deadline: Instant,
    timeout: Duration,
}

/// One in-flight outbound request, shared by every caller of its event type.
struct PendingRequest {
    id: u64,
    acknowledged: bool,
    started: Instant,
    /// Already-encoded payload, replayed verbatim in `requestExecute`.
    data: Vec<Value>,
    data_infos: Option<Vec<DataInfo>>,
    promises: Vec<PromiseSlot>,
}

/// Responder-side record of a `requestId` we acknowledged. Only ids in this
/// table are executed: that is what addresses `requestExecute` to the
/// acknowledging endpoint on a broadcast wire.
struct AckedRequest {
    event_type: String,
    at: Instant,
}

struct EventsInner {
    handlers: HashMap<String, Vec<(HandlerToken, EventHandler)>>,
    pending: HashMap<String, PendingRequest>,
    acked_remote: HashMap<u64, AckedRequest>,
    next_request_id: u64,
    ticker: Option<JoinHandle<()>>,
}

impl EventsInner {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pending: HashMap::new(),
            acked_remote: HashMap::new(),
            next_request_id: 1,
            ticker: None,
        }
    }
}

fn lock_inner(inner: &Mutex<EventsInner>) -> MutexGuard<'_, EventsInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// EVENT SERVICE
// =============================================================================

pub struct EventService {
    client: Arc<ChannelClient>,
    connection: ConnectionId,
    inner: Arc<Mutex<EventsInner>>,
    default_timeout: Duration,
}

impl EventService {
    /// Create the endpoint's event service over the pool's `events` client.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure when the client cannot be created.
    pub fn new(pool: &ClientPool) -> Result<Self, TransportError> {
        let client = pool.get_or_create(EVENTS_CHANNEL)?;
        let transport = pool.transport_handle();
        let connection = client.connection();
        let inner = Arc::new(Mutex::new(EventsInner::new()));

        let dispatch_inner = Arc::clone(&inner);
        let dispatch_transport = Arc::clone(&transport);
        client.register_binary_handler(move |bytes| {
            incoming(&dispatch_inner, &dispatch_transport, connection, bytes);
            Ok(())
        });

        Ok(Self {
            client,
            connection,
            inner,
            default_timeout: Duration::from_millis(env_parse(
                "EVENT_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )),
        })
    }

    /// Transport-assigned connection id of the underlying client.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect and wait briefly for the transport to report connected, then
    /// proceed regardless (best-effort bootstrap). With `auto_tick`, spawn a
    /// background ticker driving [`EventService::tick`].
    ///
    /// # Errors
    ///
    /// Propagates the transport failure for an unknown endpoint.
    pub async fn start(&self, auto_tick: Option<Duration>) -> Result<(), TransportError> {
        self.client.connect()?;

        for _ in 0..CONNECT_POLL_TICKS {
            if self.client.is_connected() {
                break;
            }
            self.tick();
            tokio::time::sleep(Duration::from_millis(CONNECT_POLL_SLEEP_MS)).await;
        }

        if let Some(period) = auto_tick {
            let client = Arc::clone(&self.client);
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    tick_endpoint(&client, &inner);
                }
            });
            let mut guard = lock_inner(&self.inner);
            if let Some(old) = guard.ticker.replace(handle) {
                old.abort();
            }
        }
        Ok(())
    }

    /// Drain inbound protocol messages, expire unacknowledged promises, and
    /// prune stale ack bookkeeping.
    pub fn tick(&self) {
        tick_endpoint(&self.client, &self.inner);
    }

    /// Reject every pending request and drop every handler. The underlying
    /// client stays usable.
    pub fn clear(&self) {
        let pending = {
            let mut guard = lock_inner(&self.inner);
            guard.handlers.clear();
            guard.acked_remote.clear();
            std::mem::take(&mut guard.pending)
        };
        for (event_type, entry) in pending {
            reject_promises(entry.promises, &RequestError::Closed { event_type });
        }
    }

    /// Stop ticking, clear all state, and close the underlying client.
    pub fn close(&self) {
        if let Some(handle) = lock_inner(&self.inner).ticker.take() {
            handle.abort();
        }
        self.clear();
        self.client.close();
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a handler for an event type (or [`WILDCARD_EVENT`]).
    pub fn on<F>(&self, event_type: &str, handler: F) -> HandlerToken
    where
        F: Fn(&str, &[Value]) -> Result<Option<Value>, HandlerError> + Send + Sync + 'static,
    {
        let token = HandlerToken::next();
        lock_inner(&self.inner)
            .handlers
            .entry(event_type.to_owned())
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    /// Remove exactly the handler the token was issued for. Returns whether
    /// anything was removed.
    pub fn off(&self, token: HandlerToken) -> bool {
        let mut guard = lock_inner(&self.inner);
        let mut removed = false;
        guard.handlers.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(t, _)| *t != token);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    // -------------------------------------------------------------------------
    // Emit
    // -------------------------------------------------------------------------

    /// Fire-and-forget broadcast. Local wildcard + exact listeners are
    /// notified synchronously with the already round-tripped arguments, so
    /// payload shape is identical regardless of locality; the same payload
    /// goes over the wire for remote listeners.
    ///
    /// # Errors
    ///
    /// Propagates the transport send failure. Local listeners are still
    /// notified only on successful send.
    pub fn emit(&self, event_type: &str, args: &[EventArg]) -> Result<(), TransportError> {
        let (data, data_infos) = encode_args(args);
        let mut message = Envelope::event(event_type, self.connection.0).with_data(data.clone());
        if let Some(infos) = data_infos.clone() {
            message = message.with_data_infos(infos);
        }
        self.client.send(encode_envelope(&message))?;

        match decode_args(&data, data_infos.as_deref()) {
            Ok(decoded) => self.dispatch_local_event(event_type, &decoded),
            Err(e) => {
                warn!(event = event_type, error = %e, "emit payload failed round trip; local listeners skipped");
            }
        }
        Ok(())
    }

    /// Forward a log line to every other endpoint.
    ///
    /// # Errors
    ///
    /// Propagates the transport send failure.
    pub fn send_log(&self, message: &str) -> Result<(), TransportError> {
        let envelope =
            Envelope::log(self.connection.0).with_data(vec![Value::String(message.to_owned())]);
        self.client.send(encode_envelope(&envelope))
    }

    fn dispatch_local_event(&self, event_type: &str, args: &[Value]) {
        let handlers = {
            let guard = lock_inner(&self.inner);
            listeners(&guard, event_type)
        };
        for (token, handler) in handlers {
            if let Err(e) = handler(event_type, args) {
                warn!(event = event_type, %token, error = %e, "event listener failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Issue a request with the service's default timeout.
    pub fn request(&self, event_type: &str, args: &[EventArg]) -> RequestFuture {
        self.request_with(event_type, args, RequestOptions { timeout: self.default_timeout })
    }

    /// Issue a request.
    ///
    /// With an exact-type local handler the request resolves synchronously —
    /// no network round trip. Otherwise the request goes on the wire;
    /// concurrent callers for the same event type coalesce onto the one
    /// in-flight request, each keeping its own deadline.
    pub fn request_with(
        &self,
        event_type: &str,
        args: &[EventArg],
        options: RequestOptions,
    ) -> RequestFuture {
        let (tx, rx) = oneshot::channel();
        let future = RequestFuture { event_type: event_type.to_owned(), rx };

        let (data, data_infos) = encode_args(args);

        let local_handlers = {
            let guard = lock_inner(&self.inner);
            exact_handlers(&guard, event_type)
        };
        if !local_handlers.is_empty() {
            let result = run_local_request(event_type, &local_handlers, &data, data_infos.as_deref());
            let _ = tx.send(result);
            return future;
        }

        let deadline = Instant::now() + options.timeout;
        let probe = {
            let mut guard = lock_inner(&self.inner);
            if let Some(pending) = guard.pending.get_mut(event_type) {
                pending.promises.push(PromiseSlot { tx, deadline, timeout: options.timeout });
                debug!(event = event_type, id = pending.id, waiters = pending.promises.len(), "request coalesced");
                return future;
            }

            let id = guard.next_request_id;
            guard.next_request_id += 1;
            guard.pending.insert(
                event_type.to_owned(),
                PendingRequest {
                    id,
                    acknowledged: false,
                    started: Instant::now(),
                    data,
                    data_infos,
                    promises: vec![PromiseSlot { tx, deadline, timeout: options.timeout }],
                },
            );
            Envelope::request(event_type, self.connection.0, id)
        };

        if let Err(e) = self.client.send(encode_envelope(&probe)) {
            let entry = lock_inner(&self.inner).pending.remove(event_type);
            if let Some(entry) = entry {
                reject_promises(
                    entry.promises,
                    &RequestError::Transport {
                        event_type: event_type.to_owned(),
                        message: e.to_string(),
                    },
                );
            }
        }
        future
    }

    /// Remove the pending request for an event type and reject its waiters.
    /// Returns whether anything was pending.
    pub fn cancel_request(&self, event_type: &str, message: &str) -> bool {
        let entry = lock_inner(&self.inner).pending.remove(event_type);
        let Some(entry) = entry else {
            return false;
        };
        debug!(event = event_type, id = entry.id, "request cancelled");
        reject_promises(
            entry.promises,
            &RequestError::Cancelled {
                event_type: event_type.to_owned(),
                message: message.to_owned(),
            },
        );
        true
    }

    #[must_use]
    pub fn is_request_pending(&self, event_type: &str) -> bool {
        lock_inner(&self.inner).pending.contains_key(event_type)
    }

    /// Expire unacknowledged promises whose deadline has passed.
    pub(crate) fn check_timeouts_at(&self, now: Instant) {
        check_timeouts(&self.inner, now);
    }
}

// =============================================================================
// TICK
// =============================================================================

fn tick_endpoint(client: &ChannelClient, inner: &Mutex<EventsInner>) {
    client.tick();
    let now = Instant::now();
    check_timeouts(inner, now);
    lock_inner(inner)
        .acked_remote
        .retain(|_, acked| now.duration_since(acked.at) <= ACK_RETENTION);
}

/// Expire unacknowledged promises whose deadline has passed. An entry is
/// dropped once no waiters remain; an acknowledged entry never times out.
fn check_timeouts(inner: &Mutex<EventsInner>, now: Instant) {
    let mut guard = lock_inner(inner);
    guard.pending.retain(|event_type, pending| {
        if pending.acknowledged {
            return true;
        }
        let (expired, live): (Vec<PromiseSlot>, Vec<PromiseSlot>) =
            pending.promises.drain(..).partition(|slot| slot.deadline <= now);
        pending.promises = live;

        for slot in expired {
            let timeout_ms = u64::try_from(slot.timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(event = %event_type, id = pending.id, timeout_ms, "request timed out while unacknowledged");
            let _ = slot.tx.send(Err(RequestError::Timeout {
                event_type: event_type.clone(),
                timeout_ms,
            }));
        }
        !pending.promises.is_empty()
    });
}

// =============================================================================
// LOCAL DISPATCH HELPERS
// =============================================================================

fn listeners(inner: &EventsInner, event_type: &str) -> Vec<(HandlerToken, EventHandler)> {
    let mut handlers = Vec::new();
    if event_type != WILDCARD_EVENT {
        if let Some(wildcard) = inner.handlers.get(WILDCARD_EVENT) {
            handlers.extend(wildcard.iter().cloned());
        }
    }
    if let Some(exact) = inner.handlers.get(event_type) {
        handlers.extend(exact.iter().cloned());
    }
    handlers
}

fn exact_handlers(inner: &EventsInner, event_type: &str) -> Vec<(HandlerToken, EventHandler)> {
    inner.handlers.get(event_type).cloned().unwrap_or_default()
}

fn run_local_request(
    event_type: &str,
    handlers: &[(HandlerToken, EventHandler)],
    data: &[Value],
    data_infos: Option<&[DataInfo]>,
) -> Result<Vec<Value>, RequestError> {
    let args = match decode_args(data, data_infos) {
        Ok(args) => args,
        Err(e) => {
            return Err(RequestError::Payload {
                event_type: event_type.to_owned(),
                message: e.to_string(),
            });
        }
    };

    let mut results = Vec::new();
    let mut first_error: Option<String> = None;
    for (token, handler) in handlers {
        match handler(event_type, &args) {
            Ok(Some(value)) => results.push(value),
            Ok(None) => {}
            Err(e) => {
                warn!(event = event_type, %token, error = %e, "local request handler failed");
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
            }
        }
    }

    match first_error {
        Some(message) => Err(RequestError::Handler { event_type: event_type.to_owned(), message }),
        None => Ok(results),
    }
}

fn reject_promises(promises: Vec<PromiseSlot>, error: &RequestError) {
    for slot in promises {
        let _ = slot.tx.send(Err(error.clone()));
    }
}

fn send_envelope(transport: &Arc<dyn Transport>, connection: ConnectionId, envelope: &Envelope) {
    if let Err(e) = transport.send_to_hub(connection, encode_envelope(envelope)) {
        warn!(kind = %envelope.req, error = %e, "failed to send protocol message");
    }
}

// =============================================================================
// INBOUND PROTOCOL
// =============================================================================

fn incoming(
    inner: &Arc<Mutex<EventsInner>>,
    transport: &Arc<dyn Transport>,
    connection: ConnectionId,
    bytes: &[u8],
) {
    let message = match decode_envelope(bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping malformed event payload");
            return;
        }
    };

    // The hub relay broadcasts to every client, including the sender.
    if message.sender_id == connection.0 {
        return;
    }

    match message.req {
        MessageKind::Request => on_remote_request(inner, transport, connection, &message),
        MessageKind::RequestAck => on_request_ack(inner, transport, connection, &message),
        MessageKind::RequestExecute => on_request_execute(inner, transport, connection, &message),
        MessageKind::RequestResult => on_request_result(inner, &message),
        MessageKind::Event => on_remote_event(inner, &message),
        MessageKind::Log => on_remote_log(&message),
    }
}

fn on_remote_request(
    inner: &Arc<Mutex<EventsInner>>,
    transport: &Arc<dyn Transport>,
    connection: ConnectionId,
    message: &Envelope,
) {
    // decode_envelope guarantees `type` on request envelopes.
    let Some(event_type) = message.event_type.as_deref() else {
        return;
    };
    let Some(request_id) = message.request_id else {
        warn!(event = event_type, "dropping request without correlation id");
        return;
    };

    {
        let mut guard = lock_inner(inner);
        let has_handler = guard
            .handlers
            .get(event_type)
            .is_some_and(|handlers| !handlers.is_empty());
        if !has_handler {
            trace!(event = event_type, id = request_id, "no handler for remote request");
            return;
        }
        guard.acked_remote.insert(
            request_id,
            AckedRequest { event_type: event_type.to_owned(), at: Instant::now() },
        );
    }

    let ack = message.reply(MessageKind::RequestAck, connection.0);
    send_envelope(transport, connection, &ack);
}

fn on_request_ack(
    inner: &Arc<Mutex<EventsInner>>,
    transport: &Arc<dyn Transport>,
    connection: ConnectionId,
    message: &Envelope,
) {
    let Some(request_id) = message.request_id else {
        warn!("dropping ack without correlation id");
        return;
    };
    let Some(event_type) = message.event_type.as_deref() else {
        warn!(id = request_id, "dropping ack without event type");
        return;
    };

    let mut guard = lock_inner(inner);
    let stale = match guard.pending.get(event_type) {
        None => {
            debug!(event = event_type, id = request_id, "ack for unknown request; ignoring");
            return;
        }
        Some(pending) => pending.id != request_id,
    };
    if stale {
        let Some(entry) = guard.pending.remove(event_type) else {
            return;
        };
        warn!(
            event = event_type,
            tracked = entry.id,
            incoming = request_id,
            "ack correlation mismatch; dropping stale request"
        );
        drop(guard);
        reject_promises(entry.promises, &RequestError::Superseded { event_type: event_type.to_owned() });
        return;
    }

    let Some(pending) = guard.pending.get_mut(event_type) else {
        return;
    };
    if pending.acknowledged {
        debug!(event = event_type, id = request_id, "request already acknowledged; first responder wins");
        return;
    }
    pending.acknowledged = true;
    pending.started = Instant::now();

    let mut execute = message.reply(MessageKind::RequestExecute, connection.0).with_data(pending.data.clone());
    if let Some(infos) = pending.data_infos.clone() {
        execute = execute.with_data_infos(infos);
    }
    drop(guard);

    send_envelope(transport, connection, &execute);
}

fn on_request_execute(
    inner: &Arc<Mutex<EventsInner>>,
    transport: &Arc<dyn Transport>,
    connection: ConnectionId,
    message: &Envelope,
) {
    let Some(request_id) = message.request_id else {
        warn!("dropping execute without correlation id");
        return;
    };

    let (event_type, handlers) = {
        let mut guard = lock_inner(inner);
        // Only ids we acknowledged are ours to execute.
        let Some(acked) = guard.acked_remote.remove(&request_id) else {
            return;
        };
        let handlers = exact_handlers(&guard, &acked.event_type);
        (acked.event_type, handlers)
    };

    let data = message.data.clone().unwrap_or_default();
    let args = match decode_args(&data, message.data_infos.as_deref()) {
        Ok(args) => args,
        Err(e) => {
            warn!(event = %event_type, id = request_id, error = %e, "dropping execute with undecodable payload");
            return;
        }
    };

    let mut results = Vec::new();
    for (token, handler) in &handlers {
        match handler(&event_type, &args) {
            Ok(Some(value)) => results.push(value),
            Ok(None) => {}
            Err(e) => {
                warn!(event = %event_type, %token, error = %e, "request handler failed");
            }
        }
    }

    let mut reply = message.reply(MessageKind::RequestResult, connection.0).with_data(results);
    if reply.event_type.is_none() {
        reply.event_type = Some(event_type);
    }
    send_envelope(transport, connection, &reply);
}

fn on_request_result(inner: &Arc<Mutex<EventsInner>>, message: &Envelope) {
    let Some(request_id) = message.request_id else {
        warn!("dropping result without correlation id");
        return;
    };
    let Some(event_type) = message.event_type.as_deref() else {
        warn!(id = request_id, "dropping result without event type");
        return;
    };

    let mut guard = lock_inner(inner);
    let stale = match guard.pending.get(event_type) {
        None => {
            debug!(event = event_type, id = request_id, "result for unknown request; ignoring");
            return;
        }
        Some(pending) => pending.id != request_id,
    };
    let Some(entry) = guard.pending.remove(event_type) else {
        return;
    };
    if stale {
        warn!(
            event = event_type,
            tracked = entry.id,
            incoming = request_id,
            "result correlation mismatch; dropping stale request"
        );
        drop(guard);
        reject_promises(entry.promises, &RequestError::Superseded { event_type: event_type.to_owned() });
        return;
    }
    drop(guard);

    let data = message.data.clone().unwrap_or_default();
    let results = match decode_args(&data, message.data_infos.as_deref()) {
        Ok(results) => results,
        Err(e) => {
            warn!(event = event_type, id = request_id, error = %e, "result payload undecodable; rejecting waiters");
            reject_promises(
                entry.promises,
                &RequestError::Payload { event_type: event_type.to_owned(), message: e.to_string() },
            );
            return;
        }
    };

    debug!(
        event = event_type,
        id = request_id,
        results = results.len(),
        waiters = entry.promises.len(),
        elapsed = ?entry.started.elapsed(),
        "request resolved"
    );
    for slot in entry.promises {
        let _ = slot.tx.send(Ok(results.clone()));
    }
}

fn on_remote_event(inner: &Arc<Mutex<EventsInner>>, message: &Envelope) {
    // decode_envelope guarantees `type` on event envelopes.
    let Some(event_type) = message.event_type.as_deref() else {
        return;
    };

    let data = message.data.clone().unwrap_or_default();
    let args = match decode_args(&data, message.data_infos.as_deref()) {
        Ok(args) => args,
        Err(e) => {
            warn!(event = event_type, error = %e, "dropping event with undecodable payload");
            return;
        }
    };

    let handlers = {
        let guard = lock_inner(inner);
        listeners(&guard, event_type)
    };
    for (token, handler) in handlers {
        if let Err(e) = handler(event_type, &args) {
            warn!(event = event_type, %token, error = %e, "event listener failed");
        }
    }
}

fn on_remote_log(message: &Envelope) {
    let line = message
        .data
        .as_ref()
        .and_then(|data| data.first())
        .and_then(Value::as_str)
        .unwrap_or("");
    info!(sender = message.sender_id, line, "remote log");
}

// =============================================================================
// EVENT RELAY
// =============================================================================

/// Register the hub-side fan-out for the `events` channel: every inbound
/// payload is re-broadcast to every connected client of the channel,
/// including the sender (receivers drop their own echoes by sender id).
///
/// # Errors
///
/// Propagates the transport failure when the channel cannot be created.
pub fn install_event_relay(
    service: &ChannelService,
) -> Result<(ChannelId, HandlerToken), TransportError> {
    let transport = service.transport_handle();
    let channel = transport.open_channel(EVENTS_CHANNEL)?;

    let relay = Arc::clone(&transport);
    let token = service.register_message_handler(EVENTS_CHANNEL, move |sender, bytes| {
        let reached = relay.broadcast(channel, bytes)?;
        trace!(%sender, reached, "relayed event payload");
        Ok(())
    })?;

    Ok((channel, token))
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
