use super::*;
use crate::client::ClientPool;
use crate::memory::MemoryTransport;
use std::sync::atomic::{AtomicUsize, Ordering};

fn service() -> (Arc<MemoryTransport>, ChannelService) {
    let transport = Arc::new(MemoryTransport::with_capacities(16, 16));
    let service = ChannelService::new(transport.clone());
    (transport, service)
}

// =============================================================================
// Channel registry
// =============================================================================

#[test]
fn get_or_create_channel_registers_the_handler() {
    let (_, service) = service();
    let (channel, _) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should open");

    assert_eq!(service.channel_from_name("updates"), Some(channel));
    assert_eq!(service.channel_name_from_id(channel).as_deref(), Some("updates"));
    assert_eq!(service.handler_count(channel), 1);
}

#[test]
fn get_or_create_channel_is_idempotent_per_name() {
    let (_, service) = service();
    let (first, _) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should open");
    let (again, _) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should resolve");

    assert_eq!(first, again);
    assert_eq!(service.handler_count(first), 2);
}

#[test]
fn get_or_create_channel_propagates_creation_failure() {
    let (_, service) = service();
    let err = service
        .get_or_create_channel("", |_, _| Ok(()))
        .expect_err("empty name is unavailable");
    assert!(matches!(err, TransportError::ChannelUnavailable(_)));
}

#[test]
fn unregister_last_handler_drops_the_channel_list() {
    let (_, service) = service();
    let (channel, first) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should open");
    let second = service
        .register_message_handler("updates", |_, _| Ok(()))
        .expect("handler should register");

    assert!(service.unregister_message_handler(first));
    assert_eq!(service.handler_count(channel), 1);

    assert!(service.unregister_message_handler(second));
    assert_eq!(service.handler_count(channel), 0);
    assert!(!service.unregister_message_handler(second));
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn inbound_payload_reaches_all_handlers_in_order_even_when_one_fails() {
    let (transport, service) = service();
    let seen: Arc<Mutex<Vec<(&'static str, Vec<u8>)>>> = Arc::default();

    let first_seen = Arc::clone(&seen);
    service
        .register_message_handler("updates", move |_, bytes| {
            first_seen.lock().expect("test mutex").push(("first", bytes.to_vec()));
            Err("first handler fails".into())
        })
        .expect("handler should register");
    let second_seen = Arc::clone(&seen);
    service
        .register_message_handler("updates", move |_, bytes| {
            second_seen.lock().expect("test mutex").push(("second", bytes.to_vec()));
            Ok(())
        })
        .expect("handler should register");

    let pool = ClientPool::new(transport.clone());
    let client = pool.get_or_create("updates").expect("client");
    client.connect().expect("connect");
    client.send(vec![1, 2, 3]).expect("send");

    service.tick();

    let seen = seen.lock().expect("test mutex");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("first", vec![1, 2, 3]));
    assert_eq!(seen[1], ("second", vec![1, 2, 3]));
}

#[test]
fn handlers_only_see_their_own_channel() {
    let (transport, service) = service();
    let updates = Arc::new(AtomicUsize::new(0));
    let logs = Arc::new(AtomicUsize::new(0));

    let updates_count = Arc::clone(&updates);
    service
        .register_message_handler("updates", move |_, _| {
            updates_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("handler should register");
    let logs_count = Arc::clone(&logs);
    service
        .register_message_handler("logs", move |_, _| {
            logs_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("handler should register");

    let pool = ClientPool::new(transport.clone());
    let client = pool.get_or_create("logs").expect("client");
    client.connect().expect("connect");
    client.send(b"line".to_vec()).expect("send");

    service.tick();

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(logs.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_receives_the_sender_connection() {
    let (transport, service) = service();
    let seen: Arc<Mutex<Vec<ConnectionId>>> = Arc::default();

    let sink = Arc::clone(&seen);
    service
        .register_message_handler("updates", move |sender, _| {
            sink.lock().expect("test mutex").push(sender);
            Ok(())
        })
        .expect("handler should register");

    let pool = ClientPool::new(transport.clone());
    let client = pool.get_or_create("updates").expect("client");
    client.connect().expect("connect");
    client.send(b"x".to_vec()).expect("send");

    service.tick();

    assert_eq!(*seen.lock().expect("test mutex"), vec![client.connection()]);
}

// =============================================================================
// Sending
// =============================================================================

#[test]
fn broadcast_reaches_every_connected_channel_client() {
    let (transport, service) = service();
    let (channel, _) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should open");

    let pool_a = ClientPool::new(transport.clone());
    let pool_b = ClientPool::new(transport.clone());
    let a = pool_a.get_or_create("updates").expect("client");
    let b = pool_b.get_or_create("updates").expect("client");
    a.connect().expect("connect");
    b.connect().expect("connect");

    let reached = service.broadcast(channel, b"fanout").expect("broadcast");

    assert_eq!(reached, 2);
    assert_eq!(transport.drain_client(a.connection()), vec![b"fanout".to_vec()]);
    assert_eq!(transport.drain_client(b.connection()), vec![b"fanout".to_vec()]);
}

#[test]
fn send_reaches_exactly_one_client() {
    let (transport, service) = service();
    service
        .register_message_handler("updates", |_, _| Ok(()))
        .expect("handler should register");

    let pool_a = ClientPool::new(transport.clone());
    let pool_b = ClientPool::new(transport.clone());
    let a = pool_a.get_or_create("updates").expect("client");
    let b = pool_b.get_or_create("updates").expect("client");
    a.connect().expect("connect");
    b.connect().expect("connect");

    service.send(a.connection(), b"direct".to_vec()).expect("send");

    assert_eq!(transport.drain_client(a.connection()), vec![b"direct".to_vec()]);
    assert!(transport.drain_client(b.connection()).is_empty());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn close_drops_handlers_and_channels() {
    let (transport, service) = service();
    let (channel, _) = service
        .get_or_create_channel("updates", |_, _| Ok(()))
        .expect("channel should open");

    service.close();

    assert_eq!(service.handler_count(channel), 0);
    assert_eq!(transport.channel_from_name("updates"), None);
}
