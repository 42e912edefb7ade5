use super::*;

fn transport() -> MemoryTransport {
    MemoryTransport::with_capacities(4, 8)
}

// =============================================================================
// Channels
// =============================================================================

#[test]
fn open_channel_is_idempotent_per_name() {
    let t = transport();
    let first = t.open_channel("updates").expect("open");
    let again = t.open_channel("updates").expect("open again");
    let other = t.open_channel("logs").expect("open other");

    assert_eq!(first, again);
    assert_ne!(first, other);
}

#[test]
fn open_channel_rejects_empty_name() {
    let t = transport();
    let err = t.open_channel("").expect_err("empty name is unavailable");
    assert!(matches!(err, TransportError::ChannelUnavailable(_)));
}

#[test]
fn channel_name_resolution_round_trips() {
    let t = transport();
    let id = t.open_channel("updates").expect("open");

    assert_eq!(t.channel_from_name("updates"), Some(id));
    assert_eq!(t.channel_name_from_id(id).as_deref(), Some("updates"));
    assert_eq!(t.channel_from_name("missing"), None);
    assert_eq!(t.channel_name_from_id(ChannelId(99)), None);
}

#[test]
fn close_channel_disconnects_its_clients() {
    let t = transport();
    let id = t.open_channel("updates").expect("open");
    let client = t.open_client("updates").expect("client");
    t.connect(client).expect("connect");

    t.close_channel(id);

    assert!(!t.is_connected(client));
    assert_eq!(t.channel_from_name("updates"), None);
}

// =============================================================================
// Clients
// =============================================================================

#[test]
fn open_client_auto_creates_the_channel() {
    let t = transport();
    assert_eq!(t.channel_from_name("updates"), None);

    let client = t.open_client("updates").expect("client");
    assert!(t.channel_from_name("updates").is_some());
    assert!(!t.is_connected(client));
}

#[test]
fn send_before_connect_fails() {
    let t = transport();
    let client = t.open_client("updates").expect("client");

    let err = t.send_to_hub(client, b"hi".to_vec()).expect_err("not connected");
    assert!(matches!(err, TransportError::NotConnected(_)));
}

#[test]
fn send_from_unknown_connection_fails() {
    let t = transport();
    let err = t
        .send_to_hub(ConnectionId(42), b"hi".to_vec())
        .expect_err("unknown connection");
    assert!(matches!(err, TransportError::UnknownConnection(ConnectionId(42))));
}

#[test]
fn close_client_discards_pending_payloads() {
    let t = transport();
    let client = t.open_client("updates").expect("client");
    t.connect(client).expect("connect");
    t.send_to_client(client, b"queued".to_vec()).expect("send");

    t.close_client(client);

    assert!(!t.is_connected(client));
    assert!(t.drain_client(client).is_empty());
}

// =============================================================================
// Hub delivery
// =============================================================================

#[test]
fn hub_receives_client_payloads_in_order() {
    let t = transport();
    let channel = t.open_channel("updates").expect("open");
    let client = t.open_client("updates").expect("client");
    t.connect(client).expect("connect");

    t.send_to_hub(client, b"first".to_vec()).expect("send");
    t.send_to_hub(client, b"second".to_vec()).expect("send");

    let deliveries = t.drain_hub();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].channel, channel);
    assert_eq!(deliveries[0].sender, client);
    assert_eq!(deliveries[0].bytes, b"first");
    assert_eq!(deliveries[1].bytes, b"second");
    assert!(t.drain_hub().is_empty());
}

// =============================================================================
// Broadcast
// =============================================================================

#[test]
fn broadcast_reaches_only_connected_clients_of_the_channel() {
    let t = transport();
    let channel = t.open_channel("updates").expect("open");
    let connected = t.open_client("updates").expect("client");
    let dormant = t.open_client("updates").expect("client");
    let elsewhere = t.open_client("logs").expect("client");
    t.connect(connected).expect("connect");
    t.connect(elsewhere).expect("connect");

    let reached = t.broadcast(channel, b"payload").expect("broadcast");

    assert_eq!(reached, 1);
    assert_eq!(t.drain_client(connected), vec![b"payload".to_vec()]);
    assert!(t.drain_client(dormant).is_empty());
    assert!(t.drain_client(elsewhere).is_empty());
}

#[test]
fn broadcast_to_unknown_channel_fails() {
    let t = transport();
    let err = t.broadcast(ChannelId(7), b"x").expect_err("unknown channel");
    assert!(matches!(err, TransportError::UnknownChannel(ChannelId(7))));
}

// =============================================================================
// Capacity
// =============================================================================

#[test]
fn full_client_inbox_drops_new_payloads() {
    let t = transport();
    let client = t.open_client("updates").expect("client");
    t.connect(client).expect("connect");

    for i in 0..6u8 {
        t.send_to_client(client, vec![i]).expect("send is best-effort");
    }

    let delivered = t.drain_client(client);
    assert_eq!(delivered.len(), 4);
    assert_eq!(delivered[0], vec![0]);
    assert_eq!(delivered[3], vec![3]);
}

#[test]
fn full_hub_inbox_drops_new_payloads() {
    let t = transport();
    let client = t.open_client("updates").expect("client");
    t.connect(client).expect("connect");

    for i in 0..12u8 {
        t.send_to_hub(client, vec![i]).expect("send is best-effort");
    }

    assert_eq!(t.drain_hub().len(), 8);
}
