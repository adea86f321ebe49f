//! Session integration tests over real localhost sockets.

use std::time::Duration;

use rumqttc::QoS;
use tokio::net::{TcpListener, TcpStream};

use crate::dispatch::{EventDispatcher, EventStream, SessionEvent, SessionId};
use crate::error::SessionError;

use super::{BrokerSession, ClientSession, Endpoint, ListenOptions, Message, SessionStatus};

fn local_options() -> ListenOptions {
    ListenOptions::new(0).bind("127.0.0.1")
}

fn connected(session: SessionId) -> impl FnMut(&SessionEvent) -> bool {
    move |event| {
        matches!(event, SessionEvent::StateChanged { session: s, state }
            if *s == session && state.is_connected())
    }
}

fn message_received(session: SessionId) -> impl FnMut(&SessionEvent) -> bool {
    move |event| {
        matches!(event, SessionEvent::MessageReceived { session: s, .. } if *s == session)
    }
}

async fn next_matching(
    events: &mut EventStream,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Waits until both the broker and the subscriber have reported the same
/// delivery; the two events race across tasks, so order is not assumed.
async fn deliveries_for(
    events: &mut EventStream,
    broker: SessionId,
    client: SessionId,
) -> (Message, Message) {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut from_broker = None;
        let mut from_client = None;
        while from_broker.is_none() || from_client.is_none() {
            match events.recv().await {
                Some(SessionEvent::MessageReceived { session, message }) if session == broker => {
                    from_broker = Some(message);
                }
                Some(SessionEvent::MessageReceived { session, message }) if session == client => {
                    from_client = Some(message);
                }
                Some(_) => continue,
                None => panic!("event stream closed while waiting"),
            }
        }
        (from_broker.unwrap(), from_client.unwrap())
    })
    .await
    .expect("timed out waiting for deliveries")
}

#[tokio::test]
async fn hello_roundtrip_through_embedded_broker() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("broker", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("roundtrip-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    let client_id = client.id();
    next_matching(&mut events, connected(client_id)).await;

    client.subscribe("test/topic", QoS::AtLeastOnce).await.unwrap();
    client
        .publish("test/topic", "hello", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let (broker_seen, client_seen) = deliveries_for(&mut events, broker.id(), client_id).await;
    assert_eq!(broker_seen.topic(), "test/topic");
    assert_eq!(broker_seen.text(), "hello");
    assert_eq!(broker_seen.source_client_id(), Some("roundtrip-client"));
    assert_eq!(broker_seen.qos(), QoS::AtLeastOnce);
    assert_eq!(client_seen.text(), "hello");

    client.disconnect().await;
    assert_eq!(client.status(), SessionStatus::Idle);
    broker.stop().await;
    assert_eq!(broker.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn occupied_port_adopts_resident_listener() {
    let resident = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = resident.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = resident.accept().await;
        }
    });

    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("adopting", dispatcher.handle());
    let listening = broker
        .start(ListenOptions::new(port).bind("127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(listening.local_addr.port(), port);
    assert_eq!(broker.status(), SessionStatus::Connected);
    next_matching(&mut events, connected(broker.id())).await;

    // Stopping an adopted listener is state-only: the resident socket
    // keeps accepting.
    broker.stop().await;
    assert_eq!(broker.status(), SessionStatus::Idle);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn stop_recovers_an_abandoned_start() {
    let resident = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = resident.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = resident.accept().await;
        }
    });

    let dispatcher = EventDispatcher::new();
    let mut broker = BrokerSession::new("impatient", dispatcher.handle());

    // A caller deadline can drop the start future at its first await, while
    // the occupied port is still being checked; the session must not stay
    // stuck in Connecting.
    let abandoned = tokio::time::timeout(
        Duration::ZERO,
        broker.start(ListenOptions::new(port).bind("127.0.0.1")),
    )
    .await;
    if abandoned.is_err() {
        assert_eq!(broker.status(), SessionStatus::Connecting);
    }

    broker.stop().await;
    assert_eq!(broker.status(), SessionStatus::Idle);

    broker.start(local_options()).await.unwrap();
    broker.stop().await;
    assert_eq!(broker.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn lost_connection_fails_fast_until_reconnected() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("broker", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("lossy-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    let client_id = client.id();
    next_matching(&mut events, connected(client_id)).await;

    broker.stop().await;

    let event = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged { session, state }
            if *session == client_id && state.status == SessionStatus::Disconnected)
    })
    .await;
    let SessionEvent::StateChanged { state, .. } = event else {
        unreachable!()
    };
    assert!(state.last_error.is_some());

    let err = client
        .publish("t", "x", QoS::AtMostOnce, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnectedError(_)));

    let listening = broker.start(local_options()).await.unwrap();
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    next_matching(&mut events, connected(client_id)).await;
    // Filters recorded on the fresh connection must be live immediately;
    // nothing from the torn-down connection interferes.
    client.subscribe("t", QoS::AtLeastOnce).await.unwrap();
    client
        .publish("t", "back", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let (_, returned) = deliveries_for(&mut events, broker.id(), client_id).await;
    assert_eq!(returned.text(), "back");

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn stop_then_restart_reuses_the_port() {
    let dispatcher = EventDispatcher::new();
    let mut broker = BrokerSession::new("restarting", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();
    let port = listening.local_addr.port();
    broker.stop().await;

    let listening = broker
        .start(ListenOptions::new(port).bind("127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(listening.local_addr.port(), port);
    broker.stop().await;
}

#[tokio::test]
async fn publish_order_is_preserved() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("broker", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("ordered-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    next_matching(&mut events, connected(client.id())).await;

    client
        .publish("seq/topic", "first", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    client
        .publish("seq/topic", "second", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let broker_id = broker.id();
    let event = next_matching(&mut events, message_received(broker_id)).await;
    let SessionEvent::MessageReceived { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.text(), "first");
    let event = next_matching(&mut events, message_received(broker_id)).await;
    let SessionEvent::MessageReceived { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.text(), "second");

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn publish_while_never_connected_fails_fast() {
    let dispatcher = EventDispatcher::new();
    let mut client = ClientSession::new("offline", dispatcher.handle());
    let err = client
        .publish("t", "x", QoS::AtLeastOnce, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnectedError(_)));
    assert_eq!(client.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn second_connect_while_pending_is_rejected() {
    // Accepts TCP but never answers the MQTT handshake, so the session
    // stays in Connecting.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        }
    });

    let dispatcher = EventDispatcher::new();
    let mut client = ClientSession::new("pending", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", port))
        .await
        .unwrap();
    assert_eq!(client.status(), SessionStatus::Connecting);

    let err = client
        .connect(Endpoint::new("127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyInProgressError(_)));

    client.disconnect().await;
    assert_eq!(client.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn rejected_publish_is_acked_and_dropped() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("filtering", dispatcher.handle());
    broker.set_accept_publish(|message| !message.topic().starts_with("blocked/"));
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("filtered-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    next_matching(&mut events, connected(client.id())).await;
    client.subscribe("#", QoS::AtLeastOnce).await.unwrap();

    // The QoS 1 publish resolves: the broker acks even what it drops.
    client
        .publish("blocked/topic", "nope", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    client
        .publish("open/topic", "yes", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let event = next_matching(&mut events, message_received(broker.id())).await;
    let SessionEvent::MessageReceived { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.topic(), "open/topic");

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("broker", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("fickle-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    let client_id = client.id();
    next_matching(&mut events, connected(client_id)).await;

    client.subscribe("news/daily", QoS::AtLeastOnce).await.unwrap();
    client
        .publish("news/daily", "edition one", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let (_, delivered) = deliveries_for(&mut events, broker.id(), client_id).await;
    assert_eq!(delivered.text(), "edition one");

    client.unsubscribe("news/daily").await.unwrap();
    assert!(client.subscriptions().is_empty());

    client
        .publish("news/daily", "edition two", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    // The broker still observes the publish; the lapsed subscriber must not.
    let event = next_matching(&mut events, message_received(broker.id())).await;
    let SessionEvent::MessageReceived { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.text(), "edition two");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!events.drain().iter().any(|event| {
        matches!(event, SessionEvent::MessageReceived { session, .. } if *session == client_id)
    }));

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn qos2_publish_resolves_and_delivers_once() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("broker", dispatcher.handle());
    let listening = broker.start(local_options()).await.unwrap();

    let mut client = ClientSession::new("exact-client", dispatcher.handle());
    client
        .connect(Endpoint::new("127.0.0.1", listening.local_addr.port()))
        .await
        .unwrap();
    let client_id = client.id();
    next_matching(&mut events, connected(client_id)).await;

    client
        .subscribe("exact/topic", QoS::ExactlyOnce)
        .await
        .unwrap();
    client
        .publish("exact/topic", "once", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let (broker_seen, client_seen) = deliveries_for(&mut events, broker.id(), client_id).await;
    assert_eq!(broker_seen.qos(), QoS::ExactlyOnce);
    assert_eq!(client_seen.text(), "once");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leftovers = events.drain();
    assert!(!leftovers.iter().any(|event| {
        matches!(event, SessionEvent::MessageReceived { session, .. } if *session == client_id)
    }));

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn start_twice_without_stop_is_rejected() {
    let dispatcher = EventDispatcher::new();
    let mut broker = BrokerSession::new("busy", dispatcher.handle());
    broker.start(local_options()).await.unwrap();
    let err = broker.start(local_options()).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyInProgressError(_)));

    broker.stop().await;
    broker.stop().await;
    assert_eq!(broker.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn tls_listener_is_refused_but_session_stays_startable() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut broker = BrokerSession::new("tls", dispatcher.handle());
    let err = broker
        .start(ListenOptions {
            port: 0,
            bind: "127.0.0.1".to_string(),
            tls: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BindError(_)));

    let broker_id = broker.id();
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged { session, state }
            if *session == broker_id && state.status == SessionStatus::Failed)
    })
    .await;
    assert_eq!(broker.status(), SessionStatus::Idle);
    assert!(broker.state().last_error.is_some());

    broker.start(local_options()).await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn unreadable_ca_file_fails_the_connect_attempt() {
    let dispatcher = EventDispatcher::new();
    let mut events = dispatcher.subscribe();
    let mut client = ClientSession::new("tls-client", dispatcher.handle());

    let endpoint = Endpoint::new("127.0.0.1", 1883).tls("/definitely/missing/ca.pem");
    let err = client.connect(endpoint).await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectError(_)));

    let client_id = client.id();
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged { session, state }
            if *session == client_id && state.status == SessionStatus::Failed)
    })
    .await;
    assert_eq!(client.status(), SessionStatus::Idle);
    assert!(client.state().last_error.is_some());
}
