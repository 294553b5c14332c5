//! End-to-end routing between client and server engines
//!
//! Each connection is a `NatsClient` talking to its own `NatsService`; the
//! services share a `LocalFabric`. Bytes are moved by hand, so these tests
//! need no sockets except the last one.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use natsmd_rs::client::{ClientConfig, ClientEvent, NatsClient, NatsConnector};
use natsmd_rs::route::{LocalFabric, Publish};
use natsmd_rs::server::{AcceptAll, NatsService};
use natsmd_rs::{NatsServer, ServerConfig};

struct Peer {
    client: NatsClient,
    service: NatsService,
    queue: mpsc::Receiver<Publish>,
}

impl Peer {
    fn connect(fabric: &Arc<LocalFabric>, conn_id: u64, config: &ServerConfig) -> Self {
        let queue = fabric.register(conn_id, 64);
        let service = NatsService::new(
            conn_id,
            "127.0.0.1:50000".parse().unwrap(),
            config,
            fabric.clone(),
        );
        let mut peer = Self {
            client: NatsClient::new(ClientConfig::default()),
            service,
            queue,
        };
        let events = peer.to_client();
        assert!(matches!(events[..], [ClientEvent::Connected(_)]));
        peer.to_server();
        peer
    }

    /// Move server output into the client
    fn to_client(&mut self) -> Vec<ClientEvent> {
        let mut buf = self.service.take_output();
        let mut events = Vec::new();
        self.client.on_bytes_readable(&mut buf, &mut events).unwrap();
        assert!(buf.is_empty());
        events
    }

    /// Move client output into the server
    fn to_server(&mut self) {
        let mut buf: BytesMut = self.client.take_output();
        self.service.on_bytes_readable(&mut buf);
        assert!(buf.is_empty());
    }

    /// Deliver everything queued by the fabric and return what the
    /// application sees
    fn receive(&mut self) -> Vec<ClientEvent> {
        while let Ok(msg) = self.queue.try_recv() {
            self.service.on_publish_from_fabric(&msg);
        }
        self.to_client()
    }
}

fn message(events: &[ClientEvent]) -> Vec<(String, Bytes)> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Message {
                subject, payload, ..
            } => Some((String::from_utf8_lossy(subject).into_owned(), payload.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn test_literal_and_wildcard_delivered_once() {
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default();
    let mut sub = Peer::connect(&fabric, 1, &config);
    let mut publ = Peer::connect(&fabric, 2, &config);

    sub.client.subscribe(b"A.B").unwrap();
    sub.client.subscribe(b"A.>").unwrap();
    sub.to_server();
    sub.to_client();

    publ.client
        .publish(b"A.B", None, Bytes::from_static(b"hi"))
        .unwrap();
    publ.to_server();

    let got = message(&sub.receive());
    assert_eq!(got, vec![("A.B".to_string(), Bytes::from_static(b"hi"))]);
    assert_eq!(sub.client.stats().duplicates_dropped, 1);
    assert_eq!(sub.service.stats().msgs_sent, 2);
}

#[test]
fn test_wildcard_routing() {
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default();
    let mut sub = Peer::connect(&fabric, 1, &config);
    let mut publ = Peer::connect(&fabric, 2, &config);

    sub.client.subscribe(b"T.*.x").unwrap();
    sub.to_server();

    for subject in ["T.a.x", "T.a.y", "T.a.x.y", "U.a.x", "T.bb.x"] {
        publ.client
            .publish(subject.as_bytes(), None, Bytes::from_static(b"."))
            .unwrap();
    }
    publ.to_server();

    let subjects: Vec<String> = message(&sub.receive()).into_iter().map(|(s, _)| s).collect();
    assert_eq!(subjects, vec!["T.a.x", "T.bb.x"]);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default();
    let mut sub = Peer::connect(&fabric, 1, &config);
    let mut publ = Peer::connect(&fabric, 2, &config);

    sub.client.subscribe(b"news.*").unwrap();
    sub.to_server();
    assert!(sub.client.unsubscribe(b"news.*").unwrap());
    assert!(!sub.client.unsubscribe(b"news.*").unwrap());
    sub.to_server();
    assert!(sub.service.subscriptions().is_empty());

    publ.client
        .publish(b"news.today", None, Bytes::from_static(b"x"))
        .unwrap();
    publ.to_server();

    assert!(sub.queue.try_recv().is_err());
    assert!(message(&sub.receive()).is_empty());
}

#[test]
fn test_large_payload_fragmented_and_rejoined() {
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default().max_payload(64);
    let mut sub = Peer::connect(&fabric, 1, &config);
    let mut publ = Peer::connect(&fabric, 2, &config);
    assert_eq!(publ.client.max_payload(), 64);

    sub.client.subscribe(b"big.data").unwrap();
    sub.to_server();

    let payload: Bytes = (0..(3 * 64 + 17)).map(|i| (i % 251) as u8).collect();
    publ.client
        .publish(b"big.data", Some(b"inbox.1"), payload.clone())
        .unwrap();
    publ.to_server();
    assert_eq!(publ.service.stats().protocol_errors, 0);

    let events = sub.receive();
    assert_eq!(
        events,
        vec![ClientEvent::Message {
            subject: Bytes::from_static(b"big.data"),
            reply: Some(Bytes::from_static(b"inbox.1")),
            payload,
        }]
    );
    assert_eq!(sub.client.pending_fragments(), 0);
    assert_eq!(sub.client.stats().fragments_reassembled, 1);
}

#[test]
fn test_disconnect_withdraws_interest() {
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default();
    let mut sub = Peer::connect(&fabric, 1, &config);
    let mut publ = Peer::connect(&fabric, 2, &config);

    sub.client.subscribe(b"a.>").unwrap();
    sub.client.subscribe(b"a.b").unwrap();
    sub.to_server();
    assert_eq!(sub.service.shutdown(), 2);

    publ.client
        .publish(b"a.b", None, Bytes::from_static(b"x"))
        .unwrap();
    publ.to_server();
    assert!(sub.queue.try_recv().is_err());
}

#[test]
fn test_commands_split_at_every_byte() {
    let input: &[u8] = b"CONNECT {\"verbose\":true}\r\nSUB a.* 1\r\nPUB a.b r 5\r\nhello\r\nUNSUB 1\r\nPING\r\n";
    let fabric = Arc::new(LocalFabric::new());
    let config = ServerConfig::default().server_id("SPLIT");

    let mut whole = NatsService::new(1, "127.0.0.1:1".parse().unwrap(), &config, fabric.clone());
    let mut buf = BytesMut::from(input);
    let whole_events = whole.on_bytes_readable(&mut buf);
    let expected = whole.take_output();

    let mut split = NatsService::new(2, "127.0.0.1:2".parse().unwrap(), &config, fabric.clone());
    let mut buf = BytesMut::new();
    let mut split_events = Vec::new();
    for &b in input {
        buf.extend_from_slice(&[b]);
        split_events.extend(split.on_bytes_readable(&mut buf));
    }

    assert!(buf.is_empty());
    assert_eq!(split.take_output(), expected);
    assert_eq!(split_events.len(), whole_events.len());
    assert!(split.subscriptions().is_empty());
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(NatsServer::new(ServerConfig::default(), AcceptAll));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let running = server.clone();
    let task = tokio::spawn(async move {
        running
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let (mut sub, info) = NatsConnector::connect(ClientConfig::new("127.0.0.1", port))
        .await
        .unwrap();
    assert_eq!(info.server_id, server.config().server_id);

    let mut events = Vec::new();
    sub.subscribe(b"news.*").await.unwrap();
    // The PONG comes back only after the SUB was handled
    sub.client_mut().ping();
    sub.flush().await.unwrap();
    sub.next_events(&mut events).await.unwrap();

    let (mut publ, _) = NatsConnector::connect(ClientConfig::new("127.0.0.1", port))
        .await
        .unwrap();
    publ.publish(b"news.today", None, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    publ.flush().await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            sub.next_events(&mut events).await.unwrap();
            if let Some(m) = message(&events).pop() {
                return m;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(got, ("news.today".to_string(), Bytes::from_static(b"hello")));

    publ.close().await.unwrap();
    sub.close().await.unwrap();
    let _ = stop_tx.send(());
    task.await.unwrap().unwrap();
}
