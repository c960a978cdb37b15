//! Integration tests for the connection hub.
//!
//! These drive the hub through its public handle and the socket loops
//! through in-memory channels, without any HTTP upgrade or broker.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::channel::mpsc as fmpsc;
use futures::{Sink, StreamExt};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use fleetpulse::hub::{
    forward, read_loop, run_reader, run_writer, write_loop, Connection, ConnectionHub, ConnectionState, Delivery,
    HubHandle, MAILBOX_CAPACITY, MAX_FRAME_SIZE, PING_INTERVAL, READ_IDLE_TIMEOUT, WRITE_TIMEOUT,
};
use fleetpulse::models::OwnerId;

fn owner(raw: &str) -> OwnerId {
    OwnerId::parse(raw).unwrap()
}

fn alert_for(user_id: &str) -> String {
    format!(r#"{{"user_id":{user_id},"name":"High CPU","triggered_value":91.0}}"#)
}

fn spawn_hub() -> (HubHandle, tokio::task::JoinHandle<()>) {
    ConnectionHub::spawn(CancellationToken::new())
}

// ---------------------------------------------------------------------------
// Test: a second registration for the same owner evicts the first
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_registration_evicts_first() {
    let (hub, _task) = spawn_hub();
    let (first, _rx1) = Connection::new(owner("7"));
    let (second, mut rx2) = Connection::new(owner("7"));

    hub.register(first.clone()).await.unwrap();
    hub.register(second.clone()).await.unwrap();

    assert_eq!(hub.connection_count(), 1);
    assert!(first.is_closed());
    assert_eq!(second.state(), ConnectionState::Registered);
    assert!(Arc::ptr_eq(&hub.get(&owner("7")).unwrap(), &second));

    assert_eq!(hub.deliver(&alert_for("7")).await, Delivery::Delivered(owner("7")));
    assert!(rx2.recv().await.is_some());
}

// ---------------------------------------------------------------------------
// Test: unregistering an evicted connection leaves its successor in place
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_unregister_keeps_successor() {
    let (hub, _task) = spawn_hub();
    let (first, _rx1) = Connection::new(owner("alice"));
    let (second, _rx2) = Connection::new(owner("alice"));

    hub.register(first.clone()).await.unwrap();
    hub.register(second.clone()).await.unwrap();

    assert!(!hub.unregister(&first).await);
    assert!(hub.contains(&owner("alice")));

    assert!(hub.unregister(&second).await);
    assert!(!hub.unregister(&second).await);
    assert_eq!(hub.connection_count(), 0);
}

// ---------------------------------------------------------------------------
// Test: a closed connection cannot be registered
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closed_connection_is_rejected() {
    let (hub, _task) = spawn_hub();
    let (conn, _rx) = Connection::new(owner("bob"));
    conn.close();

    assert!(hub.register(conn).await.is_err());
    assert_eq!(hub.connection_count(), 0);
}

// ---------------------------------------------------------------------------
// Test: delivery with no live connection is a silent drop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deliver_without_connection_drops() {
    let (hub, _task) = spawn_hub();
    assert_eq!(hub.deliver(&alert_for("99")).await, Delivery::NoConnection(owner("99")));
}

// ---------------------------------------------------------------------------
// Test: numeric and string owner ids route to the same connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn numeric_and_string_owner_ids_match() {
    let (hub, _task) = spawn_hub();
    let (conn, mut rx) = Connection::new(owner("42"));
    hub.register(conn).await.unwrap();

    assert_eq!(hub.deliver(&alert_for("42")).await, Delivery::Delivered(owner("42")));
    assert_eq!(hub.deliver(&alert_for(r#""42""#)).await, Delivery::Delivered(owner("42")));
    assert_eq!(hub.deliver(&alert_for("42.0")).await, Delivery::Delivered(owner("42")));
    assert_eq!(hub.deliver(&alert_for("42.5")).await, Delivery::Malformed);

    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());
}

// ---------------------------------------------------------------------------
// Test: a full mailbox removes the connection and drops the new alert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_mailbox_removes_connection() {
    let (hub, _task) = spawn_hub();
    let (conn, mut rx) = Connection::new(owner("slow"));
    hub.register(conn.clone()).await.unwrap();

    for _ in 0..MAILBOX_CAPACITY {
        assert_eq!(
            hub.deliver(&alert_for(r#""slow""#)).await,
            Delivery::Delivered(owner("slow"))
        );
    }
    assert_eq!(
        hub.deliver(&alert_for(r#""slow""#)).await,
        Delivery::Backpressure(owner("slow"))
    );

    assert!(!hub.contains(&owner("slow")));
    assert!(conn.is_closed());

    let mut received = 0;
    while rx.recv().await.is_some() {
        received += 1;
    }
    assert_eq!(received, MAILBOX_CAPACITY);
}

// ---------------------------------------------------------------------------
// Test: shutdown twice closes every connection exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_twice_is_safe() {
    let (hub, task) = spawn_hub();
    let mut conns = Vec::new();
    for id in ["1", "2", "3"] {
        let (conn, rx) = Connection::new(owner(id));
        hub.register(conn.clone()).await.unwrap();
        conns.push((conn, rx));
    }

    hub.shutdown();
    hub.shutdown();
    task.await.unwrap();

    assert_eq!(hub.connection_count(), 0);
    for (conn, _rx) in &conns {
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.close());
    }

    let (late, _rx) = Connection::new(owner("4"));
    assert!(hub.register(late).await.is_err());
}

// ---------------------------------------------------------------------------
// Test: forward routes a broker stream through the hub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forward_routes_payloads() {
    let (hub, _task) = spawn_hub();
    let (conn, mut rx) = Connection::new(owner("5"));
    hub.register(conn).await.unwrap();

    let payloads = futures::stream::iter(vec![
        alert_for("5"),
        "garbage".to_string(),
        alert_for("6"),
    ]);
    assert_eq!(forward(&hub, payloads).await, 1);
    assert_eq!(rx.recv().await, Some(alert_for("5")));
}

// ---------------------------------------------------------------------------
// Test: the reader ends cleanly on a close frame and unregisters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reader_unregisters_on_close_frame() {
    let (hub, _task) = spawn_hub();
    let (conn, _rx) = Connection::new(owner("r"));
    hub.register(conn.clone()).await.unwrap();

    let (tx, stream) = fmpsc::unbounded::<Result<Message, Infallible>>();
    tx.unbounded_send(Ok(Message::Text("hello".into()))).unwrap();
    tx.unbounded_send(Ok(Message::Close(None))).unwrap();

    run_reader(hub.clone(), conn.clone(), stream).await;

    assert!(!hub.contains(&owner("r")));
    assert!(conn.is_closed());
}

// ---------------------------------------------------------------------------
// Test: an oversized frame is a protocol error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let (conn, _rx) = Connection::new(owner("big"));
    let (tx, stream) = fmpsc::unbounded::<Result<Message, Infallible>>();
    tx.unbounded_send(Ok(Message::Text("x".repeat(MAX_FRAME_SIZE + 1)))).unwrap();

    assert!(read_loop(&conn, stream).await.is_err());
}

// ---------------------------------------------------------------------------
// Test: a silent client times out; pongs extend the deadline
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn idle_reader_times_out_unless_ponged() {
    let (conn, _rx) = Connection::new(owner("idle"));
    let (tx, stream) = fmpsc::unbounded::<Result<Message, Infallible>>();
    let start = tokio::time::Instant::now();

    let reader = tokio::spawn(async move { read_loop(&conn, stream).await });

    tokio::time::sleep(READ_IDLE_TIMEOUT - Duration::from_secs(10)).await;
    tx.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
    tokio::time::sleep(READ_IDLE_TIMEOUT - Duration::from_secs(10)).await;
    assert!(!reader.is_finished());

    assert!(reader.await.unwrap().is_err());
    assert!(start.elapsed() >= READ_IDLE_TIMEOUT * 2 - Duration::from_secs(10));
}

// ---------------------------------------------------------------------------
// Test: the writer batches queued messages, pings, and closes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn writer_sends_messages_pings_and_close() {
    let (conn, mailbox) = Connection::new(owner("w"));
    for text in ["a", "b", "c"] {
        conn.try_enqueue(text.to_string()).unwrap();
    }

    let (sink, mut frames) = fmpsc::unbounded::<Message>();
    let writer = {
        let conn = conn.clone();
        tokio::spawn(async move { write_loop(&conn, mailbox, sink).await })
    };

    for expected in ["a", "b", "c"] {
        assert_eq!(frames.next().await, Some(Message::Text(expected.to_string())));
    }

    let start = tokio::time::Instant::now();
    assert_eq!(frames.next().await, Some(Message::Ping(Vec::new())));
    assert!(start.elapsed() <= PING_INTERVAL);

    conn.close();
    assert!(writer.await.unwrap().is_ok());
    assert_eq!(frames.next().await, Some(Message::Close(None)));
}

/// A socket whose peer never reads: every write stays pending
struct StalledSink;

impl Sink<Message> for StalledSink {
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Infallible> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// Test: a failed data write unregisters the connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_write_unregisters() {
    let (hub, _task) = spawn_hub();
    let (conn, mailbox) = Connection::new(owner("gone"));
    hub.register(conn.clone()).await.unwrap();

    let (sink, frames) = fmpsc::unbounded::<Message>();
    drop(frames);
    conn.try_enqueue(alert_for(r#""gone""#)).unwrap();

    run_writer(hub.clone(), conn.clone(), mailbox, sink).await;

    assert!(!hub.contains(&owner("gone")));
    assert!(conn.is_closed());
}

// ---------------------------------------------------------------------------
// Test: a ping that cannot be written in time unregisters the connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stalled_ping_unregisters() {
    let (hub, _task) = spawn_hub();
    let (conn, mailbox) = Connection::new(owner("stuck"));
    hub.register(conn.clone()).await.unwrap();
    let start = tokio::time::Instant::now();

    run_writer(hub.clone(), conn.clone(), mailbox, StalledSink).await;

    assert!(start.elapsed() >= PING_INTERVAL + WRITE_TIMEOUT);
    assert!(!hub.contains(&owner("stuck")));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

// ---------------------------------------------------------------------------
// Test: a stalled data write times out and unregisters the connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stalled_message_write_unregisters() {
    let (hub, _task) = spawn_hub();
    let (conn, mailbox) = Connection::new(owner("slowpoke"));
    hub.register(conn.clone()).await.unwrap();
    conn.try_enqueue(alert_for(r#""slowpoke""#)).unwrap();
    let start = tokio::time::Instant::now();

    run_writer(hub.clone(), conn.clone(), mailbox, StalledSink).await;

    let elapsed = start.elapsed();
    assert!(elapsed >= WRITE_TIMEOUT && elapsed < PING_INTERVAL);
    assert!(!hub.contains(&owner("slowpoke")));
    assert!(conn.is_closed());
}

// ---------------------------------------------------------------------------
// Property: at most one live connection per owner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Unregister(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Register),
        (0usize..16).prop_map(Op::Unregister),
    ]
}

proptest! {
    #[test]
    fn at_most_one_live_connection_per_owner(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (hub, _task) = spawn_hub();
            let mut created: Vec<(Arc<Connection>, _)> = Vec::new();

            for op in ops {
                match op {
                    Op::Register(id) => {
                        let (conn, rx) = Connection::new(owner(&id.to_string()));
                        hub.register(conn.clone()).await.unwrap();
                        created.push((conn, rx));
                    }
                    Op::Unregister(index) => {
                        if let Some((conn, _)) = created.get(index) {
                            hub.unregister(conn).await;
                        }
                    }
                }

                for id in 0u8..3 {
                    let owner = owner(&id.to_string());
                    let live: Vec<_> = created
                        .iter()
                        .filter(|(c, _)| c.owner() == &owner && !c.is_closed())
                        .collect();
                    assert!(live.len() <= 1);

                    match (hub.get(&owner), live.first()) {
                        (Some(registered), Some((conn, _))) => assert!(Arc::ptr_eq(&registered, conn)),
                        (None, None) => {}
                        (registered, live) => panic!("table {registered:?} disagrees with live {live:?}"),
                    }
                }
            }
        });
    }
}
