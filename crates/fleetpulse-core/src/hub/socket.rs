//! Per-connection reader and writer

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::OwnerId;

use super::connection::Connection;
use super::{HubHandle, MAILBOX_CAPACITY, MAX_FRAME_SIZE, PING_INTERVAL, READ_IDLE_TIMEOUT, WRITE_TIMEOUT};

/// Drive an upgraded socket: register it with the hub, then run its reader
/// and writer until both have exited.
pub async fn serve_socket(hub: HubHandle, socket: WebSocket, owner: OwnerId) {
    let (conn, mailbox) = Connection::new(owner);

    if let Err(e) = hub.register(conn.clone()).await {
        warn!(owner = %conn.owner(), error = %e, "Rejecting connection");
        conn.close();
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_writer(hub.clone(), conn.clone(), mailbox, sink));
    let reader = tokio::spawn(run_reader(hub, conn.clone(), stream));

    let (read, write) = tokio::join!(reader, writer);
    if let Err(e) = read.and(write) {
        warn!(owner = %conn.owner(), error = %e, "Connection task panicked");
    }
    debug!(owner = %conn.owner(), conn_id = %conn.id(), "Connection finished");
}

/// Reader unit: runs [`read_loop`] and always unregisters afterwards.
pub async fn run_reader<S, E>(hub: HubHandle, conn: Arc<Connection>, stream: S)
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    match read_loop(&conn, stream).await {
        Ok(()) => debug!(owner = %conn.owner(), "Client disconnected"),
        Err(e) => info!(owner = %conn.owner(), error = %e, "Dropping connection"),
    }
    hub.unregister(&conn).await;
}

/// Writer unit: runs [`write_loop`] and unregisters if a write fails.
pub async fn run_writer<S>(
    hub: HubHandle,
    conn: Arc<Connection>,
    mailbox: mpsc::Receiver<String>,
    sink: S,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if let Err(e) = write_loop(&conn, mailbox, sink).await {
        warn!(owner = %conn.owner(), error = %e, "Write failed, dropping connection");
        hub.unregister(&conn).await;
    }
}

/// Consume inbound frames until the client leaves, breaks the protocol, or
/// stays silent past the idle deadline. Only pongs extend the deadline.
///
/// Returns `Ok` for an orderly end (close frame, end of stream, or the
/// connection closed by the hub).
pub async fn read_loop<S, E>(conn: &Connection, mut stream: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + READ_IDLE_TIMEOUT;

    loop {
        let next = tokio::select! {
            biased;
            () = conn.closed() => return Ok(()),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return Err(Error::Protocol("read idle timeout".to_string())),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(Error::Protocol(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Pong(_) => deadline = Instant::now() + READ_IDLE_TIMEOUT,
            Message::Close(_) => return Ok(()),
            Message::Text(text) if text.len() > MAX_FRAME_SIZE => {
                return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", text.len())));
            }
            Message::Binary(data) if data.len() > MAX_FRAME_SIZE => {
                return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", data.len())));
            }
            Message::Text(_) | Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

/// Forward mailbox messages to the socket and ping on a fixed interval.
///
/// Messages already waiting behind the one received are written in the same
/// flush. Returns `Ok` once the connection is closed, `Err` when a write
/// fails or misses its deadline.
pub async fn write_loop<S>(conn: &Connection, mut mailbox: mpsc::Receiver<String>, mut sink: S) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            biased;
            () = conn.closed() => break,
            message = mailbox.recv() => {
                let Some(first) = message else { break };

                let mut batch = vec![first];
                while batch.len() < MAILBOX_CAPACITY {
                    match mailbox.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }

                let count = batch.len();
                let flushed = timeout(WRITE_TIMEOUT, send_batch(&mut sink, batch)).await;
                check_write(flushed, "message")?;
                metrics::counter!("fleetpulse_alerts_delivered_total").increment(count as u64);
            }
            _ = ping.tick() => {
                let sent = timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await;
                check_write(sent, "ping")?;
            }
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
    Ok(())
}

async fn send_batch<S>(sink: &mut S, batch: Vec<String>) -> std::result::Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    for text in batch {
        sink.feed(Message::Text(text)).await?;
    }
    sink.flush().await
}

fn check_write<E: Display>(
    outcome: std::result::Result<std::result::Result<(), E>, tokio::time::error::Elapsed>,
    what: &str,
) -> Result<()> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Protocol(format!("{what} write failed: {e}"))),
        Err(_) => Err(Error::Protocol(format!("{what} write timed out"))),
    }
}
