// src/realtime/client.rs
//! Per-connection read and write pumps.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hub::{ClientConnection, HubHandle};
use crate::model::SubscriberId;

/// Liveness and buffering knobs for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    /// Interval between keepalive pings.
    pub ping_period: Duration,
    /// Read deadline; refreshed by every inbound frame.
    pub pong_wait: Duration,
    /// Upper bound on a single transport write.
    pub write_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            queue_capacity: 256,
            ping_period: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent Close or the stream ended.
    ClientClosed,
    LivenessTimeout,
    ReadError,
    /// The write side stopped first (queue closed by the hub, or a write failed).
    WriterStopped,
}

/// A registered connection waiting for its transport.
pub struct ClientSession {
    subscriber: SubscriberId,
    conn_id: u64,
    outbound: mpsc::Receiver<Bytes>,
    hub: HubHandle,
    cfg: SessionConfig,
}

impl ClientSession {
    /// Register a fresh connection for `subscriber` with the hub.
    pub fn connect(hub: &HubHandle, subscriber: SubscriberId, cfg: SessionConfig) -> Self {
        let (conn, outbound) = ClientConnection::new(subscriber, cfg.queue_capacity);
        let conn_id = conn.conn_id();
        hub.register(conn);
        Self {
            subscriber,
            conn_id,
            outbound,
            hub: hub.clone(),
            cfg,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Drive the session until either side stops, then unregister.
    ///
    /// The write pump runs as its own task; the read loop runs on the caller's
    /// task. They share only the outbound queue and a close signal.
    pub async fn run<S, R, E>(self, sink: S, mut stream: R) -> SessionEnd
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Self {
            subscriber,
            conn_id,
            outbound,
            hub,
            cfg,
        } = self;

        let closed = CancellationToken::new();
        let probe_outstanding = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_pump(
            sink,
            outbound,
            closed.clone(),
            probe_outstanding.clone(),
            cfg,
            subscriber,
        ));

        let end = loop {
            tokio::select! {
                _ = closed.cancelled() => break SessionEnd::WriterStopped,
                frame = timeout(cfg.pong_wait, stream.next()) => match frame {
                    Err(_) => {
                        tracing::warn!(target: "hub", subscriber = %subscriber, conn = conn_id, "liveness deadline passed, dropping client");
                        break SessionEnd::LivenessTimeout;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break SessionEnd::ClientClosed,
                    Ok(Some(Err(e))) => {
                        tracing::debug!(target: "hub", subscriber = %subscriber, error = %e, "websocket read failed");
                        break SessionEnd::ReadError;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {
                        probe_outstanding.store(false, Ordering::Release);
                    }
                    // Any other inbound frame only refreshes the deadline.
                    Ok(Some(Ok(_))) => {}
                }
            }
        };

        closed.cancel();
        hub.unregister(subscriber, conn_id);
        let _ = writer.await;
        tracing::debug!(target: "hub", subscriber = %subscriber, conn = conn_id, reason = ?end, "session finished");
        end
    }
}

async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    probe_outstanding: Arc<AtomicBool>,
    cfg: SessionConfig,
    subscriber: SubscriberId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display + Send,
{
    let mut ticker = interval_at(Instant::now() + cfg.ping_period, cfg.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                // The read side ended first; tell the peer if the transport still takes writes.
                let _ = send_within(&mut sink, Message::Close(None), cfg.write_wait).await;
                break;
            }
            msg = outbound.recv() => match msg {
                Some(payload) => {
                    if let Err(e) = send_within(&mut sink, payload_frame(payload), cfg.write_wait).await {
                        tracing::warn!(target: "hub", subscriber = %subscriber, error = %e, "websocket send failed");
                        break;
                    }
                }
                None => {
                    // The hub released this connection.
                    let _ = send_within(&mut sink, Message::Close(None), cfg.write_wait).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if probe_outstanding.swap(true, Ordering::AcqRel) {
                    continue;
                }
                if let Err(e) = send_within(&mut sink, Message::Ping(Bytes::new()), cfg.write_wait).await {
                    tracing::warn!(target: "hub", subscriber = %subscriber, error = %e, "websocket ping failed");
                    break;
                }
            }
        }
    }

    closed.cancel();
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

async fn send_within<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout(limit)),
    }
}

/// UTF-8 payloads go out as text frames, anything else as binary. Neither copies.
fn payload_frame(payload: Bytes) -> Message {
    match Utf8Bytes::try_from(payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(payload),
    }
}
