// tests/hub_realtime.rs
//
// Hub fan-out and per-connection sessions, driven over in-memory transports
// instead of real sockets.

use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use feedhub::realtime::{ClientConnection, ClientSession, Hub, HubHandle, SessionConfig, SessionEnd};
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use uuid::Uuid;

type Inbound = mpsc::Sender<Result<Message, axum::Error>>;
type Outbound = mpsc::Receiver<Message>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

/// Start a session whose transport is a pair of channels.
fn open_session(
    hub: &HubHandle,
    who: Uuid,
    cfg: SessionConfig,
) -> (JoinHandle<SessionEnd>, Inbound, Outbound) {
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    let (in_tx, in_rx) = mpsc::channel::<Result<Message, axum::Error>>(64);
    let stream: FrameStream = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|m| (m, rx))
    }));
    let session = ClientSession::connect(hub, who, cfg);
    let task = tokio::spawn(session.run(PollSender::new(out_tx), stream));
    (task, in_tx, out_rx)
}

fn cfg(pong_secs: u64, ping_secs: u64) -> SessionConfig {
    SessionConfig {
        queue_capacity: 16,
        ping_period: Duration::from_secs(ping_secs),
        pong_wait: Duration::from_secs(pong_secs),
        write_wait: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn third_message_into_full_queue_disconnects_only_that_client() {
    let (hub, _join) = Hub::spawn();
    let slow = Uuid::new_v4();
    let healthy = Uuid::new_v4();

    let (slow_conn, mut slow_rx) = ClientConnection::new(slow, 2);
    let (ok_conn, mut ok_rx) = ClientConnection::new(healthy, 8);
    hub.register(slow_conn);
    hub.register(ok_conn);

    for n in 1..=3u8 {
        hub.submit_to(&[slow, healthy], Bytes::from(vec![b'0' + n]));
    }
    assert_eq!(hub.stats().await.unwrap().connected, 1);

    // The two queued payloads are intact; then the queue is closed.
    assert_eq!(slow_rx.recv().await.unwrap(), Bytes::from_static(b"1"));
    assert_eq!(slow_rx.recv().await.unwrap(), Bytes::from_static(b"2"));
    assert!(slow_rx.recv().await.is_none());

    for want in [b"1", b"2", b"3"] {
        assert_eq!(ok_rx.recv().await.unwrap(), Bytes::from_static(want));
    }

    // Further submits to the dropped identity are silently ignored.
    hub.submit_to(&[slow], Bytes::from_static(b"4"));
    assert_eq!(hub.stats().await.unwrap().connected, 1);
}

#[tokio::test]
async fn session_delivers_in_fifo_order_and_unregisters_on_close() {
    let (hub, _join) = Hub::spawn();
    let who = Uuid::new_v4();
    let (task, in_tx, mut out_rx) = open_session(&hub, who, cfg(60, 54));

    hub.submit_to(&[who], Bytes::from_static(br#"{"n":1}"#));
    hub.submit_to(&[who], Bytes::from_static(br#"{"n":2}"#));

    assert_eq!(out_rx.recv().await.unwrap(), Message::Text(r#"{"n":1}"#.into()));
    assert_eq!(out_rx.recv().await.unwrap(), Message::Text(r#"{"n":2}"#.into()));

    in_tx.send(Ok(Message::Close(None))).await.unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);
    assert_eq!(hub.stats().await.unwrap().connected, 0);
    // The close handshake is answered.
    assert_eq!(out_rx.recv().await.unwrap(), Message::Close(None));
}

#[tokio::test(start_paused = true)]
async fn silent_client_hits_liveness_deadline_after_one_probe() {
    let (hub, _join) = Hub::spawn();
    let who = Uuid::new_v4();
    let (task, _in_tx, mut out_rx) = open_session(&hub, who, cfg(20, 9));

    assert_eq!(task.await.unwrap(), SessionEnd::LivenessTimeout);
    assert_eq!(hub.stats().await.unwrap().connected, 0);

    let mut frames = Vec::new();
    while let Ok(frame) = out_rx.try_recv() {
        frames.push(frame);
    }
    // A second tick at 18s found the first probe unanswered.
    let pings = frames.iter().filter(|f| matches!(f, Message::Ping(_))).count();
    assert_eq!(pings, 1);
    // The dropped client is still told goodbye.
    assert_eq!(frames.last(), Some(&Message::Close(None)));
}

#[tokio::test(start_paused = true)]
async fn answered_probes_keep_the_session_alive() {
    let (hub, _join) = Hub::spawn();
    let who = Uuid::new_v4();
    let (task, in_tx, mut out_rx) = open_session(&hub, who, cfg(20, 9));

    let responder_tx = in_tx.clone();
    let responder = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(frame) = out_rx.recv().await {
            if matches!(frame, Message::Ping(_)) {
                pings += 1;
                let _ = responder_tx.send(Ok(Message::Pong(Bytes::new()))).await;
            }
        }
        pings
    });

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(hub.stats().await.unwrap().connected, 1);

    in_tx.send(Ok(Message::Close(None))).await.unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);
    assert!(responder.await.unwrap() >= 5);
}

#[tokio::test]
async fn reconnect_closes_previous_session() {
    let (hub, _join) = Hub::spawn();
    let who = Uuid::new_v4();

    let (first, _in1, mut out1) = open_session(&hub, who, cfg(60, 54));
    let (_second, _in2, _out2) = open_session(&hub, who, cfg(60, 54));

    assert_eq!(first.await.unwrap(), SessionEnd::WriterStopped);
    assert_eq!(out1.recv().await.unwrap(), Message::Close(None));
    // The replacement stays routed.
    assert_eq!(hub.stats().await.unwrap().connected, 1);
}
