// src/realtime/hub.rs
//! Connection registry and fan-out coordinator.
//!
//! The registry lives inside a single task. Sessions and the scheduler talk
//! to it through [`HubHandle`], whose methods never block: commands go into
//! an unbounded mailbox and are applied strictly in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::model::SubscriberId;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("hub_clients_connected", "Live realtime connections.");
        describe_counter!(
            "hub_slow_consumer_disconnects_total",
            "Connections dropped because their outbound queue was full."
        );
        describe_counter!("hub_messages_enqueued_total", "Payloads queued for delivery.");
    });
}

/// The hub's end of one live connection. Holding the sender is what keeps
/// the connection's outbound queue open; dropping it releases the pump.
#[derive(Debug)]
pub struct ClientConnection {
    subscriber: SubscriberId,
    conn_id: u64,
    sender: mpsc::Sender<Bytes>,
}

impl ClientConnection {
    /// New connection with a bounded outbound queue of `capacity` payloads.
    pub fn new(subscriber: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            subscriber,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sender,
        };
        (conn, rx)
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

#[derive(Debug)]
enum HubCommand {
    Register(ClientConnection),
    Unregister {
        subscriber: SubscriberId,
        conn_id: u64,
    },
    Submit(HashMap<SubscriberId, Bytes>),
    Stats(oneshot::Sender<HubStats>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connected: usize,
}

/// Producer-side entry points. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Returns `false` if the hub has stopped.
    pub fn register(&self, conn: ClientConnection) -> bool {
        self.tx.send(HubCommand::Register(conn)).is_ok()
    }

    /// Removes the registration only if `conn_id` is still the one routed
    /// for `subscriber`, so a replaced connection cannot evict its successor.
    pub fn unregister(&self, subscriber: SubscriberId, conn_id: u64) {
        let _ = self.tx.send(HubCommand::Unregister {
            subscriber,
            conn_id,
        });
    }

    pub fn submit(&self, signals: HashMap<SubscriberId, Bytes>) {
        if signals.is_empty() {
            return;
        }
        let _ = self.tx.send(HubCommand::Submit(signals));
    }

    /// Same payload for every subscriber in `audience`.
    pub fn submit_to(&self, audience: &[SubscriberId], payload: Bytes) {
        let signals = audience
            .iter()
            .map(|id| (*id, payload.clone()))
            .collect::<HashMap<_, _>>();
        self.submit(signals);
    }

    /// `None` if the hub has stopped.
    pub async fn stats(&self) -> Option<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Stats(reply)).ok()?;
        rx.await.ok()
    }
}

pub struct Hub {
    clients: HashMap<SubscriberId, ClientConnection>,
    mailbox: mpsc::UnboundedReceiver<HubCommand>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let hub = Self {
            clients: HashMap::new(),
            mailbox,
        };
        (hub, HubHandle { tx })
    }

    /// Start the coordinator on the runtime. It stops once every handle is dropped.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        (handle, tokio::spawn(hub.run()))
    }

    pub async fn run(mut self) {
        ensure_metrics_described();
        tracing::info!(target: "hub", "realtime hub started");

        while let Some(cmd) = self.mailbox.recv().await {
            match cmd {
                HubCommand::Register(conn) => self.register(conn),
                HubCommand::Unregister {
                    subscriber,
                    conn_id,
                } => self.unregister(subscriber, conn_id),
                HubCommand::Submit(signals) => self.dispatch(signals),
                HubCommand::Stats(reply) => {
                    let _ = reply.send(HubStats {
                        connected: self.clients.len(),
                    });
                }
            }
        }

        tracing::info!(target: "hub", clients = self.clients.len(), "realtime hub stopped");
        self.clients.clear();
        gauge!("hub_clients_connected").set(0.0);
    }

    fn register(&mut self, conn: ClientConnection) {
        let subscriber = conn.subscriber;
        let conn_id = conn.conn_id;
        // Dropping the stale entry closes its queue, which ends its pump.
        if let Some(stale) = self.clients.insert(subscriber, conn) {
            tracing::info!(
                target: "hub",
                subscriber = %subscriber,
                stale_conn = stale.conn_id,
                "subscriber reconnected, closing previous connection"
            );
        }
        tracing::info!(
            target: "hub",
            subscriber = %subscriber,
            conn = conn_id,
            total_clients = self.clients.len(),
            "client registered"
        );
        gauge!("hub_clients_connected").set(self.clients.len() as f64);
    }

    fn unregister(&mut self, subscriber: SubscriberId, conn_id: u64) {
        let current = self.clients.get(&subscriber).map(|c| c.conn_id);
        if current == Some(conn_id) {
            self.clients.remove(&subscriber);
            tracing::info!(
                target: "hub",
                subscriber = %subscriber,
                conn = conn_id,
                total_clients = self.clients.len(),
                "client unregistered"
            );
            gauge!("hub_clients_connected").set(self.clients.len() as f64);
        }
    }

    fn dispatch(&mut self, signals: HashMap<SubscriberId, Bytes>) {
        for (subscriber, payload) in signals {
            let Some(conn) = self.clients.get(&subscriber) else {
                continue;
            };
            match conn.sender.try_send(payload) {
                Ok(()) => {
                    counter!("hub_messages_enqueued_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::error!(
                        target: "hub",
                        subscriber = %subscriber,
                        conn = conn.conn_id,
                        "client send queue is full, disconnecting slow consumer"
                    );
                    counter!("hub_slow_consumer_disconnects_total").increment(1);
                    self.clients.remove(&subscriber);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(target: "hub", subscriber = %subscriber, "client queue already closed");
                    self.clients.remove(&subscriber);
                }
            }
        }
        gauge!("hub_clients_connected").set(self.clients.len() as f64);
    }
}
