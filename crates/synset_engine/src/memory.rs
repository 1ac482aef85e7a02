//! In-memory broker.
//!
//! Plays the role of the networked store and pub/sub server inside one
//! process. Every [`MemoryConnection`] gets its own event stream, so nodes
//! built on it behave as they would against a real broker, including
//! receiving their own broadcasts. Faults can be injected to exercise the
//! buffering and seed-retry paths.

use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{Broadcaster, ConnectionSignal, SharedStore, StoreWrite, TransportEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

struct Connection {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    sets: HashMap<String, BTreeSet<Vec<u8>>>,
    connections: Vec<Connection>,
    published: Vec<(String, Vec<u8>)>,
    unavailable: bool,
    fail_writes: bool,
    failing_fetches: usize,
    next_id: u64,
}

impl BrokerState {
    fn send(&mut self, id: u64, event: TransportEvent) {
        self.connections.retain(|conn| {
            if conn.id != id {
                return true;
            }
            conn.events.send(event.clone()).is_ok()
        });
    }

    fn broadcast(&mut self, event: impl Fn(&Connection) -> Vec<TransportEvent>) {
        self.connections.retain(|conn| {
            event(conn)
                .into_iter()
                .all(|event| conn.events.send(event).is_ok())
        });
    }

    fn check_available(&self) -> ReplicationResult<()> {
        if self.unavailable {
            Err(ReplicationError::transport_retryable("broker unavailable"))
        } else {
            Ok(())
        }
    }
}

/// An in-process store plus broadcast channel.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    fetches_paused: Arc<watch::Sender<bool>>,
}

impl MemoryBroker {
    /// Creates an empty, available broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            fetches_paused: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Opens a connection.
    ///
    /// If the broker is available, the returned stream starts with `Ready`
    /// signals for both the publish and subscribe sides.
    pub fn connect(&self) -> (MemoryConnection, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;

        if !state.unavailable {
            let _ = tx.send(TransportEvent::Publisher(ConnectionSignal::Ready));
            let _ = tx.send(TransportEvent::Subscriber(ConnectionSignal::Ready));
        }

        state.connections.push(Connection {
            id,
            events: tx,
            subscriptions: HashSet::new(),
        });

        (
            MemoryConnection {
                id,
                broker: self.clone(),
            },
            rx,
        )
    }

    /// Returns the members stored under `key`.
    pub fn stored_members(&self, key: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every payload published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Takes the broker down or brings it back.
    ///
    /// Going down sends `Error` to every publish side and `Reconnecting`
    /// to every subscribe side. Coming back sends `Ready` to both and
    /// re-confirms every subscription.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        if state.unavailable != available {
            return;
        }
        state.unavailable = !available;

        if available {
            state.broadcast(|conn| {
                let mut events = vec![
                    TransportEvent::Publisher(ConnectionSignal::Ready),
                    TransportEvent::Subscriber(ConnectionSignal::Ready),
                ];
                events.extend(conn.subscriptions.iter().map(|channel| {
                    TransportEvent::Subscribed {
                        channel: channel.clone(),
                    }
                }));
                events
            });
        } else {
            state.broadcast(|_| {
                vec![
                    TransportEvent::Publisher(ConnectionSignal::Error(
                        "connection reset".into(),
                    )),
                    TransportEvent::Subscriber(ConnectionSignal::Reconnecting),
                ]
            });
        }
    }

    /// Re-confirms every subscription, as a broker failover would.
    pub fn resubscribe_all(&self) {
        let mut state = self.state.lock();
        if state.unavailable {
            return;
        }
        state.broadcast(|conn| {
            conn.subscriptions
                .iter()
                .map(|channel| TransportEvent::Subscribed {
                    channel: channel.clone(),
                })
                .collect()
        });
    }

    /// Makes every store write fail until turned off.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Makes the next `count` membership fetches fail.
    pub fn fail_fetches(&self, count: usize) {
        self.state.lock().failing_fetches = count;
    }

    /// Holds membership fetches until [`resume_fetches`](Self::resume_fetches).
    pub fn pause_fetches(&self) {
        self.fetches_paused.send_replace(true);
    }

    /// Releases held membership fetches.
    pub fn resume_fetches(&self) {
        self.fetches_paused.send_replace(false);
    }

    /// Publishes a raw payload as an outside writer would.
    pub fn inject(&self, channel: &str, payload: Vec<u8>) -> ReplicationResult<()> {
        self.publish(channel, payload)
    }

    fn write(&self, key: &str, write: StoreWrite) -> ReplicationResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.fail_writes {
            return Err(ReplicationError::Store("injected write failure".into()));
        }

        match write {
            StoreWrite::Add(values) => {
                state.sets.entry(key.to_string()).or_default().extend(values);
            }
            StoreWrite::Remove(value) => {
                let emptied = match state.sets.get_mut(key) {
                    Some(set) => {
                        set.remove(&value);
                        set.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    state.sets.remove(key);
                }
            }
            StoreWrite::Delete => {
                state.sets.remove(key);
            }
            StoreWrite::Replace(values) => {
                state.sets.remove(key);
                if !values.is_empty() {
                    state.sets.insert(key.to_string(), values.into_iter().collect());
                }
            }
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> ReplicationResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.published.push((channel.to_string(), payload.clone()));
        state.broadcast(|conn| {
            if conn.subscriptions.contains(channel) {
                vec![TransportEvent::Message {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                }]
            } else {
                Vec::new()
            }
        });
        Ok(())
    }

    fn subscribe(&self, id: u64, channel: &str) -> ReplicationResult<()> {
        let mut state = self.state.lock();
        let conn = state
            .connections
            .iter_mut()
            .find(|conn| conn.id == id)
            .ok_or(ReplicationError::NotConnected)?;
        conn.subscriptions.insert(channel.to_string());

        if !state.unavailable {
            state.send(
                id,
                TransportEvent::Subscribed {
                    channel: channel.to_string(),
                },
            );
        }
        Ok(())
    }

    fn fetch(&self, key: &str) -> ReplicationResult<Vec<Vec<u8>>> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ReplicationError::Store("injected fetch failure".into()));
        }
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to a [`MemoryBroker`], usable as both store and
/// broadcaster.
#[derive(Clone)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl SharedStore for MemoryConnection {
    fn write(&self, key: &str, write: StoreWrite) -> ReplicationResult<()> {
        self.broker.write(key, write)
    }

    fn members(&self, key: &str) -> BoxFuture<'static, ReplicationResult<Vec<Vec<u8>>>> {
        let broker = self.broker.clone();
        let key = key.to_string();
        async move {
            let mut paused = broker.fetches_paused.subscribe();
            if paused.wait_for(|paused| !*paused).await.is_err() {
                return Err(ReplicationError::NotConnected);
            }
            broker.fetch(&key)
        }
        .boxed()
    }
}

impl Broadcaster for MemoryConnection {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> ReplicationResult<()> {
        self.broker.publish(channel, payload)
    }

    fn subscribe(&self, channel: &str) -> ReplicationResult<()> {
        self.broker.subscribe(self.id, channel)
    }
}
