//! Multi-node cluster harness.
//!
//! Runs several replicas of one set against a shared [`MemoryBroker`] and
//! pumps their event streams by hand, so tests control exactly when each
//! node observes what.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use synset_engine::{
    MemoryBroker, ReplicatedSet, ReplicationResult, SetConfig, TransportEvent,
};
use synset_protocol::{CborRecognizer, Member, MemberSet, ValueRecognizer};
use tokio::sync::mpsc;

/// Rounds [`Cluster::settle`] runs before giving up.
pub const SETTLE_ROUNDS: usize = 1000;

/// One replica and its pending transport events.
pub struct Node<T> {
    set: ReplicatedSet<T>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl<T> Node<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    /// Returns the replica.
    pub fn set(&self) -> &ReplicatedSet<T> {
        &self.set
    }

    /// Delivers every pending event. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.set.handle(event);
            handled += 1;
        }
        handled
    }
}

/// Replicas of one set sharing an in-memory broker.
pub struct Cluster<T> {
    broker: MemoryBroker,
    config: SetConfig,
    nodes: Vec<Node<T>>,
}

impl<T> Cluster<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates `size` nodes replicating `key`.
    pub fn new(key: &str, size: usize) -> ReplicationResult<Self> {
        Self::with_config(SetConfig::new(key), size)
    }

    /// Creates `size` nodes sharing `config`.
    pub fn with_config(config: SetConfig, size: usize) -> ReplicationResult<Self> {
        let mut cluster = Self {
            broker: MemoryBroker::new(),
            config,
            nodes: Vec::with_capacity(size),
        };
        for _ in 0..size {
            cluster.join()?;
        }
        Ok(cluster)
    }

    /// Connects another node. Returns its index.
    pub fn join(&mut self) -> ReplicationResult<usize> {
        let (conn, events) = self.broker.connect();
        let set = ReplicatedSet::from_connection(self.config.clone(), conn, CborRecognizer::new())?;
        self.nodes.push(Node { set, events });
        Ok(self.nodes.len() - 1)
    }

    /// Returns the broker, for fault injection.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Returns the replica at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn node(&self, index: usize) -> &ReplicatedSet<T> {
        &self.nodes[index].set
    }

    /// Returns every replica in join order.
    pub fn nodes(&self) -> impl Iterator<Item = &ReplicatedSet<T>> {
        self.nodes.iter().map(Node::set)
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Delivers pending events to every node once.
    pub fn pump(&mut self) -> usize {
        self.nodes.iter_mut().map(Node::pump).sum()
    }

    /// Pumps events until no node has anything pending and no seed load is
    /// in flight. Returns false if that did not happen within
    /// [`SETTLE_ROUNDS`].
    pub async fn settle(&mut self) -> bool {
        for _ in 0..SETTLE_ROUNDS {
            let handled = self.pump();
            if handled == 0 && self.nodes().all(|set| !set.is_loading_seed()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    /// Returns the membership held by the shared store.
    ///
    /// Stored members that do not decode as `T` are skipped.
    pub fn stored(&self) -> MemberSet<T> {
        let recognizer = CborRecognizer::<T>::new();
        self.broker
            .stored_members(self.config.key.as_str())
            .into_iter()
            .filter_map(|bytes| {
                let value = recognizer.recognize(&bytes).ok()?;
                Some(Member::from_parts(bytes, value))
            })
            .collect()
    }

    /// Returns true if every node holds the store's membership and has
    /// nothing left to send.
    pub fn is_converged(&self) -> bool {
        let stored = self.stored();
        self.nodes()
            .all(|set| set.outbound_len() == 0 && set.members() == stored)
    }
}
