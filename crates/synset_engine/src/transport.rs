//! Transport layer abstraction.
//!
//! The shared store and the broadcast channel are external services. The
//! engine talks to them through [`SharedStore`] and [`Broadcaster`], and
//! learns about their lifecycle through [`TransportEvent`]s that the
//! embedding event loop feeds into [`ReplicatedSet::handle`].
//!
//! [`ReplicatedSet::handle`]: crate::ReplicatedSet::handle

use crate::error::ReplicationResult;
use futures::future::BoxFuture;
use synset_protocol::{Member, Operation};

/// A write against the shared store, addressed by the set's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    /// Set-add of one or more members.
    Add(Vec<Vec<u8>>),
    /// Set-remove of one member.
    Remove(Vec<u8>),
    /// Key delete.
    Delete,
    /// Atomic delete followed by set-add of the given members.
    Replace(Vec<Vec<u8>>),
}

impl StoreWrite {
    /// Maps an operation to the store write that mirrors it.
    ///
    /// Returns `None` for an `AddAll` with no values, which has nothing to
    /// write.
    pub fn from_operation<T>(op: &Operation<T>) -> Option<Self> {
        match op {
            Operation::Add(member) => Some(StoreWrite::Add(vec![member.as_bytes().to_vec()])),
            Operation::Remove(member) => Some(StoreWrite::Remove(member.as_bytes().to_vec())),
            Operation::Clear => Some(StoreWrite::Delete),
            Operation::AddAll(members) if members.is_empty() => None,
            Operation::AddAll(members) => Some(StoreWrite::Add(encoded(members))),
            Operation::ReplaceAll(members) => Some(StoreWrite::Replace(encoded(members))),
        }
    }
}

fn encoded<T>(members: &[Member<T>]) -> Vec<Vec<u8>> {
    members
        .iter()
        .map(|member| member.as_bytes().to_vec())
        .collect()
}

/// The shared key/value store with set semantics.
///
/// Implementations must not block: `write` enqueues the command and
/// returns whether it was accepted for delivery.
pub trait SharedStore: Send + Sync {
    /// Applies a write to `key`.
    fn write(&self, key: &str, write: StoreWrite) -> ReplicationResult<()>;

    /// Fetches every member stored under `key`.
    fn members(&self, key: &str) -> BoxFuture<'static, ReplicationResult<Vec<Vec<u8>>>>;
}

/// The broadcast channel.
pub trait Broadcaster: Send + Sync {
    /// Publishes `payload` on `channel` without waiting for delivery.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> ReplicationResult<()>;

    /// Subscribes to `channel`.
    ///
    /// Confirmation arrives later as [`TransportEvent::Subscribed`], and again
    /// after every reconnection.
    fn subscribe(&self, channel: &str) -> ReplicationResult<()>;
}

/// Lifecycle signal of one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection is up and accepting commands.
    Ready,
    /// The connection dropped and a retry is in progress.
    Reconnecting,
    /// The connection reported an error.
    Error(String),
    /// The connection was closed and will not come back on its own.
    Closed,
}

impl ConnectionSignal {
    /// Returns true for signals that make the connection unusable.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, ConnectionSignal::Ready)
    }
}

/// An event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lifecycle signal of the publish connection (writes and broadcasts).
    Publisher(ConnectionSignal),
    /// Lifecycle signal of the subscribe connection.
    Subscriber(ConnectionSignal),
    /// The subscribe connection confirmed a (re)subscription.
    Subscribed {
        /// Channel that was subscribed.
        channel: String,
    },
    /// A broadcast message.
    Message {
        /// Channel the message arrived on.
        channel: String,
        /// Raw payload.
        payload: Vec<u8>,
    },
}
