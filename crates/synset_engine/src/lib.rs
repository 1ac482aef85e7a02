//! # Synset Engine
//!
//! Replication engine for sets shared through a key/value store with set
//! semantics and a publish/subscribe channel.
//!
//! This crate provides:
//! - The replicated set handle ([`ReplicatedSet`])
//! - Connection health tracking per transport side
//! - Outbound buffering while the publish side is down
//! - Seed loading with inbound buffering on every (re)subscription
//! - A single-writer state container with change notification
//! - An in-memory broker for tests and simulations
//!
//! ## Architecture
//!
//! Every node applies its own operations immediately, then writes them to
//! the store and broadcasts them. Peers apply broadcasts as they arrive.
//! Whenever a subscription is confirmed, the full membership is fetched
//! from the store and replaces local state; broadcasts received meanwhile
//! are held and replayed on top of it.
//!
//! ## Key Invariants
//!
//! - Local state changes only through the reducer
//! - Operations issued while disconnected are sent in issue order
//! - Remote operations are never re-broadcast
//! - Broadcasts received during a seed load apply after the baseline
//! - Subscribers are notified only when membership actually changes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod health;
mod inbound;
mod memory;
mod outbound;
mod state;
mod transport;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{RetryConfig, SetConfig};
pub use engine::{FailureListener, ReplicatedSet, ReplicationStats};
pub use error::{ReplicationError, ReplicationResult};
pub use health::ConnectionHealth;
pub use inbound::{InboundBuffer, SeedPhase};
pub use memory::{MemoryBroker, MemoryConnection};
pub use outbound::OutboundBuffer;
pub use state::{reduce, Action, Directed, Dispatch, Listener, StateContainer};
pub use transport::{Broadcaster, ConnectionSignal, SharedStore, StoreWrite, TransportEvent};
