//! # Synset Testkit
//!
//! Test utilities for Synset.
//!
//! This crate provides:
//! - Property-based test generators using proptest
//! - A multi-node cluster harness over the in-memory broker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synset_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn nodes_converge() {
//!     let mut cluster = Cluster::<i64>::new("numbers", 3).unwrap();
//!     cluster.settle().await;
//!     cluster.node(0).add(1).unwrap();
//!     cluster.settle().await;
//!     assert!(cluster.is_converged());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::generators::*;
}

pub use cluster::*;
pub use generators::*;
