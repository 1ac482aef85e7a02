//! # Synset Protocol
//!
//! Operation model for replicated sets.
//!
//! This crate provides:
//! - `Member` and `MemberSet`: values keyed by their canonical CBOR bytes
//! - `Operation`: the five set mutations and the pure `apply` function
//! - Wire encoding/decoding of operations
//! - `ValueRecognizer` for validating values received from peers
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Usage
//!
//! ```
//! use synset_protocol::{apply, CborRecognizer, MemberSet, Operation};
//!
//! let op = Operation::add(7i64).unwrap();
//! let state = apply(&MemberSet::new(), &op);
//! assert!(state.contains(&7));
//!
//! let bytes = op.encode().unwrap();
//! let decoded = Operation::decode(&bytes, &CborRecognizer::<i64>::new()).unwrap();
//! assert_eq!(decoded, op);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod member;
mod operation;
mod recognizer;

pub use error::{ProtocolError, ProtocolResult};
pub use member::{encode_value, Member, MemberSet};
pub use operation::{apply, Operation, OperationKind};
pub use recognizer::{CborRecognizer, Validated, ValueRecognizer};
