//! Set members and the copy-on-write member set.
//!
//! A [`Member`] pairs a value with its canonical CBOR encoding. Equality,
//! ordering and hashing only look at the encoding, so two members are the
//! same set element iff their encoded bytes are identical.

use crate::error::{ProtocolError, ProtocolResult};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Encodes a value to its canonical CBOR form.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// A value together with its canonical encoding.
#[derive(Clone)]
pub struct Member<T> {
    bytes: Arc<[u8]>,
    value: T,
}

impl<T: Serialize> Member<T> {
    /// Creates a member by encoding `value`.
    pub fn new(value: T) -> ProtocolResult<Self> {
        let bytes = encode_value(&value)?;
        Ok(Self {
            bytes: bytes.into(),
            value,
        })
    }
}

impl<T> Member<T> {
    /// Creates a member from bytes that are already known to encode `value`.
    ///
    /// Used by recognizers after they have validated the bytes.
    pub fn from_parts(bytes: impl Into<Arc<[u8]>>, value: T) -> Self {
        Self {
            bytes: bytes.into(),
            value,
        }
    }

    /// Returns the decoded value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Returns the canonical encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the member and returns the value.
    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T> PartialEq for Member<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Member<T> {}

impl<T> PartialOrd for Member<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Member<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<T> Hash for Member<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.value, f)
    }
}

/// An immutable set of members with cheap clones.
///
/// Cloning shares the underlying tree; mutation copies it only when it is
/// shared. Members iterate in the order of their encoded bytes.
#[derive(Clone)]
pub struct MemberSet<T> {
    members: Arc<BTreeSet<Member<T>>>,
}

impl<T: Clone> MemberSet<T> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            members: Arc::new(BTreeSet::new()),
        }
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns true if `member` is in the set.
    pub fn contains_member(&self, member: &Member<T>) -> bool {
        self.members.contains(member)
    }

    /// Iterates over the members.
    pub fn members(&self) -> impl Iterator<Item = &Member<T>> {
        self.members.iter()
    }

    /// Iterates over the values.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.members.iter().map(Member::value)
    }

    /// Clones the values into a vector.
    pub fn to_values(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Returns a set with `member` inserted.
    pub fn with(&self, member: &Member<T>) -> Self {
        if self.contains_member(member) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.members).insert(member.clone());
        next
    }

    /// Returns a set with `member` removed.
    pub fn without(&self, member: &Member<T>) -> Self {
        if !self.contains_member(member) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.members).remove(member);
        next
    }

    /// Returns the union of this set and `members`.
    pub fn union<'a>(&self, members: impl IntoIterator<Item = &'a Member<T>>) -> Self
    where
        T: 'a,
    {
        let mut next = self.clone();
        for member in members {
            if !next.contains_member(member) {
                Arc::make_mut(&mut next.members).insert(member.clone());
            }
        }
        next
    }
}

impl<T: Clone + Serialize> MemberSet<T> {
    /// Returns true if `value` is in the set.
    ///
    /// A value that cannot be encoded is never a member.
    pub fn contains(&self, value: &T) -> bool {
        encode_value(value)
            .map(|bytes| self.contains_member(&Member::from_parts(bytes, value.clone())))
            .unwrap_or(false)
    }
}

impl<T: Clone> Default for MemberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FromIterator<Member<T>> for MemberSet<T> {
    fn from_iter<I: IntoIterator<Item = Member<T>>>(iter: I) -> Self {
        Self {
            members: Arc::new(iter.into_iter().collect()),
        }
    }
}

impl<T> PartialEq for MemberSet<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.members, &other.members) || self.members == other.members
    }
}

impl<T> Eq for MemberSet<T> {}

impl<T: fmt::Debug> fmt::Debug for MemberSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members.iter()).finish()
    }
}
