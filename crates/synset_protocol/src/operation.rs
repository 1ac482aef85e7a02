//! Set operations and their wire form.

use crate::error::{ProtocolError, ProtocolResult};
use crate::member::{Member, MemberSet};
use crate::recognizer::ValueRecognizer;
use ciborium::value::Value;
use serde::Serialize;
use std::fmt;

const FIELD_TYPE: &str = "type";
const FIELD_VALUE: &str = "value";
const FIELD_VALUES: &str = "values";

/// Discriminator of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Insert one value.
    Add,
    /// Remove one value.
    Remove,
    /// Remove every value.
    Clear,
    /// Insert many values.
    AddAll,
    /// Overwrite the set with the given values.
    ReplaceAll,
}

impl OperationKind {
    /// Returns the wire tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            OperationKind::Add => "Add",
            OperationKind::Remove => "Remove",
            OperationKind::Clear => "Clear",
            OperationKind::AddAll => "AddAll",
            OperationKind::ReplaceAll => "ReplaceAll",
        }
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Add" => Some(OperationKind::Add),
            "Remove" => Some(OperationKind::Remove),
            "Clear" => Some(OperationKind::Clear),
            "AddAll" => Some(OperationKind::AddAll),
            "ReplaceAll" => Some(OperationKind::ReplaceAll),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A mutation of a replicated set.
///
/// Operations are immutable values. The same operation is applied to the
/// local state, written to the shared store, and broadcast to peers.
#[derive(Clone)]
pub enum Operation<T> {
    /// Membership union with one value.
    Add(Member<T>),
    /// Membership difference against one value.
    Remove(Member<T>),
    /// Reset to empty.
    Clear,
    /// Membership union with many values.
    AddAll(Vec<Member<T>>),
    /// Full overwrite; duplicates collapse.
    ReplaceAll(Vec<Member<T>>),
}

impl<T: Serialize> Operation<T> {
    /// Creates an `Add` operation.
    pub fn add(value: T) -> ProtocolResult<Self> {
        Ok(Operation::Add(Member::new(value)?))
    }

    /// Creates a `Remove` operation.
    pub fn remove(value: T) -> ProtocolResult<Self> {
        Ok(Operation::Remove(Member::new(value)?))
    }

    /// Creates an `AddAll` operation.
    pub fn add_all(values: impl IntoIterator<Item = T>) -> ProtocolResult<Self> {
        Ok(Operation::AddAll(members_of(values)?))
    }

    /// Creates a `ReplaceAll` operation.
    pub fn replace_all(values: impl IntoIterator<Item = T>) -> ProtocolResult<Self> {
        Ok(Operation::ReplaceAll(members_of(values)?))
    }
}

fn members_of<T: Serialize>(values: impl IntoIterator<Item = T>) -> ProtocolResult<Vec<Member<T>>> {
    values.into_iter().map(Member::new).collect()
}

impl<T> Operation<T> {
    /// Returns the discriminator.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add(_) => OperationKind::Add,
            Operation::Remove(_) => OperationKind::Remove,
            Operation::Clear => OperationKind::Clear,
            Operation::AddAll(_) => OperationKind::AddAll,
            Operation::ReplaceAll(_) => OperationKind::ReplaceAll,
        }
    }

    /// Encodes to the wire record.
    ///
    /// The record is a CBOR map with a `type` tag and either a `value`
    /// byte string, a `values` array of byte strings, or nothing (`Clear`).
    /// Each embedded value is carried in its canonical encoding.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut pairs = vec![(
            Value::Text(FIELD_TYPE.into()),
            Value::Text(self.kind().as_tag().into()),
        )];

        match self {
            Operation::Add(member) | Operation::Remove(member) => {
                pairs.push((
                    Value::Text(FIELD_VALUE.into()),
                    Value::Bytes(member.as_bytes().to_vec()),
                ));
            }
            Operation::Clear => {}
            Operation::AddAll(members) | Operation::ReplaceAll(members) => {
                let values = members
                    .iter()
                    .map(|member| Value::Bytes(member.as_bytes().to_vec()))
                    .collect();
                pairs.push((Value::Text(FIELD_VALUES.into()), Value::Array(values)));
            }
        }

        let mut buffer = Vec::new();
        ciborium::ser::into_writer(&Value::Map(pairs), &mut buffer)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(buffer)
    }

    /// Decodes a wire record, validating every embedded value.
    pub fn decode<R>(bytes: &[u8], recognizer: &R) -> ProtocolResult<Self>
    where
        R: ValueRecognizer<T> + ?Sized,
    {
        let record: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))?;
        let map = record
            .as_map()
            .ok_or_else(|| ProtocolError::invalid_structure("expected map for operation"))?;

        let get_field = |name: &str| {
            map.iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };

        let tag = get_field(FIELD_TYPE)
            .and_then(|v| v.as_text())
            .ok_or_else(|| ProtocolError::invalid_structure("missing type"))?;

        let kind = OperationKind::from_tag(tag).ok_or_else(|| ProtocolError::UnknownTag {
            tag: tag.to_string(),
        })?;

        let single = || -> ProtocolResult<Member<T>> {
            let raw = get_field(FIELD_VALUE)
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| ProtocolError::invalid_structure("missing value"))?;
            recognize_member(raw, recognizer)
        };

        let many = || -> ProtocolResult<Vec<Member<T>>> {
            let raw = get_field(FIELD_VALUES)
                .and_then(|v| v.as_array())
                .ok_or_else(|| ProtocolError::invalid_structure("missing values"))?;
            raw.iter()
                .map(|item| {
                    let bytes = item
                        .as_bytes()
                        .ok_or_else(|| ProtocolError::invalid_structure("value must be bytes"))?;
                    recognize_member(bytes, recognizer)
                })
                .collect()
        };

        Ok(match kind {
            OperationKind::Add => Operation::Add(single()?),
            OperationKind::Remove => Operation::Remove(single()?),
            OperationKind::Clear => Operation::Clear,
            OperationKind::AddAll => Operation::AddAll(many()?),
            OperationKind::ReplaceAll => Operation::ReplaceAll(many()?),
        })
    }

    /// Decodes a wire record, treating any failure as "not an operation".
    pub fn recognize<R>(bytes: &[u8], recognizer: &R) -> Option<Self>
    where
        R: ValueRecognizer<T> + ?Sized,
    {
        Self::decode(bytes, recognizer).ok()
    }
}

fn recognize_member<T, R>(bytes: &[u8], recognizer: &R) -> ProtocolResult<Member<T>>
where
    R: ValueRecognizer<T> + ?Sized,
{
    let value = recognizer.recognize(bytes)?;
    Ok(Member::from_parts(bytes, value))
}

impl<T> PartialEq for Operation<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Operation::Add(a), Operation::Add(b)) => a == b,
            (Operation::Remove(a), Operation::Remove(b)) => a == b,
            (Operation::Clear, Operation::Clear) => true,
            (Operation::AddAll(a), Operation::AddAll(b)) => a == b,
            (Operation::ReplaceAll(a), Operation::ReplaceAll(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> Eq for Operation<T> {}

impl<T: fmt::Debug> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Add(member) => f.debug_tuple("Add").field(member).finish(),
            Operation::Remove(member) => f.debug_tuple("Remove").field(member).finish(),
            Operation::Clear => f.write_str("Clear"),
            Operation::AddAll(members) => f.debug_tuple("AddAll").field(members).finish(),
            Operation::ReplaceAll(members) => {
                f.debug_tuple("ReplaceAll").field(members).finish()
            }
        }
    }
}

/// Applies `op` to `state`, returning the next state.
///
/// Total over every operation and free of side effects. When the operation
/// leaves membership unchanged the returned set shares storage with `state`.
pub fn apply<T: Clone>(state: &MemberSet<T>, op: &Operation<T>) -> MemberSet<T> {
    match op {
        Operation::Add(member) => state.with(member),
        Operation::Remove(member) => state.without(member),
        Operation::Clear => MemberSet::new(),
        Operation::AddAll(members) => state.union(members),
        Operation::ReplaceAll(members) => members.iter().cloned().collect(),
    }
}
