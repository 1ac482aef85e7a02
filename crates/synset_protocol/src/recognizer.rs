//! Value recognizers.
//!
//! Every value that arrives over the wire is handed to a [`ValueRecognizer`]
//! before it can become a [`Member`](crate::Member). A recognizer decides
//! whether the bytes are a well-formed value of the set's type.

use crate::error::{ProtocolError, ProtocolResult};
use crate::member::encode_value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Recognizes encoded values of type `T`.
pub trait ValueRecognizer<T>: Send + Sync {
    /// Decodes and validates `bytes`, returning the value on success.
    fn recognize(&self, bytes: &[u8]) -> ProtocolResult<T>;
}

/// Recognizes any CBOR encoding that deserializes to `T`.
///
/// The bytes must also be the canonical encoding of the decoded value,
/// otherwise two peers could hold distinct byte strings for one value.
pub struct CborRecognizer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborRecognizer<T> {
    /// Creates a new recognizer.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Adds a validity check on top of decoding.
    pub fn validated<F>(self, check: F) -> Validated<Self, F>
    where
        F: Fn(&T) -> bool + Send + Sync,
    {
        Validated { inner: self, check }
    }
}

impl<T> Default for CborRecognizer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueRecognizer<T> for CborRecognizer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn recognize(&self, bytes: &[u8]) -> ProtocolResult<T> {
        let value: T = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))?;
        let canonical = encode_value(&value)?;
        if canonical != bytes {
            return Err(ProtocolError::rejected("non-canonical encoding"));
        }
        Ok(value)
    }
}

/// A recognizer that applies a predicate after the inner recognizer.
pub struct Validated<R, F> {
    inner: R,
    check: F,
}

impl<T, R, F> ValueRecognizer<T> for Validated<R, F>
where
    R: ValueRecognizer<T>,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn recognize(&self, bytes: &[u8]) -> ProtocolResult<T> {
        let value = self.inner.recognize(bytes)?;
        if (self.check)(&value) {
            Ok(value)
        } else {
            Err(ProtocolError::rejected("failed validity check"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_matching_type() {
        let recognizer = CborRecognizer::<i64>::new();
        let bytes = encode_value(&42i64).unwrap();
        assert_eq!(recognizer.recognize(&bytes).unwrap(), 42);
    }

    #[test]
    fn rejects_wrong_type() {
        let recognizer = CborRecognizer::<i64>::new();
        let bytes = encode_value("forty-two").unwrap();
        assert!(matches!(
            recognizer.recognize(&bytes),
            Err(ProtocolError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn rejects_non_canonical_integer() {
        // 5 encoded with a one-byte argument instead of inline.
        let recognizer = CborRecognizer::<i64>::new();
        assert!(matches!(
            recognizer.recognize(&[0x18, 0x05]),
            Err(ProtocolError::RejectedValue { .. })
        ));
    }

    #[test]
    fn validated_applies_predicate() {
        let recognizer = CborRecognizer::<i64>::new().validated(|n| *n >= 0);
        let ok = encode_value(&3i64).unwrap();
        let bad = encode_value(&-3i64).unwrap();
        assert_eq!(recognizer.recognize(&ok).unwrap(), 3);
        assert!(matches!(
            recognizer.recognize(&bad),
            Err(ProtocolError::RejectedValue { .. })
        ));
    }
}
