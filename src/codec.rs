//! Value codecs.
//!
//! A codec translates between an application value and the textual form the
//! durable store holds. Encode and decode must be two-sided inverses over the
//! values the application actually stores; they are not required to be total.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Translates values to and from their durable textual form.
///
/// `encode` may return `Ok(None)` to signal that the value has no durable
/// representation; the sync layer treats that as a deletion of the durable
/// key, symmetric with an explicit unset.
pub trait Codec<T> {
    /// Encode a value. `Ok(None)` requests deletion of the durable key.
    ///
    /// # Errors
    /// Returns [`CodecError::Encode`] when the value cannot be represented.
    fn encode(&self, value: &T) -> Result<Option<String>, CodecError>;

    /// Decode durable text back into a value.
    ///
    /// # Errors
    /// Returns [`CodecError::Decode`] when the text is malformed.
    fn decode(&self, raw: &str) -> Result<T, CodecError>;
}

/// Identity codec for values that are already strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Option<String>, CodecError> {
        Ok(Some(value.clone()))
    }

    fn decode(&self, raw: &str) -> Result<String, CodecError> {
        Ok(raw.to_string())
    }
}

/// JSON codec for any serde-serializable value.
///
/// # Examples
///
/// ```
/// use persistore::{Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let text = codec.encode(&vec![1, 2, 3]).unwrap().unwrap();
/// let back: Vec<i32> = codec.decode(&text).unwrap();
/// assert_eq!(back, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Option<String>, CodecError> {
        serde_json::to_string(value)
            .map(Some)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<T, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
