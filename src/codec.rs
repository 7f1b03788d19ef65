//! Pluggable key and payload codecs (§4.10).
//!
//! The core never interprets payload bytes or filenames itself; it only
//! calls through these four slots. Each has a default implementation that
//! is used when the cache is built without an explicit override.

use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes a caller key into a filesystem-safe filename.
pub trait KeyEncoder: Send + Sync {
    fn encode(&self, key: &str) -> String;
}

/// Inverts [`KeyEncoder::encode`].
pub trait KeyDecoder: Send + Sync {
    fn decode(&self, filename: &str) -> Result<String>;
}

/// Converts a caller value to bytes. Parameterized by key, since some
/// codecs embed the key in the encoded form (checksums, versioning).
pub trait Serializer<V>: Send + Sync {
    fn serialize(&self, value: &V, key: &str) -> Result<Vec<u8>>;
}

/// Inverts [`Serializer::serialize`].
pub trait Deserializer<V>: Send + Sync {
    fn deserialize(&self, bytes: &[u8], key: &str) -> Result<V>;
}

/// Percent-encodes everything except letters and digits, with `.`, `:`,
/// `/` and `%` always escaped (even though `%` would already be covered
/// by "not a letter or digit" -- the spec calls it out explicitly, so we
/// keep the check literal rather than relying on the general case).
#[derive(Debug, Default, Clone, Copy)]
pub struct PercentKeyCodec;

const ALWAYS_ESCAPE: [char; 4] = ['.', ':', '/', '%'];

impl KeyEncoder for PercentKeyCodec {
    fn encode(&self, key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        for byte in key.bytes() {
            let ch = byte as char;
            if ch.is_ascii_alphanumeric() && !ALWAYS_ESCAPE.contains(&ch) {
                out.push(ch);
            } else {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
        }
        out
    }
}

impl KeyDecoder for PercentKeyCodec {
    fn decode(&self, filename: &str) -> Result<String> {
        let bytes = filename.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = filename
                    .get(i + 1..i + 3)
                    .ok_or_else(|| CacheError::KeyEncoding {
                        filename: filename.to_owned(),
                    })?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| CacheError::KeyEncoding {
                    filename: filename.to_owned(),
                })?;
                out.push(byte);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).map_err(|_| CacheError::KeyEncoding {
            filename: filename.to_owned(),
        })
    }
}

/// Opaque archival of the value and its reverse, using MessagePack. The
/// core does not interpret these bytes; this is just the default so the
/// crate is usable without a caller supplying their own codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackCodec;

impl<V: Serialize> Serializer<V> for MessagePackCodec {
    fn serialize(&self, value: &V, key: &str) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| CacheError::Serialize {
            key: key.to_owned(),
            source: Box::new(e),
        })
    }
}

impl<V: DeserializeOwned> Deserializer<V> for MessagePackCodec {
    fn deserialize(&self, bytes: &[u8], key: &str) -> Result<V> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Deserialize {
            key: key.to_owned(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_key_encodes_to_empty_string() {
        assert_eq!(PercentKeyCodec.encode(""), "");
    }

    #[test]
    fn round_trips_arbitrary_keys() {
        let codec = PercentKeyCodec;
        for key in ["simple", "a.b:c/d%e", "unicode-héllo", "with spaces", ""] {
            let encoded = codec.encode(key);
            let decoded = codec.decode(&encoded).unwrap();
            assert_eq!(decoded, key);
        }
    }

    #[test]
    fn escapes_reserved_characters() {
        let encoded = PercentKeyCodec.encode(".:/ %");
        assert_eq!(encoded, "%2E%3A%2F%20%25");
    }

    #[test]
    fn messagepack_round_trips() {
        let codec = MessagePackCodec;
        let value = vec![1u8, 2, 3, 4];
        let bytes = Serializer::serialize(&codec, &value, "k").unwrap();
        let back: Vec<u8> = Deserializer::deserialize(&codec, &bytes, "k").unwrap();
        assert_eq!(back, value);
    }
}
