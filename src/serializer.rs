//! Payload codec contract plus the default JSON implementation.
//!
//! The JSON codec defines the only bit-exact wire encoding owned by this
//! crate: integers that would lose precision in a double are written as
//! `{"__type": "bigint", "value": "<decimal>"}` and ISO-8601 timestamp
//! strings as `{"__type": "date", "value": "<iso>"}`. Decoding always folds
//! the tagged forms back, so `decode(encode(x)) == x`.

use crate::error::{BusError, BusResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Largest integer magnitude a double represents exactly.
const MAX_EXACT_DOUBLE_INT: u64 = 9_007_199_254_740_991;

/// Format-tagged payload codec.
///
/// Implementations must be pure: the same input always produces the same
/// bytes, and decode is the inverse of encode.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// Short format tag recorded in adapter diagnostics ("json", "avro", ...).
    fn format(&self) -> &'static str;

    /// MIME type advertised to backends that carry one.
    fn content_type(&self) -> &'static str;

    fn serialize(&self, value: &Value) -> BusResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> BusResult<Value>;
}

/// Typed convenience layer over any [`Serializer`].
pub trait SerializerExt: Serializer {
    fn encode<T: Serialize>(&self, value: &T) -> BusResult<Vec<u8>> {
        let value = serde_json::to_value(value)
            .map_err(|e| BusError::serialization("payload is not serializable").with_cause(e))?;
        self.serialize(&value)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BusResult<T> {
        let value = self.deserialize(bytes)?;
        serde_json::from_value(value).map_err(|e| {
            BusError::serialization("payload does not match the expected shape").with_cause(e)
        })
    }
}

impl<S: Serializer + ?Sized> SerializerExt for S {}

#[derive(Debug, Clone, Copy)]
pub struct JsonCodecOptions {
    /// Tag integers beyond double precision instead of emitting them raw.
    pub tag_large_integers: bool,
    /// Tag ISO-8601 timestamp strings so decoders can revive them.
    pub tag_dates: bool,
}

impl Default for JsonCodecOptions {
    fn default() -> Self {
        Self { tag_large_integers: true, tag_dates: false }
    }
}

/// Default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    options: JsonCodecOptions,
}

impl JsonCodec {
    pub fn new(options: JsonCodecOptions) -> Self {
        Self { options }
    }

    /// Codec with both tagged encodings enabled.
    pub fn with_tagging() -> Self {
        Self::new(JsonCodecOptions { tag_large_integers: true, tag_dates: true })
    }

    fn encode_value(&self, value: &Value) -> Value {
        match value {
            Value::Number(n) if self.options.tag_large_integers && exceeds_double(n) => {
                tagged("bigint", n.to_string())
            }
            Value::String(s) if self.options.tag_dates && looks_like_iso_datetime(s) => {
                tagged("date", s.clone())
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.encode_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), self.encode_value(v))).collect(),
            ),
            other => other.clone(),
        }
    }

    fn decode_value(&self, value: Value) -> BusResult<Value> {
        match value {
            Value::Object(map) => {
                match as_tagged(&map) {
                    Some(("bigint", inner)) => {
                        let n: serde_json::Number = serde_json::from_str(inner).map_err(|_| {
                            BusError::serialization(format!("invalid bigint encoding: {inner:?}"))
                        })?;
                        return Ok(Value::Number(n));
                    }
                    Some(("date", inner)) => return Ok(Value::String(inner.to_string())),
                    // Unknown tags are user data, not codec output.
                    _ => {}
                }
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, self.decode_value(v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                items.into_iter().map(|v| self.decode_value(v)).collect::<BusResult<_>>().map(Value::Array)
            }
            other => Ok(other),
        }
    }
}

impl Serializer for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> BusResult<Vec<u8>> {
        let encoded = self.encode_value(value);
        serde_json::to_vec(&encoded)
            .map_err(|e| BusError::serialization("failed to encode JSON payload").with_cause(e))
    }

    fn deserialize(&self, bytes: &[u8]) -> BusResult<Value> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BusError::serialization("failed to decode JSON payload").with_cause(e))?;
        self.decode_value(value)
    }
}

fn tagged(tag: &str, value: String) -> Value {
    let mut map = serde_json::Map::with_capacity(2);
    map.insert("__type".into(), Value::String(tag.into()));
    map.insert("value".into(), Value::String(value));
    Value::Object(map)
}

fn as_tagged(map: &serde_json::Map<String, Value>) -> Option<(&str, &str)> {
    if map.len() != 2 {
        return None;
    }
    let tag = map.get("__type")?.as_str()?;
    let value = map.get("value")?.as_str()?;
    Some((tag, value))
}

fn exceeds_double(n: &serde_json::Number) -> bool {
    if let Some(i) = n.as_i64() {
        i.unsigned_abs() > MAX_EXACT_DOUBLE_INT
    } else if let Some(u) = n.as_u64() {
        u > MAX_EXACT_DOUBLE_INT
    } else {
        false
    }
}

/// Match `YYYY-MM-DDTHH:MM:SS` with optional `.sss` fraction and `Z` suffix.
fn looks_like_iso_datetime(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() < 19 {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| b[range].iter().all(u8::is_ascii_digit);
    if !(digits(0..4)
        && b[4] == b'-'
        && digits(5..7)
        && b[7] == b'-'
        && digits(8..10)
        && b[10] == b'T'
        && digits(11..13)
        && b[13] == b':'
        && digits(14..16)
        && b[16] == b':'
        && digits(17..19))
    {
        return false;
    }
    let mut rest = &b[19..];
    if rest.first() == Some(&b'.') {
        let frac = rest[1..].iter().take_while(|c| c.is_ascii_digit()).count();
        if frac == 0 {
            return false;
        }
        rest = &rest[1 + frac..];
    }
    rest.is_empty() || rest == b"Z"
}
