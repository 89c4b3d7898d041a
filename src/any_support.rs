//! Encoding and decoding of arbitrary values as type-URL-tagged blobs.
//!
//! Messages are packed as `google.protobuf.Any` with standard
//! `type.googleapis.com/` URLs, resolved against the descriptor pool loaded
//! at startup. Primitives are packed as synthetic single-field wrapper
//! messages under the reserved `p.statehost.io/` prefix, so that a string or
//! a counter value can travel anywhere a message can.
//!
//! Also derives *comparable keys*: canonical, hashable identities for
//! values, used as map and set indices by the replicated data types. Keys
//! never leave the process.

use prost::encoding::{self, DecodeContext, WireType};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, ReflectMessage};
use prost_types::Any;

/// Type URL prefix for messages from the user's descriptor pool.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com";

/// Reserved type URL prefix for primitive wrapper encodings.
pub const PRIMITIVE_URL_PREFIX: &str = "p.statehost.io";

/// Field number the primitive wrapper value is encoded under.
const PRIMITIVE_FIELD: u32 = 15;

/// Errors from Any encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum AnySupportError {
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A primitive value with a reserved wrapper encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    String(String),
    Bytes(Vec<u8>),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
}

impl PrimitiveValue {
    /// The URL suffix identifying this primitive kind.
    fn kind(&self) -> &'static str {
        match self {
            PrimitiveValue::String(_) => "string",
            PrimitiveValue::Bytes(_) => "bytes",
            PrimitiveValue::Int32(_) => "int32",
            PrimitiveValue::Int64(_) => "int64",
            PrimitiveValue::Float(_) => "float",
            PrimitiveValue::Double(_) => "double",
            PrimitiveValue::Bool(_) => "bool",
        }
    }
}

/// A decoded Any: either a primitive or a dynamic message.
#[derive(Debug, Clone)]
pub enum DecodedValue {
    Primitive(PrimitiveValue),
    Message(DynamicMessage),
}

/// A canonical, deterministic key for a value.
///
/// Equal values (by value equality after encoding) yield identical keys.
/// Floats are keyed by bit pattern so the key is `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComparableKey {
    String(String),
    Bytes(Vec<u8>),
    Int32(i32),
    Int64(i64),
    FloatBits(u32),
    DoubleBits(u64),
    Bool(bool),
    Message { type_url: String, bytes: Vec<u8> },
}

/// Derive the comparable key for an Any without consulting a pool.
///
/// Primitive wrappers key by their decoded value; everything else keys by
/// (type URL, serialized bytes). A wrapper that fails to decode also falls
/// back to the byte key, which is still stable.
pub fn comparable_key(any: &Any) -> ComparableKey {
    if let Some(kind) = primitive_kind(&any.type_url) {
        if let Ok(p) = decode_primitive(kind, &any.value) {
            return match p {
                PrimitiveValue::String(s) => ComparableKey::String(s),
                PrimitiveValue::Bytes(b) => ComparableKey::Bytes(b),
                PrimitiveValue::Int32(v) => ComparableKey::Int32(v),
                PrimitiveValue::Int64(v) => ComparableKey::Int64(v),
                PrimitiveValue::Float(v) => ComparableKey::FloatBits(v.to_bits()),
                PrimitiveValue::Double(v) => ComparableKey::DoubleBits(v.to_bits()),
                PrimitiveValue::Bool(v) => ComparableKey::Bool(v),
            };
        }
    }
    ComparableKey::Message {
        type_url: any.type_url.clone(),
        bytes: any.value.clone(),
    }
}

/// The unqualified message name of a type URL:
/// `type.googleapis.com/com.example.ValueSet` → `ValueSet`.
pub fn unqualified_name(type_url: &str) -> &str {
    let full = type_url.rsplit('/').next().unwrap_or(type_url);
    full.rsplit('.').next().unwrap_or(full)
}

/// The fully-qualified message name of a type URL, without the host prefix.
pub fn full_name(type_url: &str) -> &str {
    type_url.rsplit('/').next().unwrap_or(type_url)
}

fn primitive_kind(type_url: &str) -> Option<&str> {
    type_url
        .strip_prefix(PRIMITIVE_URL_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Encoder/decoder over a registered descriptor pool.
#[derive(Debug, Clone)]
pub struct AnySupport {
    pool: DescriptorPool,
}

impl AnySupport {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Look up a message descriptor by fully-qualified name.
    pub fn message_by_name(&self, name: &str) -> Result<MessageDescriptor, AnySupportError> {
        self.pool
            .get_message_by_name(name)
            .ok_or_else(|| AnySupportError::UnknownType(name.to_string()))
    }

    /// Pack a dynamic message into an Any.
    pub fn encode(&self, message: &DynamicMessage) -> Any {
        Any {
            type_url: format!("{}/{}", TYPE_URL_PREFIX, message.descriptor().full_name()),
            value: {
                use prost::Message;
                message.encode_to_vec()
            },
        }
    }

    /// Pack a primitive into its reserved wrapper encoding.
    ///
    /// Default values encode to an empty payload, matching proto3 field
    /// omission.
    pub fn encode_primitive(&self, value: PrimitiveValue) -> Any {
        Any {
            type_url: format!("{}/{}", PRIMITIVE_URL_PREFIX, value.kind()),
            value: encode_primitive(&value),
        }
    }

    /// Unpack an Any into a primitive or a dynamic message.
    pub fn decode(&self, any: &Any) -> Result<DecodedValue, AnySupportError> {
        if let Some(kind) = primitive_kind(&any.type_url) {
            return decode_primitive(kind, &any.value).map(DecodedValue::Primitive);
        }

        let name = full_name(&any.type_url);
        let descriptor = self
            .pool
            .get_message_by_name(name)
            .ok_or_else(|| AnySupportError::UnknownType(any.type_url.clone()))?;

        DynamicMessage::decode(descriptor, any.value.as_slice())
            .map(DecodedValue::Message)
            .map_err(|e| AnySupportError::Serialization(e.to_string()))
    }

    /// Derive the canonical comparable key for an Any, verifying message
    /// type URLs against the pool.
    pub fn to_comparable(&self, any: &Any) -> Result<ComparableKey, AnySupportError> {
        if primitive_kind(&any.type_url).is_none() {
            let name = full_name(&any.type_url);
            if self.pool.get_message_by_name(name).is_none() {
                return Err(AnySupportError::UnknownType(any.type_url.clone()));
            }
        }
        Ok(comparable_key(any))
    }
}

fn encode_primitive(value: &PrimitiveValue) -> Vec<u8> {
    let mut buf = Vec::new();
    match value {
        PrimitiveValue::String(v) => {
            if !v.is_empty() {
                encoding::string::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Bytes(v) => {
            if !v.is_empty() {
                encoding::bytes::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Int32(v) => {
            if *v != 0 {
                encoding::int32::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Int64(v) => {
            if *v != 0 {
                encoding::int64::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Float(v) => {
            if *v != 0.0 {
                encoding::float::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Double(v) => {
            if *v != 0.0 {
                encoding::double::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
        PrimitiveValue::Bool(v) => {
            if *v {
                encoding::bool::encode(PRIMITIVE_FIELD, v, &mut buf);
            }
        }
    }
    buf
}

fn decode_primitive(kind: &str, bytes: &[u8]) -> Result<PrimitiveValue, AnySupportError> {
    let mut value = default_primitive(kind)?;
    let mut buf = bytes;
    while !buf.is_empty() {
        let (tag, wire_type) =
            encoding::decode_key(&mut buf).map_err(|e| AnySupportError::Serialization(e.to_string()))?;
        if tag != PRIMITIVE_FIELD {
            return Err(AnySupportError::Serialization(format!(
                "Unexpected field {tag} in primitive wrapper"
            )));
        }
        merge_primitive(&mut value, wire_type, &mut buf)?;
    }
    Ok(value)
}

fn default_primitive(kind: &str) -> Result<PrimitiveValue, AnySupportError> {
    Ok(match kind {
        "string" => PrimitiveValue::String(String::new()),
        "bytes" => PrimitiveValue::Bytes(Vec::new()),
        "int32" => PrimitiveValue::Int32(0),
        "int64" => PrimitiveValue::Int64(0),
        "float" => PrimitiveValue::Float(0.0),
        "double" => PrimitiveValue::Double(0.0),
        "bool" => PrimitiveValue::Bool(false),
        other => {
            return Err(AnySupportError::UnknownType(format!(
                "{PRIMITIVE_URL_PREFIX}/{other}"
            )))
        }
    })
}

fn merge_primitive(
    value: &mut PrimitiveValue,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<(), AnySupportError> {
    let ctx = DecodeContext::default();
    let result = match value {
        PrimitiveValue::String(v) => encoding::string::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Bytes(v) => encoding::bytes::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Int32(v) => encoding::int32::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Int64(v) => encoding::int64::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Float(v) => encoding::float::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Double(v) => encoding::double::merge(wire_type, v, buf, ctx),
        PrimitiveValue::Bool(v) => encoding::bool::merge(wire_type, v, buf, ctx),
    };
    result.map_err(|e| AnySupportError::Serialization(e.to_string()))
}
