//! HTSP message tree.
//!
//! Every request, response and push is a [`Message`]: an ordered map from
//! field name to [`Value`]. Values nest, so a message is a tree of strings,
//! binary blobs, signed 64-bit integers, maps and lists.
//!
//! ```rust
//! use htsp_client::message::Message;
//!
//! let mut msg = Message::new();
//! msg.set("channelId", 42u32);
//! msg.set("weight", 150u32);
//! assert_eq!(msg.get_u32("channelId"), Some(42));
//! ```

pub mod codec;

use bytes::Bytes;

use crate::{HtspError, Result};

pub use codec::{decode_frame, decode_payload, encode_frame, encode_payload};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bin(Bytes),
    S64(i64),
    Map(Message),
    List(Vec<Value>),
}

/// Ordered map of named fields; the root of every wire frame.
///
/// Insertion order is preserved so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Start a request for `method`.
    pub fn request(method: &str) -> Self {
        let mut msg = Self::new();
        msg.set("method", method);
        msg
    }

    /// Set a field, replacing an existing field of the same name in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Builder form of [`Message::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Append a field without checking for duplicates.
    pub(crate) fn push_field(&mut self, name: String, value: Value) {
        self.fields.push((name, value));
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_s64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::S64(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer field that fits in a `u32`.
    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get_s64(name).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.get_s64(name).and_then(|v| i32::try_from(v).ok())
    }

    /// Integer field interpreted as a flag (non-zero is true).
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_s64(name).map(|v| v != 0)
    }

    pub fn get_bin(&self, name: &str) -> Option<&Bytes> {
        match self.get(name)? {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn get_map(&self, name: &str) -> Option<&Message> {
        match self.get(name)? {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[Value]> {
        match self.get(name)? {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Mandatory string field; `context` names the message for the error.
    pub fn require_str(&self, context: &str, name: &str) -> Result<&str> {
        self.get_str(name).ok_or_else(|| HtspError::missing_field(context, name))
    }

    pub fn require_s64(&self, context: &str, name: &str) -> Result<i64> {
        self.get_s64(name).ok_or_else(|| HtspError::missing_field(context, name))
    }

    pub fn require_u32(&self, context: &str, name: &str) -> Result<u32> {
        self.get_u32(name).ok_or_else(|| HtspError::missing_field(context, name))
    }

    pub fn require_bin(&self, context: &str, name: &str) -> Result<&Bytes> {
        self.get_bin(name).ok_or_else(|| HtspError::missing_field(context, name))
    }

    /// The `method` field of a request or push.
    pub fn method(&self) -> Option<&str> {
        self.get_str("method")
    }

    /// The correlation `seq` field of a request or response.
    pub fn seq(&self) -> Option<u32> {
        self.get_u32("seq")
    }

    /// Server-reported failure carried by a response, if any.
    ///
    /// A truthy `noaccess` wins over `error`; an empty `error` string is not
    /// a failure.
    pub fn server_failure(&self, method: &str) -> Option<HtspError> {
        if self.get_bool("noaccess").unwrap_or(false) {
            return Some(HtspError::AccessDenied { method: method.to_string() });
        }
        match self.get_str("error") {
            Some(message) if !message.is_empty() => Some(HtspError::Server {
                method: method.to_string(),
                message: message.to_string(),
            }),
            _ => None,
        }
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_s64(&self) -> Option<i64> {
        match self {
            Value::S64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Message> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::S64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::S64(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::S64(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::S64(v.into())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bin(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bin(Bytes::from(v))
    }
}

impl From<Message> for Value {
    fn from(v: Message) -> Self {
        Value::Map(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
