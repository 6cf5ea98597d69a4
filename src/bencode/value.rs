use bytes::Bytes;
use std::collections::BTreeMap;

/// One decoded bencode value.
///
/// Dictionaries keep their entries sorted by key, which is also the order
/// they are written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// Raw byte string; not necessarily UTF-8.
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// An empty dictionary, ready for [`Value::with`].
    ///
    /// ```
    /// use mldht::bencode::{encode, Value};
    ///
    /// let args = Value::dict()
    ///     .with("port", 6881i64)
    ///     .with("id", Value::string("abcdefghij0123456789"));
    /// assert_eq!(
    ///     encode(&args).as_ref(),
    ///     b"d2:id20:abcdefghij01234567894:porti6881ee"
    /// );
    /// ```
    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    /// Inserts `key` into a dictionary value and returns it.
    ///
    /// Non-dictionary values are returned unchanged.
    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        if let Value::Dict(entries) = &mut self {
            entries.insert(Bytes::from_static(key.as_bytes()), value.into());
        }
        self
    }

    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string as UTF-8, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks `key` up when this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Shorthand for `get(key)` followed by [`Value::as_bytes`].
    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key).and_then(Value::as_bytes)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(entries: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(entries)
    }
}
