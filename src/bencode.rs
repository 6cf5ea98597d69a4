//! Bencode codec ([BEP-3]) used for every DHT datagram.
//!
//! Four kinds of value exist: integers (`i42e`), byte strings (`4:spam`),
//! lists (`l...e`) and dictionaries with byte-string keys (`d...e`).
//! Dictionaries are held in a [`BTreeMap`](std::collections::BTreeMap), so
//! [`encode`] always writes keys in ascending byte order.
//!
//! [`decode`] accepts keys in any order (several deployed DHT clients emit
//! them unsorted); [`decode_strict`] only accepts the canonical form.
//!
//! ```
//! use mldht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:q4:ping1:t2:aae").unwrap();
//! assert_eq!(value.get(b"q").and_then(Value::as_str), Some("ping"));
//! assert_eq!(encode(&value).as_ref(), b"d1:q4:ping1:t2:aae");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_strict};
pub use encode::{encode, encode_into, encoded_len};
pub use error::BencodeError;
pub use value::Value;
