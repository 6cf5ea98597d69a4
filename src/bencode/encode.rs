use super::value::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes `value` into a fresh buffer sized with [`encoded_len`].
///
/// ```
/// use mldht::bencode::{encode, Value};
///
/// let list = Value::List(vec![Value::Integer(1), Value::string("two")]);
/// assert_eq!(encode(&list).as_ref(), b"li1e3:twoe");
/// ```
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(value));
    encode_into(value, &mut buf);
    buf.freeze()
}

/// Appends the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => put_string(b, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(entries) => {
            buf.put_u8(b'd');
            for (key, item) in entries {
                put_string(key, buf);
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

/// Number of bytes [`encode`] produces for `value`.
pub fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Integer(i) => 2 + decimal_len(*i),
        Value::Bytes(b) => string_len(b.len()),
        Value::List(items) => 2 + items.iter().map(encoded_len).sum::<usize>(),
        Value::Dict(entries) => {
            2 + entries
                .iter()
                .map(|(k, v)| string_len(k.len()) + encoded_len(v))
                .sum::<usize>()
        }
    }
}

fn put_string(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}

fn string_len(len: usize) -> usize {
    decimal_len(len as i64) + 1 + len
}

fn decimal_len(n: i64) -> usize {
    let sign = usize::from(n < 0);
    let mut magnitude = n.unsigned_abs();
    let mut digits = 1;
    while magnitude >= 10 {
        magnitude /= 10;
        digits += 1;
    }
    sign + digits
}
