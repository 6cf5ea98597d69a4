use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one value; dictionary keys may appear in any order.
///
/// A key repeated inside one dictionary keeps its last value.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    Decoder::new(data, false).finish()
}

/// Decodes exactly one value in canonical form: keys of every dictionary must
/// be strictly ascending.
pub fn decode_strict(data: &[u8]) -> Result<Value, BencodeError> {
    Decoder::new(data, true).finish()
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    strict: bool,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], strict: bool) -> Self {
        Self {
            data,
            pos: 0,
            strict,
        }
    }

    fn finish(mut self) -> Result<Value, BencodeError> {
        let value = self.value(0)?;
        match self.data.len() - self.pos {
            0 => Ok(value),
            extra => Err(BencodeError::TrailingData(extra)),
        }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep(MAX_DEPTH));
        }

        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    /// Returns the bytes up to (not including) `delim` and steps past it.
    fn until(&mut self, delim: u8) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == delim)
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        self.pos = start + len + 1;
        Ok(&self.data[start..start + len])
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        let offset = self.pos;
        self.pos += 1;
        let digits = self.until(b'e')?;

        let invalid = |reason| BencodeError::InvalidInteger { offset, reason };
        let (negative, magnitude) = match digits.split_first() {
            None => return Err(invalid("empty")),
            Some((b'-', rest)) => (true, rest),
            Some(_) => (false, digits),
        };
        if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(invalid("not a number"));
        }
        if magnitude[0] == b'0' && (magnitude.len() > 1 || negative) {
            return Err(invalid("leading zero"));
        }

        // Only ASCII digits and an optional sign remain.
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("out of range"))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let offset = self.pos;
        let digits = self.until(b':')?;
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::InvalidStringLength(offset));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength(offset))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        let mut previous: Option<Bytes> = None;

        while self.peek()? != b'e' {
            let offset = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey(offset));
            }
            let key = self.bytes()?;
            if self.strict {
                if previous.as_ref().is_some_and(|p| *p >= key) {
                    return Err(BencodeError::UnsortedKey(offset));
                }
                previous = Some(key.clone());
            }
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}
