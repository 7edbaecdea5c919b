use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one bencode value from `data`.
///
/// Trailing bytes after the value are an error, which is the right posture
/// for datagram protocols: a KRPC packet is one value and nothing else.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    let value = cur.value(0)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump();
        let start = self.pos;
        while self.peek()? != b'e' {
            self.bump();
        }
        let digits = &self.data[start..self.pos];
        self.bump();
        // i-0e, i03e and the empty integer are all malformed per BEP-3.
        let canonical = match digits {
            [] | [b'-'] => false,
            [b'0', _, ..] => false,
            [b'-', b'0', ..] => false,
            _ => true,
        };
        if !canonical {
            return Err(BencodeError::InvalidInteger);
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Int)
            .ok_or(BencodeError::InvalidInteger)
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.bump();
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.bump();
        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.bump();
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::BadDictKey);
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.bump();
        Ok(Value::Dict(map))
    }
}
