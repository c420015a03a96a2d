use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;

/// Lists and dictionaries nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

/// Decode a single bencoded value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;

    if decoder.pos != data.len() {
        return Err(BittorrentError::BencodeError(format!(
            "Trailing data after value at byte {}",
            decoder.pos
        )));
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| {
            BittorrentError::BencodeError("Unexpected end of input".to_string())
        })
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(BittorrentError::BencodeError(
                "Nesting too deep".to_string(),
            ));
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(|b| BencodeValue::String(b.to_vec())),
            c => Err(BittorrentError::BencodeError(format!(
                "Invalid bencode token '{}' at byte {}",
                c as char, self.pos
            ))),
        }
    }

    /// Read ASCII up to `delim`, leaving the cursor past the delimiter.
    fn until(&mut self, delim: u8) -> Result<&'a str> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == delim)
            .ok_or_else(|| {
                BittorrentError::BencodeError(format!(
                    "Missing '{}' after byte {}",
                    delim as char, start
                ))
            })?;
        self.pos = start + len + 1;

        std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| BittorrentError::BencodeError("Non-ASCII number".to_string()))
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'i'
        let digits = self.until(b'e')?;

        if digits.starts_with("-0") || (digits.len() > 1 && digits.starts_with('0')) {
            return Err(BittorrentError::BencodeError(format!(
                "Integer with leading zero: {}",
                digits
            )));
        }

        digits
            .parse::<i64>()
            .map(BencodeValue::Integer)
            .map_err(|_| BittorrentError::BencodeError(format!("Invalid integer: {}", digits)))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len_str = self.until(b':')?;
        let len = len_str.parse::<usize>().map_err(|_| {
            BittorrentError::BencodeError(format!("Invalid string length: {}", len_str))
        })?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                BittorrentError::BencodeError("String length exceeds data".to_string())
            })?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1; // 'l'
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }
        self.pos += 1;

        Ok(BencodeValue::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1; // 'd'
        let mut dict = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BittorrentError::BencodeError(
                    "Dictionary key must be a string".to_string(),
                ));
            }
            let key = self.bytes()?.to_vec();
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.pos += 1;

        Ok(BencodeValue::Dict(dict))
    }
}
