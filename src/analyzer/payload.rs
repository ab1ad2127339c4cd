/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::Serialize;

use public::bytes::{read_u16_be, read_u32_be, read_u64_be};

/// Cursor reader over one possibly-truncated payload view. Reads never
/// succeed past the end of the buffer: a short read returns `None` and
/// leaves the cursor where it was, which is the signal to bail out with
/// "need more bytes".
pub struct PayloadMessage<'a> {
    data: &'a [u8],
    pub offset: usize,
}

impl<'a> PayloadMessage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        if offset + 2 > self.data.len() {
            return None;
        }
        Some(read_u16_be(&self.data[offset..]))
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        if offset + 4 > self.data.len() {
            return None;
        }
        Some(read_u32_be(&self.data[offset..]))
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        if offset + 8 > self.data.len() {
            return None;
        }
        Some(read_u64_be(&self.data[offset..]))
    }

    // returns (new_offset, bytes)
    pub fn read_bytes(&self, offset: usize, length: usize) -> Option<(usize, &'a [u8])> {
        let end = offset.checked_add(length)?;
        if end > self.data.len() {
            return None;
        }
        Some((end, &self.data[offset..end]))
    }

    // consume up to and including the delimiter, returning the bytes before it
    pub fn read_until(&self, offset: usize, delimiter: u8) -> Option<(usize, &'a [u8])> {
        if offset >= self.data.len() {
            return None;
        }
        let pos = self.data[offset..].iter().position(|&b| b == delimiter)?;
        Some((offset + pos + 1, &self.data[offset..offset + pos]))
    }

    // big-endian length prefix of 1, 2 or 4 bytes followed by the string
    pub fn read_length_prefixed_string(
        &self,
        offset: usize,
        prefix_width: usize,
    ) -> Option<(usize, &'a [u8])> {
        let length = match prefix_width {
            1 => self.read_u8(offset)? as usize,
            2 => self.read_u16(offset)? as usize,
            4 => self.read_u32(offset)? as usize,
            _ => return None,
        };
        self.read_bytes(offset + prefix_width, length)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KeyVal {
    pub key: &'static str,
    pub val: AttrValue,
}

/// Merged attribute list of an emitted record. Insertion ordered, last
/// write wins on duplicate keys.
#[derive(Serialize, Debug, Clone, Default)]
pub struct AttributeMap(Vec<KeyVal>);

impl AttributeMap {
    pub fn add_str(&mut self, key: &'static str, val: impl Into<String>) {
        self.put(key, AttrValue::String(val.into()));
    }

    pub fn add_int(&mut self, key: &'static str, val: i64) {
        self.put(key, AttrValue::Int(val));
    }

    pub fn add_bool(&mut self, key: &'static str, val: bool) {
        self.put(key, AttrValue::Bool(val));
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.iter().find(|kv| kv.key == key).map(|kv| &kv.val)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyVal> {
        self.0.iter()
    }

    fn put(&mut self, key: &'static str, val: AttrValue) {
        for kv in self.0.iter_mut() {
            if kv.key == key {
                kv.val = val;
                return;
            }
        }
        self.0.push(KeyVal { key, val });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_are_incomplete() {
        let msg = PayloadMessage::new(&[0x12, 0x34, 0x56]);
        assert_eq!(msg.read_u16(0), Some(0x1234));
        assert_eq!(msg.read_u16(2), None);
        assert_eq!(msg.read_u32(0), None);
        assert_eq!(msg.read_bytes(1, 2), Some((3, &[0x34, 0x56][..])));
        assert_eq!(msg.read_bytes(2, 2), None);
    }

    #[test]
    fn read_until_delimiter() {
        let msg = PayloadMessage::new(b"abc\r\ndef");
        let (next, line) = msg.read_until(0, b'\r').unwrap();
        assert_eq!(line, b"abc");
        assert_eq!(next, 4);
        assert!(msg.read_until(5, b'\r').is_none());
    }

    #[test]
    fn length_prefixed_string() {
        let msg = PayloadMessage::new(&[0x00, 0x03, b'f', b'o', b'o']);
        let (next, s) = msg.read_length_prefixed_string(0, 2).unwrap();
        assert_eq!(s, b"foo");
        assert_eq!(next, 5);
        // prefix exceeds buffer
        let msg = PayloadMessage::new(&[0x00, 0x09, b'f']);
        assert!(msg.read_length_prefixed_string(0, 2).is_none());
    }

    #[test]
    fn attribute_overwrite() {
        let mut attrs = AttributeMap::default();
        attrs.add_int("dns.rcode", 0);
        attrs.add_bool("is_error", false);
        attrs.add_int("dns.rcode", 3);
        assert_eq!(attrs.get("dns.rcode"), Some(&AttrValue::Int(3)));
        assert_eq!(attrs.iter().count(), 2);
    }
}
