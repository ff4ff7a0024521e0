// SPDX-License-Identifier: AGPL-3.0-or-later

//! Marshal/unmarshal typed values with alignment and endianness (C1).
//!
//! Every append advances a [`bytes::BytesMut`]; every parse advances a
//! [`Cursor`] over a borrowed `&[u8]`. Alignment is computed from the
//! current offset, exactly as the data model requires: before writing or
//! reading a value of natural alignment `A` at offset `o`, the offset is
//! advanced to `(o + A - 1) & !(A - 1)`, padding with zero bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wire::value::{Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("overflow: declared length {declared} exceeds available {available}")]
    Overflow { declared: usize, available: usize },
    #[error("bad alignment: offset {offset} is not aligned to {align}")]
    BadAlign { offset: usize, align: usize },
    #[error("invalid utf-8 in string value")]
    BadUtf8,
    #[error("unknown type tag: 0x{0:02x}")]
    UnknownType(u8),
    #[error("duplicate key in dict: {0}")]
    DuplicateKey(String),
    #[error("array element type mismatch: expected {expected:?}, found {found:?}")]
    HeterogeneousArray { expected: ValueType, found: ValueType },
    #[error("buffer exhausted while reading")]
    Eof,
    #[error("out of memory")]
    Oom,
}

type Result<T> = std::result::Result<T, CodecError>;

#[inline]
pub fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Zero-pads `buf` until its length is aligned to `align`.
pub fn pad_to(buf: &mut BytesMut, align: usize) {
    let target = align_up(buf.len(), align);
    while buf.len() < target {
        buf.put_u8(0);
    }
}

/// A read cursor over a borrowed byte slice, tracking position explicitly so
/// alignment can be checked against the start of the enclosing region.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::Eof);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Consumes and returns exactly `n` unaligned bytes. Used by callers
    /// outside the codec (e.g. the message header-field tag) that need raw
    /// access without going through a typed value.
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Skip zero padding bytes up to the given alignment.
    pub fn align_to(&mut self, align: usize) -> Result<()> {
        let target = align_up(self.pos, align);
        let pad = target - self.pos;
        if pad > 0 {
            let _ = self.take(pad)?;
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self, endian: Endian) -> Result<u32> {
        let bytes = self.take(4)?;
        let mut b: Bytes = Bytes::copy_from_slice(bytes);
        Ok(match endian {
            Endian::Big => b.get_u32(),
            Endian::Little => b.get_u32_le(),
        })
    }

    fn get_i32(&mut self, endian: Endian) -> Result<i32> {
        Ok(self.get_u32(endian)? as i32)
    }

    fn get_u64(&mut self, endian: Endian) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut b: Bytes = Bytes::copy_from_slice(bytes);
        Ok(match endian {
            Endian::Big => b.get_u64(),
            Endian::Little => b.get_u64_le(),
        })
    }

    fn get_i64(&mut self, endian: Endian) -> Result<i64> {
        Ok(self.get_u64(endian)? as i64)
    }

    fn get_f64(&mut self, endian: Endian) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64(endian)?))
    }
}

/// Appends a single typed value to `buf`: a one-byte type tag (unaligned)
/// followed by the value's payload, aligned to its natural alignment.
pub fn append_value(buf: &mut BytesMut, value: &Value, endian: Endian) -> Result<()> {
    buf.put_u8(value.value_type().tag());
    append_payload(buf, value, endian)
}

fn append_payload(buf: &mut BytesMut, value: &Value, endian: Endian) -> Result<()> {
    let align = value.value_type().alignment();
    pad_to(buf, align);

    match value {
        Value::Invalid | Value::Nil => {},
        Value::Boolean(b) => put_u32(buf, *b as u32, endian),
        Value::Byte(b) => buf.put_u8(*b),
        Value::Int32(v) => put_u32(buf, *v as u32, endian),
        Value::Uint32(v) => put_u32(buf, *v, endian),
        Value::Int64(v) => put_u64(buf, *v as u64, endian),
        Value::Uint64(v) => put_u64(buf, *v, endian),
        Value::Double(v) => put_u64(buf, v.to_bits(), endian),
        Value::String(s) => append_string(buf, s, endian),
        Value::Named { name, data } => {
            buf.put_slice(name);
            append_byte_blob(buf, data, endian);
        },
        Value::Array { element_type, items } => {
            append_array(buf, *element_type, items, endian)?;
        },
        Value::Dict(pairs) => append_dict(buf, pairs, endian)?,
    }
    Ok(())
}

fn put_u32(buf: &mut BytesMut, v: u32, endian: Endian) {
    match endian {
        Endian::Big => buf.put_u32(v),
        Endian::Little => buf.put_u32_le(v),
    }
}

fn put_u64(buf: &mut BytesMut, v: u64, endian: Endian) {
    match endian {
        Endian::Big => buf.put_u64(v),
        Endian::Little => buf.put_u64_le(v),
    }
}

/// 4-byte length, UTF-8 bytes, one NUL; length excludes the NUL.
fn append_string(buf: &mut BytesMut, s: &str, endian: Endian) {
    put_u32(buf, s.len() as u32, endian);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn append_byte_blob(buf: &mut BytesMut, data: &[u8], endian: Endian) {
    put_u32(buf, data.len() as u32, endian);
    buf.put_slice(data);
}

/// 4-byte byte-length of the element region, element region.
fn append_array(
    buf: &mut BytesMut,
    element_type: ValueType,
    items: &[Value],
    endian: Endian,
) -> Result<()> {
    buf.put_u8(element_type.tag());
    let len_offset = buf.len();
    put_u32(buf, 0, endian); // placeholder, back-patched below
    pad_to(buf, element_type.alignment());
    let body_start = buf.len();
    for item in items {
        if item.value_type() != element_type {
            return Err(CodecError::HeterogeneousArray {
                expected: element_type,
                found: item.value_type(),
            });
        }
        append_payload(buf, item, endian)?;
    }
    let body_len = (buf.len() - body_start) as u32;
    set_u32_at(buf, len_offset, body_len, endian);
    Ok(())
}

fn append_dict(buf: &mut BytesMut, pairs: &[(String, Value)], endian: Endian) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for (k, _) in pairs {
        if !seen.insert(k.as_str()) {
            return Err(CodecError::DuplicateKey(k.clone()));
        }
    }
    let len_offset = buf.len();
    put_u32(buf, 0, endian);
    pad_to(buf, 4);
    let body_start = buf.len();
    for (k, v) in pairs {
        pad_to(buf, 4);
        append_string(buf, k, endian);
        append_value(buf, v, endian)?;
    }
    let body_len = (buf.len() - body_start) as u32;
    set_u32_at(buf, len_offset, body_len, endian);
    Ok(())
}

/// Overwrites the 4-byte big/little-endian integer at `offset` — the
/// back-patching primitive used for header/body length fields and array
/// byte-lengths.
pub fn set_u32_at(buf: &mut BytesMut, offset: usize, value: u32, endian: Endian) {
    let bytes = match endian {
        Endian::Big => value.to_be_bytes(),
        Endian::Little => value.to_le_bytes(),
    };
    buf[offset..offset + 4].copy_from_slice(&bytes);
}

/// Parses one type-tagged value (tag byte + aligned payload).
pub fn parse_value(cur: &mut Cursor<'_>, endian: Endian) -> Result<Value> {
    let tag = cur.get_u8()?;
    let vt = ValueType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;
    parse_payload(cur, vt, endian)
}

fn parse_payload(cur: &mut Cursor<'_>, vt: ValueType, endian: Endian) -> Result<Value> {
    cur.align_to(vt.alignment())?;
    Ok(match vt {
        ValueType::Invalid => Value::Invalid,
        ValueType::Nil => Value::Nil,
        ValueType::Boolean => Value::Boolean(cur.get_u32(endian)? != 0),
        ValueType::Byte => Value::Byte(cur.get_u8()?),
        ValueType::Int32 => Value::Int32(cur.get_i32(endian)?),
        ValueType::Uint32 => Value::Uint32(cur.get_u32(endian)?),
        ValueType::Int64 => Value::Int64(cur.get_i64(endian)?),
        ValueType::Uint64 => Value::Uint64(cur.get_u64(endian)?),
        ValueType::Double => Value::Double(cur.get_f64(endian)?),
        ValueType::String => Value::String(parse_string(cur, endian)?),
        ValueType::Named => parse_named(cur, endian)?,
        ValueType::Array => parse_array(cur, endian)?,
        ValueType::Dict => parse_dict(cur, endian)?,
    })
}

fn parse_string(cur: &mut Cursor<'_>, endian: Endian) -> Result<String> {
    let len = cur.get_u32(endian)? as usize;
    let bytes = cur.take(len)?;
    let s = std::str::from_utf8(bytes).map_err(|_| CodecError::BadUtf8)?.to_owned();
    let nul = cur.get_u8()?;
    if nul != 0 {
        return Err(CodecError::BadUtf8);
    }
    Ok(s)
}

fn parse_named(cur: &mut Cursor<'_>, endian: Endian) -> Result<Value> {
    let name_bytes = cur.take(4)?;
    let mut name = [0u8; 4];
    name.copy_from_slice(name_bytes);
    let len = cur.get_u32(endian)? as usize;
    let data = Bytes::copy_from_slice(cur.take(len)?);
    Ok(Value::Named { name, data })
}

fn parse_array(cur: &mut Cursor<'_>, endian: Endian) -> Result<Value> {
    let elem_tag = cur.get_u8()?;
    let element_type = ValueType::from_tag(elem_tag).ok_or(CodecError::UnknownType(elem_tag))?;
    let byte_len = cur.get_u32(endian)? as usize;
    if byte_len > cur.remaining() {
        return Err(CodecError::Overflow { declared: byte_len, available: cur.remaining() });
    }
    cur.align_to(element_type.alignment())?;
    let end = cur.pos() + byte_len;
    let mut items = Vec::new();
    while cur.pos() < end {
        items.push(parse_payload(cur, element_type, endian)?);
    }
    if cur.pos() != end {
        return Err(CodecError::BadAlign { offset: cur.pos(), align: element_type.alignment() });
    }
    Ok(Value::Array { element_type, items })
}

fn parse_dict(cur: &mut Cursor<'_>, endian: Endian) -> Result<Value> {
    let byte_len = cur.get_u32(endian)? as usize;
    if byte_len > cur.remaining() {
        return Err(CodecError::Overflow { declared: byte_len, available: cur.remaining() });
    }
    cur.align_to(4)?;
    let end = cur.pos() + byte_len;
    let mut pairs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    while cur.pos() < end {
        cur.align_to(4)?;
        let key = parse_string(cur, endian)?;
        let value = parse_value(cur, endian)?;
        if !seen.insert(key.clone()) {
            return Err(CodecError::DuplicateKey(key));
        }
        pairs.push((key, value));
    }
    Ok(Value::Dict(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value, endian: Endian) -> Value {
        let mut buf = BytesMut::new();
        append_value(&mut buf, v, endian).expect("append");
        let mut cur = Cursor::new(&buf);
        parse_value(&mut cur, endian).expect("parse")
    }

    #[test]
    fn scalars_roundtrip_both_endiannesses() {
        for endian in [Endian::Big, Endian::Little] {
            assert_eq!(roundtrip(&Value::Boolean(true), endian), Value::Boolean(true));
            assert_eq!(roundtrip(&Value::Byte(0xab), endian), Value::Byte(0xab));
            assert_eq!(roundtrip(&Value::Int32(-1), endian), Value::Int32(-1));
            assert_eq!(roundtrip(&Value::Uint32(42), endian), Value::Uint32(42));
            assert_eq!(roundtrip(&Value::Int64(-123456789012), endian), Value::Int64(-123456789012));
            assert_eq!(roundtrip(&Value::Uint64(123456789012), endian), Value::Uint64(123456789012));
            assert_eq!(roundtrip(&Value::Double(3.5), endian), Value::Double(3.5));
            assert_eq!(
                roundtrip(&Value::String("héllo".into()), endian),
                Value::String("héllo".into())
            );
        }
    }

    #[test]
    fn array_and_dict_roundtrip() {
        let arr = Value::Array {
            element_type: ValueType::Int32,
            items: vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)],
        };
        assert_eq!(roundtrip(&arr, Endian::Little), arr);

        let dict = Value::Dict(vec![("a".to_owned(), Value::Uint32(7))]);
        assert_eq!(roundtrip(&dict, Endian::Little), dict);
    }

    #[test]
    fn scenario_6_mixed_body_byte_length_little_endian() {
        // [STRING "héllo", INT32 -1, ARRAY<INT32>{1,2,3}, DICT{"a"->UINT32 7}]
        let mut buf = BytesMut::new();
        let values = vec![
            Value::String("héllo".to_owned()),
            Value::Int32(-1),
            Value::Array {
                element_type: ValueType::Int32,
                items: vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)],
            },
            Value::Dict(vec![("a".to_owned(), Value::Uint32(7))]),
        ];
        for v in &values {
            append_value(&mut buf, v, Endian::Little).expect("append");
        }

        let mut cur = Cursor::new(&buf);
        for expected in &values {
            let got = parse_value(&mut cur, Endian::Little).expect("parse");
            assert_eq!(&got, expected);
        }
        assert!(cur.is_empty());
    }

    #[test]
    fn dict_keys_after_the_first_are_4_aligned() {
        // A one-byte value between two string keys ("ab" -> BYTE, "bb" ->
        // UINT32) pushes the second key's length field off a 4-byte
        // boundary unless append_dict/parse_dict pad before every key, not
        // just the dict's own byte-length region.
        let dict = Value::Dict(vec![
            ("ab".to_owned(), Value::Byte(1)),
            ("bb".to_owned(), Value::Uint32(2)),
        ]);
        let mut buf = BytesMut::new();
        append_value(&mut buf, &dict, Endian::Little).expect("append");

        // tag byte + 4-byte dict length = 5, then pad_to(4) brings the
        // first key's length field to offset 8.
        let first_key_len_offset = 8;
        assert_eq!(&buf[first_key_len_offset..first_key_len_offset + 4], &2u32.to_le_bytes());

        // "ab" entry: 4 (len) + 2 (content) + 1 (nul) + 1 (tag) + 1 (byte) = 9
        // bytes, landing the second key at offset 17, which must be padded
        // up to 20 before its length field.
        let second_key_len_offset = 20;
        assert_eq!(&buf[second_key_len_offset..second_key_len_offset + 4], &2u32.to_le_bytes());

        assert_eq!(roundtrip(&dict, Endian::Little), dict);
    }

    #[test]
    fn duplicate_dict_key_rejected() {
        let mut buf = BytesMut::new();
        let dict = Value::Dict(vec![
            ("a".to_owned(), Value::Uint32(1)),
            ("a".to_owned(), Value::Uint32(2)),
        ]);
        assert!(matches!(
            append_value(&mut buf, &dict, Endian::Big),
            Err(CodecError::DuplicateKey(_))
        ));
    }

    #[test]
    fn set_u32_at_backpatches_length_field() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xdead_beef);
        let offset = 0;
        set_u32_at(&mut buf, offset, 0x1234_5678, Endian::Big);
        assert_eq!(&buf[..4], &0x1234_5678u32.to_be_bytes());
    }

    #[test]
    fn alignment_invariant_holds_after_every_append() {
        let mut buf = BytesMut::new();
        buf.put_u8(0); // misalign by one byte
        append_value(&mut buf, &Value::Uint32(1), Endian::Big).expect("append");
        // tag byte at offset 1, payload must start 4-aligned
        assert_eq!((buf.len() - 4) % 4, 0);
    }
}
