//! MsgPack encoder and decoder.
//!
//! Encoding always picks the shortest representation for a value. Decoding
//! reads exactly one value from the front of a [`Buf`], leaving anything after
//! it untouched.

use crate::error::{CodecError, Kind};
use crate::value::Value;
use bytes::{Buf, BufMut, Bytes};

/// MsgPack tag bytes.
pub mod marker {
    pub const POSITIVE_FIXINT_MAX: u8 = 0x7f;
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
    pub const NIL: u8 = 0xc0;
    pub const NEVER_USED: u8 = 0xc1;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const EXT8: u8 = 0xc7;
    pub const EXT16: u8 = 0xc8;
    pub const EXT32: u8 = 0xc9;
    pub const FLOAT32: u8 = 0xca;
    pub const FLOAT64: u8 = 0xcb;
    pub const UINT8: u8 = 0xcc;
    pub const UINT16: u8 = 0xcd;
    pub const UINT32: u8 = 0xce;
    pub const UINT64: u8 = 0xcf;
    pub const INT8: u8 = 0xd0;
    pub const INT16: u8 = 0xd1;
    pub const INT32: u8 = 0xd2;
    pub const INT64: u8 = 0xd3;
    pub const FIXEXT1: u8 = 0xd4;
    pub const FIXEXT16: u8 = 0xd8;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
    pub const NEGATIVE_FIXINT_MIN: u8 = 0xe0;
}

/// Largest length or count the decoder accepts.
const MAX_DECODE_LEN: u32 = i32::MAX as u32;

/// Deepest array/map nesting the decoder accepts.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Encodes a value into the buffer.
pub fn encode<B: BufMut>(value: &Value, buf: &mut B) -> Result<(), CodecError> {
    match value {
        Value::Nil => buf.put_u8(marker::NIL),
        Value::Bool(false) => buf.put_u8(marker::FALSE),
        Value::Bool(true) => buf.put_u8(marker::TRUE),
        Value::Int(n) => encode_int(*n, buf),
        Value::UInt(n) => encode_uint(*n, buf),
        Value::F32(f) => {
            buf.put_u8(marker::FLOAT32);
            buf.put_f32(*f);
        }
        Value::F64(f) => {
            buf.put_u8(marker::FLOAT64);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            encode_str_header(s.len(), buf)?;
            buf.put_slice(s.as_bytes());
        }
        Value::Bin(b) => {
            encode_bin_header(b.len(), buf)?;
            buf.put_slice(b);
        }
        Value::Array(items) => {
            encode_array_header(items.len(), buf)?;
            for item in items {
                encode(item, buf)?;
            }
        }
        Value::Map(pairs) => {
            encode_map_header(pairs.len(), buf)?;
            for (k, v) in pairs {
                encode(k, buf)?;
                encode(v, buf)?;
            }
        }
        Value::Deferred(deferred) => {
            let resolved = deferred.evaluate()?;
            encode(&resolved, buf)?;
        }
    }
    Ok(())
}

/// Encodes a value into a fresh byte vector.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode(value, &mut buf)?;
    Ok(buf)
}

/// Encodes a signed integer using the shortest form.
pub fn encode_int<B: BufMut>(n: i64, buf: &mut B) {
    if n >= 0 {
        encode_uint(n as u64, buf);
    } else if n >= -32 {
        buf.put_i8(n as i8);
    } else if n >= i8::MIN as i64 {
        buf.put_u8(marker::INT8);
        buf.put_i8(n as i8);
    } else if n >= i16::MIN as i64 {
        buf.put_u8(marker::INT16);
        buf.put_i16(n as i16);
    } else if n >= i32::MIN as i64 {
        buf.put_u8(marker::INT32);
        buf.put_i32(n as i32);
    } else {
        buf.put_u8(marker::INT64);
        buf.put_i64(n);
    }
}

/// Encodes an unsigned integer using the shortest form.
pub fn encode_uint<B: BufMut>(n: u64, buf: &mut B) {
    if n <= marker::POSITIVE_FIXINT_MAX as u64 {
        buf.put_u8(n as u8);
    } else if n <= u8::MAX as u64 {
        buf.put_u8(marker::UINT8);
        buf.put_u8(n as u8);
    } else if n <= u16::MAX as u64 {
        buf.put_u8(marker::UINT16);
        buf.put_u16(n as u16);
    } else if n <= u32::MAX as u64 {
        buf.put_u8(marker::UINT32);
        buf.put_u32(n as u32);
    } else {
        buf.put_u8(marker::UINT64);
        buf.put_u64(n);
    }
}

fn encode_str_header<B: BufMut>(len: usize, buf: &mut B) -> Result<(), CodecError> {
    if len <= 31 {
        buf.put_u8(marker::FIXSTR | len as u8);
    } else if len <= u8::MAX as usize {
        buf.put_u8(marker::STR8);
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(marker::STR16);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(marker::STR32);
        buf.put_u32(len as u32);
    } else {
        return Err(CodecError::TooLong {
            kind: Kind::String,
            len,
        });
    }
    Ok(())
}

fn encode_bin_header<B: BufMut>(len: usize, buf: &mut B) -> Result<(), CodecError> {
    if len <= u8::MAX as usize {
        buf.put_u8(marker::BIN8);
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(marker::BIN16);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(marker::BIN32);
        buf.put_u32(len as u32);
    } else {
        return Err(CodecError::TooLong {
            kind: Kind::Binary,
            len,
        });
    }
    Ok(())
}

/// Writes an array header for `len` elements.
pub fn encode_array_header<B: BufMut>(len: usize, buf: &mut B) -> Result<(), CodecError> {
    if len <= 15 {
        buf.put_u8(marker::FIXARRAY | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(marker::ARRAY16);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(marker::ARRAY32);
        buf.put_u32(len as u32);
    } else {
        return Err(CodecError::TooLong {
            kind: Kind::Array,
            len,
        });
    }
    Ok(())
}

/// Writes a map header for `len` key/value pairs.
pub fn encode_map_header<B: BufMut>(len: usize, buf: &mut B) -> Result<(), CodecError> {
    if len <= 15 {
        buf.put_u8(marker::FIXMAP | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(marker::MAP16);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(marker::MAP32);
        buf.put_u32(len as u32);
    } else {
        return Err(CodecError::TooLong {
            kind: Kind::Map,
            len,
        });
    }
    Ok(())
}

/// Decodes one value from the front of the buffer.
pub fn decode<B: Buf>(buf: &mut B) -> Result<Value, CodecError> {
    ensure(buf, 1)?;
    decode_tagged(buf, 0)
}

/// Decodes one value from a byte slice.
pub fn from_slice(mut data: &[u8]) -> Result<Value, CodecError> {
    decode(&mut data)
}

/// Decodes an element of an array or map.
///
/// Running dry before the element starts is reported as
/// [`CodecError::NoMoreInput`], separately from a truncated scalar.
fn decode_element<B: Buf>(buf: &mut B, depth: usize) -> Result<Value, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::NoMoreInput);
    }
    decode_tagged(buf, depth)
}

fn decode_tagged<B: Buf>(buf: &mut B, depth: usize) -> Result<Value, CodecError> {
    let tag = buf.get_u8();
    match tag {
        0x00..=marker::POSITIVE_FIXINT_MAX => Ok(Value::Int(tag as i64)),
        0x80..=0x8f => decode_map((tag & 0x0f) as u32, buf, depth),
        0x90..=0x9f => decode_array((tag & 0x0f) as u32, buf, depth),
        0xa0..=0xbf => decode_str((tag & 0x1f) as u32, buf),
        marker::NIL => Ok(Value::Nil),
        marker::NEVER_USED => Err(CodecError::InvalidType(tag)),
        marker::FALSE => Ok(Value::Bool(false)),
        marker::TRUE => Ok(Value::Bool(true)),
        marker::BIN8 => {
            let len = read_u8(buf)? as u32;
            decode_bin(len, buf)
        }
        marker::BIN16 => {
            let len = read_u16(buf)? as u32;
            decode_bin(len, buf)
        }
        marker::BIN32 => {
            let len = read_u32(buf)?;
            decode_bin(len, buf)
        }
        marker::EXT8 | marker::EXT16 | marker::EXT32 => Err(CodecError::UnsupportedExtension(tag)),
        marker::FLOAT32 => {
            ensure(buf, 4)?;
            Ok(Value::F32(buf.get_f32()))
        }
        marker::FLOAT64 => {
            ensure(buf, 8)?;
            Ok(Value::F64(buf.get_f64()))
        }
        marker::UINT8 => Ok(Value::Int(read_u8(buf)? as i64)),
        marker::UINT16 => Ok(Value::Int(read_u16(buf)? as i64)),
        marker::UINT32 => Ok(Value::Int(read_u32(buf)? as i64)),
        marker::UINT64 => {
            ensure(buf, 8)?;
            Ok(Value::from(buf.get_u64()))
        }
        marker::INT8 => {
            ensure(buf, 1)?;
            Ok(Value::Int(buf.get_i8() as i64))
        }
        marker::INT16 => {
            ensure(buf, 2)?;
            Ok(Value::Int(buf.get_i16() as i64))
        }
        marker::INT32 => {
            ensure(buf, 4)?;
            Ok(Value::Int(buf.get_i32() as i64))
        }
        marker::INT64 => {
            ensure(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        marker::FIXEXT1..=marker::FIXEXT16 => Err(CodecError::UnsupportedExtension(tag)),
        marker::STR8 => {
            let len = read_u8(buf)? as u32;
            decode_str(len, buf)
        }
        marker::STR16 => {
            let len = read_u16(buf)? as u32;
            decode_str(len, buf)
        }
        marker::STR32 => {
            let len = read_u32(buf)?;
            decode_str(len, buf)
        }
        marker::ARRAY16 => {
            let len = read_u16(buf)? as u32;
            decode_array(len, buf, depth)
        }
        marker::ARRAY32 => {
            let len = read_u32(buf)?;
            decode_array(len, buf, depth)
        }
        marker::MAP16 => {
            let len = read_u16(buf)? as u32;
            decode_map(len, buf, depth)
        }
        marker::MAP32 => {
            let len = read_u32(buf)?;
            decode_map(len, buf, depth)
        }
        marker::NEGATIVE_FIXINT_MIN..=0xff => Ok(Value::Int(tag as i8 as i64)),
    }
}

fn check_len(kind: Kind, len: u32) -> Result<usize, CodecError> {
    if len > MAX_DECODE_LEN {
        return Err(CodecError::TooLarge { kind, len });
    }
    Ok(len as usize)
}

fn decode_str<B: Buf>(len: u32, buf: &mut B) -> Result<Value, CodecError> {
    let len = check_len(Kind::String, len)?;
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map(Value::Str)
        .map_err(|_| CodecError::InvalidUtf8)
}

fn decode_bin<B: Buf>(len: u32, buf: &mut B) -> Result<Value, CodecError> {
    let len = check_len(Kind::Binary, len)?;
    ensure(buf, len)?;
    let bytes: Bytes = buf.copy_to_bytes(len);
    Ok(Value::Bin(bytes))
}

fn nested(depth: usize) -> Result<usize, CodecError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(CodecError::TooDeep(MAX_NESTING_DEPTH));
    }
    Ok(depth + 1)
}

fn decode_array<B: Buf>(len: u32, buf: &mut B, depth: usize) -> Result<Value, CodecError> {
    let depth = nested(depth)?;
    let len = check_len(Kind::Array, len)?;
    // Every element takes at least one byte.
    let mut items = Vec::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        items.push(decode_element(buf, depth)?);
    }
    Ok(Value::Array(items))
}

fn decode_map<B: Buf>(len: u32, buf: &mut B, depth: usize) -> Result<Value, CodecError> {
    let depth = nested(depth)?;
    let len = check_len(Kind::Map, len)?;
    let mut pairs = Vec::with_capacity(len.min(buf.remaining() / 2));
    for _ in 0..len {
        let key = decode_element(buf, depth)?;
        let value = decode_element(buf, depth)?;
        pairs.push((key, value));
    }
    Ok(Value::Map(pairs))
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(CodecError::UnexpectedEof { needed, remaining });
    }
    Ok(())
}

fn read_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_u16<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn read_u32<B: Buf>(buf: &mut B) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}
