//! IPROTO packet framing.
//!
//! Frame layout:
//!
//! ```text
//! +------+----------------+------------------+-------------------+
//! | 0xce | payload length | header map       | body map          |
//! |  1   | 4 bytes (BE)   | MsgPack          | MsgPack, optional |
//! +------+----------------+------------------+-------------------+
//! ```
//!
//! The length prefix is itself a MsgPack uint32, so a peer may also read it
//! as a generic MsgPack integer (see [`decode_length_prefix`]).

use crate::codec::{self, marker};
use crate::consts::key;
use crate::error::{CodecError, Kind, ProtocolError};
use crate::value::Value;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Marker byte that starts every frame written by this crate.
pub const FRAME_MARKER: u8 = marker::UINT32;

/// Size of the fixed-width length prefix (marker + u32).
pub const SIZE_HEADER_LEN: usize = 5;

/// Header or body of a packet, keyed by IPROTO field codes.
pub type FieldMap = BTreeMap<u64, Value>;

/// One decoded IPROTO packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    pub header: FieldMap,
    pub body: Option<FieldMap>,
}

impl Packet {
    pub fn new(header: FieldMap) -> Self {
        Self { header, body: None }
    }

    pub fn with_body(mut self, body: FieldMap) -> Self {
        self.body = Some(body);
        self
    }

    /// Request type or response status code.
    pub fn code(&self) -> Option<u64> {
        self.header.get(&key::CODE).and_then(Value::as_u64)
    }

    /// Correlation id.
    pub fn sync(&self) -> Option<u64> {
        self.header.get(&key::SYNC).and_then(Value::as_u64)
    }

    /// Schema version the server was at when it produced the packet.
    pub fn schema_version(&self) -> Option<u64> {
        self.header.get(&key::SCHEMA_VERSION).and_then(Value::as_u64)
    }

    /// Looks up a body field.
    pub fn body_field(&self, field: u64) -> Option<&Value> {
        self.body.as_ref().and_then(|body| body.get(&field))
    }

    /// Serializes the packet into a complete frame.
    ///
    /// The buffer starts with five reserved bytes that are filled in with the
    /// marker and payload length once the maps have been written.
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_bytes(0, SIZE_HEADER_LEN);

        encode_field_map(&self.header, &mut buf)?;
        if let Some(ref body) = self.body {
            encode_field_map(body, &mut buf)?;
        }

        let payload_len = buf.len() - SIZE_HEADER_LEN;
        let payload_len = u32::try_from(payload_len).map_err(|_| CodecError::TooLong {
            kind: Kind::Frame,
            len: payload_len,
        })?;
        buf[0] = FRAME_MARKER;
        buf[1..SIZE_HEADER_LEN].copy_from_slice(&payload_len.to_be_bytes());
        Ok(buf)
    }

    /// Decodes one frame from the front of the buffer.
    ///
    /// Returns `Ok(Some(packet))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < SIZE_HEADER_LEN {
            return Ok(None);
        }

        if buf[0] != FRAME_MARKER {
            return Err(ProtocolError::InvalidMarker(buf[0]));
        }

        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        check_payload_len(payload_len as u64)?;
        let payload_len = payload_len as usize;
        if buf.len() < SIZE_HEADER_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(SIZE_HEADER_LEN);
        let payload = buf.split_to(payload_len).freeze();
        Self::from_payload(payload).map(Some)
    }

    /// Decodes the header map and, if any bytes remain, the body map.
    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let header = into_field_map(codec::decode(&mut payload)?, "header")?;

        let body = if payload.has_remaining() {
            Some(into_field_map(codec::decode(&mut payload)?, "body")?)
        } else {
            None
        };

        if payload.has_remaining() {
            return Err(ProtocolError::TrailingBytes(payload.remaining()));
        }

        Ok(Self { header, body })
    }
}

/// Writes a field map as a MsgPack map with integer keys.
pub fn encode_field_map<B: BufMut>(map: &FieldMap, buf: &mut B) -> Result<(), CodecError> {
    codec::encode_map_header(map.len(), buf)?;
    for (k, v) in map {
        codec::encode_uint(*k, buf);
        codec::encode(v, buf)?;
    }
    Ok(())
}

fn into_field_map(value: Value, what: &'static str) -> Result<FieldMap, ProtocolError> {
    let pairs = match value {
        Value::Map(pairs) => pairs,
        other => {
            return Err(ProtocolError::UnexpectedType {
                what,
                found: other.kind_name(),
            })
        }
    };

    let mut map = FieldMap::new();
    for (k, v) in pairs {
        let field = k.as_u64().ok_or_else(|| ProtocolError::InvalidKey {
            what,
            found: format!("{:?}", k),
        })?;
        map.insert(field, v);
    }
    Ok(map)
}

/// Number of bytes that follow a length-prefix tag.
///
/// The length prefix must be a MsgPack unsigned integer; any other tag is
/// rejected before more input is read.
pub fn length_prefix_width(tag: u8) -> Result<usize, ProtocolError> {
    match tag {
        0x00..=marker::POSITIVE_FIXINT_MAX => Ok(0),
        marker::UINT8 => Ok(1),
        marker::UINT16 => Ok(2),
        marker::UINT32 => Ok(4),
        marker::UINT64 => Ok(8),
        other => Err(ProtocolError::InvalidLengthPrefix(other)),
    }
}

/// Decodes a length prefix written as any MsgPack unsigned integer.
pub fn decode_length_prefix<B: Buf>(buf: &mut B) -> Result<usize, ProtocolError> {
    let value = codec::decode(buf)?;
    let len = value.as_u64().ok_or(ProtocolError::UnexpectedType {
        what: "length",
        found: value.kind_name(),
    })?;
    check_payload_len(len)?;
    Ok(len as usize)
}

fn check_payload_len(len: u64) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}
