//! # tntc-protocol
//!
//! Wire protocol implementation for tntc (Tarantool IPROTO).
//!
//! This crate provides:
//! - A MsgPack codec over a closed [`Value`] type
//! - Length-prefixed packet framing with header/body maps
//! - Greeting parsing and chap-sha1 authentication
//! - Request builders, response envelope and server error codes

pub mod auth;
pub mod codec;
pub mod consts;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod request;
pub mod value;

pub use consts::{IteratorType, RequestType};
pub use error::{CodecError, ErrorCode, Kind, ProtocolError, ServerError};
pub use frame::{FieldMap, Packet, FRAME_MARKER, SIZE_HEADER_LEN};
pub use greeting::{Greeting, GREETING_SIZE};
pub use request::{Request, Response};
pub use value::Value;

/// Maximum frame payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;
