//! Request builders and response envelope.

use crate::consts::{key, IteratorType, RequestType, ERROR_TYPE_MARKER, OK};
use crate::error::{CodecError, ProtocolError, ServerError};
use crate::frame::{FieldMap, Packet};
use crate::value::Value;
use bytes::BytesMut;

/// A request body waiting for a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_type: RequestType,
    pub body: FieldMap,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            body: FieldMap::new(),
        }
    }

    pub fn with(mut self, field: u64, value: impl Into<Value>) -> Self {
        self.body.insert(field, value.into());
        self
    }

    /// Serializes the request as a frame carrying `sync`.
    pub fn encode(&self, sync: u64) -> Result<BytesMut, CodecError> {
        let mut header = FieldMap::new();
        header.insert(key::CODE, Value::from(self.request_type.code()));
        header.insert(key::SYNC, Value::from(sync));
        Packet::new(header).with_body(self.body.clone()).encode()
    }

    pub fn ping() -> Self {
        Self::new(RequestType::Ping)
    }

    pub fn auth() -> Self {
        Self::new(RequestType::Auth)
    }

    pub fn select(
        space_id: u32,
        index_id: u32,
        search_key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
    ) -> Self {
        Self::new(RequestType::Select)
            .with(key::SPACE_ID, space_id)
            .with(key::INDEX_ID, index_id)
            .with(key::KEY, search_key)
            .with(key::OFFSET, offset)
            .with(key::LIMIT, limit)
            .with(key::ITERATOR, iterator.code())
    }

    pub fn insert(space_id: u32, tuple: Vec<Value>) -> Self {
        Self::new(RequestType::Insert)
            .with(key::SPACE_ID, space_id)
            .with(key::TUPLE, tuple)
    }

    pub fn replace(space_id: u32, tuple: Vec<Value>) -> Self {
        Self::new(RequestType::Replace)
            .with(key::SPACE_ID, space_id)
            .with(key::TUPLE, tuple)
    }

    /// `ops` is a list of update operations, e.g. `["=", 1, "value"]`.
    pub fn update(space_id: u32, index_id: u32, search_key: Vec<Value>, ops: Vec<Value>) -> Self {
        Self::new(RequestType::Update)
            .with(key::SPACE_ID, space_id)
            .with(key::INDEX_ID, index_id)
            .with(key::KEY, search_key)
            .with(key::TUPLE, ops)
    }

    pub fn upsert(space_id: u32, tuple: Vec<Value>, ops: Vec<Value>) -> Self {
        Self::new(RequestType::Upsert)
            .with(key::SPACE_ID, space_id)
            .with(key::TUPLE, tuple)
            .with(key::OPS, ops)
    }

    pub fn delete(space_id: u32, index_id: u32, search_key: Vec<Value>) -> Self {
        Self::new(RequestType::Delete)
            .with(key::SPACE_ID, space_id)
            .with(key::INDEX_ID, index_id)
            .with(key::KEY, search_key)
    }

    pub fn call(function: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Call)
            .with(key::FUNCTION_NAME, function)
            .with(key::TUPLE, args)
    }

    /// Call with the pre-1.7 result format (every result wrapped in a tuple).
    pub fn call16(function: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Call16)
            .with(key::FUNCTION_NAME, function)
            .with(key::TUPLE, args)
    }

    pub fn eval(expression: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Eval)
            .with(key::EXPR, expression)
            .with(key::TUPLE, args)
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub sync: u64,
    pub code: u64,
    pub schema_version: Option<u64>,
    pub body: FieldMap,
}

impl Response {
    pub fn from_packet(packet: Packet) -> Result<Self, ProtocolError> {
        let code = packet.code().ok_or(ProtocolError::MissingField("code"))?;
        let sync = packet.sync().ok_or(ProtocolError::MissingField("sync"))?;
        let schema_version = packet.schema_version();
        Ok(Self {
            sync,
            code,
            schema_version,
            body: packet.body.unwrap_or_default(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == OK
    }

    pub fn is_error(&self) -> bool {
        self.code & ERROR_TYPE_MARKER != 0
    }

    /// Returns the server error carried by an error response.
    ///
    /// Any non-zero code counts as an error, with or without the error
    /// marker bit.
    pub fn error(&self) -> Option<ServerError> {
        if self.is_ok() {
            return None;
        }
        // Codes past u32 are kept distinct from every known code.
        let code = u32::try_from(self.code & !ERROR_TYPE_MARKER).unwrap_or(u32::MAX);
        let message = self
            .body
            .get(&key::ERROR)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Some(ServerError::new(code, message))
    }

    /// Returns the result tuples (empty when the body carries none).
    pub fn into_data(mut self) -> Vec<Value> {
        match self.body.remove(&key::DATA) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        }
    }
}
