//! IPROTO field keys, request types and system space ids.

/// Header and body map keys.
pub mod key {
    pub const CODE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const SCHEMA_VERSION: u64 = 0x05;

    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const INDEX_BASE: u64 = 0x15;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const EXPR: u64 = 0x27;
    pub const OPS: u64 = 0x28;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
}

/// Bit set in the response code of every error response.
pub const ERROR_TYPE_MARKER: u64 = 0x8000;

/// Response code of a successful response.
pub const OK: u64 = 0x00;

/// System space holding space definitions visible to the session.
pub const VSPACE_ID: u32 = 281;

/// System space holding index definitions visible to the session.
pub const VINDEX_ID: u32 = 289;

/// Primary index of a system space (by id).
pub const PRIMARY_INDEX_ID: u32 = 0;

/// Default listen port of a Tarantool instance.
pub const DEFAULT_PORT: u16 = 3301;

/// Request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call16,
    Auth,
    Eval,
    Upsert,
    Call,
    Ping,
}

impl RequestType {
    pub fn code(&self) -> u64 {
        match self {
            RequestType::Select => 1,
            RequestType::Insert => 2,
            RequestType::Replace => 3,
            RequestType::Update => 4,
            RequestType::Delete => 5,
            RequestType::Call16 => 6,
            RequestType::Auth => 7,
            RequestType::Eval => 8,
            RequestType::Upsert => 9,
            RequestType::Call => 10,
            RequestType::Ping => 64,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            6 => RequestType::Call16,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            64 => RequestType::Ping,
            _ => return None,
        })
    }
}

/// Index iterator types for SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IteratorType {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
    BitsAllSet,
    BitsAnySet,
    BitsAllNotSet,
    Overlaps,
    Neighbor,
}

impl IteratorType {
    pub fn code(&self) -> u32 {
        match self {
            IteratorType::Eq => 0,
            IteratorType::Req => 1,
            IteratorType::All => 2,
            IteratorType::Lt => 3,
            IteratorType::Le => 4,
            IteratorType::Ge => 5,
            IteratorType::Gt => 6,
            IteratorType::BitsAllSet => 7,
            IteratorType::BitsAnySet => 8,
            IteratorType::BitsAllNotSet => 9,
            IteratorType::Overlaps => 10,
            IteratorType::Neighbor => 11,
        }
    }
}
