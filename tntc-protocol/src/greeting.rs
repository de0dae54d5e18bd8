//! Server greeting sent on every new connection.
//!
//! The greeting is two 64-byte lines. The first starts with `"Tarantool "`
//! followed by the server version, protocol name and, on newer servers, the
//! instance UUID. The second carries the base64 auth salt. Both are padded
//! with spaces and end with a newline.

use crate::error::ProtocolError;
use uuid::Uuid;

/// Size of one greeting line.
pub const GREETING_LINE_SIZE: usize = 64;

/// Size of the full greeting.
pub const GREETING_SIZE: usize = 2 * GREETING_LINE_SIZE;

/// Prefix every valid greeting starts with.
pub const GREETING_PREFIX: &str = "Tarantool ";

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Everything after the prefix, e.g. `2.11.1 (Binary) 7170b4af-...`.
    pub version: String,
    /// Protocol name without parentheses, e.g. `Binary`.
    pub protocol: Option<String>,
    /// Instance UUID, when the server reports one.
    pub instance_uuid: Option<Uuid>,
    /// Base64 salt for chap-sha1 authentication.
    pub salt: String,
}

impl Greeting {
    /// Parses the 128-byte greeting received from `addr`.
    pub fn parse(bytes: &[u8; GREETING_SIZE], addr: &str) -> Result<Self, ProtocolError> {
        let (line, salt_line) = bytes.split_at(GREETING_LINE_SIZE);
        let version = Self::parse_version_line(line, addr)?;

        let mut tokens = version.split_whitespace().skip(1);
        let protocol = tokens.next().and_then(|token| {
            token
                .strip_prefix('(')
                .and_then(|t| t.strip_suffix(')'))
                .map(str::to_string)
        });
        let instance_uuid = tokens.next().and_then(|token| Uuid::parse_str(token).ok());

        let salt = trim_line(salt_line);
        if salt.is_empty() {
            return Err(ProtocolError::InvalidSalt("empty salt line".to_string()));
        }

        Ok(Self {
            version,
            protocol,
            instance_uuid,
            salt,
        })
    }

    /// Validates the first greeting line and returns the version text.
    pub fn parse_version_line(line: &[u8], addr: &str) -> Result<String, ProtocolError> {
        let text = trim_line(line);
        match text.strip_prefix(GREETING_PREFIX) {
            Some(version) => Ok(version.to_string()),
            None => Err(ProtocolError::BadGreeting {
                addr: addr.to_string(),
                line: text,
            }),
        }
    }

    /// Version number token, e.g. `2.11.1`.
    pub fn version_number(&self) -> &str {
        self.version.split_whitespace().next().unwrap_or("")
    }
}

fn trim_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

#[cfg(test)]
pub(crate) fn greeting_bytes(version_line: &str, salt: &str) -> [u8; GREETING_SIZE] {
    let mut bytes = [b' '; GREETING_SIZE];
    bytes[..version_line.len()].copy_from_slice(version_line.as_bytes());
    bytes[GREETING_LINE_SIZE - 1] = b'\n';
    bytes[GREETING_LINE_SIZE..GREETING_LINE_SIZE + salt.len()].copy_from_slice(salt.as_bytes());
    bytes[GREETING_SIZE - 1] = b'\n';
    bytes
}
