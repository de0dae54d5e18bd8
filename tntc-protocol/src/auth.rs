//! chap-sha1 authentication.
//!
//! ```text
//! step1    = sha1(password)
//! step2    = sha1(step1)
//! scramble = sha1(salt[0..20] ++ step2)
//! proof    = step1 xor scramble
//! ```

use crate::consts::key;
use crate::error::ProtocolError;
use crate::request::Request;
use crate::value::Value;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

/// The only supported auth mechanism.
pub const CHAP_SHA1: &str = "chap-sha1";

/// Length of a SHA-1 digest and of the scramble sent to the server.
pub const SCRAMBLE_SIZE: usize = 20;

/// Computes the chap-sha1 proof for `password` against a base64 `salt`.
pub fn scramble(password: &str, salt: &str) -> Result<[u8; SCRAMBLE_SIZE], ProtocolError> {
    let salt = BASE64_STANDARD
        .decode(salt.trim())
        .map_err(|e| ProtocolError::InvalidSalt(e.to_string()))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(ProtocolError::InvalidSalt(format!(
            "salt has {} bytes, need at least {}",
            salt.len(),
            SCRAMBLE_SIZE
        )));
    }

    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(step2);
    let scramble = hasher.finalize();

    let mut proof = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in proof.iter_mut().enumerate() {
        *byte = step1[i] ^ scramble[i];
    }
    Ok(proof)
}

/// Builds the AUTH request for `username`.
pub fn auth_request(username: &str, password: &str, salt: &str) -> Result<Request, ProtocolError> {
    let proof = scramble(password, salt)?;
    Ok(Request::auth()
        .with(key::USER_NAME, Value::from(username))
        .with(
            key::TUPLE,
            Value::Array(vec![Value::from(CHAP_SHA1), Value::from(proof.to_vec())]),
        ))
}
