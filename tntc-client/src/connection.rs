//! Session setup on a freshly opened transport.
//!
//! These helpers read directly from the stream and are only used before the
//! reader and writer tasks take over the connection.

use crate::error::ConnectionError;
use bytes::Bytes;
use tntc_protocol::frame::{decode_length_prefix, length_prefix_width};
use tntc_protocol::{auth, Greeting, Packet, Response, GREETING_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn read_error(err: std::io::Error) -> ConnectionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectionError::EndOfStream
    } else {
        ConnectionError::Io(err)
    }
}

/// Reads and parses the 128-byte server greeting.
pub async fn read_greeting<R>(reader: &mut R, peer: &str) -> Result<Greeting, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; GREETING_SIZE];
    reader.read_exact(&mut buf).await.map_err(read_error)?;
    let greeting = Greeting::parse(&buf, peer)?;
    tracing::debug!("Greeting from {}: Tarantool {}", peer, greeting.version);
    Ok(greeting)
}

/// Reads exactly one frame.
///
/// The length prefix may be any MsgPack unsigned integer.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 9];
    reader.read_exact(&mut prefix[..1]).await.map_err(read_error)?;
    let width = length_prefix_width(prefix[0])?;
    reader
        .read_exact(&mut prefix[1..=width])
        .await
        .map_err(read_error)?;
    let len = decode_length_prefix(&mut &prefix[..=width])?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(read_error)?;
    Ok(Packet::from_payload(Bytes::from(payload))?)
}

/// Sends a chap-sha1 AUTH request and waits for the server's verdict.
pub async fn authenticate<S>(
    stream: &mut S,
    sync: u64,
    username: &str,
    password: &str,
    greeting: &Greeting,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = auth::auth_request(username, password, &greeting.salt)?;
    let encoded = request.encode(sync)?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;

    let response = Response::from_packet(read_packet(stream).await?)?;
    if let Some(err) = response.error() {
        tracing::debug!("Authentication as {} rejected: {}", username, err);
        return Err(ConnectionError::AuthFailed(err));
    }

    tracing::debug!("Authenticated as {}", username);
    Ok(())
}
