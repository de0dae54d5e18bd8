//! Socket providers.
//!
//! A provider hands the connector a fresh transport for every connect
//! attempt. It is called with attempt `0` and no error before the first
//! connection, and again after every failure with the consecutive attempt
//! number and the error that ended the previous attempt.

use crate::error::ConnectionError;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tntc_protocol::consts::DEFAULT_PORT;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Default timeout for opening a socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A byte stream the client can run a session over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// An opened transport and the peer it is connected to.
pub struct Channel {
    pub stream: BoxedTransport,
    pub peer: String,
}

impl Channel {
    pub fn new(stream: impl Transport, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("peer", &self.peer).finish()
    }
}

/// Opens transports for the connector.
pub trait SocketProvider: Send + Sync + 'static {
    fn get(
        &self,
        attempt: u32,
        last_error: Option<Arc<ConnectionError>>,
    ) -> BoxFuture<'_, Result<Channel, ConnectionError>>;
}

/// Shared providers, so the caller can keep a handle to the provider the
/// client runs with (for example to refresh its address list).
impl<T: SocketProvider + ?Sized> SocketProvider for Arc<T> {
    fn get(
        &self,
        attempt: u32,
        last_error: Option<Arc<ConnectionError>>,
    ) -> BoxFuture<'_, Result<Channel, ConnectionError>> {
        (**self).get(attempt, last_error)
    }
}

/// Provider backed by a closure.
pub struct FnProvider<F> {
    open: F,
    retries_limit: Option<u32>,
}

impl<F, Fut> FnProvider<F>
where
    F: Fn(u32, Option<Arc<ConnectionError>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Channel, ConnectionError>> + Send + 'static,
{
    pub fn new(open: F) -> Self {
        Self {
            open,
            retries_limit: None,
        }
    }

    pub fn with_retries_limit(mut self, limit: Option<u32>) -> Self {
        self.retries_limit = limit;
        self
    }
}

impl<F, Fut> SocketProvider for FnProvider<F>
where
    F: Fn(u32, Option<Arc<ConnectionError>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Channel, ConnectionError>> + Send + 'static,
{
    fn get(
        &self,
        attempt: u32,
        last_error: Option<Arc<ConnectionError>>,
    ) -> BoxFuture<'_, Result<Channel, ConnectionError>> {
        Box::pin(async move {
            check_retries(self.retries_limit, attempt, last_error.clone())?;
            (self.open)(attempt, last_error).await
        })
    }
}

/// A `host:port` server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parses `host:port`, `host` (default port) or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self, ConnectionError> {
        let trimmed = s.trim();
        let invalid = || ConnectionError::InvalidAddress(s.to_string());
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match trimmed.rsplit_once(':') {
                // Bare IPv6 address without brackets.
                Some((host, _)) if host.contains(':') => (trimmed, None),
                Some((host, port)) => (host, Some(port)),
                None => (trimmed, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Opens a TCP connection to this address.
    pub async fn connect(&self, timeout: Duration) -> Result<Channel, ConnectionError> {
        let addr = self.to_string();
        tracing::debug!("Connecting to {}...", addr);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| ConnectionError::Timeout { addr: addr.clone() })?
            .map_err(|source| ConnectionError::Transient {
                addr: addr.clone(),
                source,
            })?;

        stream.set_nodelay(true).ok();
        tracing::debug!("TCP connected to {}", addr);
        Ok(Channel::new(stream, addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_addresses<I, S>(addresses: I) -> Result<Vec<Address>, ConnectionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parsed = addresses
        .into_iter()
        .map(|addr| Address::parse(addr.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    if parsed.is_empty() {
        return Err(ConnectionError::EmptyAddressList);
    }
    Ok(parsed)
}

/// Fails once `attempt` consecutive attempts have been spent.
fn check_retries(
    limit: Option<u32>,
    attempt: u32,
    last_error: Option<Arc<ConnectionError>>,
) -> Result<(), ConnectionError> {
    match limit {
        Some(limit) if attempt >= limit => Err(ConnectionError::RetriesExhausted {
            attempts: attempt,
            last: last_error,
        }),
        _ => Ok(()),
    }
}

/// Provider that always connects to one address.
#[derive(Debug, Clone)]
pub struct SingleSocketProvider {
    address: Address,
    connect_timeout: Duration,
    retries_limit: Option<u32>,
}

impl SingleSocketProvider {
    pub fn new(address: &str) -> Result<Self, ConnectionError> {
        Ok(Self {
            address: Address::parse(address)?,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retries_limit: None,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retries_limit(mut self, limit: Option<u32>) -> Self {
        self.retries_limit = limit;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl SocketProvider for SingleSocketProvider {
    fn get(
        &self,
        attempt: u32,
        last_error: Option<Arc<ConnectionError>>,
    ) -> BoxFuture<'_, Result<Channel, ConnectionError>> {
        Box::pin(async move {
            check_retries(self.retries_limit, attempt, last_error)?;
            self.address.connect(self.connect_timeout).await
        })
    }
}

#[derive(Debug)]
struct RoundRobinState {
    addresses: Vec<Address>,
    cursor: usize,
    last: Option<Address>,
}

/// Provider that rotates through a list of addresses.
///
/// Each call to [`SocketProvider::get`] uses the next address in order,
/// wrapping at the end of the list.
#[derive(Debug)]
pub struct RoundRobinSocketProvider {
    state: RwLock<RoundRobinState>,
    connect_timeout: Duration,
    retries_limit: Option<u32>,
}

impl RoundRobinSocketProvider {
    pub fn new<I, S>(addresses: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            state: RwLock::new(RoundRobinState {
                addresses: parse_addresses(addresses)?,
                cursor: 0,
                last: None,
            }),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retries_limit: None,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retries_limit(mut self, limit: Option<u32>) -> Self {
        self.retries_limit = limit;
        self
    }

    /// Replaces the address list.
    ///
    /// An empty or unparseable list is rejected and the current list is
    /// kept. The cursor is only wrapped into the new list's range.
    pub fn refresh_addresses<I, S>(&self, addresses: I) -> Result<(), ConnectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addresses = parse_addresses(addresses)?;
        let mut state = self.state.write();
        state.cursor %= addresses.len();
        state.addresses = addresses;
        tracing::debug!("Address list refreshed ({} addresses)", state.addresses.len());
        Ok(())
    }

    pub fn address_count(&self) -> usize {
        self.state.read().addresses.len()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.state.read().addresses.clone()
    }

    /// The address used by the most recent attempt.
    pub fn last_address(&self) -> Option<Address> {
        self.state.read().last.clone()
    }

    fn next_address(&self) -> Address {
        let mut state = self.state.write();
        let address = state.addresses[state.cursor].clone();
        state.cursor = (state.cursor + 1) % state.addresses.len();
        state.last = Some(address.clone());
        address
    }
}

impl SocketProvider for RoundRobinSocketProvider {
    fn get(
        &self,
        attempt: u32,
        last_error: Option<Arc<ConnectionError>>,
    ) -> BoxFuture<'_, Result<Channel, ConnectionError>> {
        Box::pin(async move {
            check_retries(self.retries_limit, attempt, last_error)?;
            let address = self.next_address();
            address.connect(self.connect_timeout).await
        })
    }
}
