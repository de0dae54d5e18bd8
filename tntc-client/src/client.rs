//! Multiplexed client.
//!
//! One [`Client`] owns at most one live transport. Operations from any
//! number of callers are tagged with a sync id, appended to a shared send
//! buffer and completed by the reader task when the matching response
//! arrives. A background connector opens transports through a
//! [`SocketProvider`] and replaces them when they fail.
//!
//! ```text
//!              +-------------+   ok    +-------+
//!  Connecting -> Authenticating ------> | Ready | --close--> Closed
//!      ^       +-------------+         +-------+
//!      |                                   | I/O failure
//!      +----------- Reconnecting <---------+
//! ```

use crate::config::ClientConfig;
use crate::connection::{authenticate, read_greeting};
use crate::error::{ClientError, ConnectionError};
use crate::ops::{ComposableOps, FireAndForgetOps, FutureOps, ResponseFuture, SyncOps};
use crate::provider::{Channel, SocketProvider};
use crate::schema::SchemaCache;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tntc_protocol::{Greeting, Packet, ProtocolError, Request, Response, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Result of one operation: the response data tuples.
pub type OperationResult = Result<Vec<Value>, ClientError>;

pub(crate) type ResultSink = oneshot::Sender<OperationResult>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

/// Client statistics.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub connect_attempts: AtomicU64,
    pub connects: AtomicU64,
    pub spurious_wakeups: AtomicU64,
    pub requests_submitted: AtomicU64,
    pub responses_dropped: AtomicU64,
}

struct PendingOperation {
    /// `None` for fire-and-forget operations.
    sink: Option<ResultSink>,
}

struct Inner {
    phase: Phase,
    epoch: u64,
    pending: HashMap<u64, PendingOperation>,
    send_buf: BytesMut,
    /// Reader and writer of the current epoch.
    tasks: Vec<JoinHandle<()>>,
}

/// State shared by the client handle, its views and background tasks.
pub(crate) struct ClientShared {
    config: ClientConfig,
    provider: Box<dyn SocketProvider>,
    handle: Handle,
    next_sync: AtomicU64,
    inner: Mutex<Inner>,
    thumbstone: RwLock<Option<Arc<ConnectionError>>>,
    greeting: RwLock<Option<Greeting>>,
    phase_tx: watch::Sender<Phase>,
    /// Wakes the connector parked on a live session.
    wakeup: Notify,
    /// Wakes the writer when the send buffer gains data.
    flush: Notify,
    closed: AtomicBool,
    connector: Mutex<Option<JoinHandle<()>>>,
    schema_version: AtomicU64,
    schema_generation: AtomicU64,
    stats: ClientStats,
}

impl ClientShared {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Last schema version reported by the server (0 before any response).
    pub(crate) fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// Bumped whenever cached schema data must be dropped.
    pub(crate) fn schema_generation(&self) -> u64 {
        self.schema_generation.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_schema(&self) {
        self.schema_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn next_sync(&self) -> u64 {
        self.next_sync.fetch_add(1, Ordering::SeqCst)
    }

    fn set_phase(&self, inner: &mut Inner, phase: Phase) {
        inner.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn enter_phase(&self, phase: Phase) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Closed {
            self.set_phase(&mut inner, phase);
        }
    }

    /// Waits for `Ready` or `Closed`; true only for `Ready`.
    pub(crate) async fn wait_alive(&self, timeout: Duration) -> bool {
        let mut rx = self.phase_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|phase| matches!(phase, Phase::Ready | Phase::Closed)),
        )
        .await;
        matches!(waited, Ok(Ok(phase)) if *phase == Phase::Ready)
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && inner.phase == Phase::Ready
    }

    /// Registers an operation and queues its frame for the writer.
    ///
    /// Requests submitted before the client is ready stay queued until the
    /// next session is established, up to `max_queued_requests`. Past that
    /// limit a submission fails with the last connection error, or with
    /// [`ClientError::QueueFull`] if no attempt has failed yet.
    pub(crate) fn submit(&self, request: &Request, sink: Option<ResultSink>) -> Result<u64, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }

        let sync = self.next_sync();
        let encoded = request.encode(sync)?;

        let ready = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Closed {
                return Err(ClientError::Closed);
            }
            let queued = inner.pending.len();
            if inner.phase != Phase::Ready && queued >= self.config.max_queued_requests {
                return Err(match self.thumbstone.read().clone() {
                    Some(cause) => ClientError::Communication(cause),
                    None => ClientError::QueueFull(queued),
                });
            }
            inner.pending.insert(sync, PendingOperation { sink });
            inner.send_buf.extend_from_slice(&encoded);
            inner.phase == Phase::Ready
        };

        self.stats.requests_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Submitted {:?} sync={} ({} bytes)",
            request.request_type,
            sync,
            encoded.len()
        );
        if ready {
            self.flush.notify_one();
        }
        Ok(sync)
    }

    /// Forgets a pending operation. Returns whether it was still pending.
    pub(crate) fn forget(&self, sync: u64) -> bool {
        self.inner.lock().pending.remove(&sync).is_some()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Submits a request and returns a future for its result.
    pub(crate) fn future(self: &Arc<Self>, request: &Request) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        match self.submit(request, Some(tx)) {
            Ok(sync) => ResponseFuture::pending(self.clone(), sync, rx),
            Err(err) => ResponseFuture::failed(err),
        }
    }

    /// Completes the operation a response belongs to.
    fn dispatch(&self, packet: Packet) -> Result<(), ProtocolError> {
        let response = Response::from_packet(packet)?;
        if let Some(version) = response.schema_version {
            self.schema_version.store(version, Ordering::Release);
        }

        let error = response.error();
        if error.as_ref().is_some_and(|err| err.is_wrong_schema()) {
            tracing::debug!("Schema changed on server, invalidating schema cache");
            self.invalidate_schema();
        }

        let sync = response.sync;
        let Some(operation) = self.inner.lock().pending.remove(&sync) else {
            self.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropping response for unknown sync={}", sync);
            return Ok(());
        };

        let result = match error {
            Some(err) => Err(ClientError::Server(err)),
            None => Ok(response.into_data()),
        };
        if let Some(sink) = operation.sink {
            let _ = sink.send(result);
        }
        Ok(())
    }

    /// Tears down session `epoch` after an I/O or protocol failure.
    ///
    /// Only the first failure of a live session has an effect; later reports
    /// from the other task of the same epoch are ignored.
    fn fail_epoch(&self, epoch: u64, cause: ConnectionError) {
        let cause = Arc::new(cause);
        let (pending, tasks) = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.phase != Phase::Ready {
                return;
            }
            self.set_phase(&mut inner, Phase::Reconnecting);
            *self.thumbstone.write() = Some(cause.clone());
            inner.send_buf.clear();
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.tasks),
            )
        };

        tracing::warn!(
            "Connection lost (epoch {}), failing {} pending operations: {}",
            epoch,
            pending.len(),
            cause
        );
        for task in tasks {
            task.abort();
        }
        fail_all(pending, &cause);
        self.wakeup.notify_one();
    }

    /// Moves to `Closed`, failing everything still pending.
    ///
    /// `cause` becomes the thumbstone when the client closes because of a
    /// terminal connection error. Returns false if already closed.
    fn shutdown(&self, cause: Option<Arc<ConnectionError>>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let (pending, tasks) = {
            let mut inner = self.inner.lock();
            self.set_phase(&mut inner, Phase::Closed);
            if let Some(ref cause) = cause {
                *self.thumbstone.write() = Some(cause.clone());
            }
            inner.send_buf.clear();
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.tasks),
            )
        };

        for task in tasks {
            task.abort();
        }
        let cause = cause.unwrap_or_else(|| Arc::new(ConnectionError::Closed));
        fail_all(pending, &cause);
        self.wakeup.notify_one();
        true
    }

    async fn establish(&self, mut channel: Channel) -> Result<(Channel, Greeting), ConnectionError> {
        let timeout = self.config.connect_timeout();
        let timed_out = || ConnectionError::Timeout {
            addr: channel.peer.clone(),
        };

        let greeting = tokio::time::timeout(timeout, read_greeting(&mut channel.stream, &channel.peer))
            .await
            .map_err(|_| timed_out())??;

        if let Some(username) = self.config.username.as_deref() {
            self.enter_phase(Phase::Authenticating);
            let password = self.config.password.as_deref().unwrap_or("");
            let sync = self.next_sync();
            tokio::time::timeout(
                timeout,
                authenticate(&mut channel.stream, sync, username, password, &greeting),
            )
            .await
            .map_err(|_| timed_out())??;
        }

        Ok((channel, greeting))
    }

    /// Starts a new epoch on an established transport.
    ///
    /// Returns `None` if the client was closed while connecting.
    fn activate(self: &Arc<Self>, channel: Channel, greeting: Greeting) -> Option<u64> {
        let Channel { stream, peer } = channel;
        let (reader, writer) = tokio::io::split(stream);

        let epoch = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Closed {
                return None;
            }
            inner.epoch += 1;
            let epoch = inner.epoch;
            self.set_phase(&mut inner, Phase::Ready);
            inner.tasks = vec![
                self.handle.spawn(read_loop(self.clone(), epoch, reader)),
                self.handle.spawn(write_loop(self.clone(), epoch, writer)),
            ];
            epoch
        };

        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Connected to {} (Tarantool {}), epoch {}",
            peer,
            greeting.version,
            epoch
        );
        *self.greeting.write() = Some(greeting);
        // Flush anything queued while disconnected.
        self.flush.notify_one();
        Some(epoch)
    }

    /// Waits until session `epoch` is no longer live.
    ///
    /// Wakeups that find the session unchanged are counted and ignored.
    async fn park_until_broken(&self, epoch: u64) {
        while self.is_current(epoch) {
            self.wakeup.notified().await;
            if self.is_current(epoch) {
                self.stats.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Connector woke up without a state change");
            }
        }
    }
}

fn fail_all(pending: HashMap<u64, PendingOperation>, cause: &Arc<ConnectionError>) {
    for operation in pending.into_values() {
        if let Some(sink) = operation.sink {
            let _ = sink.send(Err(ClientError::Communication(cause.clone())));
        }
    }
}

async fn read_loop<R>(shared: Arc<ClientShared>, epoch: u64, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let chunk = shared.config.read_buffer_size();
    let mut buf = BytesMut::with_capacity(chunk);

    let cause = loop {
        match Packet::decode(&mut buf) {
            Ok(Some(packet)) => {
                if let Err(err) = shared.dispatch(packet) {
                    break ConnectionError::Protocol(err);
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => break ConnectionError::Protocol(err),
        }

        buf.reserve(chunk);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break ConnectionError::EndOfStream,
            Ok(n) => tracing::trace!("Read {} bytes (epoch {})", n, epoch),
            Err(err) => break ConnectionError::Io(err),
        }
    };

    shared.fail_epoch(epoch, cause);
}

async fn write_loop<W>(shared: Arc<ClientShared>, epoch: u64, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        shared.flush.notified().await;
        loop {
            let batch = {
                let mut inner = shared.inner.lock();
                if inner.epoch != epoch || inner.phase != Phase::Ready {
                    return;
                }
                if inner.send_buf.is_empty() {
                    break;
                }
                inner.send_buf.split().freeze()
            };

            tracing::trace!("Flushing {} bytes (epoch {})", batch.len(), epoch);
            let written = async {
                writer.write_all(&batch).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                shared.fail_epoch(epoch, ConnectionError::Io(err));
                return;
            }
        }
    }
}

async fn run_connector(shared: Arc<ClientShared>) {
    let mut attempt: u32 = 0;
    let mut last_error: Option<Arc<ConnectionError>> = None;

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        shared.enter_phase(Phase::Connecting);
        shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connect attempt {}", attempt);

        let result = match shared.provider.get(attempt, last_error.clone()).await {
            Ok(channel) => shared.establish(channel).await,
            Err(err) => Err(err),
        };

        match result {
            Ok((channel, greeting)) => {
                let Some(epoch) = shared.activate(channel, greeting) else {
                    return;
                };
                attempt = 0;
                shared.park_until_broken(epoch).await;
                last_error = shared.thumbstone.read().clone();
            }
            Err(err) if err.is_retryable() => {
                let err = Arc::new(err);
                tracing::warn!("Connect attempt {} failed: {}", attempt, err);
                {
                    let mut inner = shared.inner.lock();
                    if inner.phase == Phase::Closed {
                        return;
                    }
                    shared.set_phase(&mut inner, Phase::Reconnecting);
                    *shared.thumbstone.write() = Some(err.clone());
                }
                last_error = Some(err);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(shared.config.backoff_for_attempt(attempt)).await;
            }
            Err(err) => {
                tracing::error!("Giving up on connecting: {}", err);
                shared.shutdown(Some(Arc::new(err)));
                return;
            }
        }
    }
}

/// Multiplexed client handle.
///
/// Dropping the handle closes the client.
pub struct Client {
    shared: Arc<ClientShared>,
    schema: Arc<SchemaCache>,
}

impl Client {
    /// Creates a client for the configured addresses and starts connecting.
    ///
    /// Fails with [`ConnectionError::NoRuntime`] outside a Tokio runtime.
    pub fn connect(config: ClientConfig) -> Result<Self, ConnectionError> {
        let provider = config.provider()?;
        Self::with_provider(config, provider)
    }

    /// Creates a client that opens transports through `provider`.
    ///
    /// Pass an `Arc` of the provider to keep a handle to it, e.g. to
    /// refresh a round-robin address list while the client runs.
    ///
    /// Fails with [`ConnectionError::NoRuntime`] outside a Tokio runtime.
    pub fn with_provider(
        config: ClientConfig,
        provider: impl SocketProvider,
    ) -> Result<Self, ConnectionError> {
        let handle =
            Handle::try_current().map_err(|err| ConnectionError::NoRuntime(err.to_string()))?;
        let (phase_tx, _) = watch::channel(Phase::Connecting);
        let shared = Arc::new(ClientShared {
            config,
            provider: Box::new(provider),
            handle: handle.clone(),
            next_sync: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                phase: Phase::Connecting,
                epoch: 0,
                pending: HashMap::new(),
                send_buf: BytesMut::new(),
                tasks: Vec::new(),
            }),
            thumbstone: RwLock::new(None),
            greeting: RwLock::new(None),
            phase_tx,
            wakeup: Notify::new(),
            flush: Notify::new(),
            closed: AtomicBool::new(false),
            connector: Mutex::new(None),
            schema_version: AtomicU64::new(0),
            schema_generation: AtomicU64::new(0),
            stats: ClientStats::default(),
        });

        let connector = handle.spawn(run_connector(shared.clone()));
        *shared.connector.lock() = Some(connector);

        let schema = Arc::new(SchemaCache::new(shared.clone()));
        Ok(Self { shared, schema })
    }

    /// Returns whether a session is ready for requests.
    pub fn is_alive(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Waits until a session is ready. Returns false on timeout or close.
    pub async fn wait_alive(&self, timeout: Duration) -> bool {
        self.shared.wait_alive(timeout).await
    }

    pub fn phase(&self) -> Phase {
        self.shared.inner.lock().phase
    }

    /// Number of sessions established so far.
    pub fn epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    /// The last fatal connection error.
    pub fn thumbstone(&self) -> Option<Arc<ConnectionError>> {
        self.shared.thumbstone.read().clone()
    }

    /// Greeting of the most recently established session.
    pub fn server_greeting(&self) -> Option<Greeting> {
        self.shared.greeting.read().clone()
    }

    /// Last schema version reported by the server.
    pub fn schema_version(&self) -> u64 {
        self.shared.schema_version()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.shared.stats
    }

    /// Number of operations waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the client. Idempotent.
    ///
    /// Pending operations fail with a communication error and later
    /// submissions fail with [`ClientError::Closed`].
    pub fn close(&self) {
        if self.shared.shutdown(None) {
            tracing::info!("Client closed");
        }
        if let Some(connector) = self.shared.connector.lock().take() {
            connector.abort();
        }
    }

    /// Sends a request and waits for its result.
    pub async fn execute(&self, request: Request) -> OperationResult {
        self.shared.future(&request).await
    }

    /// Resolves a space name to its id.
    pub async fn space_id(&self, space: &str) -> Result<u32, ClientError> {
        self.schema.space_id(space).await
    }

    /// Resolves an index name within a space to its id.
    pub async fn index_id(&self, space: &str, index: &str) -> Result<u32, ClientError> {
        self.schema.index_id(space, index).await
    }

    pub fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    /// Blocking view. Its calls must not run on a runtime worker thread.
    pub fn sync_ops(&self) -> SyncOps {
        SyncOps::new(self.shared.clone(), self.schema.clone())
    }

    /// Future-based view.
    pub fn async_ops(&self) -> FutureOps {
        FutureOps::new(self.shared.clone())
    }

    /// View returning shareable, composable futures.
    pub fn composable_ops(&self) -> ComposableOps {
        ComposableOps::new(self.shared.clone())
    }

    /// View that returns sync ids and never exposes responses.
    pub fn fire_and_forget_ops(&self) -> FireAndForgetOps {
        FireAndForgetOps::new(self.shared.clone())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::TarantoolOps;
    use crate::provider::{FnProvider, RoundRobinSocketProvider};
    use crate::testing::{space_of, BrokenPipe, MockServer, Reply};
    use std::collections::HashSet;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> ClientConfig {
        ClientConfig::new().with_reconnect_backoff(Duration::from_millis(1), Duration::from_millis(10))
    }

    fn connect(server: &Arc<MockServer>) -> Client {
        Client::with_provider(config(), server.provider()).unwrap()
    }

    async fn wait_for_epoch(client: &Client, epoch: u64) {
        tokio::time::timeout(WAIT, async {
            while client.epoch() < epoch {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ping() {
        let server = Arc::new(MockServer::echo());
        let client = connect(&server);

        assert!(client.wait_alive(WAIT).await);
        assert!(client.is_alive());
        assert_eq!(client.epoch(), 1);
        client.async_ops().ping().await.unwrap();

        let greeting = client.server_greeting().unwrap();
        assert_eq!(greeting.version_number(), "2.11.1");
        assert_eq!(client.schema_version(), 1);
        assert_eq!(client.stats().connects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_operations_get_distinct_syncs() {
        let server = Arc::new(MockServer::new(|packet| {
            Reply::Data(vec![Value::from(packet.sync().unwrap())])
        }));
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.async_ops();
        let futures: Vec<_> = (0..50).map(|_| ops.ping()).collect();
        let syncs: Vec<u64> = futures.iter().map(|f| f.sync_id().unwrap()).collect();

        let distinct: HashSet<_> = syncs.iter().copied().collect();
        assert_eq!(distinct.len(), syncs.len());
        assert!(!syncs.contains(&0));

        for (future, sync) in futures.into_iter().zip(syncs) {
            assert_eq!(future.await.unwrap(), vec![Value::from(sync)]);
        }
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let server = Arc::new(MockServer::new(|packet| match space_of(packet) {
            Some(1) => Reply::Delayed(Duration::from_millis(100), vec![Value::from("slow")]),
            _ => Reply::Data(vec![Value::from("fast")]),
        }));
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.async_ops();
        let slow = ops.select(1, 0, vec![], 0, 1, Default::default());
        let fast = ops.select(2, 0, vec![], 0, 1, Default::default());

        let fast_result = fast.await.unwrap();
        assert_eq!(fast_result, vec![Value::from("fast")]);
        assert_eq!(client.pending_count(), 1);
        assert_eq!(slow.await.unwrap(), vec![Value::from("slow")]);
    }

    #[tokio::test]
    async fn test_server_error_is_local() {
        let server = Arc::new(MockServer::new(|packet| match space_of(packet) {
            Some(999) => Reply::Error(36, "Space '999' does not exist".to_string()),
            _ => Reply::Delayed(Duration::from_millis(20), vec![]),
        }));
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.async_ops();
        let other = ops.insert(512, vec![Value::from(1u8)]);
        let failing = ops.insert(999, vec![Value::from(1u8)]);

        match failing.await {
            Err(ClientError::Server(err)) => {
                assert_eq!(err.code, tntc_protocol::ErrorCode::NoSuchSpace);
                assert_eq!(err.message, "Space '999' does not exist");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        other.await.unwrap();
        assert!(client.is_alive());
        assert!(client.thumbstone().is_none());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_all_pending() {
        let server = Arc::new(MockServer::new(|packet| match space_of(packet) {
            Some(1) => Reply::NoReply,
            _ => Reply::Data(vec![]),
        }));
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.async_ops();
        let pending: Vec<_> = (0..5)
            .map(|_| ops.select(1, 0, vec![], 0, 1, Default::default()))
            .collect();
        ops.ping().await.unwrap();
        assert_eq!(client.pending_count(), 5);

        server.kill_connections();

        let mut causes = Vec::new();
        for future in pending {
            match future.await {
                Err(ClientError::Communication(cause)) => causes.push(cause),
                other => panic!("unexpected result: {other:?}"),
            }
        }
        let thumbstone = client.thumbstone().unwrap();
        assert!(causes.iter().all(|cause| Arc::ptr_eq(cause, &thumbstone)));

        assert!(client.wait_alive(WAIT).await);
        assert_eq!(client.epoch(), 2);
        assert_eq!(server.connections(), 2);
        ops.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_spurious_wakeup_does_not_reconnect() {
        let server = Arc::new(MockServer::echo());
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let attempts = client.stats().connect_attempts.load(Ordering::Relaxed);
        client.shared.wakeup.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            client.stats().connect_attempts.load(Ordering::Relaxed),
            attempts
        );
        assert_eq!(client.stats().spurious_wakeups.load(Ordering::Relaxed), 1);
        assert_eq!(client.epoch(), 1);
        assert!(client.thumbstone().is_none());
        client.async_ops().ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_queued_before_connect() {
        let server = Arc::new(MockServer::echo());
        let client = connect(&server);

        // The connector has not run yet on this single-threaded runtime.
        assert!(!client.is_alive());
        let ping = client.async_ops().ping();
        ping.await.unwrap();
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_close() {
        let server = Arc::new(MockServer::new(|_| Reply::NoReply));
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.async_ops();
        let pending = ops.ping();
        client.close();

        match pending.await {
            Err(ClientError::Communication(cause)) => {
                assert!(matches!(*cause, ConnectionError::Closed))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!client.is_alive());
        assert!(client.is_closed());
        assert_eq!(client.phase(), Phase::Closed);

        client.close();
        assert!(matches!(ops.ping().await, Err(ClientError::Closed)));
        assert!(matches!(
            client.fire_and_forget_ops().ping(),
            Err(ClientError::Closed)
        ));
        assert!(!client.wait_alive(WAIT).await);
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let server = Arc::new(MockServer::echo());
        let client = connect(&server);
        assert!(client.wait_alive(WAIT).await);

        let ops = client.fire_and_forget_ops();
        let first = ops.insert(512, vec![Value::from(1u8)]).unwrap();
        let second = ops.insert(512, vec![Value::from(2u8)]).unwrap();
        assert!(second > first);
        assert!(first > 0);

        // FIFO per connection: a later round trip proves delivery.
        client.async_ops().ping().await.unwrap();
        assert_eq!(server.requests(), 3);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().responses_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_auth() {
        let server = Arc::new(MockServer::echo().with_credentials("admin", "secret"));
        let client = Client::with_provider(
            config().with_credentials("admin", "secret"),
            server.provider(),
        )
        .unwrap();
        assert!(client.wait_alive(WAIT).await);
        client.async_ops().ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_rejected_while_loading_is_retried() {
        let server = Arc::new(
            MockServer::echo()
                .with_credentials("admin", "secret")
                .with_loading_auths(2),
        );
        let client = Client::with_provider(
            config().with_credentials("admin", "secret"),
            server.provider(),
        )
        .unwrap();

        assert!(client.wait_alive(WAIT).await);
        assert_eq!(server.connections(), 3);
        assert_eq!(client.epoch(), 1);
        match client.thumbstone().as_deref() {
            Some(ConnectionError::AuthFailed(err)) => {
                assert_eq!(err.code, tntc_protocol::ErrorCode::Loading)
            }
            other => panic!("unexpected thumbstone: {other:?}"),
        }
        client.async_ops().ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_exhausts_retries() {
        let server = Arc::new(MockServer::echo().with_credentials("admin", "secret"));
        let accept = server.clone();
        let provider = FnProvider::new(move |_attempt, _last_error| {
            let channel = accept.accept();
            async move { Ok(channel) }
        })
        .with_retries_limit(Some(3));
        let client =
            Client::with_provider(config().with_credentials("admin", "wrong"), provider).unwrap();

        assert!(!client.wait_alive(WAIT).await);
        assert!(client.is_closed());
        match client.thumbstone().as_deref() {
            Some(ConnectionError::RetriesExhausted {
                attempts: 3,
                last: Some(last),
            }) => match &**last {
                ConnectionError::AuthFailed(err) => {
                    assert_eq!(err.code, tntc_protocol::ErrorCode::PasswordMismatch)
                }
                other => panic!("unexpected last error: {other:?}"),
            },
            other => panic!("unexpected thumbstone: {other:?}"),
        }
        assert_eq!(server.connections(), 3);
    }

    #[tokio::test]
    async fn test_refresh_addresses_on_live_client() {
        let first = Arc::new(MockServer::echo());
        let second = Arc::new(MockServer::echo());
        let first_addr = first.listen().await;
        let second_addr = second.listen().await;

        let provider = Arc::new(RoundRobinSocketProvider::new([first_addr.as_str()]).unwrap());
        let client = Client::with_provider(config(), provider.clone()).unwrap();
        assert!(client.wait_alive(WAIT).await);
        assert_eq!(provider.last_address().unwrap().to_string(), first_addr);

        provider.refresh_addresses([second_addr.as_str()]).unwrap();
        first.kill_connections();
        wait_for_epoch(&client, 2).await;

        assert_eq!(provider.last_address().unwrap().to_string(), second_addr);
        assert_eq!(first.connections(), 1);
        assert_eq!(second.connections(), 1);
        client.async_ops().ping().await.unwrap();
        assert_eq!(second.requests(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_fails_pending_and_reconnects() {
        let server = Arc::new(MockServer::echo());
        let fallback = server.clone();
        let opened = AtomicU64::new(0);
        let provider = FnProvider::new(move |_attempt, _last_error| {
            let channel = if opened.fetch_add(1, Ordering::SeqCst) == 0 {
                Channel::new(BrokenPipe::new(), "broken:1")
            } else {
                fallback.accept()
            };
            async move { Ok(channel) }
        });
        let client = Client::with_provider(config(), provider).unwrap();
        assert!(client.wait_alive(WAIT).await);
        assert_eq!(client.epoch(), 1);

        let cause = match client.async_ops().ping().await {
            Err(ClientError::Communication(cause)) => cause,
            other => panic!("unexpected result: {other:?}"),
        };
        match &*cause {
            ConnectionError::Io(err) => assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected cause: {other:?}"),
        }
        assert!(Arc::ptr_eq(&cause, &client.thumbstone().unwrap()));

        wait_for_epoch(&client, 2).await;
        client.async_ops().ping().await.unwrap();
        assert_eq!(server.connections(), 1);
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn test_queue_limit_while_not_ready() {
        let provider = FnProvider::new(|attempt, _last_error| {
            // The first peer hangs up before greeting, later ones never answer.
            let silent = (attempt == 0).then(|| {
                let (client, _) = tokio::io::duplex(64);
                Channel::new(client, "silent:1")
            });
            async move {
                match silent {
                    Some(channel) => Ok(channel),
                    None => futures::future::pending().await,
                }
            }
        });
        let client =
            Client::with_provider(config().with_max_queued_requests(2), provider).unwrap();
        let ops = client.fire_and_forget_ops();

        ops.ping().unwrap();
        ops.ping().unwrap();
        assert!(matches!(ops.ping(), Err(ClientError::QueueFull(2))));

        tokio::time::timeout(WAIT, async {
            while client.thumbstone().is_none() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        match client.async_ops().ping().await {
            Err(ClientError::Communication(cause)) => {
                assert!(matches!(*cause, ConnectionError::EndOfStream));
                assert!(Arc::ptr_eq(&cause, &client.thumbstone().unwrap()));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(client.pending_count(), 2);
        assert!(!client.is_closed());
    }

    #[test]
    fn test_requires_runtime() {
        let provider = FnProvider::new(|_attempt, _last_error| async {
            Err::<Channel, _>(ConnectionError::EndOfStream)
        });
        assert!(matches!(
            Client::with_provider(ClientConfig::new(), provider),
            Err(ConnectionError::NoRuntime(_))
        ));
        assert!(matches!(
            Client::connect(ClientConfig::new()),
            Err(ConnectionError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_retries_exhausted_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let provider = RoundRobinSocketProvider::new([addr.as_str()])
            .unwrap()
            .with_retries_limit(Some(3));
        let client = Client::with_provider(config(), provider).unwrap();

        assert!(!client.wait_alive(WAIT).await);
        assert!(client.is_closed());
        match client.thumbstone().as_deref() {
            Some(ConnectionError::RetriesExhausted {
                attempts: 3,
                last: Some(last),
            }) => assert!(matches!(**last, ConnectionError::Transient { .. })),
            other => panic!("unexpected thumbstone: {other:?}"),
        }
        assert_eq!(client.stats().connect_attempts.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_setup_failure_is_retried() {
        let server = Arc::new(MockServer::echo());
        let fallback = server.clone();
        let provider = FnProvider::new(move |attempt, _last_error| {
            let channel = if attempt == 0 {
                // Peer that hangs up before sending a greeting.
                let (client, _) = tokio::io::duplex(64);
                Channel::new(client, "silent:1")
            } else {
                fallback.accept()
            };
            async move { Ok(channel) }
        });
        let client = Client::with_provider(config(), provider).unwrap();

        assert!(client.wait_alive(WAIT).await);
        assert_eq!(client.stats().connect_attempts.load(Ordering::Relaxed), 2);
        assert!(matches!(
            client.thumbstone().as_deref(),
            Some(ConnectionError::EndOfStream)
        ));
        client.async_ops().ping().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_ops() {
        let server = Arc::new(MockServer::new(|_| Reply::Data(vec![Value::from(7u8)])));
        let client = connect(&server);
        let ops = client.sync_ops();

        let result = tokio::task::spawn_blocking(move || {
            assert!(ops.wait_alive(WAIT));
            let data = ops.ping()?;
            let close = ops.close();
            Ok::<_, ClientError>((data, close))
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.0, vec![Value::from(7u8)]);
        assert!(matches!(result.1, Err(ClientError::State(_))));
        assert!(client.is_alive());
    }
}
