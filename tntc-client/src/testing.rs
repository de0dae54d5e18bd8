//! In-memory IPROTO server for tests.

use crate::provider::{Channel, FnProvider, SocketProvider};
use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tntc_protocol::consts::{key, RequestType};
use tntc_protocol::greeting::GREETING_LINE_SIZE;
use tntc_protocol::{auth, FieldMap, Packet, Value, GREETING_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

pub(crate) const SALT: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

pub(crate) const VERSION_LINE: &str =
    "Tarantool 2.11.1 (Binary) 7170b4af-c72f-4f07-8729-08fc678543a1";

pub(crate) fn greeting_bytes() -> [u8; GREETING_SIZE] {
    let mut bytes = [b' '; GREETING_SIZE];
    bytes[..VERSION_LINE.len()].copy_from_slice(VERSION_LINE.as_bytes());
    bytes[GREETING_LINE_SIZE - 1] = b'\n';
    bytes[GREETING_LINE_SIZE..GREETING_LINE_SIZE + SALT.len()].copy_from_slice(SALT.as_bytes());
    bytes[GREETING_SIZE - 1] = b'\n';
    bytes
}

pub(crate) fn response_frame(sync: u64, code: u64, body: FieldMap) -> Bytes {
    response_frame_with_schema(sync, code, 1, body)
}

fn response_frame_with_schema(sync: u64, code: u64, schema_version: u64, body: FieldMap) -> Bytes {
    let mut header = FieldMap::new();
    header.insert(key::CODE, Value::from(code));
    header.insert(key::SYNC, Value::from(sync));
    header.insert(key::SCHEMA_VERSION, Value::from(schema_version));
    Packet::new(header).with_body(body).encode().unwrap().freeze()
}

/// What the mock server does with one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Data(Vec<Value>),
    Error(u32, String),
    /// Answer after a delay, letting later requests overtake this one.
    Delayed(Duration, Vec<Value>),
    NoReply,
    Disconnect,
}

type Handler = Box<dyn Fn(&Packet) -> Reply + Send + Sync>;

pub(crate) struct MockServer {
    handler: Handler,
    credentials: Option<(String, String)>,
    /// AUTH requests still to be rejected with ER_LOADING.
    loading_auths: AtomicUsize,
    schema_version: AtomicU64,
    connections: AtomicUsize,
    requests: AtomicUsize,
    kill: broadcast::Sender<()>,
}

impl MockServer {
    pub(crate) fn new(handler: impl Fn(&Packet) -> Reply + Send + Sync + 'static) -> Self {
        let (kill, _) = broadcast::channel(4);
        Self {
            handler: Box::new(handler),
            credentials: None,
            loading_auths: AtomicUsize::new(0),
            schema_version: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            kill,
        }
    }

    /// Server that answers every request with an empty result.
    pub(crate) fn echo() -> Self {
        Self::new(|_| Reply::Data(vec![]))
    }

    pub(crate) fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Rejects the first `n` AUTH requests as if the instance were loading.
    pub(crate) fn with_loading_auths(self, n: usize) -> Self {
        self.loading_auths.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Requests received so far, AUTH excluded.
    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn set_schema_version(&self, version: u64) {
        self.schema_version.store(version, Ordering::SeqCst);
    }

    /// Drops every open connection.
    pub(crate) fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub(crate) fn provider(self: &Arc<Self>) -> impl SocketProvider {
        let server = self.clone();
        FnProvider::new(move |_attempt, _last_error| {
            let channel = server.accept();
            async move { Ok(channel) }
        })
    }

    pub(crate) fn accept(self: &Arc<Self>) -> Channel {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let n = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let kill = self.kill.subscribe();
        tokio::spawn(self.clone().serve(server, kill));
        Channel::new(client, format!("mock:{}", n))
    }

    /// Serves TCP connections on a loopback port. Returns `host:port`.
    pub(crate) async fn listen(self: &Arc<Self>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.connections.fetch_add(1, Ordering::SeqCst);
                let kill = server.kill.subscribe();
                tokio::spawn(server.clone().serve(stream, kill));
            }
        });
        addr
    }

    async fn serve<S>(self: Arc<Self>, stream: S, mut kill: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        if writer.write_all(&greeting_bytes()).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = BytesMut::new();
        'conn: loop {
            tokio::select! {
                _ = kill.recv() => break 'conn,
                read = reader.read_buf(&mut buf) => {
                    if !matches!(read, Ok(n) if n > 0) {
                        break 'conn;
                    }
                    while let Ok(Some(packet)) = Packet::decode(&mut buf) {
                        if !self.respond(&packet, &tx) {
                            break 'conn;
                        }
                    }
                }
            }
        }
        write_task.abort();
    }

    fn respond(&self, packet: &Packet, tx: &mpsc::UnboundedSender<Bytes>) -> bool {
        let sync = packet.sync().unwrap_or(0);
        let reply = if packet.code() == Some(RequestType::Auth.code()) {
            self.check_auth(packet)
        } else {
            self.requests.fetch_add(1, Ordering::SeqCst);
            (self.handler)(packet)
        };

        let schema_version = self.schema_version.load(Ordering::SeqCst);
        match reply {
            Reply::Data(data) => {
                let _ = tx.send(data_frame(sync, schema_version, data));
            }
            Reply::Error(code, message) => {
                let mut body = FieldMap::new();
                body.insert(key::ERROR, Value::from(message));
                let frame =
                    response_frame_with_schema(sync, 0x8000 | code as u64, schema_version, body);
                let _ = tx.send(frame);
            }
            Reply::Delayed(delay, data) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(data_frame(sync, schema_version, data));
                });
            }
            Reply::NoReply => {}
            Reply::Disconnect => return false,
        }
        true
    }

    fn check_auth(&self, packet: &Packet) -> Reply {
        let loading = self
            .loading_auths
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if loading {
            return Reply::Error(116, "Tarantool is loading".to_string());
        }
        let Some((username, password)) = &self.credentials else {
            return Reply::Data(vec![]);
        };
        let user = packet.body_field(key::USER_NAME).and_then(Value::as_str);
        let proof = packet
            .body_field(key::TUPLE)
            .and_then(Value::as_array)
            .and_then(|tuple| tuple.get(1))
            .and_then(Value::as_bytes);
        let expected = auth::scramble(password, SALT).unwrap();

        if user != Some(username.as_str()) {
            return Reply::Error(45, format!("User '{}' is not found", user.unwrap_or("")));
        }
        if proof != Some(&expected[..]) {
            return Reply::Error(
                47,
                format!("Incorrect password supplied for user '{}'", username),
            );
        }
        Reply::Data(vec![])
    }
}

fn data_frame(sync: u64, schema_version: u64, data: Vec<Value>) -> Bytes {
    let mut body = FieldMap::new();
    body.insert(key::DATA, Value::Array(data));
    response_frame_with_schema(sync, 0, schema_version, body)
}

/// Space id of a SELECT/INSERT/... request.
pub(crate) fn space_of(packet: &Packet) -> Option<u32> {
    packet.body_field(key::SPACE_ID).and_then(Value::as_u32)
}

/// Transport that sends a greeting and then fails every write.
pub(crate) struct BrokenPipe {
    greeting: [u8; GREETING_SIZE],
    sent: usize,
}

impl BrokenPipe {
    pub(crate) fn new() -> Self {
        Self {
            greeting: greeting_bytes(),
            sent: 0,
        }
    }
}

impl AsyncRead for BrokenPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let sent = self.sent;
        let rest = &self.greeting[sent..];
        if rest.is_empty() {
            // Nothing more to read, ever.
            return Poll::Pending;
        }
        let n = rest.len().min(buf.remaining());
        buf.put_slice(&rest[..n]);
        self.sent += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
