//! Operation views over a client.
//!
//! All views submit the same sync-tracked requests and differ only in how
//! the result is handed back: blocking, as a future, as a shareable future,
//! or not at all.

use crate::client::{ClientShared, OperationResult};
use crate::error::ClientError;
use crate::schema::SchemaCache;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tntc_protocol::{IteratorType, Request, Value};
use tokio::sync::oneshot;

const CLOSE_VIEW: &str = "close the client instead of an operations view";

/// Data operations, implemented by every view.
pub trait TarantoolOps {
    type Output;

    /// Submits a prepared request.
    fn exec(&self, request: Request) -> Self::Output;

    /// Views cannot be closed on their own.
    fn close(&self) -> Result<(), ClientError> {
        Err(ClientError::State(CLOSE_VIEW))
    }

    fn ping(&self) -> Self::Output {
        self.exec(Request::ping())
    }

    fn select(
        &self,
        space_id: u32,
        index_id: u32,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
    ) -> Self::Output {
        self.exec(Request::select(space_id, index_id, key, offset, limit, iterator))
    }

    fn insert(&self, space_id: u32, tuple: Vec<Value>) -> Self::Output {
        self.exec(Request::insert(space_id, tuple))
    }

    fn replace(&self, space_id: u32, tuple: Vec<Value>) -> Self::Output {
        self.exec(Request::replace(space_id, tuple))
    }

    fn update(&self, space_id: u32, index_id: u32, key: Vec<Value>, ops: Vec<Value>) -> Self::Output {
        self.exec(Request::update(space_id, index_id, key, ops))
    }

    fn upsert(&self, space_id: u32, tuple: Vec<Value>, ops: Vec<Value>) -> Self::Output {
        self.exec(Request::upsert(space_id, tuple, ops))
    }

    fn delete(&self, space_id: u32, index_id: u32, key: Vec<Value>) -> Self::Output {
        self.exec(Request::delete(space_id, index_id, key))
    }

    fn call(&self, function: &str, args: Vec<Value>) -> Self::Output {
        self.exec(Request::call(function, args))
    }

    fn call16(&self, function: &str, args: Vec<Value>) -> Self::Output {
        self.exec(Request::call16(function, args))
    }

    fn eval(&self, expression: &str, args: Vec<Value>) -> Self::Output {
        self.exec(Request::eval(expression, args))
    }
}

enum FutureState {
    Pending(oneshot::Receiver<OperationResult>),
    Failed(ClientError),
    Done,
}

/// Result of an operation submitted through [`FutureOps`].
///
/// Dropping or cancelling the future only forgets the operation locally;
/// the server still executes the request.
pub struct ResponseFuture {
    shared: Option<Arc<ClientShared>>,
    sync: Option<u64>,
    state: FutureState,
}

impl ResponseFuture {
    pub(crate) fn pending(
        shared: Arc<ClientShared>,
        sync: u64,
        rx: oneshot::Receiver<OperationResult>,
    ) -> Self {
        Self {
            shared: Some(shared),
            sync: Some(sync),
            state: FutureState::Pending(rx),
        }
    }

    pub(crate) fn failed(err: ClientError) -> Self {
        Self {
            shared: None,
            sync: None,
            state: FutureState::Failed(err),
        }
    }

    /// Sync id of the request, if it was submitted.
    pub fn sync_id(&self) -> Option<u64> {
        self.sync
    }

    /// Stops waiting for the response. Returns whether it was still pending.
    pub fn cancel(mut self) -> bool {
        self.forget()
    }

    fn forget(&mut self) -> bool {
        if !matches!(self.state, FutureState::Pending(_)) {
            return false;
        }
        self.state = FutureState::Done;
        match (&self.shared, self.sync) {
            (Some(shared), Some(sync)) => shared.forget(sync),
            _ => false,
        }
    }
}

impl Future for ResponseFuture {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = match std::mem::replace(&mut this.state, FutureState::Done) {
            FutureState::Pending(mut rx) => match Pin::new(&mut rx).poll(cx) {
                Poll::Pending => {
                    this.state = FutureState::Pending(rx);
                    return Poll::Pending;
                }
                Poll::Ready(Ok(result)) => result,
                // Sink dropped without an answer: the entry was removed elsewhere.
                Poll::Ready(Err(_)) => Err(ClientError::Closed),
            },
            FutureState::Failed(err) => Err(err),
            FutureState::Done => Err(ClientError::State(
                "response future polled after completion",
            )),
        };
        Poll::Ready(result)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.forget();
    }
}

/// Blocking view.
///
/// Calls park the current thread until the operation completes, so they must
/// run outside the client's runtime (e.g. in `spawn_blocking`) on a
/// multi-threaded runtime.
#[derive(Clone)]
pub struct SyncOps {
    shared: Arc<ClientShared>,
    schema: Arc<SchemaCache>,
}

impl SyncOps {
    pub(crate) fn new(shared: Arc<ClientShared>, schema: Arc<SchemaCache>) -> Self {
        Self { shared, schema }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.shared.handle().block_on(future)
    }

    /// Blocks until the client is ready. Returns false on timeout or close.
    pub fn wait_alive(&self, timeout: Duration) -> bool {
        self.block_on(self.shared.wait_alive(timeout))
    }

    pub fn space_id(&self, space: &str) -> Result<u32, ClientError> {
        self.block_on(self.schema.space_id(space))
    }

    pub fn index_id(&self, space: &str, index: &str) -> Result<u32, ClientError> {
        self.block_on(self.schema.index_id(space, index))
    }
}

impl TarantoolOps for SyncOps {
    type Output = OperationResult;

    fn exec(&self, request: Request) -> OperationResult {
        let future = self.shared.future(&request);
        let timeout = self.shared.config().operation_timeout();
        self.block_on(async move {
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, future).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout),
                },
                None => future.await,
            }
        })
    }
}

/// Future-based view.
#[derive(Clone)]
pub struct FutureOps {
    shared: Arc<ClientShared>,
}

impl FutureOps {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }
}

impl TarantoolOps for FutureOps {
    type Output = ResponseFuture;

    fn exec(&self, request: Request) -> ResponseFuture {
        self.shared.future(&request)
    }
}

/// Shareable future returned by [`ComposableOps`].
pub type CompletionStage = Shared<BoxFuture<'static, OperationResult>>;

/// View returning futures that can be cloned, chained and awaited by
/// several consumers.
#[derive(Clone)]
pub struct ComposableOps {
    shared: Arc<ClientShared>,
}

impl ComposableOps {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }
}

impl TarantoolOps for ComposableOps {
    type Output = CompletionStage;

    fn exec(&self, request: Request) -> CompletionStage {
        self.shared.future(&request).boxed().shared()
    }
}

/// View that submits requests without waiting for their responses.
///
/// A later successful round trip on the same client shows that earlier
/// fire-and-forget requests reached the server.
#[derive(Clone)]
pub struct FireAndForgetOps {
    shared: Arc<ClientShared>,
}

impl FireAndForgetOps {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }
}

impl TarantoolOps for FireAndForgetOps {
    type Output = Result<u64, ClientError>;

    fn exec(&self, request: Request) -> Result<u64, ClientError> {
        self.shared.submit(&request, None)
    }
}
