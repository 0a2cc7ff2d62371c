//! # Transaction Scheduling
//!
//! Every [`Transaction`] is a FIFO command queue drained by its connection's
//! scheduler task. Calling an operation enqueues it immediately and returns a
//! [`Request`], a future resolving to that operation's result; awaiting is
//! optional, execution is not.
//!
//! ## Lifecycle
//!
//! ```text
//!   Pending ──begin──▶ Active ◀──▶ Idle ──(queue closed | commit())──▶ Committing ──▶ Committed
//!                        │
//!                        └──(unrecovered failure | abort())──▶ Aborted
//! ```
//!
//! - **Pending**: queued behind earlier transactions of the same connection.
//! - **Idle**: queue drained, waiting for more work. A transaction is
//!   auto-committed once it is idle and every handle able to enqueue work
//!   (the transaction, its stores, indexes and cursors) has been dropped.
//! - **Aborted**: the backend rolled back; every operation still queued fails
//!   with `AbortError` without running.
//!
//! Completion is broadcast through a `watch` channel so any number of
//! [`Completion`] handles can wait on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::backend::{ConnectionId, MemoryBackend, TransactionId, TransactionMode};
use crate::error::{StoreError, StoreResult};
use crate::object_store::ObjectStore;
use crate::schema::Schema;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// What a failed operation does to its transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail the request and abort the whole transaction.
    #[default]
    AbortTransaction,
    /// Fail only the request; the transaction stays usable.
    Recover,
}

/// Result handle of one queued operation.
#[must_use = "the operation runs regardless, but its result is lost unless awaited"]
pub struct Request<T> {
    rx: oneshot::Receiver<StoreResult<T>>,
}

impl<T> Request<T> {
    /// A request that already failed.
    pub(crate) fn failed(error: StoreError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }
}

impl<T> Future for Request<T> {
    type Output = StoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::Abort(
                "transaction ended before the request completed".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A queued unit of work, executed against the backend or cancelled.
pub(crate) trait PendingOperation: Send {
    /// Run and deliver the result. Returns the error only when it must abort
    /// the transaction.
    fn execute(self: Box<Self>, backend: &MemoryBackend, tx: TransactionId) -> StoreResult<()>;

    /// Deliver `error` without running.
    fn cancel(self: Box<Self>, error: StoreError);
}

struct Operation<T, F> {
    run: F,
    reply: oneshot::Sender<StoreResult<T>>,
    policy: ErrorPolicy,
}

impl<T, F> PendingOperation for Operation<T, F>
where
    T: Send,
    F: FnOnce(&MemoryBackend, TransactionId) -> StoreResult<T> + Send,
{
    fn execute(self: Box<Self>, backend: &MemoryBackend, tx: TransactionId) -> StoreResult<()> {
        let Operation { run, reply, policy } = *self;
        match run(backend, tx) {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(e.clone()));
                match policy {
                    ErrorPolicy::Recover => Ok(()),
                    ErrorPolicy::AbortTransaction => Err(e),
                }
            }
        }
    }

    fn cancel(self: Box<Self>, error: StoreError) {
        let _ = self.reply.send(Err(error));
    }
}

pub(crate) enum Command {
    Op(Box<dyn PendingOperation>),
    Commit,
    Abort(StoreError),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Active,
    Idle,
    Committing,
    Committed,
    Aborted,
}

impl TxState {
    pub fn is_finished(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed,
    Aborted(StoreError),
}

impl TransactionOutcome {
    pub fn into_result(self) -> StoreResult<()> {
        match self {
            TransactionOutcome::Committed => Ok(()),
            TransactionOutcome::Aborted(e) => Err(e),
        }
    }
}

fn inactive() -> StoreError {
    StoreError::TransactionInactive("transaction is no longer accepting requests".into())
}

fn aborted() -> StoreError {
    StoreError::Abort("transaction was aborted".into())
}

pub(crate) struct TxShared {
    pub(crate) backend: Arc<MemoryBackend>,
    mode: TransactionMode,
    scope: Vec<String>,
    /// Committed schema when the transaction was created.
    schema: Schema,
    id: OnceLock<TransactionId>,
    state: Mutex<TxState>,
    /// Commit or abort requested; no new requests accepted.
    finishing: AtomicBool,
    aborted: AtomicBool,
    outcome: watch::Sender<Option<TransactionOutcome>>,
}

impl TxShared {
    fn set_state(&self, state: TxState) {
        *self.state.lock() = state;
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Handle to a queued or running transaction. Cheap to clone; every clone
/// keeps the transaction open.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) shared: Arc<TxShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id.get())
            .field("mode", &self.shared.mode)
            .field("scope", &self.shared.scope)
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    /// A new transaction and the job that drives it. `started` is set for
    /// version-change transactions, which the backend begins up front.
    pub(crate) fn new(
        backend: Arc<MemoryBackend>,
        schema: Schema,
        scope: Vec<String>,
        mode: TransactionMode,
        started: Option<TransactionId>,
    ) -> (Self, TransactionJob) {
        let (commands, queue) = mpsc::unbounded_channel();
        let (outcome, _) = watch::channel(None);
        let id = OnceLock::new();
        if let Some(started) = started {
            let _ = id.set(started);
        }
        let shared = Arc::new(TxShared {
            backend,
            mode,
            scope,
            schema,
            id,
            state: Mutex::new(TxState::Pending),
            finishing: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            outcome,
        });
        let job = TransactionJob {
            shared: Arc::clone(&shared),
            queue,
        };
        (Self { shared, commands }, job)
    }

    pub fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    pub fn state(&self) -> TxState {
        *self.shared.state.lock()
    }

    /// Object store names the transaction may touch.
    pub fn scope(&self) -> Vec<String> {
        if self.shared.mode == TransactionMode::VersionChange {
            return self
                .schema()
                .map(|s| s.object_stores.keys().cloned().collect())
                .unwrap_or_default();
        }
        self.shared.scope.clone()
    }

    /// Backend transaction id, once started.
    pub(crate) fn id(&self) -> Option<TransactionId> {
        self.shared.id.get().copied()
    }

    pub(crate) fn backend(&self) -> &MemoryBackend {
        &self.shared.backend
    }

    /// Schema as seen by this transaction: the live, possibly uncommitted
    /// schema once started, the creation-time one before.
    pub fn schema(&self) -> StoreResult<Schema> {
        match self.id() {
            Some(id) => match self.shared.backend.transaction_schema(id) {
                Ok(schema) => Ok(schema),
                Err(_) => Ok(self.shared.schema.clone()),
            },
            None => Ok(self.shared.schema.clone()),
        }
    }

    /// True once commit or abort was requested or the transaction ended.
    pub fn is_finishing(&self) -> bool {
        self.shared.finishing.load(Ordering::Acquire)
    }

    /// Handle to the object store `name`, which must be in scope.
    pub fn object_store(&self, name: &str) -> StoreResult<ObjectStore> {
        if self.is_finishing() {
            return Err(StoreError::invalid_state("transaction has finished"));
        }
        let in_scope = if self.shared.mode == TransactionMode::VersionChange {
            self.schema()?.object_stores.contains_key(name)
        } else {
            self.shared.scope.iter().any(|s| s == name)
        };
        if !in_scope {
            return Err(StoreError::not_found(format!(
                "object store '{}' is not in the transaction scope",
                name
            )));
        }
        Ok(ObjectStore::new(self.clone(), name.to_string()))
    }

    /// Enqueue `run`. It executes after everything enqueued before it.
    pub(crate) fn schedule<T, F>(&self, policy: ErrorPolicy, run: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryBackend, TransactionId) -> StoreResult<T> + Send + 'static,
    {
        if self.is_finishing() {
            return Request::failed(inactive());
        }
        let (reply, rx) = oneshot::channel();
        let op = Box::new(Operation { run, reply, policy });
        if let Err(mpsc::error::SendError(Command::Op(op))) = self.commands.send(Command::Op(op)) {
            op.cancel(inactive());
        }
        Request { rx }
    }

    /// Commit once everything already queued has run. Later requests fail
    /// with `TransactionInactiveError`.
    pub fn commit(&self) -> StoreResult<()> {
        if self.shared.finishing.swap(true, Ordering::AcqRel) {
            return Err(StoreError::invalid_state("transaction is already finishing"));
        }
        let _ = self.commands.send(Command::Commit);
        Ok(())
    }

    /// Abort: queued requests fail with `AbortError` without running and all
    /// writes are rolled back.
    pub fn abort(&self) -> StoreResult<()> {
        if self.shared.finishing.swap(true, Ordering::AcqRel) {
            return Err(StoreError::invalid_state("transaction is already finishing"));
        }
        self.shared.aborted.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Abort(aborted()));
        Ok(())
    }

    /// Watch for completion without keeping the transaction open.
    pub fn subscribe(&self) -> Completion {
        Completion {
            rx: self.shared.outcome.subscribe(),
        }
    }

    /// Release this handle and wait for the transaction to end. Other live
    /// handles still keep it open.
    pub async fn done(self) -> StoreResult<()> {
        let completion = self.subscribe();
        drop(self);
        completion.wait().await
    }
}

/// Waits for a transaction's outcome.
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<TransactionOutcome>>,
}

impl Completion {
    pub async fn wait(mut self) -> StoreResult<()> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome.into_result();
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return match last {
                    Some(outcome) => outcome.into_result(),
                    None => Err(StoreError::Abort("transaction dropped before completing".into())),
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler Job
// ---------------------------------------------------------------------------

enum End {
    Commit,
    Abort(StoreError),
}

/// Drives one transaction from begin to outcome on its connection's
/// scheduler task.
pub(crate) struct TransactionJob {
    shared: Arc<TxShared>,
    queue: mpsc::UnboundedReceiver<Command>,
}

impl TransactionJob {
    pub(crate) async fn run(mut self, conn: ConnectionId) {
        let shared = Arc::clone(&self.shared);
        let backend = &shared.backend;

        let id = match shared.id.get() {
            Some(id) => *id,
            None => match backend
                .begin_transaction(conn, &shared.scope, shared.mode)
                .await
            {
                Ok(id) => {
                    let _ = shared.id.set(id);
                    id
                }
                Err(e) => {
                    warn!(connection = %conn, error = %e, "transaction could not start");
                    self.finish(TransactionOutcome::Aborted(e));
                    return;
                }
            },
        };
        shared.set_state(TxState::Active);

        let end = loop {
            let command = match self.queue.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => {
                    shared.set_state(TxState::Idle);
                    self.queue.recv().await
                }
                Err(TryRecvError::Disconnected) => None,
            };
            match command {
                Some(Command::Op(op)) => {
                    if shared.aborted.load(Ordering::Acquire) {
                        op.cancel(aborted());
                        continue;
                    }
                    shared.set_state(TxState::Active);
                    if let Err(e) = op.execute(backend, id) {
                        debug!(transaction = %id, error = %e, "request failed, aborting");
                        break End::Abort(e);
                    }
                }
                Some(Command::Commit) | None => break End::Commit,
                Some(Command::Abort(e)) => break End::Abort(e),
            }
        };

        shared.finishing.store(true, Ordering::Release);
        let outcome = match end {
            End::Commit => {
                shared.set_state(TxState::Committing);
                match backend.commit(id) {
                    Ok(()) => TransactionOutcome::Committed,
                    Err(e) => TransactionOutcome::Aborted(e),
                }
            }
            End::Abort(e) => {
                shared.aborted.store(true, Ordering::Release);
                if let Err(rollback) = backend.rollback(id) {
                    warn!(transaction = %id, error = %rollback, "rollback failed");
                }
                TransactionOutcome::Aborted(e)
            }
        };
        self.finish(outcome);
    }

    /// Fail leftovers, publish the outcome.
    fn finish(&mut self, outcome: TransactionOutcome) {
        self.queue.close();
        let leftover = match outcome {
            TransactionOutcome::Committed => inactive(),
            TransactionOutcome::Aborted(_) => aborted(),
        };
        while let Ok(command) = self.queue.try_recv() {
            if let Command::Op(op) = command {
                op.cancel(leftover.clone());
            }
        }
        self.shared.finishing.store(true, Ordering::Release);
        self.shared.set_state(match outcome {
            TransactionOutcome::Committed => TxState::Committed,
            TransactionOutcome::Aborted(_) => TxState::Aborted,
        });
        self.shared.outcome.send_replace(Some(outcome));
    }
}
