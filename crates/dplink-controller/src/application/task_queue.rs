//! Ordered single-worker task queue with cooperative cancellation.
//!
//! Every asynchronous piece of connection work (connect, attention, HDCP
//! poll) is a [`Task`] pushed onto one unbounded channel and executed by one
//! worker, strictly in order.  Two tasks therefore never run concurrently,
//! whatever connection they belong to.
//!
//! # Cancellation
//!
//! ```text
//!  enqueue(conn, kind) ──► Task { epoch = current(conn) }
//!                                       │
//!  cancel(conn)  ──► epoch(conn) += 1   │   (task is now stale)
//!                                       ▼
//!  worker: task.epoch != current(conn) → skipped
//!
//!  cancel_and_drain(conn):
//!      cancel(conn); push Barrier(oneshot) ; await oneshot
//!      → every task queued before the call has been dropped or finished
//! ```
//!
//! A running task observes cancellation through its [`CancelToken`], which
//! it checks at start and after each suspension point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dplink_core::ConnectionId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// The three kinds of deferred connection work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    Connect,
    Attention,
    HdcpPoll,
}

/// One unit of work for the worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub connection: ConnectionId,
    pub kind: TaskKind,
    pub token: CancelToken,
}

enum QueueItem {
    Run(Task),
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct QueueShared {
    next_epoch: AtomicU64,
    epochs: Mutex<HashMap<ConnectionId, u64>>,
    pending: Mutex<HashSet<(ConnectionId, TaskKind)>>,
}

impl QueueShared {
    fn epochs(&self) -> MutexGuard<'_, HashMap<ConnectionId, u64>> {
        self.epochs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<(ConnectionId, TaskKind)>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current_epoch(&self, connection: ConnectionId) -> u64 {
        self.epochs().get(&connection).copied().unwrap_or(0)
    }
}

/// Handle a running task uses to notice that its connection was cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<QueueShared>,
    connection: ConnectionId,
    epoch: u64,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.shared.current_epoch(self.connection) != self.epoch
    }
}

/// Producer side of the queue.  Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    /// Creates the queue and the receiver the worker drains.
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared::default());
        (
            Self {
                tx,
                shared: Arc::clone(&shared),
            },
            TaskReceiver { rx, shared },
        )
    }

    /// Pushes a task unless one of the same kind is already queued for the
    /// connection.  Returns `true` when the task was queued.
    pub fn enqueue(&self, connection: ConnectionId, kind: TaskKind) -> bool {
        let epoch = self.shared.current_epoch(connection);
        self.push(connection, kind, epoch)
    }

    /// Schedules `kind` after `delay`.  The task is stamped with the epoch
    /// current *now*, so a cancel during the delay makes it stale.
    pub fn enqueue_after(&self, connection: ConnectionId, kind: TaskKind, delay: Duration) {
        let epoch = self.shared.current_epoch(connection);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.shared.current_epoch(connection) == epoch {
                queue.push(connection, kind, epoch);
            }
        });
    }

    fn push(&self, connection: ConnectionId, kind: TaskKind, epoch: u64) -> bool {
        if !self.shared.pending().insert((connection, kind)) {
            trace!(%connection, ?kind, "task already pending");
            return false;
        }
        let task = Task {
            connection,
            kind,
            token: CancelToken {
                shared: Arc::clone(&self.shared),
                connection,
                epoch,
            },
        };
        if self.tx.send(QueueItem::Run(task)).is_err() {
            self.shared.pending().remove(&(connection, kind));
            debug!(%connection, ?kind, "task queue closed; task dropped");
            return false;
        }
        debug!(%connection, ?kind, "task queued");
        true
    }

    /// Whether a task of `kind` is queued (not yet started) for the connection.
    pub fn is_pending(&self, connection: ConnectionId, kind: TaskKind) -> bool {
        self.shared.pending().contains(&(connection, kind))
    }

    /// Invalidates every queued, delayed or running task of the connection.
    pub fn cancel(&self, connection: ConnectionId) {
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.epochs().insert(connection, epoch);
        self.shared.pending().retain(|(c, _)| *c != connection);
        debug!(%connection, epoch, "connection tasks cancelled");
    }

    /// Waits until every item queued before this call has been processed.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueItem::Barrier(tx)).is_err() {
            return;
        }
        // A dropped sender means the worker has stopped: nothing is left to run.
        let _ = rx.await;
    }

    pub async fn cancel_and_drain(&self, connection: ConnectionId) {
        self.cancel(connection);
        self.drain().await;
    }

    /// Asks the worker to stop after the items already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueItem::Shutdown);
    }
}

/// Consumer side of the queue, owned by the worker.
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    shared: Arc<QueueShared>,
}

impl TaskReceiver {
    /// Returns the next live task.  Stale tasks are dropped and barriers are
    /// released on the way.  `None` after shutdown.
    pub async fn next(&mut self) -> Option<Task> {
        loop {
            match self.rx.recv().await? {
                QueueItem::Run(task) => {
                    self.shared.pending().remove(&(task.connection, task.kind));
                    if task.token.is_cancelled() {
                        debug!(connection = %task.connection, kind = ?task.kind, "stale task skipped");
                        continue;
                    }
                    return Some(task);
                }
                QueueItem::Barrier(done) => {
                    let _ = done.send(());
                }
                QueueItem::Shutdown => return None,
            }
        }
    }
}
