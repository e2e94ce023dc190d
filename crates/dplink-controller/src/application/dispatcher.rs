//! HotplugDispatcher: the single entry point for external stimuli.
//!
//! Cable insert/remove, sideband attention and simulated events all arrive
//! here and are translated into queued tasks:
//!
//! ```text
//!  attention(hpd_irq, hpd_high)
//!     ├─ hpd_high == false            → disconnect, synchronously
//!     ├─ hpd_irq && Ready             → attention pending, queue Attention
//!     ├─ no Connect queued, !Connected → request reconnect, queue Connect
//!     └─ otherwise                    → ignored
//! ```
//!
//! The routing decision reads only the published state snapshot and the
//! queue's pending set.  Apart from disconnect, nothing on this path takes
//! the session lock; the connect task clears `Aborted` itself.
//!
//! The dispatcher owns the single queue worker.  Synchronous paths
//! (disconnect, suspend) cancel and drain the connection's queued tasks
//! before touching its state.

use std::sync::Arc;

use dplink_core::{
    ConnectionId, HdcpState, LedgerSnapshot, ReservationGrant, ResourceLedger, StreamId,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{
    Connection, ConnectionError, ConnectionOptions, ConnectionStatus, StreamRequest,
};
use super::hardware::{CableOrientation, Hardware};
use super::notification::NotifyOutcome;
use super::registry::ConnectionRegistry;
use super::task_queue::{TaskKind, TaskQueue, TaskReceiver};
use super::timing::TimingConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Events a test harness or debug interface can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimulatedEvent {
    HpdHigh,
    HpdLow,
    HpdIrq,
}

/// Where an attention callback was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionRoute {
    Disconnected,
    AttentionQueued,
    ConnectQueued,
    Ignored,
}

/// Every connection plus the shared ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub connections: Vec<ConnectionStatus>,
    pub ledger: LedgerSnapshot,
}

pub struct HotplugDispatcher {
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<ResourceLedger>,
    queue: TaskQueue,
    timing: TimingConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HotplugDispatcher {
    /// Creates the dispatcher and spawns its queue worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<ResourceLedger>,
        timing: TimingConfig,
    ) -> Self {
        let (queue, rx) = TaskQueue::new();
        let worker = tokio::spawn(run_worker(rx, Arc::clone(&registry)));
        Self {
            registry,
            ledger,
            queue,
            timing,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>, DispatchError> {
        self.registry
            .get(id)
            .ok_or(DispatchError::UnknownConnection(id))
    }

    /// Creates and registers a connection for a newly detected link.
    pub fn attach(
        &self,
        id: ConnectionId,
        hardware: Hardware,
        options: ConnectionOptions,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(
            id,
            hardware,
            options,
            Arc::clone(&self.ledger),
            self.queue.clone(),
            self.timing,
        ));
        self.registry.insert(Arc::clone(&connection));
        info!(conn = %id, ?options, "connection attached");
        connection
    }

    /// Disconnects and forgets a removed link.
    pub async fn detach(&self, id: ConnectionId) -> Result<(), DispatchError> {
        let result = self.disconnect(id).await;
        self.registry.remove(id);
        self.ledger.forget(id);
        info!(conn = %id, "connection detached");
        result
    }

    /// Cable and mode ready.  Queues a connect when the hotplug line is high.
    pub async fn configure(&self, id: ConnectionId) -> Result<bool, DispatchError> {
        let connection = self.lookup(id)?;
        let hpd_high = connection.configure().await?;
        let queued = hpd_high
            && !connection.state().is_connected()
            && self.queue.enqueue(id, TaskKind::Connect);
        Ok(queued)
    }

    /// Synchronous teardown: abort, cancel and drain, then unwind.
    ///
    /// The connection converges to `Disconnected` even when a step fails;
    /// the first failure is returned.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), DispatchError> {
        let connection = self.lookup(id)?;
        connection.abort().await;
        self.queue.cancel_and_drain(id).await;
        connection.teardown().await?;
        Ok(())
    }

    /// Hotplug / attention callback from the platform.
    pub async fn attention(
        &self,
        id: ConnectionId,
        hpd_irq: bool,
        hpd_high: bool,
    ) -> Result<AttentionRoute, DispatchError> {
        let connection = self.lookup(id)?;
        connection.set_hpd(hpd_high, hpd_irq);

        if !hpd_high {
            self.disconnect(id).await?;
            return Ok(AttentionRoute::Disconnected);
        }

        let state = connection.state();
        if hpd_irq && state.is_ready() {
            connection.set_attention_pending(true);
            self.queue.enqueue(id, TaskKind::Attention);
            debug!(conn = %id, "attention queued");
            return Ok(AttentionRoute::AttentionQueued);
        }

        if !self.queue.is_pending(id, TaskKind::Connect) && !state.is_connected() {
            connection.request_reconnect();
            self.queue.enqueue(id, TaskKind::Connect);
            debug!(conn = %id, "connect queued");
            return Ok(AttentionRoute::ConnectQueued);
        }

        debug!(conn = %id, state = %state, "hotplug event ignored");
        Ok(AttentionRoute::Ignored)
    }

    /// Injects an event through the same routing as a platform callback.
    pub async fn simulate(
        &self,
        id: ConnectionId,
        event: SimulatedEvent,
    ) -> Result<AttentionRoute, DispatchError> {
        info!(conn = %id, ?event, "simulated event");
        match event {
            SimulatedEvent::HpdHigh => self.attention(id, false, true).await,
            SimulatedEvent::HpdLow => self.attention(id, false, false).await,
            SimulatedEvent::HpdIrq => self.attention(id, true, true).await,
        }
    }

    pub fn set_orientation(
        &self,
        id: ConnectionId,
        orientation: CableOrientation,
    ) -> Result<(), DispatchError> {
        self.lookup(id)?.set_orientation(orientation);
        Ok(())
    }

    pub async fn enable_stream(
        &self,
        id: ConnectionId,
        request: StreamRequest,
    ) -> Result<ReservationGrant, DispatchError> {
        Ok(self.lookup(id)?.enable_stream(request).await?)
    }

    pub async fn disable_stream(
        &self,
        id: ConnectionId,
        stream: StreamId,
    ) -> Result<(), DispatchError> {
        Ok(self.lookup(id)?.disable_stream(stream).await?)
    }

    pub async fn set_trusted_ui(
        &self,
        id: ConnectionId,
        active: bool,
    ) -> Result<NotifyOutcome, DispatchError> {
        Ok(self.lookup(id)?.set_trusted_ui(active).await?)
    }

    pub async fn hdcp_status_changed(
        &self,
        id: ConnectionId,
        state: HdcpState,
    ) -> Result<(), DispatchError> {
        self.lookup(id)?.hdcp_status_changed(state).await;
        Ok(())
    }

    /// Suspends every connection.  All are attempted; the first error wins.
    pub async fn suspend_prepare(&self) -> Result<(), DispatchError> {
        let mut first = None;
        for connection in self.registry.all() {
            if let Err(e) = connection.suspend().await {
                warn!(conn = %connection.id(), "suspend failed: {e}");
                first.get_or_insert(DispatchError::from(e));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Resumes every connection.  Returns how many reconnects were queued.
    pub async fn resume_complete(&self) -> usize {
        let mut reconnects = 0;
        for connection in self.registry.all() {
            if connection.resume().await {
                reconnects += 1;
            }
        }
        reconnects
    }

    pub async fn status(&self, id: ConnectionId) -> Result<ConnectionStatus, DispatchError> {
        Ok(self.lookup(id)?.status().await)
    }

    /// Status of every connection plus the ledger snapshot.
    pub async fn status_all(&self) -> ControllerStatus {
        let mut connections = Vec::new();
        for connection in self.registry.all() {
            connections.push(connection.status().await);
        }
        ControllerStatus {
            connections,
            ledger: self.ledger.snapshot(),
        }
    }

    /// Waits until every task queued so far has run.
    pub async fn settle(&self) {
        self.queue.drain().await;
    }

    /// Stops the worker after the tasks already queued.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!("task worker ended abnormally: {e}");
            }
        }
        info!("hotplug dispatcher stopped");
    }
}

async fn run_worker(mut rx: TaskReceiver, registry: Arc<ConnectionRegistry>) {
    debug!("task worker started");
    while let Some(task) = rx.next().await {
        let Some(connection) = registry.get(task.connection) else {
            debug!(conn = %task.connection, kind = ?task.kind, "task for detached connection dropped");
            continue;
        };
        connection.run_task(&task).await;
    }
    debug!("task worker stopped");
}
