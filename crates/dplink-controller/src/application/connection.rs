//! Connection state machine: one physical link and everything it owns.
//!
//! ```text
//!  Disconnected ─configure─► Configured ─host_init─► +Initialized
//!        ▲                                                │ hpd high
//!        │                                                ▼
//!        │            +Enabled ◄─enable_stream─ +Connected ◄─ +Ready
//!        │                                                │
//!        └───── disconnect: +Aborted, cancel tasks, unwind in reverse
//! ```
//!
//! Every mutation happens under the session lock (a `tokio::sync::Mutex`).
//! When a guard is dropped the current [`SessionState`] is published on a
//! `watch` channel so the hotplug path can route events without ever taking
//! the lock.  Lock order is session then ledger; the ledger never calls back.
//!
//! The lock is never held across a compositor acknowledgement wait.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use dplink_core::{
    ConnectionId, ConnectionReservation, HdcpContext, HdcpState, LedgerError, ReservationGrant,
    ResourceLedger, ResourceRequest, SessionError, SessionState, Stream, StreamId, StreamTable,
    StreamTableError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::hardware::{
    CableOrientation, Hardware, HardwareError, MstTopology, PanelKind, SidebandEvent, SinkCaps,
};
use super::hdcp_auth::{HdcpAuthenticator, PollAction};
use super::mst::{MstCoordinator, MstError};
use super::notification::{AckHandle, NotificationChannel, NotificationError, NotifyOutcome};
use super::task_queue::{CancelToken, Task, TaskKind, TaskQueue};
use super::timing::TimingConfig;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("sink is already connected")]
    AlreadyConnected,
    #[error("connection is not configured")]
    NotConfigured,
    #[error("connection was aborted")]
    Aborted,
    #[error("link is not ready")]
    NotReady,
    #[error("sink is not connected")]
    NotConnected,
    #[error("unknown {0}")]
    UnknownStream(StreamId),
    #[error("{step} failed: {source}")]
    Hardware {
        step: &'static str,
        #[source]
        source: HardwareError,
    },
    #[error(transparent)]
    Resource(#[from] LedgerError),
    #[error(transparent)]
    Streams(#[from] StreamTableError),
    #[error(transparent)]
    Mst(#[from] MstError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

fn hw(step: &'static str) -> impl FnOnce(HardwareError) -> ConnectionError {
    move |source| ConnectionError::Hardware { step, source }
}

/// Keeps the first error of a best-effort sequence.
fn record(first: &mut Option<ConnectionError>, result: Result<(), ConnectionError>) {
    if let Err(e) = result {
        warn!("{e}");
        first.get_or_insert(e);
    }
}

// ── Public records ────────────────────────────────────────────────────────────

/// Per-connection options, usually derived from the controller config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub panel: PanelKind,
    pub mst_capable: bool,
    pub hdcp_enabled: bool,
    /// Wait for slow sinks to report HDCP-ready before authenticating.
    pub sink_sync: bool,
    /// Stream table size when MST is active.
    pub max_streams: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            panel: PanelKind::Dp,
            mst_capable: false,
            hdcp_enabled: true,
            sink_sync: false,
            max_streams: 4,
        }
    }
}

/// Platform-reported hotplug status.  Written by the hotplug path only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HpdStatus {
    pub hpd_high: bool,
    pub hpd_irq: bool,
    pub orientation: CableOrientation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpdHighOutcome {
    Connected,
    /// Nothing answered the capability read; bring-up was unwound.
    SinkAbsent,
}

/// A stream the compositor wants armed for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub id: StreamId,
    pub panel: u8,
    pub resources: ResourceRequest,
    /// MST time slots; ignored on single-stream links.
    pub slot_count: u8,
}

impl StreamRequest {
    /// The single stream of a non-MST link.
    pub fn single(resources: ResourceRequest) -> Self {
        Self {
            id: StreamId(0),
            panel: 0,
            resources,
            slot_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub id: StreamId,
    pub panel: u8,
    pub virtual_channel: u8,
    pub start_slot: u8,
    pub slot_count: u8,
}

/// Queryable state of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub state: SessionState,
    pub facets: String,
    pub hdcp: String,
    pub hdcp_state: HdcpState,
    pub mst_active: bool,
    /// Unallocated MST payload slots; the full payload when MST is idle.
    pub mst_free_slots: u8,
    /// Whether a connect or disconnect event was ever sent to the compositor.
    pub notification_sent: bool,
    pub sink: Option<SinkCaps>,
    pub streams: Vec<StreamStatus>,
    pub reservation: ConnectionReservation,
    pub hpd: HpdStatus,
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Session {
    state: SessionState,
    hdcp: HdcpContext,
    streams: StreamTable,
    mst: MstCoordinator,
    sink: Option<SinkCaps>,
    sink_synced: bool,
}

/// Session lock guard that publishes the state snapshot when released.
struct SessionGuard<'a> {
    inner: MutexGuard<'a, Session>,
    snapshot: &'a watch::Sender<SessionState>,
}

impl Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.inner
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.inner
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.snapshot.send_replace(self.inner.state);
    }
}

/// Bring-up steps, recorded so a failure can undo exactly what was applied.
#[derive(Debug, Clone, Copy)]
enum BringUpStep {
    PowerUp,
    HostInit,
    HostReady,
    PanelReady,
    MstActive,
}

// ── Connection ────────────────────────────────────────────────────────────────

pub struct Connection {
    id: ConnectionId,
    options: ConnectionOptions,
    hw: Hardware,
    ledger: Arc<ResourceLedger>,
    queue: TaskQueue,
    timing: TimingConfig,
    session: Mutex<Session>,
    snapshot: watch::Sender<SessionState>,
    hpd: StdMutex<HpdStatus>,
    attention_pending: AtomicBool,
    reconnect_requested: AtomicBool,
    notifications: NotificationChannel,
    hdcp: HdcpAuthenticator,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        hw: Hardware,
        options: ConnectionOptions,
        ledger: Arc<ResourceLedger>,
        queue: TaskQueue,
        timing: TimingConfig,
    ) -> Self {
        let max_streams = if options.mst_capable {
            options.max_streams.max(1)
        } else {
            1
        };
        let session = Session {
            state: SessionState::new(),
            hdcp: HdcpContext::new(),
            streams: StreamTable::new(max_streams),
            mst: MstCoordinator::new(hw.mst.clone()),
            sink: None,
            sink_synced: false,
        };
        let hdcp = HdcpAuthenticator::new(
            hw.hdcp_engines.clone(),
            options.hdcp_enabled,
            options.sink_sync,
            timing,
        );
        let (snapshot, _) = watch::channel(SessionState::new());
        Self {
            id,
            options,
            hw,
            ledger,
            queue,
            timing,
            session: Mutex::new(session),
            snapshot,
            hpd: StdMutex::new(HpdStatus::default()),
            attention_pending: AtomicBool::new(false),
            reconnect_requested: AtomicBool::new(false),
            notifications: NotificationChannel::new(&timing),
            hdcp,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Latest published state.  Never blocks.
    pub fn state(&self) -> SessionState {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.snapshot.subscribe()
    }

    async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            inner: self.session.lock().await,
            snapshot: &self.snapshot,
        }
    }

    fn hpd(&self) -> StdMutexGuard<'_, HpdStatus> {
        self.hpd.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn hpd_status(&self) -> HpdStatus {
        *self.hpd()
    }

    pub fn set_hpd(&self, hpd_high: bool, hpd_irq: bool) {
        let mut hpd = self.hpd();
        hpd.hpd_high = hpd_high;
        hpd.hpd_irq = hpd_irq;
    }

    pub fn set_orientation(&self, orientation: CableOrientation) {
        self.hpd().orientation = orientation;
    }

    pub fn is_attention_pending(&self) -> bool {
        self.attention_pending.load(Ordering::SeqCst)
    }

    pub fn set_attention_pending(&self, pending: bool) {
        self.attention_pending.store(pending, Ordering::SeqCst);
    }

    // ── Host bring-up primitives ──────────────────────────────────────────────

    fn host_init_locked(&self, s: &mut Session) -> Result<(), ConnectionError> {
        if s.state.is_initialized() {
            debug!(conn = %self.id, "host already initialized");
            return Ok(());
        }
        self.hw.power.acquire().map_err(hw("power acquire"))?;
        if let Err(e) = self.hw.controller.enable_hpd_source() {
            if let Err(release) = self.hw.power.release() {
                warn!(conn = %self.id, "power release after failed init: {release}");
            }
            return Err(hw("enable hpd source")(e));
        }
        s.state.set_initialized(true);
        s.state.set_source_powered_down(false);
        info!(conn = %self.id, "host initialized");
        Ok(())
    }

    fn host_deinit_locked(&self, s: &mut Session) -> Result<(), ConnectionError> {
        if !s.state.is_initialized() {
            return Ok(());
        }
        let mut first = None;
        record(
            &mut first,
            self.hw
                .controller
                .disable_hpd_source()
                .map_err(hw("disable hpd source")),
        );
        record(&mut first, self.hw.power.release().map_err(hw("power release")));
        s.state.set_initialized(false);
        s.state.set_source_powered_down(false);
        info!(conn = %self.id, "host deinitialized");
        first.map_or(Ok(()), Err)
    }

    fn host_ready_locked(&self, s: &mut Session) -> Result<(), ConnectionError> {
        if s.state.is_ready() {
            return Ok(());
        }
        self.hw.aux.aux_init().map_err(hw("aux init"))?;
        s.state.set_ready(true);
        Ok(())
    }

    fn host_unready_locked(&self, s: &mut Session) -> Result<(), ConnectionError> {
        if !s.state.is_ready() {
            return Ok(());
        }
        let result = self.hw.aux.aux_deinit().map_err(hw("aux deinit"));
        s.state.set_ready(false);
        result
    }

    /// Acquires link power and enables the hotplug source.  Idempotent.
    pub async fn host_init(&self) -> Result<(), ConnectionError> {
        let mut guard = self.lock().await;
        self.host_init_locked(&mut guard)
    }

    /// Inverse of [`host_init`](Self::host_init).  Best-effort.
    pub async fn host_deinit(&self) -> Result<(), ConnectionError> {
        let mut guard = self.lock().await;
        self.host_deinit_locked(&mut guard)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Cable and mode are ready.  Returns whether the hotplug line is high.
    pub async fn configure(&self) -> Result<bool, ConnectionError> {
        let mut guard = self.lock().await;
        let s = &mut *guard;
        let was_configured = s.state.is_configured();
        s.state.set_aborted(false);
        s.state.set_configured(true);
        if let Err(e) = self.host_init_locked(s) {
            if !was_configured {
                s.state.set_configured(false);
            }
            return Err(e);
        }
        if !was_configured {
            s.state.clear_notified();
        }
        info!(conn = %self.id, state = %s.state, "configured");
        Ok(self.hpd_status().hpd_high)
    }

    /// Marks a fresh hotplug-high.  The next connect task clears `Aborted`
    /// before bringing the link up.  Never blocks.
    pub fn request_reconnect(&self) {
        self.reconnect_requested.store(true, Ordering::SeqCst);
    }

    /// Sets `Aborted`: nothing programs hardware until the next configure
    /// or reconnect request.
    pub async fn abort(&self) {
        self.lock().await.state.set_aborted(true);
        self.reconnect_requested.store(false, Ordering::SeqCst);
        self.set_attention_pending(false);
        info!(conn = %self.id, "aborted");
    }

    /// Brings the link up after the hotplug line went high.
    pub async fn process_hpd_high(&self) -> Result<HpdHighOutcome, ConnectionError> {
        let mut guard = self.lock().await;
        let s = &mut *guard;
        if s.state.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }
        if s.state.is_aborted() {
            return Err(ConnectionError::Aborted);
        }
        if !s.state.is_configured() {
            return Err(ConnectionError::NotConfigured);
        }

        let mut applied = Vec::new();
        let outcome = self.bring_up(s, &mut applied).await;
        match &outcome {
            Ok(HpdHighOutcome::Connected) => {
                info!(conn = %self.id, state = %s.state, "sink connected");
            }
            Ok(HpdHighOutcome::SinkAbsent) => {
                info!(conn = %self.id, "no sink answered; link left down");
                self.unwind(s, applied);
            }
            Err(e) => {
                warn!(conn = %self.id, "link bring-up failed: {e}");
                self.unwind(s, applied);
            }
        }
        outcome
    }

    async fn bring_up(
        &self,
        s: &mut Session,
        applied: &mut Vec<BringUpStep>,
    ) -> Result<HpdHighOutcome, ConnectionError> {
        let orientation = self.hpd_status().orientation;
        self.hw
            .power
            .power_up(orientation)
            .map_err(hw("power up"))?;
        applied.push(BringUpStep::PowerUp);

        if s.state.is_source_powered_down() || !s.state.is_initialized() {
            self.host_init_locked(s)?;
            applied.push(BringUpStep::HostInit);
        }

        if !s.state.is_ready() {
            self.host_ready_locked(s)?;
            applied.push(BringUpStep::HostReady);
        }

        if self.options.panel == PanelKind::Edp {
            self.wait_power_rail().await?;
        }
        self.hw.panel.panel_ready().map_err(hw("panel ready"))?;
        applied.push(BringUpStep::PanelReady);

        let caps = match self.hw.aux.read_sink_caps() {
            Ok(caps) if caps.sink_count == 0 => return Ok(HpdHighOutcome::SinkAbsent),
            Ok(caps) => caps,
            Err(e) if e.is_benign_absence() => {
                debug!(conn = %self.id, "capability read: {e}");
                return Ok(HpdHighOutcome::SinkAbsent);
            }
            Err(e) => return Err(hw("capability read")(e)),
        };

        let event = self
            .hw
            .aux
            .process_sideband_request()
            .map_err(hw("sideband request"))?;
        debug!(conn = %self.id, ?event, "sideband request processed during bring-up");

        if self.options.mst_capable && caps.mst_capable && s.mst.activate().map_err(hw("mst"))? {
            applied.push(BringUpStep::MstActive);
        }

        self.hw
            .controller
            .link_training(&caps)
            .map_err(hw("link training"))?;

        s.sink = Some(caps);
        s.sink_synced = false;
        s.state.set_connected(true);
        if self.hdcp.is_enabled() {
            self.hdcp.update_capabilities(&mut s.hdcp, caps.hdcp);
        }
        Ok(HpdHighOutcome::Connected)
    }

    async fn wait_power_rail(&self) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.timing.edp_rail_timeout();
        loop {
            if self.hw.panel.power_rail_settled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(hw("eDP power rail")(HardwareError::Timeout));
            }
            tokio::time::sleep(self.timing.edp_rail_poll()).await;
        }
    }

    fn unwind(&self, s: &mut Session, applied: Vec<BringUpStep>) {
        for step in applied.into_iter().rev() {
            let result = match step {
                BringUpStep::MstActive => {
                    s.mst.deactivate(self.hw.controller.as_ref());
                    Ok(())
                }
                BringUpStep::PanelReady => self.hw.panel.panel_deinit().map_err(hw("panel deinit")),
                BringUpStep::HostReady => self.host_unready_locked(s),
                BringUpStep::HostInit => {
                    let result = self.host_deinit_locked(s);
                    s.state.set_source_powered_down(true);
                    result
                }
                BringUpStep::PowerUp => self.hw.power.power_down().map_err(hw("power down")),
            };
            if let Err(e) = result {
                warn!(conn = %self.id, ?step, "unwind step failed: {e}");
            }
        }
        s.sink = None;
        debug!(conn = %self.id, state = %s.state, "bring-up unwound");
    }

    /// Takes the link down after the hotplug line dropped, then tells the
    /// compositor.  The hardware part always completes.
    pub async fn process_hpd_low(&self) -> Result<NotifyOutcome, ConnectionError> {
        {
            let mut guard = self.lock().await;
            let s = &mut *guard;
            s.state.set_connected(false);
            let ids = s.streams.ids();
            let suspended = s.state.is_suspended();
            self.hdcp.off(&mut s.hdcp, &ids, suspended);
            if let Err(e) = self.hw.controller.audio_off() {
                warn!(conn = %self.id, "audio off failed: {e}");
            }
            if s.streams.is_empty() {
                if let Err(e) = self.hw.power.power_down() {
                    warn!(conn = %self.id, "power down failed: {e}");
                }
            }
            info!(conn = %self.id, state = %s.state, "sink disconnected");
        }
        self.notify(false, false).await
    }

    // ── Notification ──────────────────────────────────────────────────────────

    /// Tells the compositor about a connect or disconnect.
    ///
    /// No-op when the compositor already reflects the requested state.  The
    /// bookkeeping flags flip before the acknowledgement wait, so a timeout
    /// leaves the notification marked as sent.
    pub async fn notify(
        &self,
        connected: bool,
        skip_wait: bool,
    ) -> Result<NotifyOutcome, ConnectionError> {
        let (topology, trusted_ui, prior) = {
            let mut guard = self.lock().await;
            let prior = guard.state;
            if prior.is_connect_notified() == connected {
                return Ok(NotifyOutcome::Unchanged);
            }
            if connected {
                guard.state.mark_connect_notified();
            } else {
                guard.state.mark_disconnect_notified();
            }
            (
                guard.mst.active_topology(),
                prior.is_trusted_ui_active(),
                prior,
            )
        };

        let ack = self.notifications.begin();
        if let Err(e) = self.dispatch(topology.as_ref(), connected, ack).await {
            warn!(conn = %self.id, connected, "notification dispatch failed: {e}");
            let mut guard = self.lock().await;
            if prior.is_connect_notified() {
                guard.state.mark_connect_notified();
            } else if prior.is_disconnect_notified() {
                guard.state.mark_disconnect_notified();
            } else {
                guard.state.clear_notified();
            }
            return Err(NotificationError::Dispatch(e).into());
        }
        info!(conn = %self.id, connected, "compositor notified");

        if skip_wait || trusted_ui || (connected && topology.is_some()) {
            return Ok(NotifyOutcome::Sent);
        }
        let outcome = self
            .notifications
            .await_ack(|ack| self.dispatch(topology.as_ref(), connected, ack))
            .await?;
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        topology: Option<&Arc<dyn MstTopology>>,
        connected: bool,
        ack: AckHandle,
    ) -> Result<(), HardwareError> {
        match topology {
            Some(topology) => topology.hpd(connected, ack),
            None => self.hw.notifier.hotplug(self.id, connected, ack).await,
        }
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    /// Runs one queued task.  Failures are logged, never propagated.
    pub async fn run_task(&self, task: &Task) {
        let result = match task.kind {
            TaskKind::Connect => self.run_connect_task(&task.token).await,
            TaskKind::Attention => self.run_attention_task(&task.token).await,
            TaskKind::HdcpPoll => self.run_hdcp_poll(&task.token).await,
        };
        if let Err(e) = result {
            warn!(conn = %self.id, kind = ?task.kind, "task failed: {e}");
        }
    }

    pub async fn run_connect_task(&self, token: &CancelToken) -> Result<(), ConnectionError> {
        if token.is_cancelled() {
            debug!(conn = %self.id, "connect task skipped");
            return Ok(());
        }
        if self.reconnect_requested.swap(false, Ordering::SeqCst) {
            self.lock().await.state.set_aborted(false);
        }
        if self.state().is_aborted() {
            debug!(conn = %self.id, "connect task skipped");
            return Ok(());
        }
        match self.process_hpd_high().await {
            Ok(HpdHighOutcome::Connected) => {}
            Ok(HpdHighOutcome::SinkAbsent) => return Ok(()),
            Err(ConnectionError::AlreadyConnected) => {
                debug!(conn = %self.id, "connect task found sink already connected");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let delay = self.timing.notification_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if token.is_cancelled() || self.state().is_aborted() {
            return Ok(());
        }
        if self.is_attention_pending() {
            info!(conn = %self.id, "attention pending; connect notification coalesced");
            return Ok(());
        }
        self.notify(true, false).await.map(|_| ())
    }

    pub async fn run_attention_task(&self, token: &CancelToken) -> Result<(), ConnectionError> {
        self.set_attention_pending(false);
        if token.is_cancelled() {
            return Ok(());
        }

        let (event, rearm) = {
            let mut guard = self.lock().await;
            let s = &mut *guard;
            if s.state.is_aborted() || !s.state.is_ready() {
                debug!(conn = %self.id, "attention ignored; link not ready");
                return Ok(());
            }
            s.mst.hpd_irq();
            match self.hw.aux.process_sideband_request() {
                Ok(SidebandEvent::LinkStatusChanged) => {
                    if let Err(e) = self.hw.controller.link_maintenance() {
                        warn!(conn = %self.id, "link maintenance failed: {e}");
                    }
                    (SidebandEvent::LinkStatusChanged, PollAction::Idle)
                }
                Ok(SidebandEvent::CpIrq) => {
                    (SidebandEvent::CpIrq, self.hdcp.cp_irq(&mut s.hdcp))
                }
                Ok(event) => (event, PollAction::Idle),
                Err(e) => {
                    warn!(conn = %self.id, "sideband request failed: {e}");
                    (SidebandEvent::None, PollAction::Idle)
                }
            }
        };
        debug!(conn = %self.id, ?event, "attention processed");
        if let PollAction::Rearm(delay) = rearm {
            self.queue.enqueue_after(self.id, TaskKind::HdcpPoll, delay);
        }

        match event {
            SidebandEvent::SinkCountChanged(0) => {
                self.process_hpd_low().await?;
                return Ok(());
            }
            SidebandEvent::SinkCountChanged(_) if !self.state().is_connected() => {
                match self.process_hpd_high().await {
                    Ok(_) | Err(ConnectionError::AlreadyConnected) => {}
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }

        if token.is_cancelled() {
            return Ok(());
        }
        let state = self.state();
        if state.is_connected() && !state.is_connect_notified() {
            self.notify(true, false).await?;
        }
        Ok(())
    }

    pub async fn run_hdcp_poll(&self, token: &CancelToken) -> Result<(), ConnectionError> {
        if token.is_cancelled() {
            return Ok(());
        }
        let needs_sink_sync = {
            let guard = self.lock().await;
            if !self.hdcp_poll_allowed(&guard.state) {
                debug!(conn = %self.id, state = %guard.state, "HDCP poll skipped");
                return Ok(());
            }
            self.hdcp.sink_sync_needed()
                && !guard.sink_synced
                && guard.hdcp.state() == HdcpState::Inactive
                && guard.state.is_enabled()
        };

        if needs_sink_sync {
            match self.hw.aux.sink_hdcp_ready() {
                Ok(true) => {
                    tokio::time::sleep(self.timing.sink_sync_settle()).await;
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    self.lock().await.sink_synced = true;
                }
                Ok(false) => {
                    debug!(conn = %self.id, "sink not HDCP-ready; retrying later");
                    self.queue
                        .enqueue_after(self.id, TaskKind::HdcpPoll, self.timing.hdcp_retry());
                    return Ok(());
                }
                Err(e) => {
                    warn!(conn = %self.id, "sink HDCP status read failed: {e}");
                    self.queue
                        .enqueue_after(self.id, TaskKind::HdcpPoll, self.timing.hdcp_retry());
                    return Ok(());
                }
            }
        }

        let action = {
            let mut guard = self.lock().await;
            let s = &mut *guard;
            if !self.hdcp_poll_allowed(&s.state) {
                return Ok(());
            }
            let ids = s.streams.ids();
            self.hdcp.poll(&mut s.hdcp, &s.state, &ids)
        };
        if let PollAction::Rearm(delay) = action {
            self.queue.enqueue_after(self.id, TaskKind::HdcpPoll, delay);
        }
        Ok(())
    }

    fn hdcp_poll_allowed(&self, state: &SessionState) -> bool {
        self.hdcp.is_enabled()
            && !state.is_aborted()
            && !state.is_hdcp_aborted()
            && !state.is_trusted_ui_active()
    }

    /// Asynchronous result reported by the HDCP engine.
    pub async fn hdcp_status_changed(&self, new_state: HdcpState) {
        let (action, aborted) = {
            let mut guard = self.lock().await;
            let aborted = guard.state.is_aborted();
            (self.hdcp.status_changed(&mut guard.hdcp, new_state), aborted)
        };
        if let (PollAction::Rearm(delay), false) = (action, aborted) {
            self.queue.enqueue_after(self.id, TaskKind::HdcpPoll, delay);
        }
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    /// Arms a stream for display.
    ///
    /// The ledger reservation for every stream of the connection is committed
    /// before any hardware is programmed.  On failure the table and the
    /// reservation are restored.
    pub async fn enable_stream(
        &self,
        request: StreamRequest,
    ) -> Result<ReservationGrant, ConnectionError> {
        let grant = {
            let mut guard = self.lock().await;
            let s = &mut *guard;
            if s.state.is_aborted() {
                return Err(ConnectionError::Aborted);
            }
            if !s.state.is_ready() {
                return Err(ConnectionError::NotReady);
            }
            if !s.state.is_connected() {
                return Err(ConnectionError::NotConnected);
            }
            if !s.mst.is_active() && !s.streams.is_empty() {
                return Err(StreamTableError::Full { max: 1 }.into());
            }

            s.streams.insert(Stream {
                id: request.id,
                panel: request.panel,
                virtual_channel: s.streams.next_virtual_channel(),
                start_slot: 0,
                slot_count: 0,
                resources: request.resources,
            })?;

            let grant = match self.ledger.reserve(self.id, &s.streams.aggregate_request()) {
                Ok(grant) => grant,
                Err(e) => {
                    s.streams.remove(request.id);
                    warn!(conn = %self.id, stream = %request.id, "mode rejected: {e}");
                    return Err(e.into());
                }
            };

            if let Err(e) = self.program_stream(s, request) {
                s.streams.remove(request.id);
                self.resync_reservation(s);
                warn!(conn = %self.id, stream = %request.id, "stream enable failed: {e}");
                return Err(e);
            }
            self.hdcp.stream_added(&s.hdcp, request.id);
            info!(conn = %self.id, stream = %request.id, state = %s.state, "stream enabled");
            grant
        };

        if self.hdcp.is_enabled() {
            self.queue.enqueue_after(
                self.id,
                TaskKind::HdcpPoll,
                self.timing.hdcp_poll_after_enable(),
            );
        }
        Ok(grant)
    }

    fn program_stream(&self, s: &mut Session, request: StreamRequest) -> Result<(), ConnectionError> {
        if s.mst.is_active() {
            let allocation = s
                .mst
                .program(self.hw.controller.as_ref(), request.id, request.slot_count)?;
            if let Some(stream) = s.streams.get_mut(request.id) {
                stream.start_slot = allocation.start_slot;
                stream.slot_count = allocation.slot_count;
            }
        }
        let stream = s
            .streams
            .get(request.id)
            .cloned()
            .ok_or(ConnectionError::UnknownStream(request.id))?;
        if let Err(e) = self.hw.controller.stream_on(&stream) {
            s.mst.release(self.hw.controller.as_ref(), request.id);
            return Err(hw("stream on")(e));
        }
        s.state.set_enabled(true)?;
        Ok(())
    }

    /// Re-commits the reservation for the streams still in the table.
    fn resync_reservation(&self, s: &Session) {
        if s.streams.is_empty() {
            self.ledger.release(self.id);
            return;
        }
        if let Err(e) = self.ledger.reserve(self.id, &s.streams.aggregate_request()) {
            warn!(conn = %self.id, "reservation resync failed: {e}");
        }
    }

    /// Turns a stream off and shrinks the reservation.
    pub async fn disable_stream(&self, id: StreamId) -> Result<(), ConnectionError> {
        let mut guard = self.lock().await;
        let s = &mut *guard;
        let stream = s
            .streams
            .remove(id)
            .ok_or(ConnectionError::UnknownStream(id))?;

        let mut first = None;
        if s.state.may_program_hardware() {
            record(
                &mut first,
                self.hw.controller.stream_off(&stream).map_err(hw("stream off")),
            );
            s.mst.release(self.hw.controller.as_ref(), id);
        }

        if s.streams.is_empty() {
            s.state.set_enabled(false)?;
            let suspended = s.state.is_suspended();
            self.hdcp.off(&mut s.hdcp, &[id], suspended);
        } else {
            self.hdcp.stream_removed(&s.hdcp, id);
        }
        self.resync_reservation(s);
        info!(conn = %self.id, stream = %id, state = %s.state, "stream disabled");
        first.map_or(Ok(()), Err)
    }

    // ── Teardown, suspend, resume ─────────────────────────────────────────────

    /// Unwinds the whole connection in reverse order.
    ///
    /// The disconnect goes out through the MST topology while it is still
    /// active; the topology is then cleared before the streams are drained.
    ///
    /// Every step runs even when an earlier one fails; the first error is
    /// returned once the connection has converged to `Disconnected`.
    pub async fn teardown(&self) -> Result<(), ConnectionError> {
        let mut first = None;
        record(&mut first, self.process_hpd_low().await.map(|_| ()));

        let delay = self.timing.disconnect_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.lock().await;
        let s = &mut *guard;
        s.mst.deactivate(self.hw.controller.as_ref());
        let ids = s.streams.ids();
        for stream in s.streams.drain() {
            record(
                &mut first,
                self.hw.controller.stream_off(&stream).map_err(hw("stream off")),
            );
        }
        let suspended = s.state.is_suspended();
        self.hdcp.off(&mut s.hdcp, &ids, suspended);
        self.ledger.release(self.id);
        s.state.set_enabled(false)?;
        record(
            &mut first,
            self.hw.panel.panel_deinit().map_err(hw("panel deinit")),
        );
        record(&mut first, self.host_unready_locked(s));
        record(&mut first, self.host_deinit_locked(s));
        s.state.set_configured(false);
        s.sink = None;
        record(&mut first, self.hw.power.power_down().map_err(hw("power down")));
        info!(conn = %self.id, state = %s.state, "connection torn down");
        first.map_or(Ok(()), Err)
    }

    /// Prepares for system suspend: stops HDCP work, drains queued tasks and
    /// powers the link down.  Best-effort; the first error is returned.
    pub async fn suspend(&self) -> Result<(), ConnectionError> {
        {
            let mut guard = self.lock().await;
            guard.state.set_suspended(true);
            guard.state.set_hdcp_aborted(true);
        }
        self.set_attention_pending(false);
        self.queue.cancel_and_drain(self.id).await;

        let mut first = None;
        let mut guard = self.lock().await;
        let s = &mut *guard;
        let ids = s.streams.ids();
        self.hdcp.off(&mut s.hdcp, &ids, true);
        for stream in s.streams.drain() {
            record(
                &mut first,
                self.hw.controller.stream_off(&stream).map_err(hw("stream off")),
            );
        }
        s.mst.deactivate(self.hw.controller.as_ref());
        self.ledger.release(self.id);
        s.state.set_connected(false);
        if s.state.is_configured() {
            record(&mut first, self.host_unready_locked(s));
            record(&mut first, self.host_deinit_locked(s));
            s.state.set_source_powered_down(true);
        }
        record(&mut first, self.hw.power.power_down().map_err(hw("power down")));
        info!(conn = %self.id, state = %s.state, "suspended");
        first.map_or(Ok(()), Err)
    }

    /// Leaves suspend.  Returns whether a connect task was queued.
    pub async fn resume(&self) -> bool {
        let (reconnect, deferred_off) = {
            let mut guard = self.lock().await;
            guard.state.set_suspended(false);
            guard.state.set_hdcp_aborted(false);
            let reconnect = self.hpd_status().hpd_high
                && guard.state.is_configured()
                && !guard.state.is_connected()
                && !guard.state.is_aborted();
            (reconnect, guard.hdcp.deferred_off())
        };
        info!(conn = %self.id, reconnect, "resumed");
        if deferred_off {
            self.queue.enqueue(self.id, TaskKind::HdcpPoll);
        }
        reconnect && self.queue.enqueue(self.id, TaskKind::Connect)
    }

    /// Enters or leaves trusted-UI mode.  Leaving it sends a connect
    /// notification that was held back while the mode was active.
    pub async fn set_trusted_ui(&self, active: bool) -> Result<NotifyOutcome, ConnectionError> {
        let send = {
            let mut guard = self.lock().await;
            guard.state.set_trusted_ui_active(active);
            !active && guard.state.is_connected() && !guard.state.is_connect_notified()
        };
        info!(conn = %self.id, active, "trusted UI");
        if send {
            self.notify(true, false).await
        } else {
            Ok(NotifyOutcome::Unchanged)
        }
    }

    // ── Query ─────────────────────────────────────────────────────────────────

    pub async fn status(&self) -> ConnectionStatus {
        let guard = self.lock().await;
        ConnectionStatus {
            id: self.id,
            state: guard.state,
            facets: guard.state.to_string(),
            hdcp: guard.hdcp.status(),
            hdcp_state: guard.hdcp.state(),
            mst_active: guard.mst.is_active(),
            mst_free_slots: guard.mst.free_slots(),
            notification_sent: self.notifications.was_sent(),
            sink: guard.sink,
            streams: guard
                .streams
                .iter()
                .map(|s| StreamStatus {
                    id: s.id,
                    panel: s.panel,
                    virtual_channel: s.virtual_channel,
                    start_slot: s.start_slot,
                    slot_count: s.slot_count,
                })
                .collect(),
            reservation: self.ledger.usage(self.id),
            hpd: self.hpd_status(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::task_queue::TaskReceiver;
    use crate::infrastructure::simulated::{AckPolicy, SimulatedHardware};
    use dplink_core::PlatformCapacity;

    fn make_connection(sim: &SimulatedHardware) -> (Connection, TaskReceiver) {
        let (queue, rx) = TaskQueue::new();
        let ledger = Arc::new(ResourceLedger::new(PlatformCapacity {
            mixers: 4,
            compression_blocks: 2,
        }));
        let conn = Connection::new(
            ConnectionId::new(),
            sim.hardware(),
            ConnectionOptions::default(),
            ledger,
            queue,
            TimingConfig::default(),
        );
        (conn, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_init_twice_programs_hardware_once() {
        // Arrange
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);

        // Act
        conn.host_init().await.unwrap();
        conn.host_init().await.unwrap();

        // Assert
        assert_eq!(sim.link.count("acquire"), 1);
        assert_eq!(sim.link.count("enable_hpd_source"), 1);
        assert!(conn.state().is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_init_failure_leaves_state_untouched() {
        let sim = SimulatedHardware::new();
        sim.link.fail("enable_hpd_source");
        let (conn, _rx) = make_connection(&sim);

        let result = conn.host_init().await;

        assert!(matches!(
            result,
            Err(ConnectionError::Hardware { step: "enable hpd source", .. })
        ));
        assert!(!conn.state().is_initialized());
        assert_eq!(sim.link.count("release"), 1, "power must be given back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hpd_high_twice_reports_already_connected() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();

        let second = conn.process_hpd_high().await;

        assert_eq!(second, Err(ConnectionError::AlreadyConnected));
        assert_eq!(sim.link.count("link_training"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hpd_high_requires_configure() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);

        assert_eq!(
            conn.process_hpd_high().await,
            Err(ConnectionError::NotConfigured)
        );
        assert_eq!(sim.link.count("power_up"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_training_failure_unwinds_in_reverse() {
        let sim = SimulatedHardware::new();
        sim.link.fail("link_training");
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();

        let result = conn.process_hpd_high().await;

        assert!(matches!(
            result,
            Err(ConnectionError::Hardware { step: "link training", .. })
        ));
        let state = conn.state();
        assert!(state.is_configured() && state.is_initialized());
        assert!(!state.is_ready() && !state.is_connected());
        let log = sim.link.calls();
        let tail: Vec<&str> = log.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["power_down", "aux_deinit", "panel_deinit"]);
        assert!(sim.compositor.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edp_rail_timeout_fails_bring_up() {
        let sim = SimulatedHardware::new();
        sim.link.set_power_rail_settled(false);
        let (queue, _rx) = TaskQueue::new();
        let conn = Connection::new(
            ConnectionId::new(),
            sim.hardware(),
            ConnectionOptions {
                panel: PanelKind::Edp,
                ..ConnectionOptions::default()
            },
            Arc::new(ResourceLedger::new(PlatformCapacity {
                mixers: 2,
                compression_blocks: 0,
            })),
            queue,
            TimingConfig::default(),
        );
        conn.configure().await.unwrap();

        let result = conn.process_hpd_high().await;

        assert!(matches!(
            result,
            Err(ConnectionError::Hardware { step: "eDP power rail", source: HardwareError::Timeout })
        ));
        assert_eq!(sim.link.count("panel_ready"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_connected_twice_is_noop_second_time() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();

        let first = conn.notify(true, false).await.unwrap();
        let second = conn.notify(true, false).await.unwrap();

        assert_eq!(first, NotifyOutcome::Delivered { resent: false });
        assert_eq!(second, NotifyOutcome::Unchanged);
        assert_eq!(sim.compositor.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_timeout_keeps_notified_flag() {
        let sim = SimulatedHardware::new();
        sim.compositor.set_policy(AckPolicy::Never);
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();

        let result = conn.notify(true, false).await;

        assert_eq!(
            result,
            Err(ConnectionError::Notification(NotificationError::Timeout))
        );
        assert!(conn.state().is_connect_notified());
        assert_eq!(sim.compositor.events().len(), 2, "one send plus one resend");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_ui_skips_wait_and_defers_connect_notification() {
        let sim = SimulatedHardware::new();
        sim.compositor.set_policy(AckPolicy::Never);
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();
        conn.set_trusted_ui(true).await.unwrap();

        let outcome = conn.notify(true, false).await.unwrap();

        assert_eq!(outcome, NotifyOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_stream_requires_connected() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();

        let result = conn
            .enable_stream(StreamRequest::single(ResourceRequest::mixers(1)))
            .await;

        assert_eq!(result, Err(ConnectionError::NotReady));
        assert!(!conn.state().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_on_failure_rolls_back_reservation() {
        let sim = SimulatedHardware::new();
        sim.link.fail("stream_on");
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();

        let result = conn
            .enable_stream(StreamRequest::single(ResourceRequest::mixers(2)))
            .await;

        assert!(result.is_err());
        let status = conn.status().await;
        assert!(status.streams.is_empty());
        assert_eq!(status.reservation.current.mixers, 0);
        assert!(!status.state.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_last_stream_clears_enabled_and_releases() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();
        conn.enable_stream(StreamRequest::single(ResourceRequest::mixers(2)))
            .await
            .unwrap();

        conn.disable_stream(StreamId(0)).await.unwrap();

        let status = conn.status().await;
        assert!(!status.state.is_enabled());
        assert!(status.state.is_ready());
        assert_eq!(status.reservation.current.mixers, 0);
        assert_eq!(status.reservation.high_water.mixers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_then_resume_reinitializes_host() {
        let sim = SimulatedHardware::new();
        let (conn, mut rx) = make_connection(&sim);
        tokio::spawn(async move { while rx.next().await.is_some() {} });
        conn.set_hpd(true, false);
        conn.configure().await.unwrap();
        conn.process_hpd_high().await.unwrap();

        conn.suspend().await.unwrap();
        let state = conn.state();
        assert!(state.is_source_powered_down());
        assert!(!state.is_initialized() && !state.is_ready());

        assert!(conn.resume().await);
        conn.process_hpd_high().await.unwrap();

        assert!(conn.state().is_initialized());
        assert!(!conn.state().is_source_powered_down());
        assert_eq!(sim.link.count("acquire"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_facets_and_hdcp_line() {
        let sim = SimulatedHardware::new();
        let (conn, _rx) = make_connection(&sim);
        conn.configure().await.unwrap();

        let status = conn.status().await;

        assert_eq!(status.facets, "CONFIGURED|INITIALIZED");
        assert_eq!(
            status.hdcp,
            "HDCP version: none, state: inactive, source caps: 0x00"
        );
    }
}
