//! HDCP authenticator: the content-protection sub-state-machine.
//!
//! ```text
//!             authenticate() ok                engine reports
//!  Inactive ─────────────────────► Authenticating ─────────────► Authenticated
//!     ▲  │ error                        │ engine reports failure
//!     │  ▼                              ▼
//!     │ AuthFail ◄───────────────────── AuthFail ── on()+reauthenticate() ok ─► Authenticating
//!     │
//!     └──── off() (or deferred off applied by the next safe poll)
//! ```
//!
//! The authenticator is advanced by the connection's periodic HDCP poll.
//! Engine errors never escape: they are logged, reflected in
//! [`HdcpState::AuthFail`], and the poll is re-armed.

use std::sync::Arc;
use std::time::Duration;

use dplink_core::{HdcpContext, HdcpState, SessionState, SourceCapability, StreamId};
use tracing::{debug, info, warn};

use super::hardware::HdcpEngine;
use super::timing::TimingConfig;

/// What the caller should do after a poll or a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    Idle,
    /// Schedule another poll after the given delay.
    Rearm(Duration),
}

pub struct HdcpAuthenticator {
    engines: Vec<Arc<dyn HdcpEngine>>,
    enabled: bool,
    sink_sync: bool,
    timing: TimingConfig,
}

impl HdcpAuthenticator {
    pub fn new(
        engines: Vec<Arc<dyn HdcpEngine>>,
        enabled: bool,
        sink_sync: bool,
        timing: TimingConfig,
    ) -> Self {
        Self {
            engines,
            enabled,
            sink_sync,
            timing,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the slow-sink synchronization step is configured.
    pub fn sink_sync_needed(&self) -> bool {
        self.sink_sync
    }

    /// Probes every engine's feature predicate and renegotiates the version
    /// against the sink's capability, strongest first.
    pub fn update_capabilities(&self, ctx: &mut HdcpContext, sink: SourceCapability) {
        let source = self
            .engines
            .iter()
            .filter(|e| e.feature_supported())
            .fold(SourceCapability::empty(), |caps, e| caps.with(e.version()));
        ctx.reset();
        ctx.renegotiate(source, sink);
        info!(
            source_caps = source.0,
            sink_caps = sink.0,
            version = ?ctx.version(),
            "HDCP capabilities updated"
        );
    }

    fn active_engine(&self, ctx: &HdcpContext) -> Option<&Arc<dyn HdcpEngine>> {
        let version = ctx.version()?;
        self.engines.iter().find(|e| e.version() == version)
    }

    /// Advances the state machine by one step.
    ///
    /// The caller has already filtered out aborted, HDCP-aborted and
    /// trusted-UI sessions.
    pub fn poll(
        &self,
        ctx: &mut HdcpContext,
        state: &SessionState,
        streams: &[StreamId],
    ) -> PollAction {
        if !self.enabled {
            return PollAction::Idle;
        }
        if ctx.deferred_off() && !state.is_suspended() {
            self.apply_off(ctx, streams);
            return PollAction::Idle;
        }
        let Some(engine) = self.active_engine(ctx) else {
            debug!("no HDCP version negotiated; poll idle");
            return PollAction::Idle;
        };
        let link_up = state.is_ready() && state.is_enabled();

        match ctx.state() {
            HdcpState::Inactive => {
                if !link_up {
                    return PollAction::Idle;
                }
                if let Err(e) = engine.register_streams(streams) {
                    warn!("HDCP stream registration failed: {e}");
                    ctx.set_state(HdcpState::AuthFail);
                    return PollAction::Rearm(self.timing.hdcp_retry());
                }
                match engine.authenticate() {
                    Ok(()) => {
                        info!(version = ?ctx.version(), "HDCP authentication started");
                        ctx.set_state(HdcpState::Authenticating);
                        PollAction::Idle
                    }
                    Err(e) => {
                        warn!("HDCP authenticate failed: {e}");
                        ctx.set_state(HdcpState::AuthFail);
                        PollAction::Rearm(self.timing.hdcp_retry())
                    }
                }
            }
            HdcpState::AuthFail => {
                if !link_up {
                    info!("HDCP in auth-fail but link is down; not retrying");
                    return PollAction::Idle;
                }
                let retried = engine.on().and_then(|()| engine.reauthenticate());
                match retried {
                    Ok(()) => {
                        info!("HDCP reauthentication started");
                        ctx.set_state(HdcpState::Authenticating);
                        PollAction::Idle
                    }
                    Err(e) => {
                        warn!("HDCP reauthentication failed: {e}");
                        PollAction::Rearm(self.timing.hdcp_retry())
                    }
                }
            }
            HdcpState::Authenticating | HdcpState::Authenticated => PollAction::Idle,
        }
    }

    /// Records a state reported by the engine.
    pub fn status_changed(&self, ctx: &mut HdcpContext, new_state: HdcpState) -> PollAction {
        if ctx.state() != new_state {
            info!(from = %ctx.state(), to = %new_state, "HDCP state changed");
        }
        ctx.set_state(new_state);
        PollAction::Rearm(self.timing.hdcp_poll_after_status())
    }

    /// Turns protection off, or defers it while suspended.
    pub fn off(&self, ctx: &mut HdcpContext, streams: &[StreamId], suspended: bool) {
        if ctx.state() == HdcpState::Inactive {
            return;
        }
        if suspended {
            debug!("suspended; HDCP off deferred");
            ctx.set_deferred_off(true);
            return;
        }
        self.apply_off(ctx, streams);
    }

    fn apply_off(&self, ctx: &mut HdcpContext, streams: &[StreamId]) {
        if let Some(engine) = self.active_engine(ctx) {
            if !streams.is_empty() {
                if let Err(e) = engine.deregister_streams(streams) {
                    warn!("HDCP stream deregistration failed: {e}");
                }
            }
            if let Err(e) = engine.off() {
                warn!("HDCP off failed: {e}");
            }
        }
        ctx.set_state(HdcpState::Inactive);
        ctx.set_deferred_off(false);
        info!("HDCP off");
    }

    /// Forwards a content-protection interrupt to the engine.
    pub fn cp_irq(&self, ctx: &mut HdcpContext) -> PollAction {
        let Some(engine) = self.active_engine(ctx) else {
            return PollAction::Idle;
        };
        if let Err(e) = engine.cp_irq() {
            warn!("HDCP CP_IRQ handling failed: {e}");
            ctx.set_state(HdcpState::AuthFail);
        }
        PollAction::Rearm(self.timing.hdcp_poll_after_status())
    }

    /// Registers a stream added while protection is engaged.
    pub fn stream_added(&self, ctx: &HdcpContext, stream: StreamId) {
        if !ctx.is_engaged() {
            return;
        }
        if let Some(engine) = self.active_engine(ctx) {
            if let Err(e) = engine.register_streams(&[stream]) {
                warn!(%stream, "HDCP stream registration failed: {e}");
            }
        }
    }

    /// Deregisters a stream removed while protection is engaged.
    pub fn stream_removed(&self, ctx: &HdcpContext, stream: StreamId) {
        if !ctx.is_engaged() {
            return;
        }
        if let Some(engine) = self.active_engine(ctx) {
            if let Err(e) = engine.deregister_streams(&[stream]) {
                warn!(%stream, "HDCP stream deregistration failed: {e}");
            }
        }
    }
}
