//! Session state of one display-link connection.
//!
//! # Facets, not a single enum
//!
//! A connection is described by twelve independent boolean *facets*.  They
//! are not mutually exclusive: a sink can be `Connected` and `Enabled` at the
//! same time, and `Aborted` can be set on top of any other combination.  A
//! single enum would force the code to invent states such as
//! "connected-and-enabled-but-suspended"; a facet struct keeps each fact
//! separately testable.
//!
//! ```text
//! Disconnected ─configure─► CONFIGURED ─host_init─► +INITIALIZED
//!     ─host_ready─► +READY ─hpd high─► +CONNECTED ─stream on─► +ENABLED
//! ```
//!
//! Two invariants are enforced by the setters rather than left to callers:
//!
//! - `ConnectNotified` and `DisconnectNotified` are never both set.
//! - `Enabled` can only be set while `Ready` holds, and clearing `Ready`
//!   clears `Enabled`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifies one physical link instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Creates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised when a facet change would break a session invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot enable streams while the link is not ready")]
    NotReady,
}

/// The multi-facet state of a connection.
///
/// The struct is `Copy` so that snapshots can be published to lock-free
/// readers (the hotplug interrupt path) after every mutation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionState {
    configured: bool,
    initialized: bool,
    ready: bool,
    connected: bool,
    connect_notified: bool,
    disconnect_notified: bool,
    enabled: bool,
    suspended: bool,
    aborted: bool,
    hdcp_aborted: bool,
    source_powered_down: bool,
    trusted_ui_active: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Predicates ────────────────────────────────────────────────────────────

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_connect_notified(&self) -> bool {
        self.connect_notified
    }

    pub fn is_disconnect_notified(&self) -> bool {
        self.disconnect_notified
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_hdcp_aborted(&self) -> bool {
        self.hdcp_aborted
    }

    pub fn is_source_powered_down(&self) -> bool {
        self.source_powered_down
    }

    pub fn is_trusted_ui_active(&self) -> bool {
        self.trusted_ui_active
    }

    /// Returns `true` when none of the lifecycle facets are set.
    ///
    /// Bookkeeping facets (`Aborted`, notification flags, `Suspended`) do not
    /// count: a torn-down connection keeps `Aborted` until the next configure.
    pub fn is_disconnected(&self) -> bool {
        !(self.configured || self.initialized || self.ready || self.connected || self.enabled)
    }

    /// Returns `true` when hardware may be programmed.
    pub fn may_program_hardware(&self) -> bool {
        !self.aborted
    }

    // ── Setters ───────────────────────────────────────────────────────────────

    pub fn set_configured(&mut self, on: bool) {
        self.configured = on;
    }

    pub fn set_initialized(&mut self, on: bool) {
        self.initialized = on;
    }

    /// Sets or clears `Ready`.  Clearing it also clears `Enabled`.
    pub fn set_ready(&mut self, on: bool) {
        self.ready = on;
        if !on {
            self.enabled = false;
        }
    }

    pub fn set_connected(&mut self, on: bool) {
        self.connected = on;
    }

    /// Sets or clears `Enabled`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotReady`] when asked to set `Enabled` while
    /// `Ready` is clear.  The state is left unchanged.
    pub fn set_enabled(&mut self, on: bool) -> Result<(), SessionError> {
        if on && !self.ready {
            return Err(SessionError::NotReady);
        }
        self.enabled = on;
        Ok(())
    }

    pub fn set_suspended(&mut self, on: bool) {
        self.suspended = on;
    }

    pub fn set_aborted(&mut self, on: bool) {
        self.aborted = on;
    }

    pub fn set_hdcp_aborted(&mut self, on: bool) {
        self.hdcp_aborted = on;
    }

    pub fn set_source_powered_down(&mut self, on: bool) {
        self.source_powered_down = on;
    }

    pub fn set_trusted_ui_active(&mut self, on: bool) {
        self.trusted_ui_active = on;
    }

    /// Records that the compositor was told the sink is connected.
    pub fn mark_connect_notified(&mut self) {
        self.connect_notified = true;
        self.disconnect_notified = false;
    }

    /// Records that the compositor was told the sink is gone.
    pub fn mark_disconnect_notified(&mut self) {
        self.disconnect_notified = true;
        self.connect_notified = false;
    }

    /// Forgets both notification flags (fresh configure).
    pub fn clear_notified(&mut self) {
        self.connect_notified = false;
        self.disconnect_notified = false;
    }

    /// Names of every facet currently set, in declaration order.
    pub fn facets(&self) -> Vec<&'static str> {
        let table = [
            (self.configured, "CONFIGURED"),
            (self.initialized, "INITIALIZED"),
            (self.ready, "READY"),
            (self.connected, "CONNECTED"),
            (self.connect_notified, "CONNECT_NOTIFIED"),
            (self.disconnect_notified, "DISCONNECT_NOTIFIED"),
            (self.enabled, "ENABLED"),
            (self.suspended, "SUSPENDED"),
            (self.aborted, "ABORTED"),
            (self.hdcp_aborted, "HDCP_ABORTED"),
            (self.source_powered_down, "SRC_PWRDN"),
            (self.trusted_ui_active, "TUI_ACTIVE"),
        ];
        table
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let facets = self.facets();
        if facets.is_empty() {
            return f.write_str("DISCONNECTED");
        }
        f.write_str(&facets.join("|"))
    }
}
