//! HDCP context: authentication state, negotiated version and source capability.
//!
//! The source may ship several mutually exclusive protection engines (one per
//! protocol version).  On every connect the controller probes which engines
//! are usable (the *source capability*), reads which versions the sink
//! supports, and picks the strongest version both sides share.

use std::fmt;

use serde::Serialize;

/// Authentication state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HdcpState {
    #[default]
    Inactive,
    Authenticating,
    Authenticated,
    AuthFail,
}

impl fmt::Display for HdcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HdcpState::Inactive => "inactive",
            HdcpState::Authenticating => "authenticating",
            HdcpState::Authenticated => "authenticated",
            HdcpState::AuthFail => "auth-fail",
        };
        f.write_str(name)
    }
}

/// A content-protection protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HdcpVersion {
    Hdcp1x,
    Hdcp2x,
}

impl HdcpVersion {
    /// Every version, strongest first.  Negotiation walks this order.
    pub const STRONGEST_FIRST: [HdcpVersion; 2] = [HdcpVersion::Hdcp2x, HdcpVersion::Hdcp1x];

    /// Capability bit representing this version.
    pub fn capability_bit(self) -> u8 {
        match self {
            HdcpVersion::Hdcp1x => SourceCapability::HDCP_1X,
            HdcpVersion::Hdcp2x => SourceCapability::HDCP_2X,
        }
    }
}

impl fmt::Display for HdcpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdcpVersion::Hdcp1x => f.write_str("1.x"),
            HdcpVersion::Hdcp2x => f.write_str("2.x"),
        }
    }
}

/// Bitmap of protection versions a side (source or sink) can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SourceCapability(pub u8);

impl SourceCapability {
    pub const HDCP_1X: u8 = 0x01;
    pub const HDCP_2X: u8 = 0x02;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn supports(self, version: HdcpVersion) -> bool {
        self.0 & version.capability_bit() != 0
    }

    /// Returns a copy with `version` added.
    pub fn with(self, version: HdcpVersion) -> Self {
        Self(self.0 | version.capability_bit())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Picks the strongest version present in both bitmaps.
    pub fn negotiate(self, sink: SourceCapability) -> Option<HdcpVersion> {
        HdcpVersion::STRONGEST_FIRST
            .into_iter()
            .find(|v| self.supports(*v) && sink.supports(*v))
    }
}

/// Per-connection HDCP bookkeeping.
///
/// Only the controller's HDCP authenticator mutates this; everything else
/// reads it through [`HdcpContext::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HdcpContext {
    state: HdcpState,
    version: Option<HdcpVersion>,
    source_caps: SourceCapability,
    deferred_off: bool,
}

impl HdcpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HdcpState {
        self.state
    }

    pub fn version(&self) -> Option<HdcpVersion> {
        self.version
    }

    pub fn source_caps(&self) -> SourceCapability {
        self.source_caps
    }

    pub fn deferred_off(&self) -> bool {
        self.deferred_off
    }

    /// `true` while an engine is running (authenticating or authenticated).
    pub fn is_engaged(&self) -> bool {
        matches!(
            self.state,
            HdcpState::Authenticating | HdcpState::Authenticated
        )
    }

    pub fn set_state(&mut self, state: HdcpState) {
        self.state = state;
    }

    pub fn set_deferred_off(&mut self, on: bool) {
        self.deferred_off = on;
    }

    /// Replaces the source capability and renegotiates the version against `sink`.
    pub fn renegotiate(&mut self, source: SourceCapability, sink: SourceCapability) {
        self.source_caps = source;
        self.version = source.negotiate(sink);
    }

    /// Forgets the negotiated version and returns to `Inactive`.
    pub fn reset(&mut self) {
        self.state = HdcpState::Inactive;
        self.version = None;
        self.deferred_off = false;
    }

    /// Human-readable status line: version, state and source-capability bitmap.
    pub fn status(&self) -> String {
        let version = self
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "HDCP version: {version}, state: {}, source caps: 0x{:02x}",
            self.state, self.source_caps.0
        )
    }
}
