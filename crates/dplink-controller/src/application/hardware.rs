//! Hardware and compositor collaborator interfaces.
//!
//! The state machine never touches registers.  Every outbound operation goes
//! through one of the capability traits below; each hardware generation
//! provides its own implementation and the set is injected as a
//! [`Hardware`] bundle when a connection is attached.
//!
//! All hardware calls are bounded-time synchronous calls that either succeed
//! or return a [`HardwareError`].  Only the compositor notification is
//! async, because delivering an event to user space may itself suspend.

use std::sync::Arc;

use async_trait::async_trait;
use dplink_core::{ConnectionId, HdcpVersion, SourceCapability, Stream, StreamId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::notification::AckHandle;

/// Error returned by any collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HardwareError {
    #[error("hardware error: {0}")]
    Failed(String),
    #[error("sideband transaction timed out")]
    Timeout,
    #[error("no sink present")]
    NoSink,
}

impl HardwareError {
    /// Timeouts and absent sinks mean "nothing is plugged in", not a fault.
    pub fn is_benign_absence(&self) -> bool {
        matches!(self, HardwareError::Timeout | HardwareError::NoSink)
    }
}

pub type HwResult<T = ()> = Result<T, HardwareError>;

/// Which way the reversible connector was inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CableOrientation {
    #[default]
    Normal,
    Reverse,
}

/// External DisplayPort or embedded panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanelKind {
    #[default]
    Dp,
    Edp,
}

/// What the sink reported during the capability read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkCaps {
    pub max_lanes: u8,
    pub max_link_rate_khz: u32,
    pub mst_capable: bool,
    /// HDCP versions the sink supports.
    pub hdcp: SourceCapability,
    pub sink_count: u8,
}

impl Default for SinkCaps {
    fn default() -> Self {
        Self {
            max_lanes: 4,
            max_link_rate_khz: 810_000,
            mst_capable: false,
            hdcp: SourceCapability(SourceCapability::HDCP_1X | SourceCapability::HDCP_2X),
            sink_count: 1,
        }
    }
}

/// Outcome of processing a pending sideband (attention) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandEvent {
    /// Nothing actionable was pending.
    None,
    /// Link status bits changed; the link needs maintenance.
    LinkStatusChanged,
    /// Content-protection interrupt raised by the sink.
    CpIrq,
    /// Downstream sink count changed to the given value.
    SinkCountChanged(u8),
}

/// Link power resources (clocks, regulators, PHY).
pub trait LinkPower: Send + Sync {
    /// Acquires link power resources.
    fn acquire(&self) -> HwResult;
    /// Releases link power resources.
    fn release(&self) -> HwResult;
    /// Powers the PHY up for the given cable orientation.
    fn power_up(&self, orientation: CableOrientation) -> HwResult;
    /// Powers the controller and PHY down.
    fn power_down(&self) -> HwResult;
}

/// Main-link controller.
pub trait LinkController: Send + Sync {
    fn enable_hpd_source(&self) -> HwResult;
    fn disable_hpd_source(&self) -> HwResult;
    fn link_training(&self, caps: &SinkCaps) -> HwResult;
    fn link_maintenance(&self) -> HwResult;
    fn stream_on(&self, stream: &Stream) -> HwResult;
    fn stream_off(&self, stream: &Stream) -> HwResult;
    /// Programs the MST time-slot range of a stream.
    fn set_stream_slots(&self, stream: StreamId, start_slot: u8, slot_count: u8) -> HwResult;
    fn audio_off(&self) -> HwResult;
}

/// Sideband (AUX) channel.
pub trait AuxChannel: Send + Sync {
    fn aux_init(&self) -> HwResult;
    fn aux_deinit(&self) -> HwResult;
    /// Reads the sink capability block.  Returns [`HardwareError::Timeout`] or
    /// [`HardwareError::NoSink`] when nothing answers.
    fn read_sink_caps(&self) -> HwResult<SinkCaps>;
    /// Services a pending sink request (test requests, link status, CP_IRQ).
    fn process_sideband_request(&self) -> HwResult<SidebandEvent>;
    /// Reads the sink's HDCP-ready status field.
    fn sink_hdcp_ready(&self) -> HwResult<bool>;
}

/// Panel (display object) collaborator.
pub trait PanelControl: Send + Sync {
    fn panel_ready(&self) -> HwResult;
    /// eDP only: whether the panel power rail has settled.
    fn power_rail_settled(&self) -> bool;
    fn panel_deinit(&self) -> HwResult;
}

/// One content-protection engine.  Engines for different versions are
/// mutually exclusive; the authenticator drives at most one at a time.
#[cfg_attr(test, mockall::automock)]
pub trait HdcpEngine: Send + Sync {
    fn version(&self) -> HdcpVersion;
    /// Feature predicate: whether this engine is usable on this source.
    fn feature_supported(&self) -> bool;
    fn register_streams(&self, streams: &[StreamId]) -> HwResult;
    fn deregister_streams(&self, streams: &[StreamId]) -> HwResult;
    fn authenticate(&self) -> HwResult;
    fn reauthenticate(&self) -> HwResult;
    fn on(&self) -> HwResult;
    fn off(&self) -> HwResult;
    fn cp_irq(&self) -> HwResult;
}

/// Delivers connect/disconnect events to the compositor.
///
/// The compositor acknowledges through the [`AckHandle`] it receives.
#[async_trait]
pub trait CompositorNotifier: Send + Sync {
    async fn hotplug(&self, connection: ConnectionId, connected: bool, ack: AckHandle) -> HwResult;
}

/// MST topology-manager callbacks.
pub trait MstTopology: Send + Sync {
    /// Topology-level hotplug notification (replaces the compositor path).
    fn hpd(&self, connected: bool, ack: AckHandle) -> HwResult;
    fn hpd_irq(&self) -> HwResult;
    fn set_mgr_state(&self, active: bool) -> HwResult;
    fn set_mode_params(&self, stream: StreamId, start_slot: u8, slot_count: u8) -> HwResult;
}

/// The collaborator set injected into one connection.
#[derive(Clone)]
pub struct Hardware {
    pub power: Arc<dyn LinkPower>,
    pub controller: Arc<dyn LinkController>,
    pub aux: Arc<dyn AuxChannel>,
    pub panel: Arc<dyn PanelControl>,
    /// Available protection engines, any order.
    pub hdcp_engines: Vec<Arc<dyn HdcpEngine>>,
    pub notifier: Arc<dyn CompositorNotifier>,
    /// Present only on MST-capable sources.
    pub mst: Option<Arc<dyn MstTopology>>,
}
