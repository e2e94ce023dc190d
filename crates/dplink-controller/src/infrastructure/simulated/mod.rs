//! Simulated display hardware for the `dplink-sim` binary and for tests.
//!
//! Every collaborator records the operations it receives in an in-memory
//! call log and can be told to fail a named operation, so a test can drive
//! the connection state machine through any failure path without a panel.
//!
//! # Failure injection
//!
//! ```text
//! sim.link.fail("link_training");      // every later call fails
//! sim.link.clear_failure("link_training");
//! sim.link.set_sink_absent();          // capability read times out
//! sim.compositor.set_policy(AckPolicy::Never);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dplink_core::{ConnectionId, HdcpVersion, Stream, StreamId};
use tracing::debug;

use crate::application::hardware::{
    AuxChannel, CableOrientation, CompositorNotifier, Hardware, HardwareError, HdcpEngine,
    HwResult, LinkController, LinkPower, MstTopology, PanelControl, SidebandEvent, SinkCaps,
};
use crate::application::notification::AckHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Shared call log plus the set of operations told to fail.
#[derive(Debug, Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
}

impl Recorder {
    fn op(&self, name: &str) -> HwResult {
        lock(&self.calls).push(name.to_string());
        if lock(&self.failures).contains(name) {
            debug!(op = name, "injected failure");
            return Err(HardwareError::Failed(format!("injected {name} failure")));
        }
        Ok(())
    }

    fn fail(&self, name: &str) {
        lock(&self.failures).insert(name.to_string());
    }

    fn clear_failure(&self, name: &str) {
        lock(&self.failures).remove(name);
    }

    fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn count(&self, name: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == name).count()
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// Power, controller, AUX and panel of one simulated link.
#[derive(Debug)]
pub struct SimulatedLink {
    recorder: Recorder,
    sink: Mutex<Result<SinkCaps, HardwareError>>,
    sideband: Mutex<VecDeque<SidebandEvent>>,
    hdcp_ready: AtomicBool,
    rail_settled: AtomicBool,
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLink {
    /// A link with a responsive single-stream sink attached.
    pub fn new() -> Self {
        Self {
            recorder: Recorder::default(),
            sink: Mutex::new(Ok(SinkCaps::default())),
            sideband: Mutex::new(VecDeque::new()),
            hdcp_ready: AtomicBool::new(true),
            rail_settled: AtomicBool::new(true),
        }
    }

    /// Makes every later call of `op` fail.
    pub fn fail(&self, op: &str) {
        self.recorder.fail(op);
    }

    pub fn clear_failure(&self, op: &str) {
        self.recorder.clear_failure(op);
    }

    /// Every operation received so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.recorder.calls()
    }

    pub fn count(&self, op: &str) -> usize {
        self.recorder.count(op)
    }

    pub fn set_sink(&self, caps: SinkCaps) {
        *lock(&self.sink) = Ok(caps);
    }

    /// The capability read times out, as if nothing were plugged in.
    pub fn set_sink_absent(&self) {
        *lock(&self.sink) = Err(HardwareError::Timeout);
    }

    /// Queues the result of the next sideband request.
    pub fn push_sideband(&self, event: SidebandEvent) {
        lock(&self.sideband).push_back(event);
    }

    pub fn set_hdcp_ready(&self, ready: bool) {
        self.hdcp_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_power_rail_settled(&self, settled: bool) {
        self.rail_settled.store(settled, Ordering::SeqCst);
    }
}

impl LinkPower for SimulatedLink {
    fn acquire(&self) -> HwResult {
        self.recorder.op("acquire")
    }

    fn release(&self) -> HwResult {
        self.recorder.op("release")
    }

    fn power_up(&self, orientation: CableOrientation) -> HwResult {
        debug!(?orientation, "simulated PHY power up");
        self.recorder.op("power_up")
    }

    fn power_down(&self) -> HwResult {
        self.recorder.op("power_down")
    }
}

impl LinkController for SimulatedLink {
    fn enable_hpd_source(&self) -> HwResult {
        self.recorder.op("enable_hpd_source")
    }

    fn disable_hpd_source(&self) -> HwResult {
        self.recorder.op("disable_hpd_source")
    }

    fn link_training(&self, _caps: &SinkCaps) -> HwResult {
        self.recorder.op("link_training")
    }

    fn link_maintenance(&self) -> HwResult {
        self.recorder.op("link_maintenance")
    }

    fn stream_on(&self, stream: &Stream) -> HwResult {
        debug!(stream = %stream.id, vc = stream.virtual_channel, "simulated stream on");
        self.recorder.op("stream_on")
    }

    fn stream_off(&self, _stream: &Stream) -> HwResult {
        self.recorder.op("stream_off")
    }

    fn set_stream_slots(&self, _stream: StreamId, _start_slot: u8, _slot_count: u8) -> HwResult {
        self.recorder.op("set_stream_slots")
    }

    fn audio_off(&self) -> HwResult {
        self.recorder.op("audio_off")
    }
}

impl AuxChannel for SimulatedLink {
    fn aux_init(&self) -> HwResult {
        self.recorder.op("aux_init")
    }

    fn aux_deinit(&self) -> HwResult {
        self.recorder.op("aux_deinit")
    }

    fn read_sink_caps(&self) -> HwResult<SinkCaps> {
        self.recorder.op("read_sink_caps")?;
        lock(&self.sink).clone()
    }

    fn process_sideband_request(&self) -> HwResult<SidebandEvent> {
        self.recorder.op("process_sideband_request")?;
        Ok(lock(&self.sideband).pop_front().unwrap_or(SidebandEvent::None))
    }

    fn sink_hdcp_ready(&self) -> HwResult<bool> {
        self.recorder.op("sink_hdcp_ready")?;
        Ok(self.hdcp_ready.load(Ordering::SeqCst))
    }
}

impl PanelControl for SimulatedLink {
    fn panel_ready(&self) -> HwResult {
        self.recorder.op("panel_ready")
    }

    fn power_rail_settled(&self) -> bool {
        self.rail_settled.load(Ordering::SeqCst)
    }

    fn panel_deinit(&self) -> HwResult {
        self.recorder.op("panel_deinit")
    }
}

// ── HDCP ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SimulatedHdcpEngine {
    version: HdcpVersion,
    supported: AtomicBool,
    recorder: Recorder,
}

impl SimulatedHdcpEngine {
    pub fn new(version: HdcpVersion) -> Self {
        Self {
            version,
            supported: AtomicBool::new(true),
            recorder: Recorder::default(),
        }
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn fail(&self, op: &str) {
        self.recorder.fail(op);
    }

    pub fn count(&self, op: &str) -> usize {
        self.recorder.count(op)
    }

    pub fn calls(&self) -> Vec<String> {
        self.recorder.calls()
    }
}

impl HdcpEngine for SimulatedHdcpEngine {
    fn version(&self) -> HdcpVersion {
        self.version
    }

    fn feature_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn register_streams(&self, _streams: &[StreamId]) -> HwResult {
        self.recorder.op("register_streams")
    }

    fn deregister_streams(&self, _streams: &[StreamId]) -> HwResult {
        self.recorder.op("deregister_streams")
    }

    fn authenticate(&self) -> HwResult {
        self.recorder.op("authenticate")
    }

    fn reauthenticate(&self) -> HwResult {
        self.recorder.op("reauthenticate")
    }

    fn on(&self) -> HwResult {
        self.recorder.op("on")
    }

    fn off(&self) -> HwResult {
        self.recorder.op("off")
    }

    fn cp_irq(&self) -> HwResult {
        self.recorder.op("cp_irq")
    }
}

// ── Compositor ────────────────────────────────────────────────────────────────

/// How the simulated compositor acknowledges hotplug events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Immediate,
    /// Acknowledge each dispatch after the given delay.
    Delayed(Duration),
    Never,
}

#[derive(Debug)]
pub struct SimulatedCompositor {
    policy: Mutex<AckPolicy>,
    events: Mutex<Vec<(ConnectionId, bool)>>,
}

impl Default for SimulatedCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCompositor {
    pub fn new() -> Self {
        Self {
            policy: Mutex::new(AckPolicy::Immediate),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_policy(&self, policy: AckPolicy) {
        *lock(&self.policy) = policy;
    }

    /// Every `(connection, connected)` event received, resends included.
    pub fn events(&self) -> Vec<(ConnectionId, bool)> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl CompositorNotifier for SimulatedCompositor {
    async fn hotplug(&self, connection: ConnectionId, connected: bool, ack: AckHandle) -> HwResult {
        lock(&self.events).push((connection, connected));
        let policy = *lock(&self.policy);
        debug!(%connection, connected, ?policy, "simulated compositor event");
        match policy {
            AckPolicy::Immediate => ack.acknowledge(),
            AckPolicy::Delayed(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    ack.acknowledge();
                });
            }
            AckPolicy::Never => {}
        }
        Ok(())
    }
}

// ── MST topology ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SimulatedTopology {
    hpd_events: Mutex<Vec<bool>>,
    mgr_states: Mutex<Vec<bool>>,
    mode_params: Mutex<Vec<(StreamId, u8, u8)>>,
    hpd_irqs: AtomicUsize,
}

impl SimulatedTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hpd_events(&self) -> Vec<bool> {
        lock(&self.hpd_events).clone()
    }

    pub fn mgr_states(&self) -> Vec<bool> {
        lock(&self.mgr_states).clone()
    }

    /// Non-zero `(stream, start_slot, slot_count)` programming calls.
    pub fn mode_params(&self) -> Vec<(StreamId, u8, u8)> {
        lock(&self.mode_params)
            .iter()
            .copied()
            .filter(|(_, _, count)| *count > 0)
            .collect()
    }

    /// Streams whose mode parameters were zeroed, in call order.
    pub fn cleared_mode_params(&self) -> Vec<StreamId> {
        lock(&self.mode_params)
            .iter()
            .filter(|(_, _, count)| *count == 0)
            .map(|(stream, _, _)| *stream)
            .collect()
    }

    pub fn hpd_irq_count(&self) -> usize {
        self.hpd_irqs.load(Ordering::SeqCst)
    }
}

impl MstTopology for SimulatedTopology {
    fn hpd(&self, connected: bool, ack: AckHandle) -> HwResult {
        lock(&self.hpd_events).push(connected);
        ack.acknowledge();
        Ok(())
    }

    fn hpd_irq(&self) -> HwResult {
        self.hpd_irqs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_mgr_state(&self, active: bool) -> HwResult {
        lock(&self.mgr_states).push(active);
        Ok(())
    }

    fn set_mode_params(&self, stream: StreamId, start_slot: u8, slot_count: u8) -> HwResult {
        lock(&self.mode_params).push((stream, start_slot, slot_count));
        Ok(())
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// One simulated source: link, both HDCP engines, compositor and optionally
/// an MST topology manager.
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    pub link: Arc<SimulatedLink>,
    pub hdcp2: Arc<SimulatedHdcpEngine>,
    pub hdcp1: Arc<SimulatedHdcpEngine>,
    pub compositor: Arc<SimulatedCompositor>,
    pub topology: Option<Arc<SimulatedTopology>>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    /// A single-stream source.
    pub fn new() -> Self {
        Self {
            link: Arc::new(SimulatedLink::new()),
            hdcp2: Arc::new(SimulatedHdcpEngine::new(HdcpVersion::Hdcp2x)),
            hdcp1: Arc::new(SimulatedHdcpEngine::new(HdcpVersion::Hdcp1x)),
            compositor: Arc::new(SimulatedCompositor::new()),
            topology: None,
        }
    }

    /// An MST-capable source with an MST-capable sink attached.
    pub fn with_mst() -> Self {
        let sim = Self {
            topology: Some(Arc::new(SimulatedTopology::new())),
            ..Self::new()
        };
        sim.link.set_sink(SinkCaps {
            mst_capable: true,
            ..SinkCaps::default()
        });
        sim
    }

    /// The collaborator bundle to attach a connection with.
    pub fn hardware(&self) -> Hardware {
        Hardware {
            power: self.link.clone(),
            controller: self.link.clone(),
            aux: self.link.clone(),
            panel: self.link.clone(),
            hdcp_engines: vec![
                self.hdcp2.clone() as Arc<dyn HdcpEngine>,
                self.hdcp1.clone() as Arc<dyn HdcpEngine>,
            ],
            notifier: self.compositor.clone(),
            mst: self
                .topology
                .clone()
                .map(|t| t as Arc<dyn MstTopology>),
        }
    }
}
