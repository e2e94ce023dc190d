//! Integration tests for hotplug routing, MST fan-out and power transitions.

use std::sync::Arc;
use std::time::Duration;

use dplink_controller::application::connection::{
    Connection, ConnectionOptions, StreamRequest,
};
use dplink_controller::application::dispatcher::{
    AttentionRoute, DispatchError, HotplugDispatcher, SimulatedEvent,
};
use dplink_controller::application::hardware::{PanelKind, SidebandEvent};
use dplink_controller::application::registry::ConnectionRegistry;
use dplink_controller::application::timing::TimingConfig;
use dplink_controller::infrastructure::simulated::SimulatedHardware;
use dplink_core::{
    ConnectionId, HdcpState, PlatformCapacity, ResourceLedger, ResourceRequest, StreamId,
};

fn make_dispatcher() -> HotplugDispatcher {
    let ledger = Arc::new(ResourceLedger::new(PlatformCapacity {
        mixers: 4,
        compression_blocks: 2,
    }));
    HotplugDispatcher::new(
        Arc::new(ConnectionRegistry::new()),
        ledger,
        TimingConfig::default(),
    )
}

async fn connected(
    dispatcher: &HotplugDispatcher,
    sim: &SimulatedHardware,
    options: ConnectionOptions,
) -> Arc<Connection> {
    let conn = dispatcher.attach(ConnectionId::new(), sim.hardware(), options);
    conn.set_hpd(true, false);
    dispatcher.configure(conn.id()).await.unwrap();
    dispatcher.settle().await;
    assert!(conn.state().is_connected());
    conn
}

fn one_mixer(id: u8, slot_count: u8) -> StreamRequest {
    StreamRequest {
        id: StreamId(id),
        panel: id,
        resources: ResourceRequest {
            mixers: 1,
            ..ResourceRequest::default()
        },
        slot_count,
    }
}

fn mst_options() -> ConnectionOptions {
    ConnectionOptions {
        mst_capable: true,
        ..ConnectionOptions::default()
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_attention_for_unknown_connection_is_rejected() {
    let dispatcher = make_dispatcher();
    let id = ConnectionId::new();

    let result = dispatcher.attention(id, false, true).await;

    assert_eq!(result, Err(DispatchError::UnknownConnection(id)));
}

#[tokio::test(start_paused = true)]
async fn test_hpd_high_on_connected_link_is_ignored() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;

    let route = dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdHigh)
        .await
        .unwrap();

    assert_eq!(route, AttentionRoute::Ignored);
}

#[tokio::test(start_paused = true)]
async fn test_hpd_high_during_edp_bring_up_returns_without_waiting() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    sim.link.set_power_rail_settled(false);
    let options = ConnectionOptions {
        panel: PanelKind::Edp,
        ..ConnectionOptions::default()
    };
    let conn = dispatcher.attach(ConnectionId::new(), sim.hardware(), options);
    conn.set_hpd(true, false);
    dispatcher.configure(conn.id()).await.unwrap();
    // The connect task now polls the rail with the session lock held.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act
    let before = tokio::time::Instant::now();
    let route = dispatcher.attention(conn.id(), false, true).await.unwrap();
    let elapsed = before.elapsed();

    // Assert
    assert_eq!(route, AttentionRoute::ConnectQueued);
    assert_eq!(elapsed, Duration::ZERO);
    sim.link.set_power_rail_settled(true);
    dispatcher.settle().await;
    assert!(conn.state().is_connected());
    assert_eq!(sim.compositor.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hpd_high_after_abort_reconnects() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = dispatcher.attach(
        ConnectionId::new(),
        sim.hardware(),
        ConnectionOptions::default(),
    );
    assert!(!dispatcher.configure(conn.id()).await.unwrap());
    conn.abort().await;
    dispatcher.settle().await;
    assert!(!conn.state().is_connected());

    // Act
    let route = dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdHigh)
        .await
        .unwrap();
    dispatcher.settle().await;

    // Assert
    assert_eq!(route, AttentionRoute::ConnectQueued);
    let state = conn.state();
    assert!(!state.is_aborted());
    assert!(state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_hpd_high_queues_a_single_connect() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = dispatcher.attach(
        ConnectionId::new(),
        sim.hardware(),
        ConnectionOptions::default(),
    );
    dispatcher.configure(conn.id()).await.unwrap();

    // Act
    let first = dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdHigh)
        .await
        .unwrap();
    let second = dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdHigh)
        .await
        .unwrap();
    dispatcher.settle().await;

    // Assert
    assert_eq!(first, AttentionRoute::ConnectQueued);
    assert_eq!(second, AttentionRoute::Ignored);
    assert_eq!(sim.link.count("link_training"), 1);
    assert_eq!(sim.compositor.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_status_attention_runs_link_maintenance() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    sim.link.push_sideband(SidebandEvent::LinkStatusChanged);

    let route = dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdIrq)
        .await
        .unwrap();
    dispatcher.settle().await;

    assert_eq!(route, AttentionRoute::AttentionQueued);
    assert_eq!(sim.link.count("link_maintenance"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cp_irq_attention_reaches_the_active_engine() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    dispatcher.settle().await;
    sim.link.push_sideband(SidebandEvent::CpIrq);

    // Act
    dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdIrq)
        .await
        .unwrap();
    dispatcher.settle().await;

    // Assert
    assert_eq!(sim.hdcp2.count("cp_irq"), 1);
    assert_eq!(sim.hdcp1.count("cp_irq"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sink_count_zero_reports_disconnect_but_keeps_configuration() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    sim.link.push_sideband(SidebandEvent::SinkCountChanged(0));

    dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdIrq)
        .await
        .unwrap();
    dispatcher.settle().await;

    let state = conn.state();
    assert!(!state.is_connected());
    assert!(state.is_disconnect_notified());
    assert!(state.is_configured());
    assert_eq!(
        sim.compositor.events(),
        vec![(conn.id(), true), (conn.id(), false)]
    );
}

// ── HDCP ──────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_hdcp_prefers_strongest_shared_version() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;

    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    dispatcher.settle().await;
    dispatcher
        .hdcp_status_changed(conn.id(), HdcpState::Authenticated)
        .await
        .unwrap();

    let status = dispatcher.status(conn.id()).await.unwrap();
    assert_eq!(status.hdcp_state, HdcpState::Authenticated);
    assert_eq!(sim.hdcp2.count("authenticate"), 1);
    assert_eq!(sim.hdcp1.count("authenticate"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_retried_by_the_next_poll() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    dispatcher.settle().await;

    // Act
    dispatcher
        .hdcp_status_changed(conn.id(), HdcpState::AuthFail)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    dispatcher.settle().await;

    // Assert
    assert_eq!(sim.hdcp2.count("reauthenticate"), 1);
    assert_eq!(
        dispatcher.status(conn.id()).await.unwrap().hdcp_state,
        HdcpState::Authenticating
    );
}

#[tokio::test(start_paused = true)]
async fn test_sink_sync_waits_for_ready_sink_then_settles_before_authenticating() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    sim.link.set_hdcp_ready(false);
    let options = ConnectionOptions {
        sink_sync: true,
        ..ConnectionOptions::default()
    };
    let conn = connected(&dispatcher, &sim, options).await;
    let id = conn.id();

    // Act: first poll finds the sink not ready and re-arms one unit later.
    dispatcher.enable_stream(id, one_mixer(0, 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    dispatcher.settle().await;

    // Assert
    assert_eq!(sim.link.count("sink_hdcp_ready"), 1);
    assert_eq!(sim.hdcp2.count("authenticate"), 0);
    assert_eq!(
        dispatcher.status(id).await.unwrap().hdcp_state,
        HdcpState::Inactive
    );

    // Act: the retried poll sees a ready sink and starts the settle delay.
    sim.link.set_hdcp_ready(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert
    assert_eq!(sim.link.count("sink_hdcp_ready"), 2);
    assert_eq!(sim.hdcp2.count("authenticate"), 0);

    // Act: still inside the six-unit settle window.
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Assert
    assert_eq!(sim.hdcp2.count("authenticate"), 0);

    // Act: settle window over.
    tokio::time::sleep(Duration::from_secs(1)).await;
    dispatcher.settle().await;

    // Assert
    assert_eq!(sim.link.count("sink_hdcp_ready"), 2);
    assert_eq!(sim.hdcp2.count("authenticate"), 1);
    assert_eq!(
        dispatcher.status(id).await.unwrap().hdcp_state,
        HdcpState::Authenticating
    );
}

// ── MST ───────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_mst_connect_goes_through_topology_and_allocates_slots() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::with_mst();
    let topology = sim.topology.clone().unwrap();
    let conn = connected(&dispatcher, &sim, mst_options()).await;
    let id = conn.id();

    // Act
    dispatcher.enable_stream(id, one_mixer(0, 10)).await.unwrap();
    dispatcher.enable_stream(id, one_mixer(1, 5)).await.unwrap();
    let status = dispatcher.status(id).await.unwrap();

    // Assert
    assert!(status.mst_active);
    assert_eq!(topology.hpd_events(), vec![true]);
    assert!(sim.compositor.events().is_empty());
    assert_eq!(topology.mgr_states(), vec![true]);
    let slots: Vec<_> = status
        .streams
        .iter()
        .map(|s| (s.id, s.start_slot, s.slot_count))
        .collect();
    assert_eq!(slots, vec![(StreamId(0), 1, 10), (StreamId(1), 11, 5)]);
    assert_ne!(status.streams[0].virtual_channel, status.streams[1].virtual_channel);
    assert_eq!(status.reservation.current.mixers, 2);
    assert_eq!(status.mst_free_slots, 63 - 15);
    assert!(status.notification_sent);
}

#[tokio::test(start_paused = true)]
async fn test_mst_unplug_notifies_topology_and_clears_slots() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::with_mst();
    let topology = sim.topology.clone().unwrap();
    let conn = connected(&dispatcher, &sim, mst_options()).await;
    let id = conn.id();
    dispatcher.enable_stream(id, one_mixer(0, 10)).await.unwrap();
    dispatcher.enable_stream(id, one_mixer(1, 5)).await.unwrap();
    let programmed = sim.link.count("set_stream_slots");

    // Act
    dispatcher.simulate(id, SimulatedEvent::HpdLow).await.unwrap();
    dispatcher.settle().await;

    // Assert
    assert_eq!(topology.hpd_events(), vec![true, false]);
    assert!(sim.compositor.events().is_empty());
    assert_eq!(sim.link.count("set_stream_slots"), programmed + 2);
    assert_eq!(
        topology.cleared_mode_params(),
        vec![StreamId(0), StreamId(1)]
    );
    assert_eq!(topology.mgr_states(), vec![true, false]);
    let status = dispatcher.status(id).await.unwrap();
    assert!(!status.mst_active);
    assert_eq!(status.mst_free_slots, 63);
    assert!(status.streams.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mst_suspend_unprograms_slots() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::with_mst();
    let topology = sim.topology.clone().unwrap();
    let conn = connected(&dispatcher, &sim, mst_options()).await;
    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 8))
        .await
        .unwrap();

    dispatcher.suspend_prepare().await.unwrap();

    assert_eq!(topology.cleared_mode_params(), vec![StreamId(0)]);
    assert_eq!(topology.mgr_states(), vec![true, false]);
    let status = dispatcher.status(conn.id()).await.unwrap();
    assert!(!status.mst_active);
    assert_eq!(status.mst_free_slots, 63);
}

#[tokio::test(start_paused = true)]
async fn test_mst_freed_slots_are_reused_first_fit() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::with_mst();
    let conn = connected(&dispatcher, &sim, mst_options()).await;
    let id = conn.id();
    dispatcher.enable_stream(id, one_mixer(0, 10)).await.unwrap();
    dispatcher.enable_stream(id, one_mixer(1, 5)).await.unwrap();

    dispatcher.disable_stream(id, StreamId(0)).await.unwrap();
    dispatcher.enable_stream(id, one_mixer(2, 4)).await.unwrap();

    let status = dispatcher.status(id).await.unwrap();
    let stream = status.streams.iter().find(|s| s.id == StreamId(2)).unwrap();
    assert_eq!((stream.start_slot, stream.slot_count), (1, 4));
    assert!(conn.state().is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_mst_attention_forwards_hpd_irq_to_topology() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::with_mst();
    let topology = sim.topology.clone().unwrap();
    let conn = connected(&dispatcher, &sim, mst_options()).await;

    dispatcher
        .simulate(conn.id(), SimulatedEvent::HpdIrq)
        .await
        .unwrap();
    dispatcher.settle().await;

    assert_eq!(topology.hpd_irq_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sst_link_accepts_only_one_stream() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 0))
        .await
        .unwrap();

    let second = dispatcher.enable_stream(conn.id(), one_mixer(1, 0)).await;

    assert!(second.is_err());
    assert_eq!(dispatcher.ledger().snapshot().in_use.mixers, 1);
}

// ── Power transitions ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_suspend_releases_resources_and_resume_reconnects() {
    // Arrange
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    dispatcher
        .enable_stream(conn.id(), one_mixer(0, 0))
        .await
        .unwrap();

    // Act: suspend
    dispatcher.suspend_prepare().await.unwrap();

    // Assert
    let state = conn.state();
    assert!(state.is_suspended());
    assert!(!state.is_connected());
    assert!(!state.is_enabled());
    assert!(state.is_source_powered_down());
    assert_eq!(dispatcher.ledger().snapshot().in_use.mixers, 0);

    // Act: resume
    let reconnects = dispatcher.resume_complete().await;
    dispatcher.settle().await;

    // Assert
    assert_eq!(reconnects, 1);
    let state = conn.state();
    assert!(!state.is_suspended());
    assert!(state.is_connected());
    assert!(!state.is_source_powered_down());
    assert_eq!(sim.link.count("link_training"), 2);
    assert_eq!(sim.compositor.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_without_hpd_does_not_reconnect() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    dispatcher.suspend_prepare().await.unwrap();
    conn.set_hpd(false, false);

    assert_eq!(dispatcher.resume_complete().await, 0);
    dispatcher.settle().await;

    assert!(!conn.state().is_connected());
}

// ── Registry surface ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_status_all_lists_every_connection_with_ledger() {
    let dispatcher = make_dispatcher();
    let (sim_a, sim_b) = (SimulatedHardware::new(), SimulatedHardware::new());
    let a = connected(&dispatcher, &sim_a, ConnectionOptions::default()).await;
    let b = connected(&dispatcher, &sim_b, ConnectionOptions::default()).await;
    dispatcher
        .enable_stream(a.id(), one_mixer(0, 0))
        .await
        .unwrap();

    let status = dispatcher.status_all().await;

    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    let ids: Vec<_> = status.connections.iter().map(|c| c.id).collect();
    assert_eq!(ids, expected);
    assert_eq!(status.ledger.in_use.mixers, 1);
    assert_eq!(status.ledger.capacity.mixers, 4);
}

#[tokio::test(start_paused = true)]
async fn test_detach_tears_down_and_forgets_connection() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = connected(&dispatcher, &sim, ConnectionOptions::default()).await;
    let id = conn.id();
    dispatcher.enable_stream(id, one_mixer(0, 0)).await.unwrap();

    dispatcher.detach(id).await.unwrap();

    assert!(dispatcher.registry().is_empty());
    assert!(dispatcher.ledger().snapshot().connections.is_empty());
    assert!(conn.state().is_disconnected());
    assert_eq!(
        dispatcher.status(id).await.unwrap_err(),
        DispatchError::UnknownConnection(id)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_already_queued_tasks() {
    let dispatcher = make_dispatcher();
    let sim = SimulatedHardware::new();
    let conn = dispatcher.attach(
        ConnectionId::new(),
        sim.hardware(),
        ConnectionOptions::default(),
    );
    conn.set_hpd(true, false);
    dispatcher.configure(conn.id()).await.unwrap();

    dispatcher.shutdown().await;

    assert!(conn.state().is_connected());
}
