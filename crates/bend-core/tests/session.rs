//! Session behaviour against the in-memory transport.
//!
//! Timing-sensitive tests run on a paused clock, so backoff delays are
//! exact and cost no wall time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, timeout};

use bend_core::{
    ConnectionFailureReason, DeviceSession, DisconnectReason, EndpointKey, Error, EventReceiver,
    GattLink, MockTransport, RetryConfig, SessionConfig, SessionEvent, SessionState, WindowAggregator,
    uuids,
};
use bend_types::{SampleRate, SelectionFilter};

fn payload(angle: f32, stretch: f32) -> Vec<u8> {
    let mut bytes = angle.to_le_bytes().to_vec();
    bytes.extend_from_slice(&stretch.to_le_bytes());
    bytes
}

async fn wait_for<F>(events: &mut EventReceiver, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn connected(transport: &Arc<MockTransport>) -> DeviceSession {
    let session = DeviceSession::new(transport.clone());
    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();
    session
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_writes_rate_then_stretch_and_streams() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport.clone());
    let (_sub, mut samples) = session.bus().subscribe_channel();

    session
        .connect(SelectionFilter::default(), SampleRate::Hz100, true)
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.is_streaming());
    assert_eq!(session.device().unwrap().name.as_deref(), Some("ads_mock"));

    let written = transport.written();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0], (EndpointKey::ANGLE, vec![0xA3, 0x00]));
    assert_eq!(written[1], (EndpointKey::ANGLE, vec![0x01, 0x80]));

    assert!(transport.emit_notification(payload(12.5, 3.0)));
    assert!(transport.emit_notification(payload(13.0, 3.5)));

    let first = samples.recv().await.unwrap();
    let second = samples.recv().await.unwrap();
    assert_eq!(first.sequence, 0);
    assert_eq!(first.angle, Some(12.5));
    assert_eq!(first.stretch, Some(3.0));
    assert_eq!(second.sequence, 1);
}

#[tokio::test]
async fn test_export_omits_stretch_when_disabled() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport.clone());
    let (aggregator, _agg_sub) = WindowAggregator::new(Duration::from_secs(60))
        .unwrap()
        .with_secondary(false)
        .into_shared(session.bus());
    let (_sub, mut samples) = session.bus().subscribe_channel();

    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();

    // full 8-byte payloads still carry a stretch float
    assert!(transport.emit_notification(payload(10.0, 0.0)));
    assert!(transport.emit_notification(payload(20.0, 0.0)));
    samples.recv().await.unwrap();
    let last = samples.recv().await.unwrap();
    assert_eq!(last.stretch, Some(0.0));

    let csv = aggregator.lock().unwrap().export_rows().unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Timestamp,Value"));
    let row = lines.next().unwrap();
    assert!(row.ends_with(",15"), "row: {row}");
    assert_eq!(row.split(',').count(), 2);
    assert_eq!(lines.next(), None);
}

#[tokio::test]
async fn test_connect_state_transitions() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport.clone());
    let mut events = session.subscribe_events();

    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged { state } = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![SessionState::Connecting, SessionState::Connected]);
}

#[tokio::test]
async fn test_connect_no_device_selected() {
    let transport = Arc::new(MockTransport::builder().no_device().build());
    let session = DeviceSession::new(transport.clone());

    let err = session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoDeviceSelected));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.device().is_none());
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn test_connect_rejects_name_without_prefix() {
    // advertises the angle service, but the name does not match
    let transport = Arc::new(MockTransport::builder().name("sensor-7").build());
    let session = DeviceSession::new(transport.clone());

    let err = session
        .connect(SelectionFilter::default(), SampleRate::Hz1, false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoDeviceSelected));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(transport.connect_count(), 0);
    assert!(transport.written().is_empty());
}

#[tokio::test]
async fn test_connect_rejects_foreign_service() {
    let transport = Arc::new(
        MockTransport::builder()
            .advertised_services(vec![uuids::BATTERY_SERVICE])
            .build(),
    );
    let session = DeviceSession::new(transport.clone());

    let err = session
        .connect(SelectionFilter::default(), SampleRate::Hz1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoDeviceSelected));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_backoff() {
    let transport = Arc::new(MockTransport::builder().transient_failures(2).build());
    let session = DeviceSession::new(transport.clone());

    let start = Instant::now();
    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    assert_eq!(transport.connect_count(), 3);
    assert_eq!(transport.request_count(), 1);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_exhausts_retries() {
    let transport = Arc::new(MockTransport::builder().transient_failures(10).build());
    let session = DeviceSession::new(transport.clone());

    let err = session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap_err();

    match err {
        Error::ConnectionFailed {
            reason: ConnectionFailureReason::RetriesExhausted { attempts, .. },
            ..
        } => assert_eq!(attempts, 4),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.connect_count(), 4);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.device().is_none());
    assert_eq!(transport.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_configure_closes_link_before_retry() {
    let transport = Arc::new(MockTransport::new());
    transport.set_write_failures(1);
    let session = DeviceSession::new(transport.clone());

    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();

    let links = transport.links();
    assert_eq!(links.len(), 2);
    assert!(!links[0].is_open());
    assert_eq!(transport.open_links(), 1);
    assert_eq!(transport.written().len(), 2);
}

#[tokio::test]
async fn test_connect_without_notify_support_stays_connected() {
    let transport = Arc::new(MockTransport::builder().notify_supported(false).build());
    let session = DeviceSession::new(transport.clone());
    let mut events = session.subscribe_events();

    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    assert!(!session.is_streaming());
    assert_eq!(transport.written().len(), 2);

    let event = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Connected { .. })
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Connected {
            streaming: false,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_newer_connect_supersedes_older() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_latency(Duration::from_secs(1));
    let session = Arc::new(DeviceSession::new(transport.clone()));

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .connect(SelectionFilter::default(), SampleRate::Hz10, false)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    session
        .connect(SelectionFilter::default(), SampleRate::Hz200, true)
        .await
        .unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(transport.links().len(), 2);
    assert_eq!(transport.open_links(), 1);
    assert_eq!(
        transport.written(),
        vec![
            (EndpointKey::ANGLE, SampleRate::Hz200.command_bytes().to_vec()),
            (EndpointKey::ANGLE, vec![0x01, 0x80]),
        ]
    );
}

#[tokio::test]
async fn test_connect_while_connected_replaces_link() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let mut events = session.subscribe_events();

    session
        .connect(SelectionFilter::default(), SampleRate::Hz50, false)
        .await
        .unwrap();

    assert_eq!(transport.links().len(), 2);
    assert_eq!(transport.open_links(), 1);
    assert_eq!(session.settings().unwrap().sample_rate, SampleRate::Hz50);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::ReconnectStarted { .. }));
    }
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn test_disconnect_when_disconnected_is_not_paired() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport);
    assert!(matches!(
        session.disconnect().await.unwrap_err(),
        Error::NotPaired
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_link_without_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let (_sub, mut samples) = session.bus().subscribe_channel();
    let mut events = session.subscribe_events();

    session.disconnect().await.unwrap();

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.device().is_none());
    assert_eq!(transport.open_links(), 0);
    assert!(!transport.emit_notification(payload(1.0, 0.0)));

    let event = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::UserRequested,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_count(), 1);
    assert!(samples.try_recv().is_err());
    assert!(matches!(
        session.disconnect().await.unwrap_err(),
        Error::NotPaired
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_connect() {
    let transport = Arc::new(MockTransport::builder().transient_failures(10).build());
    let session = Arc::new(DeviceSession::new(transport.clone()));

    let attempt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .connect(SelectionFilter::default(), SampleRate::Hz10, false)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(transport.connect_count(), 1);

    session.disconnect().await.unwrap();

    let err = attempt.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connect_count(), 1);
}

// =============================================================================
// Link loss
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_with_same_settings() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport.clone());
    session
        .connect(SelectionFilter::default(), SampleRate::Hz20, true)
        .await
        .unwrap();
    let (_sub, mut samples) = session.bus().subscribe_channel();
    let mut events = session.subscribe_events();

    assert!(transport.emit_notification(payload(5.0, 1.0)));
    assert_eq!(samples.recv().await.unwrap().sequence, 0);
    assert!(transport.emit_notification(payload(6.0, 1.0)));
    assert_eq!(samples.recv().await.unwrap().sequence, 1);

    transport.drop_link();

    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::Disconnected {
                reason: DisconnectReason::LinkLost,
                ..
            }
        )
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ReconnectSucceeded { .. })
    })
    .await;

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.request_count(), 1);

    let written = transport.written();
    assert_eq!(written.len(), 4);
    assert_eq!(written[2..], written[..2]);

    assert!(transport.emit_notification(payload(7.0, 1.0)));
    let sample = samples.recv().await.unwrap();
    assert_eq!(sample.sequence, 0);
    assert_eq!(sample.angle, Some(7.0));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnect_exhaustion() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let mut events = session.subscribe_events();

    transport.set_transient_failures(100);
    transport.drop_link();

    let event = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ReconnectFailed { .. })
    })
    .await;
    let SessionEvent::ReconnectFailed { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("gave up after 4 attempts"));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.device().is_none());
    assert_eq!(transport.connect_count(), 5);
    assert_eq!(transport.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnect_passes_through_reconnecting() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let mut state = session.watch_state();
    transport.set_transient_failures(1);

    transport.drop_link();

    timeout(
        Duration::from_secs(60),
        state.wait_for(|s| *s == SessionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(
        Duration::from_secs(60),
        state.wait_for(|s| *s == SessionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(transport.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let mut state = session.watch_state();

    transport.set_transient_failures(100);
    transport.drop_link();
    timeout(
        Duration::from_secs(60),
        state.wait_for(|s| *s == SessionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);

    let attempts = transport.connect_count();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_count(), attempts);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_without_auto_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::builder(transport.clone())
        .config(SessionConfig::new().auto_reconnect(false))
        .build();
    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    transport.drop_link();

    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::Disconnected {
                reason: DisconnectReason::LinkLost,
                ..
            }
        )
    })
    .await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_reconnect_budget() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::builder(transport.clone())
        .config(SessionConfig::new().reconnect_retry(RetryConfig::none()))
        .build();
    session
        .connect(SelectionFilter::default(), SampleRate::Hz10, false)
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    transport.set_transient_failures(1);
    transport.drop_link();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ReconnectFailed { .. })
    })
    .await;
    assert_eq!(transport.connect_count(), 2);
}

// =============================================================================
// Characteristic I/O
// =============================================================================

#[tokio::test]
async fn test_io_without_connection() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport);

    assert!(matches!(
        session
            .write_characteristic(EndpointKey::ANGLE, &[1, 2])
            .await
            .unwrap_err(),
        Error::ServiceUninitialized
    ));
    assert!(matches!(
        session.read_battery().await.unwrap_err(),
        Error::ServiceUninitialized
    ));
}

#[tokio::test]
async fn test_read_battery_and_device_info() {
    let transport = Arc::new(MockTransport::builder().battery(42).firmware("2.1.0").build());
    let session = connected(&transport).await;

    assert_eq!(session.read_battery().await.unwrap(), 42);

    let info = session.read_device_info().await.unwrap();
    assert_eq!(info.name, "ads_mock");
    assert_eq!(info.firmware, "2.1.0");
    assert_eq!(info.manufacturer, "Bend Labs");
}

#[tokio::test]
async fn test_write_unknown_endpoint_is_not_found() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;

    let missing = EndpointKey::new(uuids::ANGLE_SERVICE, uuids::GAP_DEVICE_NAME);
    let err = session
        .write_characteristic(missing, &[0])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_write_characteristic_goes_through_cache() {
    let transport = Arc::new(MockTransport::new());
    let session = connected(&transport).await;
    let discoveries = transport.current_link().unwrap().discovery_count();

    session
        .write_characteristic(EndpointKey::ANGLE, &SampleRate::Hz500.command_bytes())
        .await
        .unwrap();

    assert_eq!(transport.current_link().unwrap().discovery_count(), discoveries);
    assert_eq!(
        transport.written().last().unwrap().1,
        SampleRate::Hz500.command_bytes().to_vec()
    );
    assert!(session.cached_characteristics() >= 1);
}
