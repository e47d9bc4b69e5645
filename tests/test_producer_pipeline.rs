//! Producers feeding the coordinator through the bus


use std::sync::Arc;
use std::time::Duration;
use test_helpers::{settle, topic, TransportRig};
use trackerlink::producers::{
    JsonLinesFixSource, LineIngest, LocationManager, NetworkReporter, PdnEvent,
};
use trackerlink::supervisor::FatalEscalator;
use trackerlink::testing::RecordingReboot;
use trackerlink::transport::{BrokerEvent, LinkState};

const FIXES: &[u8] = b"{\"latitude\":59.91,\"longitude\":10.75}\n\
{\"latitude\":59.92,\"longitude\":10.76}\n\
{\"latitude\":59.93,\"longitude\":10.77}\n";

#[tokio::test(start_paused = true)]
async fn test_fixes_and_lines_reach_the_broker() {
    let rig = TransportRig::start(test_helpers::test_config());
    let TransportRig {
        bus,
        broker,
        handle,
        shutdown,
        location,
        config,
        ..
    } = rig;

    let reboot = Arc::new(RecordingReboot::default());
    let escalator = FatalEscalator::new(Arc::clone(&bus), reboot.clone());

    let manager = LocationManager::new(
        Arc::clone(&bus),
        location,
        Box::new(JsonLinesFixSource::from_reader(FIXES, Duration::from_millis(100))),
        escalator.clone(),
        config.read_timeout(),
    );
    let manager_task = tokio::spawn(manager.run(shutdown.subscribe()));

    let ingest = LineIngest::new(
        Arc::clone(&bus),
        &b"temp=21.5\r\n\nhumidity=40\n"[..],
        config.publish_timeout(),
    );
    let ingest_task = tokio::spawn(ingest.run(shutdown.subscribe()));

    let reporter = NetworkReporter::new(Arc::clone(&bus), escalator);
    reporter.report(PdnEvent::Activated).await;
    settle().await;

    // Fixes are produced once attached and wait in the queue for the handshake
    tokio::time::sleep(config.settle_delay()).await;
    settle().await;
    assert_eq!(handle.queues.location.len(), 3);
    assert_eq!(handle.queues.generic.len(), 2);
    assert_eq!(ingest_task.await.unwrap().unwrap(), 2);

    broker.emit(BrokerEvent::Connected).await;
    settle().await;
    assert_eq!(*handle.link.borrow(), LinkState::Connected);

    let gps = broker.get_published_on(&topic("gps")).await;
    assert_eq!(gps.len(), 3);
    for (i, payload) in gps.iter().enumerate() {
        assert!(payload.contains(&format!("\"measId\":{i}")));
    }
    assert_eq!(
        broker.get_published_on(&topic("data")).await,
        vec!["temp=21.5".to_string(), "humidity=40".to_string()]
    );
    assert!(reboot.codes().is_empty());

    let _ = shutdown.send(true);
    let _ = manager_task.await;
    let _ = handle.coordinator.await;
    let _ = handle.executor.await;
}

#[tokio::test(start_paused = true)]
async fn test_ipv6_events_do_not_touch_network_status() {
    let rig = TransportRig::start(test_helpers::test_config());
    let reporter = NetworkReporter::new(
        Arc::clone(&rig.bus),
        FatalEscalator::new(Arc::clone(&rig.bus), rig.reboot.clone()),
    );

    assert_eq!(reporter.report(PdnEvent::Ipv6Up).await, None);
    settle().await;
    assert!(rig.broker.get_connects().await.is_empty());
    assert!(!rig.handle.work.is_pending(trackerlink::transport::Work::Connect));

    rig.stop().await;
}
