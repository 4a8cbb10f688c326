//! Scheduler behavior against a scripted mock connector

use dipa_link::connector::MockConnector;
use dipa_link::{
    ConnectionState, Criteria, Error, Event, ReconnectOptions, Scheduler,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_millis(200);
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

fn scheduler_with_mock(
    options: ReconnectOptions,
) -> (Arc<Scheduler>, dipa_link::connector::MockConnectorHandle) {
    let scheduler = Arc::new(Scheduler::new(options));
    let (mock, handle) = MockConnector::new(scheduler.context());
    scheduler.attach(Box::new(mock)).unwrap();
    (scheduler, handle)
}

fn connect(scheduler: &Scheduler) {
    scheduler
        .auto_select(&Criteria::any(), SELECT_TIMEOUT, SELECT_TIMEOUT)
        .unwrap();
    scheduler.connect(SELECT_TIMEOUT).unwrap();
}

#[test]
fn queued_executes_merge_into_one_delivery() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);
    handle.set_deliver_delay(Duration::from_millis(80));

    // First execute occupies the worker; the next two queue up behind it
    let s1 = Arc::clone(&scheduler);
    let first = thread::spawn(move || s1.execute(&[1, 2], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(20));

    let s2 = Arc::clone(&scheduler);
    let second = thread::spawn(move || s2.execute(&[3, 4], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));
    let s3 = Arc::clone(&scheduler);
    let third = thread::spawn(move || s3.execute(&[5, 6], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    third.join().unwrap().unwrap();

    let deliveries = handle.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].1, vec![1, 2]);
    assert_eq!(deliveries[1].1, vec![3, 4, 5, 6]);
}

#[test]
fn merge_respects_the_packet_budget() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);
    handle.set_packet_budget(3);
    handle.set_deliver_delay(Duration::from_millis(80));

    let s1 = Arc::clone(&scheduler);
    let first = thread::spawn(move || s1.execute(&[1], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(20));

    let s2 = Arc::clone(&scheduler);
    let second = thread::spawn(move || s2.execute(&[2, 3], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));
    let s3 = Arc::clone(&scheduler);
    let third = thread::spawn(move || s3.execute(&[4, 5], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    third.join().unwrap().unwrap();

    // [2,3] cannot absorb [4,5] within a 3-byte budget
    let deliveries = handle.deliveries();
    assert_eq!(deliveries.len(), 3);
    assert_eq!(deliveries[1].1, vec![2, 3]);
    assert_eq!(deliveries[2].1, vec![4, 5]);
}

#[test]
fn labeled_execute_supersedes_queued_same_label() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);
    handle.set_deliver_delay(Duration::from_millis(80));

    let s1 = Arc::clone(&scheduler);
    let first = thread::spawn(move || s1.execute(&[0xAA], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(20));

    // Old "fade" waits in the queue when the new one arrives
    let s2 = Arc::clone(&scheduler);
    let old_fade = thread::spawn(move || s2.execute(&[0x01], Some("fade"), IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));
    let s3 = Arc::clone(&scheduler);
    let new_fade = thread::spawn(move || s3.execute(&[0x02], Some("fade"), IO_TIMEOUT));
    thread::sleep(Duration::from_millis(10));

    first.join().unwrap().unwrap();
    // The superseded command still resolves successfully
    old_fade.join().unwrap().unwrap();
    new_fade.join().unwrap().unwrap();

    let payloads: Vec<Vec<u8>> = handle.deliveries().into_iter().map(|(_, p)| p).collect();
    assert!(payloads.contains(&vec![0x02]));
    assert!(!payloads.iter().any(|p| p.contains(&0x01)));
}

#[test]
fn clock_reads_are_single_flight() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);
    handle.set_clock_value(123_456);
    handle.set_deliver_delay(Duration::from_millis(80));

    let s1 = Arc::clone(&scheduler);
    let busy = thread::spawn(move || s1.execute(&[0], None, IO_TIMEOUT));
    thread::sleep(Duration::from_millis(20));

    let s2 = Arc::clone(&scheduler);
    let old_read = thread::spawn(move || s2.fetch_clock());
    thread::sleep(Duration::from_millis(10));
    let s3 = Arc::clone(&scheduler);
    let new_read = thread::spawn(move || s3.fetch_clock());
    thread::sleep(Duration::from_millis(10));

    busy.join().unwrap().unwrap();
    assert!(matches!(old_read.join().unwrap(), Err(Error::Superseded)));
    assert!(new_read.join().unwrap().unwrap() >= 123_456);
}

#[test]
fn timeout_floors_reject_before_enqueue() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());

    assert!(matches!(
        scheduler.connect(Duration::from_millis(500)),
        Err(Error::InvalidTimeout(_))
    ));
    assert!(matches!(
        scheduler.scan(&Criteria::any(), Duration::from_millis(500)),
        Err(Error::InvalidScanPeriod(_))
    ));
    assert!(matches!(
        scheduler.execute(&[1], None, Duration::from_millis(50)),
        Err(Error::InvalidTimeout(_))
    ));
    assert!(matches!(
        scheduler.request(&[1], true, Duration::from_millis(50)),
        Err(Error::InvalidTimeout(_))
    ));
    // Nothing reached the connector
    assert!(handle.deliveries().is_empty());
}

#[test]
fn concurrent_connect_is_rejected() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    scheduler
        .auto_select(&Criteria::any(), SELECT_TIMEOUT, SELECT_TIMEOUT)
        .unwrap();
    handle.set_deliver_delay(Duration::from_millis(80));

    // Occupy the worker so the first connect stays queued
    let s1 = Arc::clone(&scheduler);
    connect_busy_worker(&scheduler, &handle);
    let first = thread::spawn(move || s1.connect(SELECT_TIMEOUT));
    thread::sleep(Duration::from_millis(20));

    assert!(matches!(
        scheduler.connect(SELECT_TIMEOUT),
        Err(Error::ConnectingInProgress)
    ));
    first.join().unwrap().unwrap();
}

// Puts one slow execute in flight so following commands queue up
fn connect_busy_worker(
    scheduler: &Arc<Scheduler>,
    handle: &dipa_link::connector::MockConnectorHandle,
) {
    // The link must be up for deliver to run
    if !handle.is_connected() {
        scheduler.connect(SELECT_TIMEOUT).unwrap();
    }
    let s = Arc::clone(scheduler);
    thread::spawn(move || {
        let _ = s.execute(&[0xFF], None, IO_TIMEOUT);
    });
    thread::sleep(Duration::from_millis(20));
}

#[test]
fn connect_synchronizes_the_clock_mirror() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    handle.set_clock_value(987_000);
    connect(&scheduler);
    assert!(scheduler.clock_millis() >= 987_000);
}

#[test]
fn link_drop_triggers_reconnect() {
    let options = ReconnectOptions {
        on_drop: true,
        delay: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
        scan_window: Duration::from_secs(1),
        ..ReconnectOptions::default()
    };
    let (scheduler, handle) = scheduler_with_mock(options);
    let events = scheduler.events().subscribe();
    connect(&scheduler);
    assert_eq!(scheduler.connection_state(), ConnectionState::Connected);

    handle.drop_link();
    thread::sleep(Duration::from_millis(800));

    assert_eq!(scheduler.connection_state(), ConnectionState::Connected);
    assert!(handle.is_connected());

    // Connected → Connecting (drop) → Connected (restored)
    let seen: Vec<Event> = events.try_iter().collect();
    let first_connected = seen
        .iter()
        .position(|e| *e == Event::Connected)
        .expect("initial connect surfaced as an event");
    let reconnecting = seen[first_connected..]
        .iter()
        .position(|e| *e == Event::Connecting)
        .expect("drop surfaced as a reconnect attempt");
    assert!(seen[first_connected + reconnecting..].contains(&Event::Connected));
}

#[test]
fn intentional_disconnect_stays_down() {
    let options = ReconnectOptions {
        on_drop: true,
        delay: Duration::from_millis(50),
        ..ReconnectOptions::default()
    };
    let (scheduler, handle) = scheduler_with_mock(options);
    connect(&scheduler);

    scheduler.disconnect().unwrap();
    thread::sleep(Duration::from_millis(500));

    assert_eq!(scheduler.connection_state(), ConnectionState::Disconnected);
    assert!(!handle.is_connected());
}

#[test]
fn autonomous_mode_connects_from_idle() {
    let options = ReconnectOptions {
        autonomous: true,
        tick: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(1),
        scan_window: Duration::from_secs(1),
        ..ReconnectOptions::default()
    };
    let (scheduler, handle) = scheduler_with_mock(options);

    // No manual select or connect at all
    thread::sleep(Duration::from_millis(800));

    assert_eq!(scheduler.connection_state(), ConnectionState::Connected);
    assert!(handle.is_connected());
}

#[test]
fn destroy_leaves_no_connector_attached() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);

    scheduler.destroy().unwrap();
    assert_eq!(handle.destroy_count(), 1);
    assert!(!handle.is_connected());
    assert!(matches!(
        scheduler.execute(&[1], None, IO_TIMEOUT),
        Err(Error::NoConnectorAttached)
    ));
}

#[test]
fn request_round_trips_through_the_connector() {
    let (scheduler, handle) = scheduler_with_mock(ReconnectOptions::default());
    connect(&scheduler);
    handle.push_response(&[0xCA, 0xFE]);

    let reply = scheduler.request(&[0x01], true, IO_TIMEOUT).unwrap();
    assert_eq!(reply, Some(vec![0xCA, 0xFE]));

    // No response expected: the payload still goes out, nothing is read
    assert_eq!(scheduler.request(&[0x02], false, IO_TIMEOUT).unwrap(), None);
    assert_eq!(handle.deliveries().len(), 2);
}
