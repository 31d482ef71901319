//! Integration test: status synchronization loop.
//!
//! Uses a scripted status source to check the single-slot gate, sequence
//! numbering, failure handling and the reconnection path.

use async_trait::async_trait;
use bend_common::config::SyncConfig;
use bend_common::event::MachineEvent;
use bend_common::fieldbus::FieldbusError;
use bend_common::status::{ConnectionState, MachineStatusSnapshot};
use bend_control_unit::{StatusPublisher, StatusSource, StatusSyncLoop};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

// ── Helpers ─────────────────────────────────────────────────────────

struct ScriptedSource {
    latency: Duration,
    connected: AtomicBool,
    accept_reconnect: AtomicBool,
    fail_polls: AtomicBool,
    polls: AtomicU64,
    reconnects: AtomicU64,
}

impl ScriptedSource {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            connected: AtomicBool::new(true),
            accept_reconnect: AtomicBool::new(true),
            fail_polls: AtomicBool::new(false),
            polls: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn poll_status(&self) -> Result<MachineStatusSnapshot, FieldbusError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        sleep(self.latency).await;
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(FieldbusError::Exception {
                address: 7,
                code: "IllegalDataAddress".to_string(),
            });
        }
        Ok(MachineStatusSnapshot::default())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), FieldbusError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.accept_reconnect.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(FieldbusError::Connect("refused".to_string()))
        }
    }
}

fn refreshed_sequences(rx: &mut tokio::sync::broadcast::Receiver<MachineEvent>) -> Vec<u64> {
    let mut sequences = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let MachineEvent::StatusRefreshed { sequence } = event {
            sequences.push(sequence);
        }
    }
    sequences
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn slow_polls_never_overlap() {
    let source = Arc::new(ScriptedSource::new(Duration::from_millis(180)));
    let publisher = StatusPublisher::new();
    let mut events = publisher.subscribe();

    let handle =
        StatusSyncLoop::new(SyncConfig::default(), source.clone(), publisher.clone()).spawn();
    sleep(Duration::from_millis(1050)).await;
    let stats = handle.stats();
    handle.shutdown().await;

    assert_eq!(stats.max_concurrent, 1);
    assert!(stats.skipped >= 3, "{stats:?}");
    assert!(stats.cycles >= 4, "{stats:?}");
    assert!(stats.average_duration >= Duration::from_millis(180));

    let sequences = refreshed_sequences(&mut events);
    assert!(!sequences.is_empty());
    for (i, seq) in sequences.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1);
    }
    assert_eq!(publisher.latest().sequence, *sequences.last().unwrap());
    assert!(publisher.latest().is_connected());
}

#[tokio::test(start_paused = true)]
async fn fast_polls_run_every_period() {
    let source = Arc::new(ScriptedSource::new(Duration::from_millis(5)));
    let publisher = StatusPublisher::new();

    let handle =
        StatusSyncLoop::new(SyncConfig::default(), source.clone(), publisher.clone()).spawn();
    sleep(Duration::from_millis(450)).await;
    let stats = handle.stats();
    handle.shutdown().await;

    // Ticks at 0, 100, 200, 300, 400 ms.
    assert_eq!(stats.cycles, 5);
    assert_eq!(stats.skipped, 0);
    assert_eq!(source.polls(), 5);
    assert_eq!(stats.window_len, 5);
}

#[tokio::test(start_paused = true)]
async fn failed_polls_keep_the_loop_running() {
    let source = Arc::new(ScriptedSource::new(Duration::from_millis(5)));
    source.fail_polls.store(true, Ordering::SeqCst);
    let publisher = StatusPublisher::new();
    let mut events = publisher.subscribe();

    let handle =
        StatusSyncLoop::new(SyncConfig::default(), source.clone(), publisher.clone()).spawn();
    sleep(Duration::from_millis(350)).await;
    assert!(handle.stats().failed >= 3);
    assert_eq!(handle.stats().cycles, 0);

    let fault = loop {
        match events.try_recv() {
            Ok(MachineEvent::SyncFault { message }) => break message,
            Ok(_) => continue,
            Err(e) => panic!("no SyncFault event: {e}"),
        }
    };
    assert!(fault.contains("address 7"), "{fault}");

    source.fail_polls.store(false, Ordering::SeqCst);
    sleep(Duration::from_millis(200)).await;
    assert!(handle.stats().cycles >= 1);
    assert_eq!(publisher.latest().sequence, handle.stats().cycles);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnected_loop_polls_nothing_until_reconnected() {
    let source = Arc::new(ScriptedSource::new(Duration::from_millis(5)));
    source.connected.store(false, Ordering::SeqCst);
    source.accept_reconnect.store(false, Ordering::SeqCst);
    let publisher = StatusPublisher::new();

    let handle =
        StatusSyncLoop::new(SyncConfig::default(), source.clone(), publisher.clone()).spawn();
    sleep(Duration::from_millis(3000)).await;

    assert_eq!(source.polls(), 0);
    assert!(source.reconnects.load(Ordering::SeqCst) >= 2);
    assert_eq!(publisher.latest().connection, ConnectionState::Disconnected);

    source.accept_reconnect.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(1500)).await;

    assert!(source.polls() >= 1);
    assert!(publisher.latest().is_connected());
    assert!(publisher.latest().sequence >= 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_poll_in_flight() {
    let source = Arc::new(ScriptedSource::new(Duration::from_millis(80)));
    let publisher = StatusPublisher::new();

    let handle =
        StatusSyncLoop::new(SyncConfig::default(), source.clone(), publisher.clone()).spawn();
    sleep(Duration::from_millis(10)).await;
    handle.shutdown().await;

    // The first poll was started at t=0 and completed before shutdown returned.
    assert_eq!(source.polls(), 1);
    assert_eq!(publisher.latest().sequence, 1);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(source.polls(), 1);
}
