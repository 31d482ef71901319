//! Status synchronization loop.
//!
//! Background task that keeps the latest [`MachineStatusSnapshot`] fresh.
//!
//! ## Cycle
//!
//! 1. Wait for the next tick (`sync.period_ms`, missed ticks are skipped).
//! 2. While disconnected: sleep `sync.reconnect_poll_ms`, optionally try to
//!    reconnect, and start over. No polls are issued.
//! 3. Take the single-slot gate, waiting at most `sync.gate_wait_ms`. If the
//!    previous poll still holds it the cycle is dropped, never queued.
//! 4. Poll in a separate task holding the gate; publish the snapshot with the
//!    next sequence number, or report the failure as a `SyncFault`.
//!
//! The loop ends on [`SyncHandle::shutdown`] or when the handle is dropped;
//! poll failures never end it.

use async_trait::async_trait;
use bend_common::config::SyncConfig;
use bend_common::consts::EVENT_CHANNEL_CAPACITY;
use bend_common::event::MachineEvent;
use bend_common::fieldbus::FieldbusError;
use bend_common::status::{ConnectionState, MachineStatusSnapshot};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedMutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, info, warn};

/// Skipped cycles logged at WARN before switching to DEBUG.
const SKIP_WARN_LIMIT: u64 = 10;

// ─── Source ─────────────────────────────────────────────────────────

/// What the loop polls.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// Build a fresh snapshot. `sequence` and `timestamp_us` are filled in by the loop.
    async fn poll_status(&self) -> Result<MachineStatusSnapshot, FieldbusError>;

    fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), FieldbusError>;

    /// Called with every snapshot before it is published.
    async fn on_snapshot(&self, _snapshot: &MachineStatusSnapshot) {}
}

// ─── Publisher ──────────────────────────────────────────────────────

/// Latest-snapshot `watch` plus the machine event `broadcast`.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    status: Arc<watch::Sender<Arc<MachineStatusSnapshot>>>,
    events: broadcast::Sender<MachineEvent>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (status, _) = watch::channel(Arc::new(MachineStatusSnapshot::default()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: Arc::new(status),
            events,
        }
    }

    pub fn latest(&self) -> Arc<MachineStatusSnapshot> {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<MachineStatusSnapshot>> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<MachineEvent> {
        &self.events
    }

    pub fn emit(&self, event: MachineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, snapshot: Arc<MachineStatusSnapshot>) {
        self.status.send_replace(snapshot);
    }

    /// Mark the latest snapshot as disconnected (copy-on-write).
    fn mark_disconnected(&self) {
        self.status.send_if_modified(|snapshot| {
            if snapshot.connection == ConnectionState::Disconnected {
                return false;
            }
            Arc::make_mut(snapshot).connection = ConnectionState::Disconnected;
            true
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Statistics ─────────────────────────────────────────────────────

/// Bounded window of cycle durations with a running sum.
#[derive(Debug)]
struct DurationWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    total: Duration,
}

impl DurationWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: Duration::ZERO,
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.total -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.total += sample;
    }

    fn average(&self) -> Duration {
        match self.samples.len() {
            0 => Duration::ZERO,
            n => self.total / n as u32,
        }
    }
}

/// Counters shared between the loop and its handle.
#[derive(Debug)]
pub struct SyncStats {
    cycles: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
    window: Mutex<DurationWindow>,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    /// Cycles that published a snapshot.
    pub cycles: u64,
    /// Cycles dropped at the gate.
    pub skipped: u64,
    pub failed: u64,
    /// Highest number of polls ever in flight together.
    pub max_concurrent: usize,
    pub window_len: usize,
    pub average_duration: Duration,
}

impl SyncStats {
    fn new(window: usize) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            window: Mutex::new(DurationWindow::new(window)),
        }
    }

    fn begin(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(active, Ordering::SeqCst);
    }

    fn end(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        let window = self.window.lock();
        SyncStatsSnapshot {
            cycles: self.cycles.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
            window_len: window.samples.len(),
            average_duration: window.average(),
        }
    }
}

// ─── Loop ───────────────────────────────────────────────────────────

/// Running loop. Dropping the handle stops the loop at its next tick.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<SyncStats>,
}

impl SyncHandle {
    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the loop and wait for the in-flight poll to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "status loop task ended abnormally");
        }
    }
}

pub struct StatusSyncLoop<S: StatusSource> {
    config: SyncConfig,
    source: Arc<S>,
    publisher: StatusPublisher,
    stats: Arc<SyncStats>,
    sequence: Arc<AtomicU64>,
}

impl<S: StatusSource> StatusSyncLoop<S> {
    pub fn new(config: SyncConfig, source: Arc<S>, publisher: StatusPublisher) -> Self {
        let stats = Arc::new(SyncStats::new(config.duration_window));
        Self {
            config,
            source,
            publisher,
            stats,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn spawn(self) -> SyncHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(rx));
        SyncHandle {
            shutdown,
            task,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let mut ticker = interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            period_ms = self.config.period_ms,
            gate_wait_ms = self.config.gate_wait_ms,
            "status loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if !self.source.is_connected() {
                self.publisher.mark_disconnected();
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = sleep(self.config.reconnect_poll()) => {}
                }
                if !self.source.is_connected() && self.config.auto_reconnect {
                    match self.source.reconnect().await {
                        Ok(()) => info!("fieldbus reconnected"),
                        Err(e) => debug!(error = %e, "reconnect attempt failed"),
                    }
                }
                ticker.reset();
                continue;
            }

            match timeout(self.config.gate_wait(), Arc::clone(&gate).lock_owned()).await {
                Ok(guard) => {
                    tokio::spawn(Self::cycle(
                        Arc::clone(&self.source),
                        self.publisher.clone(),
                        Arc::clone(&self.stats),
                        Arc::clone(&self.sequence),
                        guard,
                    ));
                }
                Err(_) => {
                    let skipped = self.stats.skipped.fetch_add(1, Ordering::SeqCst) + 1;
                    if skipped <= SKIP_WARN_LIMIT || skipped % 1000 == 0 {
                        warn!(skipped, "previous status poll still running, cycle skipped");
                    } else {
                        debug!(skipped, "status cycle skipped");
                    }
                }
            }
        }

        // Let the in-flight poll finish before reporting the loop as stopped.
        let _ = gate.lock().await;
        info!(stats = ?self.stats.snapshot(), "status loop stopped");
    }

    async fn cycle(
        source: Arc<S>,
        publisher: StatusPublisher,
        stats: Arc<SyncStats>,
        sequence: Arc<AtomicU64>,
        _gate: OwnedMutexGuard<()>,
    ) {
        stats.begin();
        let started = Instant::now();

        match source.poll_status().await {
            Ok(mut snapshot) => {
                let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                snapshot.sequence = seq;
                snapshot.timestamp_us = unix_micros();
                snapshot.connection = ConnectionState::Connected;

                source.on_snapshot(&snapshot).await;
                publisher.publish(Arc::new(snapshot));
                publisher.emit(MachineEvent::StatusRefreshed { sequence: seq });

                stats.cycles.fetch_add(1, Ordering::SeqCst);
                stats.window.lock().push(started.elapsed());
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "status poll failed");
                if e.is_connectivity() {
                    publisher.mark_disconnected();
                }
                publisher.emit(MachineEvent::SyncFault {
                    message: e.to_string(),
                });
            }
        }

        stats.end();
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}
