//! Simulated fieldbus slave.
//!
//! `SimulatedTransport` implements `FieldbusTransport` over an in-memory
//! register bank. Every request first advances the axis physics by the time
//! elapsed since the previous request (tokio clock, so paused-time tests are
//! deterministic), then serves the request.
//!
//! Test hooks:
//! - `fail_address()` - requests touching an address time out
//! - `set_frozen()` - an axis stops moving while outputs stay commanded
//! - `set_latency()` - every request holds the wire for a fixed time
//! - `drop_link()` - the connection is lost as if the cable was pulled
//! - `max_in_flight()` - highest number of concurrently served requests

use super::bank::RegisterBank;
use super::physics::AxisSimulator;
use async_trait::async_trait;
use bend_common::axis::{AxisCalibration, AxisId};
use bend_common::config::MachineConfig;
use bend_common::consts::EVENT_CHANNEL_CAPACITY;
use bend_common::fieldbus::{FieldbusError, FieldbusEvent, FieldbusTransport};
use bend_common::status::ConnectionState;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Mutable simulation state, guarded by one lock.
struct SimState {
    bank: RegisterBank,
    axes: Vec<AxisSimulator>,
    failing: HashSet<u16>,
    last_step: Option<Instant>,
}

impl SimState {
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = self
            .last_step
            .map_or(0.0, |last| now.duration_since(last).as_secs_f64());
        self.last_step = Some(now);
        for axis in &mut self.axes {
            axis.step(&mut self.bank, dt);
        }
    }

    fn check(&self, address: u16, count: u16) -> Result<(), FieldbusError> {
        let end = address.saturating_add(count.max(1) - 1);
        match self.failing.iter().find(|a| (address..=end).contains(a)) {
            Some(&failed) => Err(FieldbusError::Timeout { address: failed }),
            None => Ok(()),
        }
    }

    fn axis_mut(&mut self, id: AxisId) -> Option<&mut AxisSimulator> {
        self.axes.iter_mut().find(|axis| axis.id() == id)
    }
}

/// In-memory fieldbus slave with hydraulic axis physics.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    /// Serializes requests like a real single-connection slave
    wire: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: AtomicU64,
    events: broadcast::Sender<FieldbusEvent>,
}

impl SimulatedTransport {
    /// Create an empty slave with no axes.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SimState {
                bank: RegisterBank::new(),
                axes: Vec::new(),
                failing: HashSet::new(),
                last_step: None,
            }),
            wire: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            events,
        }
    }

    /// Create a slave simulating every configured axis.
    pub fn from_config(config: &MachineConfig) -> Self {
        let sim = Self::new();
        for calibration in &config.axes {
            sim.add_axis(calibration.clone());
        }
        info!(axes = config.axes.len(), "Simulated fieldbus slave created");
        sim
    }

    /// Attach physics to an axis and publish its initial reading.
    pub fn add_axis(&self, calibration: AxisCalibration) {
        let mut state = self.state.lock();
        let axis = AxisSimulator::new(calibration);
        axis.publish(&mut state.bank);
        state.axes.push(axis);
    }

    // ─── Test hooks ─────────────────────────────────────────────────

    /// Place an axis sensor at `raw`.
    pub fn set_raw(&self, id: AxisId, raw: i32) {
        let mut state = self.state.lock();
        let SimState { bank, axes, .. } = &mut *state;
        if let Some(axis) = axes.iter_mut().find(|axis| axis.id() == id) {
            axis.set_raw(raw, bank);
        }
    }

    /// Current (published) sensor reading of an axis.
    pub fn raw(&self, id: AxisId) -> Option<i32> {
        self.state
            .lock()
            .axes
            .iter()
            .find(|axis| axis.id() == id)
            .map(AxisSimulator::raw)
    }

    pub fn set_frozen(&self, id: AxisId, frozen: bool) {
        if let Some(axis) = self.state.lock().axis_mut(id) {
            axis.set_frozen(frozen);
        }
    }

    pub fn set_gain(&self, id: AxisId, counts_per_volt_second: f64) {
        if let Some(axis) = self.state.lock().axis_mut(id) {
            axis.set_gain(counts_per_volt_second);
        }
    }

    /// Set an input-side coil (safety chain, presence sensors).
    pub fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().bank.set_coil(address, value);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state.lock().bank.coil(address)
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.state.lock().bank.set_input(address, value);
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.state.lock().bank.holding(address)
    }

    /// Make every request touching `address` time out.
    pub fn fail_address(&self, address: u16) {
        self.state.lock().failing.insert(address);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Make the next `connect()` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Lose the connection without a `disconnect()` call.
    pub fn drop_link(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(FieldbusEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
                reason: reason.to_string(),
            });
        }
    }

    /// Highest number of requests ever served concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total number of requests served.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    // ─── Request plumbing ───────────────────────────────────────────

    fn emit(&self, event: FieldbusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Serve one request: hold the wire, advance physics, run `op` on the state.
    async fn request<T>(
        &self,
        address: u16,
        count: u16,
        op: impl FnOnce(&mut SimState) -> T,
    ) -> Result<T, FieldbusError> {
        if !self.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        let _wire = self.wire.lock().await;

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);
        self.requests.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.state.lock();
            state.advance();
            state.check(address, count).map(|()| op(&mut state))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = &result {
            self.emit(FieldbusEvent::Error {
                message: e.to_string(),
                address: e.address(),
                cause: None,
            });
        }
        result
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FieldbusTransport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulation"
    }

    async fn connect(&self) -> Result<(), FieldbusError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            let err = FieldbusError::Connect("simulated slave refuses connections".to_string());
            self.emit(FieldbusEvent::Error {
                message: err.to_string(),
                address: None,
                cause: None,
            });
            return Err(err);
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.state.lock().last_step = Some(Instant::now());
            debug!("Simulated slave connected");
            self.emit(FieldbusEvent::ConnectionChanged {
                state: ConnectionState::Connected,
                reason: "simulation".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FieldbusError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(FieldbusEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
                reason: "disconnect requested".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<FieldbusEvent> {
        self.events.subscribe()
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FieldbusError> {
        self.request(address, count, |s| s.bank.coils(address, count))
            .await
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), FieldbusError> {
        self.request(address, 1, |s| s.bank.set_coil(address, value))
            .await
    }

    async fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), FieldbusError> {
        let count = values.len().min(u16::MAX as usize) as u16;
        self.request(address, count, |s| {
            for (addr, value) in (address..).zip(values.iter()) {
                s.bank.set_coil(addr, *value);
            }
        })
        .await
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError> {
        self.request(address, count, |s| s.bank.holdings(address, count))
            .await
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), FieldbusError> {
        self.request(address, 1, |s| s.bank.set_holding(address, value))
            .await
    }

    async fn write_holding_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> Result<(), FieldbusError> {
        let count = values.len().min(u16::MAX as usize) as u16;
        self.request(address, count, |s| {
            for (addr, value) in (address..).zip(values.iter()) {
                s.bank.set_holding(addr, *value);
            }
        })
        .await
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError> {
        self.request(address, count, |s| s.bank.inputs(address, count))
            .await
    }
}
