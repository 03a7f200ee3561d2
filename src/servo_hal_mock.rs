use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::servo_hal::{HalError, HalResult, ServoHal};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoWrite {
    pub pin: u32,
    pub angle: f64,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct BusState {
    writes: Vec<ServoWrite>,
    attached: HashSet<u32>,
    failing_pins: HashSet<u32>,
    write_latency: Duration,
}

/// Shared recorder standing in for the physical PWM outputs.  Clones observe the same bus.
#[derive(Debug, Clone, Default)]
pub struct MockServoBus {
    state: Arc<Mutex<BusState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockServoBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Any later attempt to bind `pin` fails as if nothing were connected there.
    pub fn fail_pin(&self, pin: u32) {
        self.lock().failing_pins.insert(pin);
    }

    /// Makes every write block the calling thread for `latency`, like a slow bus transfer.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    /// Highest number of writes that were ever in progress at the same time, on any pins.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<ServoWrite> {
        self.lock().writes.clone()
    }

    pub fn writes_for(&self, pin: u32) -> Vec<ServoWrite> {
        self.lock().writes.iter().filter(|w| w.pin == pin).copied().collect()
    }

    pub fn angles_for(&self, pin: u32) -> Vec<f64> {
        self.writes_for(pin).iter().map(|w| w.angle).collect()
    }

    pub fn last_angle(&self, pin: u32) -> Option<f64> {
        self.lock().writes.iter().rev().find(|w| w.pin == pin).map(|w| w.angle)
    }

    pub fn is_attached(&self, pin: u32) -> bool {
        self.lock().attached.contains(&pin)
    }

    pub fn clear(&self) {
        self.lock().writes.clear();
    }

    fn attach(&self, pin: u32) -> HalResult<ServoHalMock> {
        let mut state = self.lock();
        if state.failing_pins.contains(&pin) {
            return Err(HalError::DeviceNotConnected(format!("no servo answering on pin {pin}")));
        }
        state.attached.insert(pin);
        Ok(ServoHalMock { pin, bus: self.clone() })
    }

    fn begin_write(&self) -> WriteInFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        WriteInFlight(self)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WriteInFlight<'a>(&'a MockServoBus);

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ServoHalMock {
    pin: u32,
    bus: MockServoBus,
}

impl ServoHalMock {
    pub fn attach(bus: &MockServoBus, pin: u32) -> HalResult<Self> {
        bus.attach(pin)
    }
}

impl ServoHal for ServoHalMock {
    fn set_angle(&mut self, angle_degrees: f64) -> HalResult<()> {
        debug!("mock servo {}: set_angle {angle_degrees:.2}", self.pin);
        let _in_flight = self.bus.begin_write();
        let latency = self.bus.lock().write_latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut state = self.bus.lock();
        if !state.attached.contains(&self.pin) {
            return Err(HalError::InternalError(format!("pin {} is detached", self.pin)));
        }
        state.writes.push(ServoWrite { pin: self.pin, angle: angle_degrees, at: Instant::now() });
        Ok(())
    }

    fn detach(&mut self) -> HalResult<()> {
        debug!("mock servo {}: detach", self.pin);
        self.bus.lock().attached.remove(&self.pin);
        Ok(())
    }
}
