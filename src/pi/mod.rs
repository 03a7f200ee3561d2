//! Raspberry Pi servo outputs.
//!
//! Pins muxed to a free hardware PWM output are driven through sysfs, everything else gets
//! software PWM on the GPIO block.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub mod pwm_servo_hal;
pub mod soft_pwm_servo_hal;

/// Standard 50 Hz hobby servo frame.
pub const SERVO_PERIOD: Duration = Duration::from_millis(20);
const MIN_PULSE_NS: u64 = 500_000;
const MAX_PULSE_NS: u64 = 2_500_000;

/// Pulse width for `angle_degrees`, spreading `[min_angle, max_angle]` over the full pulse range.
pub fn pulse_width(angle_degrees: f64, min_angle: f64, max_angle: f64) -> Duration {
  let span = max_angle - min_angle;
  let fraction = if span > 0.0 && angle_degrees.is_finite() {
    ((angle_degrees - min_angle) / span).clamp(0.0, 1.0)
  } else {
    0.0
  };
  let span_ns = (MAX_PULSE_NS - MIN_PULSE_NS) as f64;
  Duration::from_nanos(MIN_PULSE_NS + (fraction * span_ns).round() as u64)
}

/// Hardware PWM output a BCM pin is muxed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PwmPortSpec {
  pub chip: u32,
  pub channel: u32,
}

impl PwmPortSpec {
  /// Pins 12/18 and 13/19 are alternate routings of the same two channels.
  pub fn for_bcm_pin(pin: u32) -> Option<Self> {
    match pin {
      12 | 18 => Some(Self { chip: 0, channel: 0 }),
      13 | 19 => Some(Self { chip: 0, channel: 1 }),
      _ => None,
    }
  }
}

/// Which pin currently owns each hardware PWM output.  Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct PwmClaims {
  holders: Arc<Mutex<HashMap<PwmPortSpec, u32>>>,
}

impl PwmClaims {
  pub fn holder(&self, port: PwmPortSpec) -> Option<u32> {
    self.lock().get(&port).copied()
  }

  fn claim(&self, port: PwmPortSpec, pin: u32) {
    self.lock().insert(port, pin);
  }

  fn release(&self, port: PwmPortSpec, pin: u32) {
    let mut holders = self.lock();
    if holders.get(&port) == Some(&pin) {
      holders.remove(&port);
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<PwmPortSpec, u32>> {
    self.holders.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// The hardware output `pin` may bind: it must be muxable, present under `root` and not already
/// held by another pin.
pub fn free_hardware_output(root: &Path, claims: &PwmClaims, pin: u32) -> Option<PwmPortSpec> {
  let port = PwmPortSpec::for_bcm_pin(pin)?;
  if !root.join(format!("pwmchip{}", port.chip)).exists() {
    return None;
  }
  match claims.holder(port) {
    Some(holder) if holder != pin => None,
    _ => Some(port),
  }
}
