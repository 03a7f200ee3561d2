use log::{debug, warn};
use tokio::time::Instant;

use crate::rig_config::ChannelSettings;
use crate::servo_hal::ServoHal;
use crate::servo_hal_factory::ServoHalFactory;

/// One physical servo.  Commands are calibrated, clamped to the configured bounds and debounced
/// before they reach the hardware.
///
/// A channel whose hardware could not be bound stays inert for its whole lifetime: every command
/// is silently dropped and [`ServoChannel::init_error`] explains why.
pub struct ServoChannel {
    settings: ChannelSettings,
    hal: Option<Box<dyn ServoHal>>,
    init_error: Option<String>,
    last_commanded_angle: Option<f64>,
    last_command_time: Option<Instant>,
}

impl ServoChannel {
    pub fn open(settings: ChannelSettings, factory: &ServoHalFactory) -> Self {
        let (hal, init_error) = match factory.create_hal(settings.pin, settings.min_angle, settings.max_angle) {
            Ok(hal) => (Some(hal), None),
            Err(e) => {
                warn!("{}:{} unavailable: {e}", settings.role, settings.pin);
                (None, Some(e.to_string()))
            }
        };
        Self {
            settings,
            hal,
            init_error,
            last_commanded_angle: None,
            last_command_time: None,
        }
    }

    pub fn pin(&self) -> u32 {
        self.settings.pin
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn available(&self) -> bool {
        self.hal.is_some()
    }

    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn last_angle(&self) -> Option<f64> {
        self.last_commanded_angle
    }

    /// Hardware-visible angle for a requested one: offset applied, then clamped to the bounds.
    pub fn bounded_angle(&self, angle: f64) -> f64 {
        (angle + self.settings.angle_offset).clamp(self.settings.min_angle, self.settings.max_angle)
    }

    /// Returns true if the hardware was actually commanded.  `force` skips the deadband and the
    /// minimum command interval but never the bounds.  Non-finite angles are dropped.
    pub fn set_angle(&mut self, angle: f64, force: bool) -> bool {
        if !angle.is_finite() {
            warn!("{}:{} ignoring non-finite angle {angle}", self.settings.role, self.settings.pin);
            return false;
        }
        let bounded = self.bounded_angle(angle);
        let now = Instant::now();
        if !force && self.is_redundant(bounded, now) {
            return false;
        }

        let Some(hal) = self.hal.as_mut() else {
            return false;
        };
        match hal.set_angle(bounded) {
            Ok(()) => {
                self.last_commanded_angle = Some(bounded);
                self.last_command_time = Some(now);
                true
            }
            Err(e) => {
                warn!("{}:{} write of {bounded:.1} failed: {e}", self.settings.role, self.settings.pin);
                false
            }
        }
    }

    fn is_redundant(&self, bounded: f64, now: Instant) -> bool {
        if let Some(previous) = self.last_commanded_angle {
            if (bounded - previous).abs() < self.settings.deadband_degrees {
                return true;
            }
        }
        match self.last_command_time {
            Some(at) => now.duration_since(at) < self.settings.min_command_interval,
            None => false,
        }
    }

    pub fn close(&mut self) {
        if let Some(mut hal) = self.hal.take() {
            debug!("{}:{} closing", self.settings.role, self.settings.pin);
            if let Err(e) = hal.detach() {
                warn!("{}:{} detach failed: {e}", self.settings.role, self.settings.pin);
            }
        }
    }
}

impl Drop for ServoChannel {
    fn drop(&mut self) {
        self.close();
    }
}
