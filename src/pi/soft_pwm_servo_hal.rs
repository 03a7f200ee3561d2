use log::debug;
use rppal::gpio::{Gpio, OutputPin};

use super::{pulse_width, SERVO_PERIOD};
use crate::servo_hal::{HalError, HalResult, ServoHal};

/// Servo on an arbitrary BCM pin, timed in software by rppal's PWM thread.  Noisier than a
/// hardware channel but available on every header pin.
pub struct SoftPwmServoHal {
    pin: u32,
    output: OutputPin,
    min_angle: f64,
    max_angle: f64,
}

impl SoftPwmServoHal {
    /// Whether this machine has a GPIO block rppal can drive.
    pub fn gpio_available() -> bool {
        Gpio::new().is_ok()
    }

    pub fn new(pin: u32, min_angle: f64, max_angle: f64) -> HalResult<Self> {
        let bcm = u8::try_from(pin).map_err(|_| HalError::DeviceNotConnected(format!("pin {pin} is not a GPIO")))?;
        let gpio = Gpio::new().map_err(|e| HalError::DeviceNotConnected(format!("GPIO unavailable: {e}")))?;
        let output = gpio
            .get(bcm)
            .map_err(|e| HalError::DeviceNotConnected(format!("pin {pin}: {e}")))?
            .into_output_low();
        debug!("pin {pin}: bound to software PWM");
        Ok(Self { pin, output, min_angle, max_angle })
    }
}

impl ServoHal for SoftPwmServoHal {
    fn set_angle(&mut self, angle_degrees: f64) -> HalResult<()> {
        let pulse = pulse_width(angle_degrees, self.min_angle, self.max_angle);
        self.output
            .set_pwm(SERVO_PERIOD, pulse)
            .map_err(|e| HalError::InternalError(format!("pin {}: {e}", self.pin)))
    }

    fn detach(&mut self) -> HalResult<()> {
        self.output
            .clear_pwm()
            .map_err(|e| HalError::InternalError(format!("pin {}: {e}", self.pin)))?;
        self.output.set_low();
        Ok(())
    }
}
