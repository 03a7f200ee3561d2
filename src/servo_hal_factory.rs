use std::path::PathBuf;

use log::{debug, info, warn};

use crate::pi::pwm_servo_hal::{PwmServoHal, SYSFS_PWM_ROOT};
use crate::pi::soft_pwm_servo_hal::SoftPwmServoHal;
use crate::pi::{free_hardware_output, PwmClaims};
use crate::servo_hal::{HalResult, ServoHal};
use crate::servo_hal_mock::{MockServoBus, ServoHalMock};

#[derive(Debug, Clone)]
enum Backend {
    Pi { pwm_root: PathBuf, claims: PwmClaims },
    Mock(MockServoBus),
}

#[derive(Debug, Clone)]
pub struct ServoHalFactory {
    backend: Backend,
}

impl Default for ServoHalFactory {
    fn default() -> Self {
        Self::new_maybe_mock(false)
    }
}

impl ServoHalFactory {
    pub fn new() -> Self {
        Default::default()
    }

    /// Real outputs when this is a Pi with usable GPIO, mocks otherwise.
    pub fn new_maybe_mock(force_mock: bool) -> Self {
        if force_mock {
            return Self::with_mock_bus(MockServoBus::new());
        }
        if SoftPwmServoHal::gpio_available() {
            Self::with_pwm_root(SYSFS_PWM_ROOT)
        } else {
            warn!("No GPIO found, falling back to mock servos");
            Self::with_mock_bus(MockServoBus::new())
        }
    }

    /// Pi outputs, looking for hardware PWM chips under `pwm_root`.
    pub fn with_pwm_root(pwm_root: impl Into<PathBuf>) -> Self {
        Self { backend: Backend::Pi { pwm_root: pwm_root.into(), claims: PwmClaims::default() } }
    }

    pub fn with_mock_bus(bus: MockServoBus) -> Self {
        Self { backend: Backend::Mock(bus) }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock(_))
    }

    pub fn create_hal(&self, pin: u32, min_angle: f64, max_angle: f64) -> HalResult<Box<dyn ServoHal>> {
        match &self.backend {
            Backend::Pi { pwm_root, claims } => {
                if free_hardware_output(pwm_root, claims, pin).is_some() {
                    match PwmServoHal::new(pwm_root, claims, pin, min_angle, max_angle) {
                        Ok(hal) => return Ok(Box::new(hal)),
                        Err(e) => info!("pin {pin}: hardware PWM unusable ({e}), using software PWM"),
                    }
                } else {
                    debug!("pin {pin}: no free hardware PWM output, using software PWM");
                }
                Ok(Box::new(SoftPwmServoHal::new(pin, min_angle, max_angle)?))
            }
            Backend::Mock(bus) => Ok(Box::new(ServoHalMock::attach(bus, pin)?)),
        }
    }
}
