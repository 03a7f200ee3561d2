use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{pulse_width, PwmClaims, PwmPortSpec, SERVO_PERIOD};
use crate::servo_hal::{HalError, HalResult, ServoHal};

pub const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

/// Servo on a hardware PWM channel exported through sysfs.  Holds its output in the shared
/// [`PwmClaims`] table until detached.
pub struct PwmServoHal {
    pin: u32,
    port: PwmPortSpec,
    claims: PwmClaims,
    chip_dir: PathBuf,
    channel_dir: PathBuf,
    min_angle: f64,
    max_angle: f64,
    enabled: bool,
    attached: bool,
}

impl PwmServoHal {
    pub fn new(root: &Path, claims: &PwmClaims, pin: u32, min_angle: f64, max_angle: f64) -> HalResult<Self> {
        let port = PwmPortSpec::for_bcm_pin(pin)
            .ok_or_else(|| HalError::DeviceNotConnected(format!("pin {pin} has no hardware PWM")))?;
        if let Some(holder) = claims.holder(port).filter(|holder| *holder != pin) {
            return Err(HalError::DeviceNotConnected(format!(
                "pin {pin} shares its PWM output with pin {holder}"
            )));
        }
        let chip_dir = root.join(format!("pwmchip{}", port.chip));
        if !chip_dir.exists() {
            return Err(HalError::DeviceNotConnected(format!(
                "{} not present (pin {pin})",
                chip_dir.display()
            )));
        }

        let channel_dir = chip_dir.join(format!("pwm{}", port.channel));
        if !channel_dir.exists() {
            fs::write(chip_dir.join("export"), port.channel.to_string())?;
        }
        if !channel_dir.exists() {
            return Err(HalError::InternalError(format!("export of {} failed", channel_dir.display())));
        }
        fs::write(channel_dir.join("period"), SERVO_PERIOD.as_nanos().to_string())?;
        claims.claim(port, pin);
        debug!("pin {pin}: bound to {}", channel_dir.display());

        Ok(Self {
            pin,
            port,
            claims: claims.clone(),
            chip_dir,
            channel_dir,
            min_angle,
            max_angle,
            enabled: false,
            attached: true,
        })
    }
}

impl ServoHal for PwmServoHal {
    fn set_angle(&mut self, angle_degrees: f64) -> HalResult<()> {
        let duty = pulse_width(angle_degrees, self.min_angle, self.max_angle);
        fs::write(self.channel_dir.join("duty_cycle"), duty.as_nanos().to_string())?;
        if !self.enabled {
            fs::write(self.channel_dir.join("enable"), "1")?;
            self.enabled = true;
        }
        Ok(())
    }

    fn detach(&mut self) -> HalResult<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.claims.release(self.port, self.pin);
        if self.enabled {
            fs::write(self.channel_dir.join("enable"), "0")?;
            self.enabled = false;
        }
        if let Err(e) = fs::write(self.chip_dir.join("unexport"), self.port.channel.to_string()) {
            warn!("unexport of {} failed: {e}", self.channel_dir.display());
        }
        Ok(())
    }
}
