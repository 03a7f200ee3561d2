use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_new::new;
use log::{debug, info, warn};
use thiserror::Error;

use crate::rig_config::{ChannelRole, ConfigError, GroupConfig};
use crate::servo_channel::ServoChannel;
use crate::servo_hal_factory::ServoHalFactory;

pub const LINKAGE_RAISED_ANGLE: f64 = 30.0;
pub const LINKAGE_LOWERED_ANGLE: f64 = 0.0;
pub const ARM_FULL_TRAVEL_ANGLE: f64 = 70.0;
pub const PUMP_ON_ANGLE: f64 = 50.0;
pub const PUMP_OFF_ANGLE: f64 = 0.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RigError {
    #[error("invalid rig configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("malformed manual target {0:?}, expected Role:pin")]
    MalformedTarget(String),
}

/// Stable identifier of a single servo for manual override, written `Role:pin` (e.g. `Link:15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManualTarget {
    pub role: ChannelRole,
    pub pin: u32,
}

impl fmt::Display for ManualTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.pin)
    }
}

impl FromStr for ManualTarget {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RigError::MalformedTarget(s.to_owned());
        let (role, pin) = s.split_once(':').ok_or_else(malformed)?;
        let role = ChannelRole::from_tag(role.trim()).ok_or_else(malformed)?;
        let pin = pin.trim().parse::<u32>().map_err(|_| malformed())?;
        Ok(Self { role, pin })
    }
}

/// Operator-side limits applied to a manual command before the channel's own bounds.
#[derive(new, Debug, Clone, Copy, PartialEq)]
pub struct ManualClamp {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RigStatus {
    pub active: usize,
    pub total: usize,
}

impl fmt::Display for RigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} servos active", self.active, self.total)
    }
}

struct RigChannels {
    linkage_hold_time: Duration,
    linkages: Vec<ServoChannel>,
    arms: Vec<ServoChannel>,
    pumps: Vec<ServoChannel>,
    linkages_active: bool,
    pumps_active: bool,
}

impl RigChannels {
    fn empty() -> Self {
        Self {
            linkage_hold_time: Duration::ZERO,
            linkages: Vec::new(),
            arms: Vec::new(),
            pumps: Vec::new(),
            linkages_active: false,
            pumps_active: false,
        }
    }

    fn role_mut(&mut self, role: ChannelRole) -> &mut Vec<ServoChannel> {
        match role {
            ChannelRole::Linkage => &mut self.linkages,
            ChannelRole::Arm => &mut self.arms,
            ChannelRole::Pump => &mut self.pumps,
        }
    }

    fn all(&self) -> impl Iterator<Item = (ChannelRole, &ServoChannel)> {
        self.linkages
            .iter()
            .map(|c| (ChannelRole::Linkage, c))
            .chain(self.arms.iter().map(|c| (ChannelRole::Arm, c)))
            .chain(self.pumps.iter().map(|c| (ChannelRole::Pump, c)))
    }

    fn close_all(&mut self) {
        for role in ChannelRole::ALL {
            for channel in self.role_mut(role).iter_mut() {
                channel.close();
            }
            self.role_mut(role).clear();
        }
    }

    fn drive(&mut self, role: ChannelRole, angle: f64, force: bool) {
        for channel in self.role_mut(role).iter_mut() {
            channel.set_angle(angle, force);
        }
    }

    fn set_linkages(&mut self, active: bool, force: bool) {
        self.linkages_active = active;
        let target = if active { LINKAGE_RAISED_ANGLE } else { LINKAGE_LOWERED_ANGLE };
        self.drive(ChannelRole::Linkage, target, force);
    }

    fn set_arm_height(&mut self, percent: f64, force: bool) {
        let normalized = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 1.0) };
        self.drive(ChannelRole::Arm, normalized * ARM_FULL_TRAVEL_ANGLE, force);
    }

    fn set_pumps(&mut self, active: bool, force: bool) {
        self.pumps_active = active;
        let target = if active { PUMP_ON_ANGLE } else { PUMP_OFF_ANGLE };
        self.drive(ChannelRole::Pump, target, force);
    }

    fn force_neutral(&mut self) {
        self.set_linkages(false, true);
        self.set_pumps(false, true);
        self.set_arm_height(0.0, true);
    }
}

/// All servos of the sprayer, grouped by role.  Every hardware write from the sequencer, the
/// manual override path and reconfiguration is serialized through one lock.
pub struct ServoRig {
    factory: ServoHalFactory,
    channels: Mutex<RigChannels>,
}

impl ServoRig {
    pub fn new(config: &GroupConfig, factory: ServoHalFactory) -> Result<Self, RigError> {
        let rig = Self { factory, channels: Mutex::new(RigChannels::empty()) };
        rig.apply_config(config)?;
        Ok(rig)
    }

    /// Tears down every channel, rebuilds from `config` and forces the rig to its neutral state.
    /// An invalid config is rejected before anything is touched.
    pub fn apply_config(&self, config: &GroupConfig) -> Result<(), RigError> {
        config.validate()?;
        let linkage_hold_time = config.linkage_hold();
        let resolved = config.resolved();

        let mut channels = self.lock();
        channels.close_all();
        channels.linkage_hold_time = linkage_hold_time;
        for settings in resolved {
            let role = settings.role;
            let channel = ServoChannel::open(settings, &self.factory);
            channels.role_mut(role).push(channel);
        }
        channels.force_neutral();

        let status = Self::status_of(&channels);
        info!("Rig configured: {status}");
        Ok(())
    }

    pub fn set_linkages(&self, active: bool, force: bool) {
        debug!("set_linkages: active={active} force={force}");
        self.lock().set_linkages(active, force);
    }

    pub fn set_arm_height(&self, percent: f64, force: bool) {
        debug!("set_arm_height: {percent:.3} force={force}");
        self.lock().set_arm_height(percent, force);
    }

    pub fn set_pumps(&self, active: bool, force: bool) {
        debug!("set_pumps: active={active} force={force}");
        self.lock().set_pumps(active, force);
    }

    pub fn linkages_active(&self) -> bool {
        self.lock().linkages_active
    }

    pub fn pumps_active(&self) -> bool {
        self.lock().pumps_active
    }

    pub fn linkage_hold_time(&self) -> Duration {
        self.lock().linkage_hold_time
    }

    pub fn list_targets(&self) -> Vec<ManualTarget> {
        self.lock()
            .all()
            .map(|(role, channel)| ManualTarget { role, pin: channel.pin() })
            .collect()
    }

    /// Forwards a raw angle to a single servo, bypassing the role-level semantics.  Returns false
    /// (and changes nothing) for unknown targets or non-finite angles.
    pub fn set_manual_angle(&self, target: &ManualTarget, angle: f64, force: bool) -> bool {
        if !angle.is_finite() {
            warn!("Rejecting manual angle {angle} for {target}");
            return false;
        }
        let mut channels = self.lock();
        match channels.role_mut(target.role).iter_mut().find(|c| c.pin() == target.pin) {
            Some(channel) => {
                debug!("manual {target} -> {angle:.1} force={force}");
                channel.set_angle(angle, force);
                true
            }
            None => {
                warn!("Unknown manual target {target}");
                false
            }
        }
    }

    /// Operator entry point: optional clamp first, then a forced write.
    pub fn set_manual_angle_clamped(&self, target: &ManualTarget, angle: f64, clamp: Option<ManualClamp>) -> bool {
        let angle = match clamp {
            None => angle,
            Some(ManualClamp { min, max }) => {
                if !min.is_finite() || !max.is_finite() {
                    warn!("Rejecting manual clamp [{min}, {max}] for {target}");
                    return false;
                }
                angle.clamp(min.min(max), min.max(max))
            }
        };
        self.set_manual_angle(target, angle, true)
    }

    pub fn status(&self) -> RigStatus {
        Self::status_of(&self.lock())
    }

    pub fn init_errors(&self) -> Vec<(ManualTarget, String)> {
        self.lock()
            .all()
            .filter_map(|(role, channel)| {
                channel
                    .init_error()
                    .map(|e| (ManualTarget { role, pin: channel.pin() }, e.to_owned()))
            })
            .collect()
    }

    /// Parks everything in the neutral state and releases the hardware.
    pub fn shutdown(&self) {
        let mut channels = self.lock();
        channels.force_neutral();
        channels.close_all();
        info!("Rig shut down");
    }

    fn status_of(channels: &RigChannels) -> RigStatus {
        let mut status = RigStatus { active: 0, total: 0 };
        for (_, channel) in channels.all() {
            status.total += 1;
            if channel.available() {
                status.active += 1;
            }
        }
        status
    }

    fn lock(&self) -> MutexGuard<'_, RigChannels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
