use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for every configured duration.  Anything longer is a typo, and would not fit a
/// `Duration` deadline anyway.
pub const MAX_CONFIG_SECONDS: f64 = 86_400.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelRole {
    #[serde(rename = "Link")]
    Linkage,
    Arm,
    Pump,
}

impl ChannelRole {
    pub const ALL: [ChannelRole; 3] = [ChannelRole::Linkage, ChannelRole::Arm, ChannelRole::Pump];

    pub fn tag(&self) -> &'static str {
        match self {
            ChannelRole::Linkage => "Link",
            ChannelRole::Arm => "Arm",
            ChannelRole::Pump => "Pump",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.tag() == tag)
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One servo as written in the config file.  Unset fields fall back to [`ChannelDefaults`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub role: ChannelRole,
    pub pin: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband_degrees: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_interval_seconds: Option<f64>,
}

impl ChannelConfig {
    pub fn new(role: ChannelRole, pin: u32) -> Self {
        Self {
            role,
            pin,
            angle_offset: None,
            min_angle: None,
            max_angle: None,
            deadband_degrees: None,
            command_interval_seconds: None,
        }
    }

    pub fn resolve(&self, defaults: &ChannelDefaults) -> ChannelSettings {
        let mut min_angle = self.min_angle.unwrap_or(defaults.min_angle);
        let mut max_angle = self.max_angle.unwrap_or(defaults.max_angle);
        if max_angle < min_angle {
            std::mem::swap(&mut min_angle, &mut max_angle);
        }
        let interval = self.command_interval_seconds.unwrap_or(defaults.command_interval_seconds);

        ChannelSettings {
            role: self.role,
            pin: self.pin,
            min_angle,
            max_angle,
            angle_offset: self.angle_offset.unwrap_or(defaults.angle_offset),
            deadband_degrees: self.deadband_degrees.unwrap_or(defaults.deadband_degrees).max(0.0),
            min_command_interval: secs(interval),
        }
    }

    fn numbers(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("angle_offset", self.angle_offset),
            ("min_angle", self.min_angle),
            ("max_angle", self.max_angle),
            ("deadband_degrees", self.deadband_degrees),
            ("command_interval_seconds", self.command_interval_seconds),
        ]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChannelDefaults {
    pub angle_offset: f64,
    pub min_angle: f64,
    pub max_angle: f64,
    pub deadband_degrees: f64,
    pub command_interval_seconds: f64,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            angle_offset: 0.0,
            min_angle: 0.0,
            max_angle: 360.0,
            deadband_degrees: 1.5,
            command_interval_seconds: 0.08,
        }
    }
}

impl ChannelDefaults {
    fn numbers(&self) -> [(&'static str, f64); 5] {
        [
            ("angle_offset", self.angle_offset),
            ("min_angle", self.min_angle),
            ("max_angle", self.max_angle),
            ("deadband_degrees", self.deadband_degrees),
            ("command_interval_seconds", self.command_interval_seconds),
        ]
    }
}

/// Fully merged settings for one channel.  `min_angle <= max_angle` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub role: ChannelRole,
    pub pin: u32,
    pub min_angle: f64,
    pub max_angle: f64,
    pub angle_offset: f64,
    pub deadband_degrees: f64,
    pub min_command_interval: Duration,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} of {target} must be a finite number")]
    NotFinite { target: String, field: &'static str },
    #[error("linkage_hold_time must be between 0 and {} seconds (got {0})", MAX_CONFIG_SECONDS)]
    InvalidHoldTime(f64),
    #[error("{field} of {target} must be at most {} seconds (got {value})", MAX_CONFIG_SECONDS)]
    OutOfRange { target: String, field: &'static str, value: f64 },
    #[error("{0} is configured more than once")]
    DuplicateTarget(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GroupConfig {
    pub linkage_hold_time: f64,
    pub defaults: ChannelDefaults,
    pub servos: Vec<ChannelConfig>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            linkage_hold_time: 1.0,
            defaults: ChannelDefaults::default(),
            servos: Self::default_servos(),
        }
    }
}

impl GroupConfig {
    pub fn default_servos() -> Vec<ChannelConfig> {
        vec![
            ChannelConfig::new(ChannelRole::Linkage, 15),
            ChannelConfig::new(ChannelRole::Arm, 14),
            ChannelConfig::new(ChannelRole::Pump, 4),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hold = self.linkage_hold_time;
        if !hold.is_finite() || !(0.0..=MAX_CONFIG_SECONDS).contains(&hold) {
            return Err(ConfigError::InvalidHoldTime(hold));
        }
        for (field, value) in self.defaults.numbers() {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { target: "defaults".to_owned(), field });
            }
        }
        check_seconds("defaults", "command_interval_seconds", self.defaults.command_interval_seconds)?;

        let mut seen = HashSet::new();
        for servo in &self.servos {
            let target = format!("{}:{}", servo.role, servo.pin);
            for (field, value) in servo.numbers() {
                if value.map_or(false, |v| !v.is_finite()) {
                    return Err(ConfigError::NotFinite { target, field });
                }
            }
            if let Some(interval) = servo.command_interval_seconds {
                check_seconds(&target, "command_interval_seconds", interval)?;
            }
            if !seen.insert((servo.role, servo.pin)) {
                return Err(ConfigError::DuplicateTarget(target));
            }
        }
        Ok(())
    }

    pub fn linkage_hold(&self) -> Duration {
        secs(self.linkage_hold_time)
    }

    pub fn resolved(&self) -> Vec<ChannelSettings> {
        self.servos.iter().map(|servo| servo.resolve(&self.defaults)).collect()
    }
}

/// Timing and scaling knobs of the spray sequence.  Durations are in seconds on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SequencerOptions {
    pub max_spray_time: f64,
    pub min_spray_time: f64,
    pub arm_stages: u32,
    pub manual_min_severity: f64,
    pub idle_scan_interval: f64,
    pub poll_interval: f64,
    pub stage_settle_time: f64,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            max_spray_time: 5.0,
            min_spray_time: 0.1,
            arm_stages: 3,
            manual_min_severity: 0.3,
            idle_scan_interval: 2.0,
            poll_interval: 0.05,
            stage_settle_time: 0.0,
        }
    }
}

impl SequencerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("max_spray_time", self.max_spray_time),
            ("min_spray_time", self.min_spray_time),
            ("idle_scan_interval", self.idle_scan_interval),
            ("poll_interval", self.poll_interval),
            ("stage_settle_time", self.stage_settle_time),
        ];
        for (field, value) in durations {
            check_seconds("sequencer", field, value)?;
        }
        if !self.manual_min_severity.is_finite() {
            return Err(ConfigError::NotFinite { target: "sequencer".to_owned(), field: "manual_min_severity" });
        }
        Ok(())
    }

    pub fn spray_duration(&self, severity: f64) -> Duration {
        let seconds = (severity.clamp(0.0, 1.0) * self.max_spray_time).max(self.min_spray_time);
        secs(seconds)
    }

    pub fn idle_scan(&self) -> Duration {
        secs(self.idle_scan_interval)
    }

    pub fn poll(&self) -> Duration {
        // A zero poll interval would spin; keep at least a millisecond between pause checks.
        secs(self.poll_interval).max(Duration::from_millis(1))
    }

    pub fn stage_settle(&self) -> Duration {
        secs(self.stage_settle_time)
    }
}

fn check_seconds(target: &str, field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::NotFinite { target: target.to_owned(), field });
    }
    if value > MAX_CONFIG_SECONDS {
        return Err(ConfigError::OutOfRange { target: target.to_owned(), field, value });
    }
    Ok(())
}

/// Negative and non-finite values read as zero, oversized ones saturate at the ceiling.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.min(MAX_CONFIG_SECONDS))
    } else {
        Duration::ZERO
    }
}

/// The persisted settings document.  Sections owned by other parts of the application (capture,
/// detector) are carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SprayerConfig {
    #[serde(default)]
    pub servo_pins: GroupConfig,
    #[serde(default)]
    pub sequencer: SequencerOptions,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl SprayerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.normalized()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.normalized().with_context(|| format!("invalid settings in {}", path.display()))
    }

    /// Loads `path`, or writes out and returns the defaults when there is no file yet.  An
    /// existing file that fails to parse or validate is reported and left alone.
    pub fn load_or_create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("{} not found; writing defaults", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.servo_pins.validate()?;
        self.sequencer.validate()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        info!("Saving config to {}", path.as_ref().display());
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn normalized(mut self) -> anyhow::Result<Self> {
        if self.servo_pins.servos.is_empty() {
            self.servo_pins.servos = GroupConfig::default_servos();
        }
        self.validate()?;
        Ok(self)
    }
}
