//! Search-and-spray sequencing over the servo rig.
//!
//! A sequence first checks whether a target is already visible and sprays straight away if so.
//! Otherwise it raises the linkage, holds, looks again, then steps the arm through a fixed number
//! of heights, checking for a target at each one.  The first positive check sprays and ends the
//! sequence; an empty sweep just lowers the linkage again.
//!
//! Every sweep move is forced past the channels' deadband and rate limit, so a stage is never
//! skipped whatever the channel timings are.  An optional settle time lets the arm arrive before
//! a stage is checked.
//!
//! At most one sequence runs at a time.  Pausing is cooperative: it is observed between steps and
//! inside every wait, and never leaves a pump running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_signals::signal::{Mutable, MutableSignal};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::detection::DetectionSupplier;
use crate::rig_config::{ConfigError, GroupConfig, SequencerOptions};
use crate::servo_rig::{ManualClamp, ManualTarget, RigError, RigStatus, ServoRig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    CheckingImmediate,
    LinkageRaised,
    ArmStage(u32),
    Spraying,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    SprayedImmediately,
    SprayedAtFullRaise,
    SprayedAtStage(u32),
    NoTarget,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceReport {
    pub outcome: SequenceOutcome,
    pub sprayed_for: Duration,
    /// The pump was shut off early because of a pause.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    Busy,
    Paused,
    IdleBackoff,
}

#[derive(Debug, Clone, Copy)]
struct SprayRecord {
    sprayed_for: Duration,
    truncated: bool,
}

enum Check {
    NoTarget,
    Sprayed(SprayRecord),
    Paused,
}

struct Shared {
    rig: Arc<ServoRig>,
    detection: Box<dyn DetectionSupplier>,
    options: SequencerOptions,
    paused: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<SequenceReport>>>,
    last_cycle_end: Mutex<Option<Instant>>,
    state: Mutable<SequenceState>,
}

/// Clears the single-flight flag however the worker ends, including cancellation.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        *lock(&self.0.last_cycle_end) = Some(Instant::now());
        self.0.state.set(SequenceState::Idle);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SpraySequencer {
    shared: Arc<Shared>,
}

impl SpraySequencer {
    pub fn new(
        rig: Arc<ServoRig>,
        detection: impl DetectionSupplier + 'static,
        options: SequencerOptions,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                rig,
                detection: Box::new(detection),
                options,
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                last_cycle_end: Mutex::new(None),
                state: Mutable::new(SequenceState::Idle),
            }),
        })
    }

    /// Called by the scheduler at its own cadence.  Starts a sequence when a target is visible,
    /// or an exploratory sweep once the idle re-scan interval has passed since the last one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger_automatic_cycle(&self) -> TriggerOutcome {
        if let Some(rejected) = self.shared.rejection() {
            return rejected;
        }
        let severity = self.shared.read_severity();
        if severity > 0.0 {
            return self.start(severity);
        }
        if !self.idle_backoff_remaining().is_zero() {
            return TriggerOutcome::IdleBackoff;
        }
        self.start(0.0)
    }

    /// Operator-requested spray.  Runs with at least the configured minimum severity, so it sprays
    /// even when nothing is detected.
    pub fn trigger_manual_spray(&self) -> TriggerOutcome {
        if let Some(rejected) = self.shared.rejection() {
            return rejected;
        }
        let severity = self.shared.read_severity().max(self.shared.options.manual_min_severity);
        self.start(severity)
    }

    fn start(&self, severity: f64) -> TriggerOutcome {
        let mut worker = lock(&self.shared.worker);
        if let Some(rejected) = self.shared.rejection() {
            return rejected;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        info!("Starting spray sequence (severity hint {severity:.2})");

        let guard = RunningGuard(self.shared.clone());
        *worker = Some(tokio::spawn(async move {
            let report = guard.0.run_sequence(severity).await;
            drop(guard);
            report
        }));
        TriggerOutcome::Started
    }

    /// Waits for the in-flight sequence, if any, and returns how it ended.
    pub async fn join(&self) -> Option<SequenceReport> {
        let handle = lock(&self.shared.worker).take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Spray worker did not complete: {e}");
                None
            }
        }
    }

    pub fn set_paused(&self, paused: bool) {
        if self.shared.paused.swap(paused, Ordering::SeqCst) != paused {
            info!("Sprayer {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn is_spraying(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> SequenceState {
        self.shared.state.get()
    }

    pub fn stage_signal(&self) -> MutableSignal<SequenceState> {
        self.shared.state.signal()
    }

    /// Time left before an empty re-scan may start.  Zero when no sequence has run yet.
    pub fn idle_backoff_remaining(&self) -> Duration {
        match *lock(&self.shared.last_cycle_end) {
            Some(end) => self.shared.options.idle_scan().saturating_sub(end.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn rig(&self) -> &Arc<ServoRig> {
        &self.shared.rig
    }

    pub fn list_targets(&self) -> Vec<ManualTarget> {
        self.shared.rig.list_targets()
    }

    pub fn set_manual_angle(&self, target: &ManualTarget, angle: f64, clamp: Option<ManualClamp>) -> bool {
        self.shared.rig.set_manual_angle_clamped(target, angle, clamp)
    }

    pub fn status(&self) -> RigStatus {
        self.shared.rig.status()
    }

    pub fn apply_config(&self, config: &GroupConfig) -> Result<(), RigError> {
        self.shared.rig.apply_config(config)
    }
}

impl Shared {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn rejection(&self) -> Option<TriggerOutcome> {
        if self.is_paused() {
            Some(TriggerOutcome::Paused)
        } else if self.running.load(Ordering::SeqCst) {
            Some(TriggerOutcome::Busy)
        } else {
            None
        }
    }

    fn read_severity(&self) -> f64 {
        match self.detection.snapshot() {
            Ok(snapshot) => snapshot.effective_severity(),
            Err(e) => {
                warn!("Detection unavailable, treating as no target: {e:#}");
                0.0
            }
        }
    }

    fn enter(&self, state: SequenceState) {
        debug!("[{:?}] => [{state:?}]", self.state.get());
        self.state.set(state);
    }

    async fn run_sequence(&self, initial_severity: f64) -> SequenceReport {
        if self.is_paused() {
            return self.abort(false);
        }

        self.enter(SequenceState::CheckingImmediate);
        match self.spray_if_needed(initial_severity).await {
            Check::Sprayed(spray) => return self.finish(SequenceOutcome::SprayedImmediately, Some(spray)),
            Check::Paused => return self.abort(false),
            Check::NoTarget => {}
        }

        self.enter(SequenceState::LinkageRaised);
        self.rig.set_linkages(true, true);
        if !self.sleep_or_pause(self.rig.linkage_hold_time()).await {
            return self.abort(true);
        }
        match self.spray_if_needed(0.0).await {
            Check::Sprayed(spray) => {
                self.lower_linkage();
                return self.finish(SequenceOutcome::SprayedAtFullRaise, Some(spray));
            }
            Check::Paused => return self.abort(true),
            Check::NoTarget => {}
        }

        let stages = self.options.arm_stages.max(1);
        for stage in 1..=stages {
            if self.is_paused() {
                return self.abort(true);
            }
            self.enter(SequenceState::ArmStage(stage));
            self.rig.set_arm_height(f64::from(stage) / f64::from(stages), true);
            let settle = self.options.stage_settle();
            if !settle.is_zero() && !self.sleep_or_pause(settle).await {
                return self.abort(true);
            }
            match self.spray_if_needed(0.0).await {
                Check::Sprayed(spray) => {
                    self.lower_linkage();
                    return self.finish(SequenceOutcome::SprayedAtStage(stage), Some(spray));
                }
                Check::Paused => return self.abort(true),
                Check::NoTarget => {}
            }
        }

        self.lower_linkage();
        self.finish(SequenceOutcome::NoTarget, None)
    }

    async fn spray_if_needed(&self, severity_hint: f64) -> Check {
        if self.is_paused() {
            return Check::Paused;
        }
        let severity = self.read_severity().max(severity_hint);
        if severity <= 0.0 {
            return Check::NoTarget;
        }
        Check::Sprayed(self.spray(severity).await)
    }

    async fn spray(&self, severity: f64) -> SprayRecord {
        self.enter(SequenceState::Spraying);
        let duration = self.options.spray_duration(severity);
        info!("Spraying for {:.2}s (severity {severity:.2})", duration.as_secs_f64());

        let started = Instant::now();
        self.rig.set_pumps(true, true);
        let completed = self.sleep_or_pause(duration).await;
        self.rig.set_pumps(false, true);

        SprayRecord { sprayed_for: started.elapsed(), truncated: !completed }
    }

    /// Sleeps in `poll_interval` slices.  Returns false as soon as a pause is observed.
    async fn sleep_or_pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_paused() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(self.options.poll())).await;
        }
    }

    fn lower_linkage(&self) {
        self.rig.set_linkages(false, true);
    }

    fn abort(&self, linkage_raised: bool) -> SequenceReport {
        if linkage_raised {
            self.lower_linkage();
        }
        self.enter(SequenceState::Aborted);
        self.finish(SequenceOutcome::Aborted, None)
    }

    fn finish(&self, outcome: SequenceOutcome, spray: Option<SprayRecord>) -> SequenceReport {
        let report = SequenceReport {
            outcome,
            sprayed_for: spray.map_or(Duration::ZERO, |s| s.sprayed_for),
            truncated: spray.map_or(false, |s| s.truncated),
        };
        info!("Spray sequence finished: {report:?}");
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use futures_signals::signal::SignalExt;

    use crate::detection::{DetectionSnapshot, LatestDetection};
    use crate::servo_hal_factory::ServoHalFactory;
    use crate::servo_hal_mock::MockServoBus;
    use crate::servo_rig::{LINKAGE_RAISED_ANGLE, PUMP_ON_ANGLE};

    use super::*;

    const LINK: u32 = 15;
    const ARM: u32 = 14;
    const PUMP: u32 = 4;

    fn constant(severity: f64) -> impl DetectionSupplier {
        move || -> anyhow::Result<DetectionSnapshot> {
            if severity > 0.0 {
                Ok(DetectionSnapshot::active(severity, vec![]))
            } else {
                Ok(DetectionSnapshot::inactive("nothing in frame"))
            }
        }
    }

    async fn harness(bus: &MockServoBus, detection: impl DetectionSupplier + 'static) -> SpraySequencer {
        harness_with(bus, detection, &GroupConfig::default(), SequencerOptions::default()).await
    }

    async fn harness_with(
        bus: &MockServoBus,
        detection: impl DetectionSupplier + 'static,
        config: &GroupConfig,
        options: SequencerOptions,
    ) -> SpraySequencer {
        let factory = ServoHalFactory::with_mock_bus(bus.clone());
        let rig = Arc::new(ServoRig::new(config, factory).unwrap());
        // The rig has been sitting in its neutral pose for a while before the first cycle.
        tokio::time::advance(Duration::from_secs(1)).await;
        SpraySequencer::new(rig, detection, options).unwrap()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }

    fn assert_roughly(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(60);
        assert!(actual >= expected && actual <= expected + slack, "{actual:?} vs {expected:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_target_sprays_without_moving() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.6)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::SprayedImmediately);
        assert!(!report.truncated);
        assert_roughly(report.sprayed_for, Duration::from_secs(3));
        assert_eq!(bus.angles_for(PUMP), vec![0.0, PUMP_ON_ANGLE, 0.0]);
        let pump = bus.writes_for(PUMP);
        assert_roughly(pump[2].at.duration_since(pump[1].at), Duration::from_secs(3));
        assert_eq!(bus.angles_for(LINK), vec![0.0]);
        assert_eq!(bus.angles_for(ARM), vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_sweep_visits_every_stage() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.0)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::NoTarget);
        assert_eq!(report.sprayed_for, Duration::ZERO);
        assert_eq!(bus.angles_for(LINK), vec![0.0, LINKAGE_RAISED_ANGLE, 0.0]);
        assert_close(&bus.angles_for(ARM), &[0.0, 70.0 / 3.0, 140.0 / 3.0, 70.0]);
        assert_eq!(bus.angles_for(PUMP), vec![0.0]);

        let link = bus.writes_for(LINK);
        let arm = bus.writes_for(ARM);
        assert_roughly(arm[1].at.duration_since(link[1].at), Duration::from_secs(1));
        assert_eq!(sequencer.stage(), SequenceState::Idle);
        assert!(!sequencer.is_spraying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_channels_still_see_every_stage() {
        let bus = MockServoBus::new();
        let mut config = GroupConfig::default();
        config.defaults.command_interval_seconds = 5.0;
        let options = SequencerOptions { stage_settle_time: 0.0, ..Default::default() };
        let sequencer = harness_with(&bus, constant(0.0), &config, options).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert_eq!(sequencer.join().await.unwrap().outcome, SequenceOutcome::NoTarget);

        assert_eq!(bus.angles_for(LINK), vec![0.0, LINKAGE_RAISED_ANGLE, 0.0]);
        assert_close(&bus.angles_for(ARM), &[0.0, 70.0 / 3.0, 140.0 / 3.0, 70.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_time_spaces_out_the_stages() {
        let bus = MockServoBus::new();
        let options = SequencerOptions { stage_settle_time: 0.5, ..Default::default() };
        let sequencer = harness_with(&bus, constant(0.0), &GroupConfig::default(), options).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        sequencer.join().await.unwrap();

        let arm = bus.writes_for(ARM);
        assert_eq!(arm.len(), 4);
        assert_roughly(arm[2].at.duration_since(arm[1].at), Duration::from_millis(500));
        assert_roughly(arm[3].at.duration_since(arm[2].at), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_unrepresentable_timings() {
        let factory = ServoHalFactory::with_mock_bus(MockServoBus::new());
        let rig = Arc::new(ServoRig::new(&GroupConfig::default(), factory).unwrap());
        let options = SequencerOptions { max_spray_time: 1e20, ..Default::default() };
        assert!(matches!(
            SpraySequencer::new(rig, constant(0.5), options),
            Err(ConfigError::OutOfRange { field: "max_spray_time", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_found_mid_sweep_stops_the_sweep() {
        let bus = MockServoBus::new();
        let arm_view = bus.clone();
        // The target only comes into view once the arm is past the second stage height.
        let detection = move || -> anyhow::Result<DetectionSnapshot> {
            match arm_view.last_angle(ARM) {
                Some(angle) if angle > 40.0 => Ok(DetectionSnapshot::active(0.8, vec![])),
                _ => Ok(DetectionSnapshot::inactive("nothing in frame")),
            }
        };
        let sequencer = harness(&bus, detection).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::SprayedAtStage(2));
        assert_roughly(report.sprayed_for, Duration::from_secs(4));
        assert_close(&bus.angles_for(ARM), &[0.0, 70.0 / 3.0, 140.0 / 3.0]);
        assert_eq!(bus.angles_for(PUMP), vec![0.0, PUMP_ON_ANGLE, 0.0]);
        assert_eq!(bus.angles_for(LINK), vec![0.0, LINKAGE_RAISED_ANGLE, 0.0]);

        let pump_off = bus.writes_for(PUMP)[2].at;
        let link_down = bus.writes_for(LINK)[2].at;
        assert!(link_down >= pump_off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_during_hold_lowers_and_aborts() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.0)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(sequencer.stage(), SequenceState::LinkageRaised);
        sequencer.set_paused(true);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::Aborted);
        assert_eq!(bus.angles_for(LINK), vec![0.0, LINKAGE_RAISED_ANGLE, 0.0]);
        assert_eq!(bus.angles_for(ARM), vec![0.0]);
        assert_eq!(bus.angles_for(PUMP), vec![0.0]);
        assert_roughly(bus.writes_for(LINK)[2].at.duration_since(bus.writes_for(LINK)[1].at), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_mid_spray_truncates_and_shuts_pump() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(1.0)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sequencer.stage(), SequenceState::Spraying);
        sequencer.set_paused(true);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::SprayedImmediately);
        assert!(report.truncated);
        assert_roughly(report.sprayed_for, Duration::from_secs(1));
        assert_eq!(bus.last_angle(PUMP), Some(0.0));
        assert!(!sequencer.rig().pumps_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.6)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert!(sequencer.is_spraying());
        assert_eq!(sequencer.trigger_manual_spray(), TriggerOutcome::Busy);
        assert_eq!(sequencer.clone().trigger_automatic_cycle(), TriggerOutcome::Busy);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sequencer.trigger_manual_spray(), TriggerOutcome::Busy);

        sequencer.join().await.unwrap();
        assert!(!sequencer.is_spraying());
        assert_eq!(bus.angles_for(PUMP), vec![0.0, PUMP_ON_ANGLE, 0.0]);
        assert!(sequencer.join().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_controller_rejects_triggers() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.9)).await;
        sequencer.set_paused(true);
        assert!(sequencer.is_paused());

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Paused);
        assert_eq!(sequencer.trigger_manual_spray(), TriggerOutcome::Paused);
        assert!(sequencer.join().await.is_none());
        assert_eq!(bus.writes().len(), 3);

        sequencer.set_paused(false);
        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_spray_without_detection_uses_minimum_severity() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.0)).await;

        assert_eq!(sequencer.trigger_manual_spray(), TriggerOutcome::Started);
        let report = sequencer.join().await.unwrap();

        assert_eq!(report.outcome, SequenceOutcome::SprayedImmediately);
        assert_roughly(report.sprayed_for, Duration::from_millis(1500));
        assert_eq!(bus.angles_for(LINK), vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_backoff_throttles_empty_rescans() {
        let bus = MockServoBus::new();
        let latest = LatestDetection::new();
        let sequencer = harness(&bus, latest.clone()).await;

        assert_eq!(sequencer.idle_backoff_remaining(), Duration::ZERO);
        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert_eq!(sequencer.join().await.unwrap().outcome, SequenceOutcome::NoTarget);

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::IdleBackoff);
        assert_eq!(sequencer.idle_backoff_remaining(), Duration::from_secs(2));
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::IdleBackoff);

        // A visible target is never throttled.
        latest.publish(DetectionSnapshot::active(0.5, vec![]));
        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert_eq!(sequencer.join().await.unwrap().outcome, SequenceOutcome::SprayedImmediately);

        latest.publish(DetectionSnapshot::inactive("gone"));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_errors_count_as_no_target() {
        let bus = MockServoBus::new();
        let failing = || -> anyhow::Result<DetectionSnapshot> { Err(anyhow::anyhow!("camera unplugged")) };
        let sequencer = harness(&bus, failing).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert_eq!(sequencer.join().await.unwrap().outcome, SequenceOutcome::NoTarget);
        assert_eq!(bus.angles_for(PUMP), vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguring_mid_spray_forces_pumps_off() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(1.0)).await;

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(bus.last_angle(PUMP), Some(PUMP_ON_ANGLE));

        sequencer.apply_config(&GroupConfig::default()).unwrap();
        assert_eq!(bus.last_angle(PUMP), Some(0.0));
        assert!(sequencer.is_spraying());

        sequencer.join().await.unwrap();
        assert_eq!(bus.last_angle(PUMP), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_signal_follows_the_sweep() {
        let bus = MockServoBus::new();
        let options = SequencerOptions { stage_settle_time: 0.3, ..Default::default() };
        let sequencer = harness_with(&bus, constant(0.0), &GroupConfig::default(), options).await;
        let mut stages = sequencer.stage_signal().to_stream();
        assert_eq!(stages.next().await, Some(SequenceState::Idle));

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(stage) = stages.next().await {
                seen.push(stage);
                if stage == SequenceState::Idle {
                    break;
                }
            }
            seen
        });

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        sequencer.join().await.unwrap();
        let seen = observer.await.unwrap();

        assert_eq!(seen.last(), Some(&SequenceState::Idle));
        assert!(seen.contains(&SequenceState::LinkageRaised), "{seen:?}");
        assert!(seen.contains(&SequenceState::ArmStage(3)), "{seen:?}");
    }

    fn real_time_sequencer(
        bus: &MockServoBus,
        config: &GroupConfig,
        detection: impl DetectionSupplier + 'static,
        options: SequencerOptions,
    ) -> SpraySequencer {
        let factory = ServoHalFactory::with_mock_bus(bus.clone());
        let rig = Arc::new(ServoRig::new(config, factory).unwrap());
        SpraySequencer::new(rig, detection, options).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_triggers_start_exactly_one_sequence() {
        let bus = MockServoBus::new();
        let options = SequencerOptions { max_spray_time: 0.2, ..Default::default() };
        let sequencer = real_time_sequencer(&bus, &GroupConfig::default(), constant(0.6), options);

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let callers: Vec<_> = (0..8)
            .map(|i| {
                let (sequencer, barrier) = (sequencer.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    if i % 2 == 0 {
                        sequencer.trigger_automatic_cycle()
                    } else {
                        sequencer.trigger_manual_spray()
                    }
                })
            })
            .collect();
        let mut outcomes = Vec::new();
        for caller in callers {
            outcomes.push(caller.await.unwrap());
        }

        let started = outcomes.iter().filter(|o| **o == TriggerOutcome::Started).count();
        assert_eq!(started, 1, "{outcomes:?}");
        assert!(outcomes.iter().all(|o| matches!(o, TriggerOutcome::Started | TriggerOutcome::Busy)));
        sequencer.join().await.unwrap();
        assert_eq!(bus.angles_for(PUMP), vec![0.0, PUMP_ON_ANGLE, 0.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_writes_never_overlap_sweep_writes() {
        let bus = MockServoBus::new();
        bus.set_write_latency(Duration::from_millis(2));
        let config = GroupConfig { linkage_hold_time: 0.05, ..Default::default() };
        let options = SequencerOptions { stage_settle_time: 0.02, ..Default::default() };
        let sequencer = real_time_sequencer(&bus, &config, constant(0.0), options);

        let stop = Arc::new(AtomicBool::new(false));
        let operator = {
            let (sequencer, stop) = (sequencer.clone(), stop.clone());
            tokio::task::spawn_blocking(move || {
                let pump: ManualTarget = "Pump:4".parse().unwrap();
                let mut angle = 0.0;
                while !stop.load(Ordering::SeqCst) {
                    angle = if angle == 0.0 { 10.0 } else { 0.0 };
                    assert!(sequencer.set_manual_angle(&pump, angle, None));
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        assert_eq!(sequencer.trigger_automatic_cycle(), TriggerOutcome::Started);
        assert_eq!(sequencer.join().await.unwrap().outcome, SequenceOutcome::NoTarget);
        stop.store(true, Ordering::SeqCst);
        operator.await.unwrap();

        assert!(bus.angles_for(PUMP).len() > 3);
        assert_eq!(bus.angles_for(ARM).len(), 4);
        assert_eq!(bus.max_concurrent_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override_passes_through() {
        let bus = MockServoBus::new();
        let sequencer = harness(&bus, constant(0.0)).await;
        let targets = sequencer.list_targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(sequencer.status().to_string(), "3/3 servos active");

        let arm: ManualTarget = "Arm:14".parse().unwrap();
        assert!(sequencer.set_manual_angle(&arm, 80.0, Some(ManualClamp::new(0.0, 45.0))));
        assert_eq!(bus.last_angle(ARM), Some(45.0));
    }
}
