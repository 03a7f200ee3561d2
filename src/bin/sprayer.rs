//! Drive the sprayer rig from the command line.
//!
//! Without a detector attached this uses a stand-in detection source (a fixed severity or random
//! hits), which is enough to exercise the linkage, arm and pumps on the bench:
//!
//! ```text
//! sprayer --fake-hw --simulate-severity 0.6 --cycles 1
//! sprayer --list-targets
//! sprayer --target Arm:14 --angle 45 --clamp-min 0 --clamp-max 60
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use log::{info, warn};
use rand::Rng;
use tokio::time::{interval, MissedTickBehavior};

use pest_sprayer::detection::{DetectionSnapshot, LatestDetection};
use pest_sprayer::rig_config::SprayerConfig;
use pest_sprayer::servo_hal_factory::ServoHalFactory;
use pest_sprayer::servo_rig::{ManualClamp, ManualTarget, ServoRig};
use pest_sprayer::spray_sequencer::{SpraySequencer, TriggerOutcome};

const SCHEDULER_TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[clap(name = "sprayer")]
struct Opts {
    #[clap(long, default_value = "config.json")]
    config: PathBuf,

    #[clap(long)]
    fake_hw: bool,

    /// Pretend the detector constantly reports this severity.
    #[clap(long)]
    simulate_severity: Option<f64>,

    /// Pretend the detector sees a target now and then.
    #[clap(long)]
    random_detections: bool,

    /// Stop after this many sequences have run.
    #[clap(long)]
    cycles: Option<usize>,

    #[clap(long)]
    manual_spray: bool,

    #[clap(long)]
    list_targets: bool,

    /// Manual override: servo to move, written Role:pin.
    #[clap(long)]
    target: Option<String>,

    #[clap(long, allow_hyphen_values = true)]
    angle: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    clamp_min: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    clamp_max: Option<f64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    let config = SprayerConfig::load_or_create(&opts.config)?;
    let factory = ServoHalFactory::new_maybe_mock(opts.fake_hw);
    if factory.is_mock() {
        info!("Using mock servos");
    }
    let rig = ServoRig::new(&config.servo_pins, factory)?;
    info!("{}", rig.status());
    for (target, error) in rig.init_errors() {
        warn!("{target}: {error}");
    }

    if opts.list_targets {
        for target in rig.list_targets() {
            println!("{target}");
        }
        return Ok(());
    }

    if let Some(target) = &opts.target {
        let result = set_angle(&rig, target, &opts);
        rig.shutdown();
        return result;
    }

    let detection = LatestDetection::new();
    let sequencer = SpraySequencer::new(rig.into(), detection.clone(), config.sequencer.clone())?;
    let outcome = if opts.manual_spray {
        run_manual_spray(&sequencer).await
    } else {
        run_scheduler(&sequencer, &detection, &opts).await
    };

    sequencer.set_paused(true);
    sequencer.join().await;
    sequencer.rig().shutdown();
    outcome
}

fn set_angle(rig: &ServoRig, target: &str, opts: &Opts) -> anyhow::Result<()> {
    let target: ManualTarget = target.parse()?;
    let angle = opts.angle.ok_or_else(|| anyhow!("--target needs an --angle"))?;
    let clamp = match (opts.clamp_min, opts.clamp_max) {
        (None, None) => None,
        (min, max) => Some(ManualClamp::new(min.unwrap_or(f64::MIN), max.unwrap_or(f64::MAX))),
    };
    if !rig.set_manual_angle_clamped(&target, angle, clamp) {
        return Err(anyhow!("{target} rejected angle {angle}"));
    }
    println!("{target} -> {angle}");
    Ok(())
}

async fn run_manual_spray(sequencer: &SpraySequencer) -> anyhow::Result<()> {
    match sequencer.trigger_manual_spray() {
        TriggerOutcome::Started => {
            let report = sequencer.join().await.ok_or_else(|| anyhow!("spray worker died"))?;
            println!("{report:?}");
            Ok(())
        }
        other => Err(anyhow!("manual spray not started: {other:?}")),
    }
}

async fn run_scheduler(sequencer: &SpraySequencer, detection: &LatestDetection, opts: &Opts) -> anyhow::Result<()> {
    let mut ticker = interval(SCHEDULER_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut completed = 0;
    let mut was_spraying = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = &mut ctrl_c => {
                info!("Interrupted, parking the rig...");
                return Ok(());
            },
        }

        if was_spraying && !sequencer.is_spraying() {
            completed += 1;
            if opts.cycles.map_or(false, |limit| completed >= limit) {
                info!("Completed {completed} sequences");
                return Ok(());
            }
        }
        was_spraying = sequencer.is_spraying();
        if was_spraying {
            continue;
        }

        detection.publish(simulated_detection(opts));
        if sequencer.trigger_automatic_cycle() == TriggerOutcome::Started {
            was_spraying = true;
        }
    }
}

fn simulated_detection(opts: &Opts) -> DetectionSnapshot {
    if let Some(severity) = opts.simulate_severity {
        return DetectionSnapshot::active(severity, vec![]);
    }
    if opts.random_detections {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.2) {
            return DetectionSnapshot::active(rng.gen_range(0.3..1.0), vec![]);
        }
        return DetectionSnapshot::active(0.0, vec![]);
    }
    DetectionSnapshot::inactive("No detector attached")
}
