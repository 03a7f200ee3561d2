use derive_new::new;
use futures_signals::signal::{Mutable, MutableSignalCloned};
use serde::{Deserialize, Serialize};

#[derive(new, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectionBox {
  pub x1: i32,
  pub y1: i32,
  pub x2: i32,
  pub y2: i32,
  pub confidence: f64,
  pub label: String,
}

/// Latest result of the external detector.  The boxes are only carried through for overlays.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectionSnapshot {
  pub severity: f64,
  pub boxes: Vec<DetectionBox>,
  pub active: bool,
  pub reason: String,
}

impl Default for DetectionSnapshot {
  fn default() -> Self {
    Self::inactive("No detection yet")
  }
}

impl DetectionSnapshot {
  pub fn active(severity: f64, boxes: Vec<DetectionBox>) -> Self {
    Self { severity, boxes, active: true, reason: String::from("Detections available") }
  }

  pub fn inactive(reason: impl Into<String>) -> Self {
    Self { severity: 0.0, boxes: Vec::new(), active: false, reason: reason.into() }
  }

  /// Severity the sequencer acts on.  Inactive or garbage snapshots mean "no target".
  pub fn effective_severity(&self) -> f64 {
    if !self.active || !self.severity.is_finite() || self.severity <= 0.0 {
      0.0
    } else {
      self.severity.min(1.0)
    }
  }
}

/// Non-blocking source of the most recent detection.  Implementations must return immediately
/// with whatever they last computed; inference never happens on this call.
pub trait DetectionSupplier: Send + Sync {
  fn snapshot(&self) -> anyhow::Result<DetectionSnapshot>;
}

impl<F> DetectionSupplier for F
where
    F: Fn() -> anyhow::Result<DetectionSnapshot> + Send + Sync,
{
  fn snapshot(&self) -> anyhow::Result<DetectionSnapshot> {
    (self)()
  }
}

/// Most-recent-value cell an inference loop publishes into.
#[derive(Clone, Default)]
pub struct LatestDetection {
  reading: Mutable<DetectionSnapshot>,
}

impl LatestDetection {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn publish(&self, snapshot: DetectionSnapshot) {
    self.reading.set(snapshot);
  }

  pub fn get(&self) -> DetectionSnapshot {
    self.reading.get_cloned()
  }

  pub fn signal(&self) -> MutableSignalCloned<DetectionSnapshot> {
    self.reading.signal_cloned()
  }
}

impl DetectionSupplier for LatestDetection {
  fn snapshot(&self) -> anyhow::Result<DetectionSnapshot> {
    Ok(self.get())
  }
}
