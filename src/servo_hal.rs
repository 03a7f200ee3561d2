use thiserror::Error;

#[derive(Error, PartialEq, Clone, Debug)]
pub enum HalError {
  #[error("{0}")]
  DeviceNotConnected(String),
  #[error("{0}")]
  InternalError(String),
}

impl From<std::io::Error> for HalError {
  fn from(e: std::io::Error) -> Self {
    HalError::InternalError(e.to_string())
  }
}

pub type HalResult<T> = Result<T, HalError>;

/// A single bound servo output.  Angles handed to the HAL are already calibrated and clamped.
pub trait ServoHal: Send {
  fn set_angle(&mut self, angle_degrees: f64) -> HalResult<()>;
  fn detach(&mut self) -> HalResult<()>;
}
