pub mod detection;
pub mod pi;
pub mod rig_config;
pub mod servo_channel;
pub mod servo_hal;
pub mod servo_hal_factory;
pub mod servo_hal_mock;
pub mod servo_rig;
pub mod spray_sequencer;
