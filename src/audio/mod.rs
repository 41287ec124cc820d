//! Audio pipelines: capture (microphone → blocks), playback (network
//! bytes → speaker), and the sample codec shared by both.

pub mod capture;
pub mod codec;
#[cfg(feature = "cpal-audio")]
pub mod device;
pub mod playback;
pub mod ring;
