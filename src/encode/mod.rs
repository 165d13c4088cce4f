//! Encoder stage
//!
//! Video and audio are encoded independently; each path produces timestamped
//! compressed access units for the network sender.

pub mod audio;
pub mod video;

pub use audio::OpusAudioEncoder;
pub use video::H264VideoEncoder;
