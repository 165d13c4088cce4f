//! livecast: RTMP live-streaming and playback engine
//!
//! This crate implements the full publish pipeline for live video: callers
//! push raw frames, the engine mixes audio, encodes H.264 and Opus, and
//! publishes over RTMP with adaptive bitrate control. A playback controller
//! covers the viewer side's lifecycle and buffer model.
//!
//! # Features
//! - RTMP publishing (handshake, chunk stream, AMF0 command flow)
//! - H.264 video encoding with GOP control and live bitrate retuning
//! - Opus audio encoding at fixed 20 ms cadence
//! - Microphone/background-music mixing with reverb and mute
//! - Adaptive bitrate reacting to send-queue congestion
//! - Lifecycle state machines with explicit observer registration
//! - Playback controller with stall accounting and live catch-up
//!
//! # Usage
//! ```rust,no_run
//! use livecast::{Streamer, StreamConfig};
//!
//! fn main() -> livecast::Result<()> {
//!     livecast::init_logging();
//!     let mut streamer = Streamer::new(StreamConfig::default())?;
//!     streamer.start_stream("rtmp://ingest.example.com/live/my-key")?;
//!     // push frames with streamer.push_video / streamer.push_audio ...
//!     streamer.stop_stream()?;
//!     Ok(())
//! }
//! ```

pub mod bitrate;
pub mod clock;
pub mod config;
pub mod encode;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod mixer;
pub mod net;
pub mod player;
pub mod stats;
pub mod streamer;
pub mod types;

// Testing utilities - synthetic data for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::{PlayerConfig, StreamConfig};
pub use errors::{Result, StreamError};
pub use events::{NetStateCode, StreamErrorCode, StreamEvent, StreamState};
pub use player::{LoadState, PlaybackState, Player, PlayerEvent, SyntheticSource};
pub use stats::TelemetrySnapshot;
pub use streamer::Streamer;
pub use types::{AudioFrame, NaturalSize, ScalingMode, VideoCodec, VideoFrame};

/// Initialize logging for the streaming engine
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "livecast=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "livecast");
        assert!(!info.version.is_empty());
    }

    #[test]
    fn test_init_logging_idempotent() {
        init_logging();
        init_logging();
    }
}
