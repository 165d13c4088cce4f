//! Configuration for the streaming engine and the playback controller
//!
//! `StreamConfig` carries everything the encoder stage, the bitrate controller
//! and the network sender need. Values are validated once, when a stream
//! starts; they are frozen for the lifetime of the session.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StreamError};
use crate::types::{ScalingMode, VideoCodec};

/// Valid video frame-rate range, frames per second
pub const FPS_RANGE: std::ops::RangeInclusive<u32> = 1..=30;

/// Streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Video frames per second, valid range 1..=30.
    ///
    /// The caller should push video frames at this cadence.
    pub video_fps: u32,
    /// Video codec used by the encoder stage
    pub video_codec: VideoCodec,
    /// Video bitrate at stream start, kbit/s
    pub video_init_bitrate: u32,
    /// Upper bound of the adaptive bitrate envelope, kbit/s
    pub video_max_bitrate: u32,
    /// Lower bound of the adaptive bitrate envelope, kbit/s
    pub video_min_bitrate: u32,
    /// Maximum keyframe (GOP) interval in seconds
    pub max_key_interval_secs: f64,
    /// Audio target bitrate, kbit/s
    pub audio_kbps: u32,
    /// Audio sample rate in Hz; the Opus encoder requires 48000
    pub audio_sample_rate: u32,
    /// Audio channel count, 1 or 2
    pub audio_channels: u16,
    /// Adjust the video bitrate from observed network throughput
    pub auto_adjust_bitrate: bool,
    /// Video width in pixels (must be even)
    pub width: u32,
    /// Video height in pixels (must be even)
    pub height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            video_fps: 15,
            video_codec: VideoCodec::H264,
            video_init_bitrate: 600,
            video_max_bitrate: 800,
            video_min_bitrate: 200,
            max_key_interval_secs: 2.0,
            audio_kbps: 48,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            auto_adjust_bitrate: false,
            width: 640,
            height: 360,
        }
    }
}

impl StreamConfig {
    /// Validate ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if !FPS_RANGE.contains(&self.video_fps) {
            return Err(StreamError::InvalidConfig(format!(
                "video_fps {} outside valid range [1, 30]",
                self.video_fps
            )));
        }
        if self.video_min_bitrate == 0 {
            return Err(StreamError::InvalidConfig("video_min_bitrate must be > 0".into()));
        }
        if self.video_min_bitrate > self.video_max_bitrate {
            return Err(StreamError::InvalidConfig(format!(
                "bitrate envelope inverted: min {} > max {}",
                self.video_min_bitrate, self.video_max_bitrate
            )));
        }
        if self.video_init_bitrate < self.video_min_bitrate
            || self.video_init_bitrate > self.video_max_bitrate
        {
            return Err(StreamError::InvalidConfig(format!(
                "video_init_bitrate {} outside envelope [{}, {}]",
                self.video_init_bitrate, self.video_min_bitrate, self.video_max_bitrate
            )));
        }
        if self.max_key_interval_secs <= 0.0 {
            return Err(StreamError::InvalidConfig("max_key_interval_secs must be positive".into()));
        }
        if self.audio_kbps == 0 {
            return Err(StreamError::InvalidConfig("audio_kbps must be > 0".into()));
        }
        if self.audio_channels != 1 && self.audio_channels != 2 {
            return Err(StreamError::InvalidConfig(format!(
                "audio_channels must be 1 or 2, got {}",
                self.audio_channels
            )));
        }
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "video dimensions must be even and non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Initial bitrate clamped into the [min, max] envelope
    pub fn clamped_init_bitrate(&self) -> u32 {
        self.video_init_bitrate
            .clamp(self.video_min_bitrate, self.video_max_bitrate)
    }

    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| StreamError::InvalidConfig(format!("failed to read config file: {}", e)))?;
        let config: StreamConfig = toml::from_str(&contents)
            .map_err(|e| StreamError::InvalidConfig(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        log::info!("loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StreamError::InvalidConfig(format!("failed to create config dir: {}", e)))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| StreamError::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        fs::write(path, contents)
            .map_err(|e| StreamError::InvalidConfig(format!("failed to write config file: {}", e)))?;
        Ok(())
    }
}

/// Playback controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Start playing as soon as the content can play through uninterrupted
    pub should_autoplay: bool,
    /// How content scales to fit the caller's view
    pub scaling_mode: ScalingMode,
    /// Maximum buffered depth for live streams in seconds.
    ///
    /// When buffered content exceeds this depth the player skips forward to
    /// stay close to the live edge. Negative disables catch-up.
    pub buffer_time_max_secs: f64,
    /// Source open timeout in seconds
    pub timeout_secs: u64,
    /// Tee raw stream bytes to this path while playing
    pub save_local_path: Option<PathBuf>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            should_autoplay: true,
            scaling_mode: ScalingMode::AspectFit,
            buffer_time_max_secs: 2.0,
            timeout_secs: 30,
            save_local_path: None,
        }
    }
}
