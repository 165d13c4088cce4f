//! Pluggable media sources for the playback controller
//!
//! The controller owns lifecycle, buffering and reporting; where the bytes
//! come from is behind [`MediaSource`]. The synthetic source exists for tests
//! and demos and needs no network or hardware.

use std::time::Duration;

use crate::errors::Result;
use crate::types::{AudioFrame, NaturalSize, VideoFrame};

/// What a source learned about the content while opening it
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Total duration in seconds; 0.0 means live, unbounded
    pub duration_secs: f64,
    pub natural_size: NaturalSize,
    /// Address of the server actually serving the content, when known
    pub server_address: Option<String>,
}

impl SourceInfo {
    pub fn is_live(&self) -> bool {
        self.duration_secs == 0.0
    }
}

/// One unit of demuxed media
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub pts: f64,
    /// Size of the chunk as it came off the source, for download accounting
    pub byte_len: usize,
    pub data: ChunkData,
}

#[derive(Debug, Clone)]
pub enum ChunkData {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// A demuxed content source the player can drain
pub trait MediaSource: Send {
    /// Open the source; must return within `timeout`
    fn open(&mut self, timeout: Duration) -> Result<SourceInfo>;

    /// Pull the next chunk in presentation order; `None` means end of content
    /// (live sources never return `None` on their own)
    fn read(&mut self) -> Result<Option<MediaChunk>>;
}

/// Deterministic gradient-video/silent-audio source
///
/// Produces frames at the configured rate instantly; pacing is the player's
/// job. `duration_secs` of 0.0 makes it live and endless.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: u32,
    duration_secs: f64,
    frame_index: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32, duration_secs: f64) -> Self {
        Self { width, height, fps, duration_secs, frame_index: 0 }
    }

    pub fn live(width: u32, height: u32, fps: u32) -> Self {
        Self::new(width, height, fps, 0.0)
    }
}

impl MediaSource for SyntheticSource {
    fn open(&mut self, _timeout: Duration) -> Result<SourceInfo> {
        self.frame_index = 0;
        Ok(SourceInfo {
            duration_secs: self.duration_secs,
            natural_size: NaturalSize { width: self.width, height: self.height },
            server_address: Some("synthetic:0".to_string()),
        })
    }

    fn read(&mut self) -> Result<Option<MediaChunk>> {
        let pts = self.frame_index as f64 / self.fps as f64;
        if self.duration_secs > 0.0 && pts >= self.duration_secs {
            return Ok(None);
        }
        let frame = crate::testing::gradient_frame(self.width, self.height, self.frame_index, pts);
        self.frame_index += 1;
        Ok(Some(MediaChunk {
            pts,
            byte_len: frame.data.len(),
            data: ChunkData::Video(frame),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_source_ends() {
        let mut source = SyntheticSource::new(32, 16, 10, 0.5);
        let info = source.open(Duration::from_secs(1)).unwrap();
        assert!(!info.is_live());
        let mut chunks = 0;
        while source.read().unwrap().is_some() {
            chunks += 1;
        }
        assert_eq!(chunks, 5); // 0.5 s at 10 fps
    }

    #[test]
    fn test_live_source_keeps_producing() {
        let mut source = SyntheticSource::live(32, 16, 10);
        let info = source.open(Duration::from_secs(1)).unwrap();
        assert!(info.is_live());
        for _ in 0..100 {
            assert!(source.read().unwrap().is_some());
        }
    }

    #[test]
    fn test_chunk_timestamps_advance() {
        let mut source = SyntheticSource::live(32, 16, 20);
        source.open(Duration::from_secs(1)).unwrap();
        let a = source.read().unwrap().unwrap();
        let b = source.read().unwrap().unwrap();
        assert!((b.pts - a.pts - 0.05).abs() < 1e-9);
    }
}
