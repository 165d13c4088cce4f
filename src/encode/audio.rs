//! Opus audio encoder
//!
//! Accumulates pushed PCM buffers into fixed 20 ms Opus frames at 48 kHz.
//! The audio bitrate is fixed for the lifetime of a stream; only the video
//! path adapts to the network.

use opus::{Application, Bitrate, Channels, Encoder};

use crate::errors::{Result, StreamError};
use crate::types::{AudioFrame, EncodedAudioFrame};

/// Opus frame size in samples per channel at 48 kHz (20 ms)
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Maximum size of a single Opus packet
const MAX_PACKET_BYTES: usize = 4000;

pub struct OpusAudioEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    sample_buffer: Vec<f32>,
    /// Timestamp of the first sample ever buffered; later packet timestamps
    /// are derived from the encoded-sample count to avoid jitter accumulation
    base_pts: Option<f64>,
    samples_encoded: u64,
    packet_buf: Vec<u8>,
}

impl OpusAudioEncoder {
    /// Create a new encoder
    ///
    /// `sample_rate` must be 48000 and `channels` 1 or 2; `kbps` is the fixed
    /// target bitrate.
    pub fn new(sample_rate: u32, channels: u16, kbps: u32) -> Result<Self> {
        if sample_rate != 48_000 {
            return Err(StreamError::AudioEncoding(
                "Opus requires a 48000 Hz sample rate".to_string(),
            ));
        }
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(StreamError::AudioEncoding(format!(
                    "unsupported channel count: {}",
                    n
                )))
            }
        };

        let mut encoder = Encoder::new(sample_rate, opus_channels, Application::Audio)
            .map_err(|e| StreamError::AudioEncoding(format!("failed to create encoder: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::Bits((kbps * 1000) as i32))
            .map_err(|e| StreamError::AudioEncoding(format!("failed to set bitrate: {}", e)))?;

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            sample_buffer: Vec::with_capacity(OPUS_FRAME_SAMPLES * channels as usize * 2),
            base_pts: None,
            samples_encoded: 0,
            packet_buf: vec![0u8; MAX_PACKET_BYTES],
        })
    }

    /// Encode a pushed PCM buffer
    ///
    /// Returns zero packets when not enough samples have accumulated, and more
    /// than one when the input spans several 20 ms frames.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<EncodedAudioFrame>> {
        if frame.sample_rate != self.sample_rate {
            return Err(StreamError::AudioEncoding(format!(
                "sample rate mismatch: expected {}, got {}",
                self.sample_rate, frame.sample_rate
            )));
        }
        if frame.channels != self.channels {
            return Err(StreamError::AudioEncoding(format!(
                "channel count mismatch: expected {}, got {}",
                self.channels, frame.channels
            )));
        }

        if self.base_pts.is_none() && !frame.samples.is_empty() {
            self.base_pts = Some(frame.pts);
        }
        self.sample_buffer.extend_from_slice(&frame.samples);

        self.drain_full_frames()
    }

    /// Encode any buffered tail, zero-padded to a full frame
    pub fn flush(&mut self) -> Result<Vec<EncodedAudioFrame>> {
        if self.sample_buffer.is_empty() {
            return Ok(Vec::new());
        }
        let samples_per_frame = OPUS_FRAME_SAMPLES * self.channels as usize;
        let rem = self.sample_buffer.len() % samples_per_frame;
        if rem != 0 {
            self.sample_buffer.extend(std::iter::repeat(0.0f32).take(samples_per_frame - rem));
        }
        self.drain_full_frames()
    }

    fn drain_full_frames(&mut self) -> Result<Vec<EncodedAudioFrame>> {
        let samples_per_frame = OPUS_FRAME_SAMPLES * self.channels as usize;
        let frame_duration = OPUS_FRAME_SAMPLES as f64 / self.sample_rate as f64;
        let mut packets = Vec::new();

        while self.sample_buffer.len() >= samples_per_frame {
            let frame_samples: Vec<f32> = self.sample_buffer.drain(..samples_per_frame).collect();
            let pts = self.base_pts.unwrap_or(0.0)
                + self.samples_encoded as f64 / self.sample_rate as f64;

            let len = self
                .encoder
                .encode_float(&frame_samples, &mut self.packet_buf)
                .map_err(|e| StreamError::AudioEncoding(format!("encoding failed: {}", e)))?;

            packets.push(EncodedAudioFrame {
                data: self.packet_buf[..len].to_vec(),
                pts,
                duration: frame_duration,
            });
            self.samples_encoded += OPUS_FRAME_SAMPLES as u64;
        }

        Ok(packets)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}
