//! Background music track player
//!
//! Decodes a WAV file into PCM once at start and serves samples to the mixer
//! at mic cadence. Supports looping, pause/resume, and end-of-track reporting.

use std::path::Path;

use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BgmState {
    Stopped,
    Playing,
    Paused,
}

pub struct BgmTrack {
    /// Interleaved f32 PCM at the mixer's sample rate and channel count
    samples: Vec<f32>,
    channels: u16,
    position: usize,
    looping: bool,
    state: BgmState,
}

impl BgmTrack {
    /// Load a WAV file and prepare it for mixing
    ///
    /// The file's sample rate must match `sample_rate`; channel layout is
    /// adapted (mono is duplicated, stereo is downmixed) to `channels`.
    pub fn load<P: AsRef<Path>>(
        path: P,
        sample_rate: u32,
        channels: u16,
        looping: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| StreamError::Mixer(format!("failed to open bgm file {:?}: {}", path, e)))?;
        let spec = reader.spec();

        if spec.sample_rate != sample_rate {
            return Err(StreamError::Mixer(format!(
                "bgm sample rate {} does not match stream rate {}",
                spec.sample_rate, sample_rate
            )));
        }
        if spec.channels == 0 || spec.channels > 2 {
            return Err(StreamError::Mixer(format!(
                "bgm channel count {} unsupported",
                spec.channels
            )));
        }

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| StreamError::Mixer(format!("failed to decode bgm: {}", e)))?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u32 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| StreamError::Mixer(format!("failed to decode bgm: {}", e)))?
            }
        };

        let samples = convert_channels(&raw, spec.channels, channels);
        if samples.is_empty() {
            return Err(StreamError::Mixer(format!("bgm file {:?} contains no audio", path)));
        }

        log::info!(
            "loaded bgm {:?}: {} samples, {} ch, loop={}",
            path,
            samples.len() / channels as usize,
            channels,
            looping
        );

        Ok(Self {
            samples,
            channels,
            position: 0,
            looping,
            state: BgmState::Playing,
        })
    }

    pub fn pause(&mut self) {
        if self.state == BgmState::Playing {
            self.state = BgmState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == BgmState::Paused {
            self.state = BgmState::Playing;
        }
    }

    pub fn stop(&mut self) {
        self.state = BgmState::Stopped;
        self.position = 0;
    }

    pub fn is_playing(&self) -> bool {
        self.state == BgmState::Playing
    }

    pub fn is_active(&self) -> bool {
        self.state != BgmState::Stopped
    }

    /// Fill `out` with the next slice of the track
    ///
    /// Paused or stopped tracks contribute silence. Returns `true` when a
    /// non-looping track reached its end during this call.
    pub fn fill(&mut self, out: &mut [f32]) -> bool {
        debug_assert_eq!(out.len() % self.channels as usize, 0);
        if self.state != BgmState::Playing {
            out.fill(0.0);
            return false;
        }

        let mut finished = false;
        let mut written = 0;
        while written < out.len() {
            let available = self.samples.len() - self.position;
            if available == 0 {
                if self.looping {
                    self.position = 0;
                    continue;
                }
                self.state = BgmState::Stopped;
                self.position = 0;
                finished = true;
                break;
            }
            let take = available.min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&self.samples[self.position..self.position + take]);
            self.position += take;
            written += take;
        }
        out[written..].fill(0.0);
        finished
    }
}

fn convert_channels(input: &[f32], from: u16, to: u16) -> Vec<f32> {
    match (from, to) {
        (a, b) if a == b => input.to_vec(),
        (1, 2) => input.iter().flat_map(|&s| [s, s]).collect(),
        (2, 1) => input.chunks_exact(2).map(|p| (p[0] + p[1]) * 0.5).collect(),
        _ => input.to_vec(),
    }
}
