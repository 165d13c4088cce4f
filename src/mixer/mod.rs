//! Audio mixer
//!
//! Combines microphone audio with an optional looping background-music track
//! at independent gains before encoding. Mute substitutes silence instead of
//! suppressing buffers, so the encoder timeline never gaps.

pub mod bgm;

use std::path::Path;

use crate::errors::{Result, StreamError};
use crate::types::AudioFrame;
use bgm::BgmTrack;

/// Highest supported reverb level
pub const MAX_REVERB_LEVEL: u8 = 4;

type FinishCallback = Box<dyn Fn() + Send>;

pub struct AudioMixer {
    sample_rate: u32,
    channels: u16,
    mic_gain: f32,
    bgm_gain: f32,
    mixing_enabled: bool,
    muted: bool,
    bgm: Option<BgmTrack>,
    bgm_finish: Option<FinishCallback>,
    reverb: Option<Reverb>,
    scratch: Vec<f32>,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            mic_gain: 1.0,
            bgm_gain: 1.0,
            mixing_enabled: true,
            muted: false,
            bgm: None,
            bgm_finish: None,
            reverb: None,
            scratch: Vec::new(),
        }
    }

    /// Start playing a background track from a WAV file
    pub fn start_bgm<P: AsRef<Path>>(&mut self, path: P, looping: bool) -> Result<()> {
        let track = BgmTrack::load(path, self.sample_rate, self.channels, looping)?;
        self.bgm = Some(track);
        Ok(())
    }

    pub fn stop_bgm(&mut self) {
        if let Some(ref mut track) = self.bgm {
            track.stop();
        }
        self.bgm = None;
    }

    pub fn pause_bgm(&mut self) {
        if let Some(ref mut track) = self.bgm {
            track.pause();
        }
    }

    pub fn resume_bgm(&mut self) {
        if let Some(ref mut track) = self.bgm {
            track.resume();
        }
    }

    pub fn bgm_active(&self) -> bool {
        self.bgm.as_ref().map(|t| t.is_active()).unwrap_or(false)
    }

    /// Register the callback fired when a non-looping track ends
    ///
    /// Effective for tracks started after this call or still playing.
    pub fn set_bgm_finish_callback<F: Fn() + Send + 'static>(&mut self, callback: F) {
        self.bgm_finish = Some(Box::new(callback));
    }

    /// Microphone gain, clamped to [0, 1]
    pub fn set_mic_volume(&mut self, volume: f32) {
        self.mic_gain = volume.clamp(0.0, 1.0);
    }

    /// Background music gain, clamped to [0, 1]
    pub fn set_bgm_volume(&mut self, volume: f32) {
        self.bgm_gain = volume.clamp(0.0, 1.0);
    }

    pub fn set_mixing_enabled(&mut self, enabled: bool) {
        self.mixing_enabled = enabled;
    }

    /// Mute the outgoing mix; cadence is preserved
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Enable reverberation on the microphone path, level 1..=4
    pub fn enable_reverb(&mut self, level: u8) -> Result<()> {
        if level == 0 || level > MAX_REVERB_LEVEL {
            return Err(StreamError::Mixer(format!(
                "reverb level {} outside valid range [1, {}]",
                level, MAX_REVERB_LEVEL
            )));
        }
        self.reverb = Some(Reverb::new(self.sample_rate, self.channels, level));
        Ok(())
    }

    pub fn disable_reverb(&mut self) {
        self.reverb = None;
    }

    /// Mix one microphone buffer in place
    ///
    /// Applies reverb to the mic path, folds in the background track when
    /// mixing is enabled, clamps to [-1, 1], and silences everything under
    /// mute. Fires the bgm finish callback when a non-looping track ends here.
    pub fn process(&mut self, frame: &mut AudioFrame) -> Result<()> {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            return Err(StreamError::Mixer(format!(
                "mic format {}Hz/{}ch does not match mixer {}Hz/{}ch",
                frame.sample_rate, frame.channels, self.sample_rate, self.channels
            )));
        }

        if self.muted {
            frame.samples.fill(0.0);
            // Keep the bgm position advancing so resume-from-mute stays in sync.
            if let Some(ref mut track) = self.bgm {
                self.scratch.resize(frame.samples.len(), 0.0);
                if track.fill(&mut self.scratch) {
                    self.fire_bgm_finished();
                }
            }
            return Ok(());
        }

        if let Some(ref mut reverb) = self.reverb {
            reverb.process(&mut frame.samples);
        }

        for sample in frame.samples.iter_mut() {
            *sample *= self.mic_gain;
        }

        if self.mixing_enabled {
            if let Some(ref mut track) = self.bgm {
                self.scratch.resize(frame.samples.len(), 0.0);
                let finished = track.fill(&mut self.scratch);
                for (out, &bgm) in frame.samples.iter_mut().zip(self.scratch.iter()) {
                    *out += bgm * self.bgm_gain;
                }
                if finished {
                    self.fire_bgm_finished();
                }
            }
        }

        for sample in frame.samples.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        Ok(())
    }

    fn fire_bgm_finished(&mut self) {
        log::debug!("bgm track finished");
        self.bgm = None;
        if let Some(ref callback) = self.bgm_finish {
            callback();
        }
    }
}

/// Schroeder-style reverberator: parallel feedback combs plus a series allpass
struct Reverb {
    combs: Vec<CombFilter>,
    allpass: AllpassFilter,
    wet: f32,
    channels: u16,
}

impl Reverb {
    fn new(sample_rate: u32, channels: u16, level: u8) -> Self {
        // Comb delays in milliseconds, mutually prime-ish to avoid flutter.
        const COMB_MS: [f32; 3] = [29.7, 37.1, 41.1];
        let feedback = 0.55 + 0.08 * level as f32;
        let wet = 0.12 * level as f32;

        let combs = COMB_MS
            .iter()
            .map(|&ms| {
                let delay = ((ms / 1000.0) * sample_rate as f32) as usize * channels as usize;
                CombFilter::new(delay.max(channels as usize), feedback.min(0.92))
            })
            .collect();
        let allpass_delay = ((5.0 / 1000.0) * sample_rate as f32) as usize * channels as usize;

        Self {
            combs,
            allpass: AllpassFilter::new(allpass_delay.max(channels as usize), 0.5),
            wet,
            channels,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        debug_assert_eq!(samples.len() % self.channels as usize, 0);
        for sample in samples.iter_mut() {
            let dry = *sample;
            let mut acc = 0.0;
            for comb in self.combs.iter_mut() {
                acc += comb.tick(dry);
            }
            let wet = self.allpass.tick(acc / self.combs.len() as f32);
            *sample = dry + wet * self.wet;
        }
    }
}

struct CombFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
}

impl CombFilter {
    fn new(delay: usize, feedback: f32) -> Self {
        Self { buffer: vec![0.0; delay], index: 0, feedback }
    }

    fn tick(&mut self, input: f32) -> f32 {
        let out = self.buffer[self.index];
        self.buffer[self.index] = input + out * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    index: usize,
    gain: f32,
}

impl AllpassFilter {
    fn new(delay: usize, gain: f32) -> Self {
        Self { buffer: vec![0.0; delay], index: 0, gain }
    }

    fn tick(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.index];
        let out = -self.gain * input + delayed;
        self.buffer[self.index] = input + self.gain * out;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn mic_frame(value: f32, samples: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![value; samples],
            sample_rate: 48_000,
            channels: 2,
            pts: 0.0,
        }
    }

    fn write_wav(dir: &tempfile::TempDir, frames: usize, amplitude: i16) -> std::path::PathBuf {
        let path = dir.path().join("track.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..frames * 2 {
            writer.write_sample(amplitude).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_mic_gain_applied() {
        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.set_mic_volume(0.5);
        let mut frame = mic_frame(0.8, 64);
        mixer.process(&mut frame).unwrap();
        assert!((frame.samples[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_volume_clamped_to_unit_range() {
        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.set_mic_volume(3.0);
        let mut frame = mic_frame(0.5, 16);
        mixer.process(&mut frame).unwrap();
        assert!((frame.samples[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mute_keeps_cadence() {
        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.set_muted(true);
        let mut frame = mic_frame(0.7, 128);
        mixer.process(&mut frame).unwrap();
        assert_eq!(frame.samples.len(), 128);
        assert!(frame.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_bgm_mixed_at_gain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 4800, i16::MAX / 2);

        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.start_bgm(&path, true).unwrap();
        mixer.set_bgm_volume(0.5);

        let mut frame = mic_frame(0.0, 64);
        mixer.process(&mut frame).unwrap();
        // bgm is ~0.5 amplitude scaled by 0.5 gain
        assert!((frame.samples[0] - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_mixing_disabled_excludes_bgm() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 4800, i16::MAX / 2);

        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.start_bgm(&path, true).unwrap();
        mixer.set_mixing_enabled(false);

        let mut frame = mic_frame(0.0, 64);
        mixer.process(&mut frame).unwrap();
        assert!(frame.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_finish_callback_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 32, 1000);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.set_bgm_finish_callback(move || fired_clone.store(true, Ordering::SeqCst));
        mixer.start_bgm(&path, false).unwrap();

        let mut frame = mic_frame(0.0, 32 * 2 + 64);
        mixer.process(&mut frame).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!mixer.bgm_active());
    }

    #[test]
    fn test_reverb_level_range() {
        let mut mixer = AudioMixer::new(48_000, 2);
        assert!(mixer.enable_reverb(0).is_err());
        assert!(mixer.enable_reverb(5).is_err());
        assert!(mixer.enable_reverb(3).is_ok());
        mixer.disable_reverb();
    }

    #[test]
    fn test_reverb_produces_tail() {
        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.enable_reverb(4).unwrap();

        // An impulse followed by silence should leave energy in the tail.
        let mut impulse = mic_frame(0.0, 9600);
        impulse.samples[0] = 1.0;
        mixer.process(&mut impulse).unwrap();
        let tail_energy: f32 = impulse.samples[4800..].iter().map(|s| s * s).sum();
        assert!(tail_energy > 0.0, "reverb should smear the impulse into the tail");
    }

    #[test]
    fn test_output_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 4800, i16::MAX);

        let mut mixer = AudioMixer::new(48_000, 2);
        mixer.start_bgm(&path, true).unwrap();
        let mut frame = mic_frame(0.9, 64);
        mixer.process(&mut frame).unwrap();
        assert!(frame.samples.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_format_mismatch_rejected() {
        let mut mixer = AudioMixer::new(48_000, 2);
        let mut frame = AudioFrame { samples: vec![0.0; 64], sample_rate: 44_100, channels: 2, pts: 0.0 };
        assert!(mixer.process(&mut frame).is_err());
    }
}
