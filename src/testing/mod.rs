//! Synthetic media generators
//!
//! Deterministic video and audio content for tests and demos, so the whole
//! pipeline runs offline without capture hardware.

use crate::types::{AudioFrame, VideoFrame};

/// Generate an RGB24 gradient frame whose pattern shifts every frame
///
/// The per-frame shift exercises temporal prediction in the video encoder.
pub fn gradient_frame(width: u32, height: u32, frame_number: u64, pts: f64) -> VideoFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];
    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }
    VideoFrame::new(data, width, height, pts)
}

/// Generate a 440 Hz sine buffer of `samples_per_frame` samples per channel
///
/// Consecutive `frame_number`s produce a phase-continuous tone.
pub fn sine_frame(frame_number: u64, samples_per_frame: usize, channels: u16) -> AudioFrame {
    let sample_rate = 48_000u32;
    let frequency = 440.0;
    let mut samples = vec![0.0f32; samples_per_frame * channels as usize];

    for i in 0..samples_per_frame {
        let t = (frame_number as f64 * samples_per_frame as f64 + i as f64) / sample_rate as f64;
        let value = (2.0 * std::f64::consts::PI * frequency * t).sin() as f32 * 0.3;
        for ch in 0..channels as usize {
            samples[i * channels as usize + ch] = value;
        }
    }

    AudioFrame {
        samples,
        sample_rate,
        channels,
        pts: frame_number as f64 * samples_per_frame as f64 / sample_rate as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_frame_shape() {
        let frame = gradient_frame(64, 32, 0, 0.0);
        assert_eq!(frame.data.len(), 64 * 32 * 3);
        assert_eq!(frame.expected_len(), frame.data.len());
    }

    #[test]
    fn test_gradient_changes_between_frames() {
        let a = gradient_frame(16, 16, 0, 0.0);
        let b = gradient_frame(16, 16, 1, 0.033);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_sine_is_phase_continuous() {
        let a = sine_frame(0, 480, 1);
        let b = sine_frame(1, 480, 1);
        // The next buffer starts roughly where the previous one ended.
        let last = a.samples[479];
        let first = b.samples[0];
        assert!((first - last).abs() < 0.05);
        assert!((b.pts - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_sine_stereo_duplicates_channels() {
        let frame = sine_frame(3, 100, 2);
        assert_eq!(frame.samples.len(), 200);
        assert_eq!(frame.samples[0], frame.samples[1]);
    }
}
