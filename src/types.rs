//! Core frame and media types shared across the pipeline

use serde::{Deserialize, Serialize};

/// Video codec selection for the encoder stage
///
/// Only H.264 is implemented; `Hevc` is accepted in configuration but rejected
/// when the stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Hevc,
}

impl Default for VideoCodec {
    fn default() -> Self {
        VideoCodec::H264
    }
}

/// How playback content scales to fit its view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingMode {
    /// No scaling, content centered at natural size
    None,
    /// Uniform scale, letterboxed in one direction
    AspectFit,
    /// Uniform scale, cropped in one direction
    AspectFill,
    /// Non-uniform scale filling the whole view
    Fill,
}

impl Default for ScalingMode {
    fn default() -> Self {
        ScalingMode::AspectFit
    }
}

/// A placement rectangle produced by [`ScalingMode::display_rect`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScalingMode {
    /// Compute where content of `(content_w, content_h)` lands inside a view of
    /// `(view_w, view_h)`.
    ///
    /// Returns the full view for degenerate (zero) content dimensions.
    pub fn display_rect(&self, content_w: u32, content_h: u32, view_w: f64, view_h: f64) -> DisplayRect {
        let cw = content_w as f64;
        let ch = content_h as f64;
        if cw <= 0.0 || ch <= 0.0 || view_w <= 0.0 || view_h <= 0.0 {
            return DisplayRect { x: 0.0, y: 0.0, width: view_w.max(0.0), height: view_h.max(0.0) };
        }

        let (w, h) = match self {
            ScalingMode::None => (cw, ch),
            ScalingMode::Fill => (view_w, view_h),
            ScalingMode::AspectFit => {
                let scale = (view_w / cw).min(view_h / ch);
                (cw * scale, ch * scale)
            }
            ScalingMode::AspectFill => {
                let scale = (view_w / cw).max(view_h / ch);
                (cw * scale, ch * scale)
            }
        };

        DisplayRect {
            x: (view_w - w) / 2.0,
            y: (view_h - h) / 2.0,
            width: w,
            height: h,
        }
    }
}

/// A raw video frame pushed by the caller
///
/// Pixel data is packed RGB24 (`width * height * 3` bytes).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, pts: f64) -> Self {
        Self { data, width, height, pts }
    }

    /// Expected byte length for the declared dimensions
    pub fn expected_len(&self) -> usize {
        (self.width * self.height * 3) as usize
    }
}

/// A raw audio buffer pushed by the caller
///
/// Samples are interleaved f32 PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

/// A compressed H.264 access unit in Annex B format
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub pts: f64,
    pub is_keyframe: bool,
}

/// A compressed Opus packet
#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    pub data: Vec<u8>,
    pub pts: f64,
    /// Packet duration in seconds
    pub duration: f64,
}

/// Width and height of playback content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NaturalSize {
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_fit_letterboxes() {
        let rect = ScalingMode::AspectFit.display_rect(1920, 1080, 400.0, 400.0);
        assert!((rect.width - 400.0).abs() < 1e-9);
        assert!((rect.height - 225.0).abs() < 1e-9);
        assert!((rect.y - 87.5).abs() < 1e-9);
        assert_eq!(rect.x, 0.0);
    }

    #[test]
    fn test_aspect_fill_crops() {
        let rect = ScalingMode::AspectFill.display_rect(1920, 1080, 400.0, 400.0);
        assert!((rect.height - 400.0).abs() < 1e-9);
        assert!(rect.width > 400.0);
        assert!(rect.x < 0.0);
    }

    #[test]
    fn test_fill_ignores_aspect() {
        let rect = ScalingMode::Fill.display_rect(1920, 1080, 300.0, 100.0);
        assert_eq!(rect.width, 300.0);
        assert_eq!(rect.height, 100.0);
    }

    #[test]
    fn test_zero_content_returns_view() {
        let rect = ScalingMode::AspectFit.display_rect(0, 0, 640.0, 480.0);
        assert_eq!(rect.width, 640.0);
        assert_eq!(rect.height, 480.0);
    }

    #[test]
    fn test_video_frame_expected_len() {
        let frame = VideoFrame::new(vec![0; 640 * 480 * 3], 640, 480, 0.0);
        assert_eq!(frame.data.len(), frame.expected_len());
    }
}
