//! H.264 video encoder using openh264

use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;

use crate::errors::{Result, StreamError};
use crate::types::{EncodedVideoFrame, VideoFrame};

/// H.264 encoder with GOP-interval enforcement and retunable target bitrate
///
/// Note: the openh264 wrapper determines dimensions from the YUVSource at
/// encode time. Changing the target bitrate rebuilds the encoder lazily
/// before the next frame, which opens a fresh IDR.
pub struct H264VideoEncoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    fps: u32,
    target_kbps: u32,
    max_key_interval_secs: f64,
    frame_count: u64,
    last_keyframe_pts: Option<f64>,
    needs_rebuild: bool,
}

fn build_encoder(fps: u32, target_kbps: u32) -> Result<Encoder> {
    let config = EncoderConfig::new()
        .bitrate(BitRate::from_bps(target_kbps * 1000))
        .max_frame_rate(FrameRate::from_hz(fps as f32))
        .skip_frames(false);
    Encoder::with_api_config(OpenH264API::from_source(), config)
        .map_err(|e| StreamError::VideoEncoding(format!("failed to create encoder: {}", e)))
}

impl H264VideoEncoder {
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        target_kbps: u32,
        max_key_interval_secs: f64,
    ) -> Result<Self> {
        let encoder = build_encoder(fps, target_kbps)?;

        Ok(Self {
            encoder,
            width,
            height,
            fps,
            target_kbps,
            max_key_interval_secs,
            frame_count: 0,
            last_keyframe_pts: None,
            needs_rebuild: false,
        })
    }

    /// Encode one RGB24 frame into an Annex B access unit
    ///
    /// A keyframe is forced whenever `pts` has advanced past the GOP cap since
    /// the previous keyframe.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedVideoFrame> {
        let expected = frame.expected_len();
        if frame.data.len() != expected {
            return Err(StreamError::VideoEncoding(format!(
                "invalid frame size: expected {} bytes, got {}",
                expected,
                frame.data.len()
            )));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(StreamError::VideoEncoding(format!(
                "frame dimensions {}x{} don't match encoder {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        if self.needs_rebuild {
            self.encoder = build_encoder(self.fps, self.target_kbps)?;
            self.needs_rebuild = false;
            self.last_keyframe_pts = None;
            log::debug!("video encoder rebuilt for target {} kbps", self.target_kbps);
        }

        match self.last_keyframe_pts {
            Some(last) if frame.pts - last >= self.max_key_interval_secs => {
                self.encoder.force_intra_frame();
            }
            _ => {}
        }

        let yuv = rgb_to_yuv420(&frame.data, self.width, self.height);
        let yuv_buffer = YUVBuffer::from_vec(yuv, self.width as usize, self.height as usize);

        let bitstream = self
            .encoder
            .encode(&yuv_buffer)
            .map_err(|e| StreamError::VideoEncoding(format!("encoding failed: {}", e)))?;

        self.frame_count += 1;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        if is_keyframe {
            self.last_keyframe_pts = Some(frame.pts);
        }

        Ok(EncodedVideoFrame {
            data: bitstream.to_vec(),
            pts: frame.pts,
            is_keyframe,
        })
    }

    /// Retarget the rate control; takes effect on the next encoded frame
    pub fn set_target_bitrate(&mut self, kbps: u32) {
        if kbps != self.target_kbps {
            self.target_kbps = kbps;
            self.needs_rebuild = true;
        }
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_kbps
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Force the next frame to be a keyframe
    pub fn force_keyframe(&mut self) {
        self.encoder.force_intra_frame();
    }
}

/// Convert RGB24 to YUV420 planar format (BT.601)
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let rgb_idx = (y * w + x) * 3;
            let r = rgb[rgb_idx] as i32;
            let g = rgb[rgb_idx + 1] as i32;
            let b = rgb[rgb_idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Subsample U and V over 2x2 blocks
            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(pts: f64) -> VideoFrame {
        VideoFrame::new(vec![128u8; 640 * 480 * 3], 640, 480, pts)
    }

    // High-entropy content so rate control has something to squeeze.
    fn noise_frame(seed: u64, pts: f64) -> VideoFrame {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let data = (0..320 * 240 * 3)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect();
        VideoFrame::new(data, 320, 240, pts)
    }

    #[test]
    fn test_yuv420_size() {
        let yuv = rgb_to_yuv420(&vec![128u8; 640 * 480 * 3], 640, 480);
        assert_eq!(yuv.len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut encoder = H264VideoEncoder::new(640, 480, 15, 600, 2.0).unwrap();
        let encoded = encoder.encode(&gray_frame(0.0)).unwrap();
        assert!(encoded.is_keyframe);
        assert!(!encoded.data.is_empty());
        assert!(
            encoded.data.starts_with(&[0x00, 0x00, 0x00, 0x01])
                || encoded.data.starts_with(&[0x00, 0x00, 0x01]),
            "should start with Annex B start code"
        );
    }

    #[test]
    fn test_gop_cap_forces_keyframe() {
        let mut encoder = H264VideoEncoder::new(640, 480, 15, 600, 2.0).unwrap();
        encoder.encode(&gray_frame(0.0)).unwrap();
        // Still inside the GOP.
        let mid = encoder.encode(&gray_frame(1.0)).unwrap();
        assert!(!mid.is_keyframe, "static content inside GOP should be a P frame");
        // Past the 2 second cap.
        let after = encoder.encode(&gray_frame(2.5)).unwrap();
        assert!(after.is_keyframe, "GOP cap must force a keyframe");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut encoder = H264VideoEncoder::new(640, 480, 15, 600, 2.0).unwrap();
        let frame = VideoFrame::new(vec![0u8; 320 * 240 * 3], 320, 240, 0.0);
        assert!(encoder.encode(&frame).is_err());
    }

    #[test]
    fn test_bitrate_retune_reopens_idr() {
        let mut encoder = H264VideoEncoder::new(640, 480, 15, 600, 2.0).unwrap();
        encoder.encode(&gray_frame(0.0)).unwrap();
        encoder.set_target_bitrate(300);
        assert_eq!(encoder.target_bitrate(), 300);
        let encoded = encoder.encode(&gray_frame(0.1)).unwrap();
        assert!(encoded.is_keyframe, "rebuild must open a new IDR");
    }

    #[test]
    fn test_target_bitrate_drives_output_size() {
        let encode_total = |kbps: u32| -> usize {
            let mut encoder = H264VideoEncoder::new(320, 240, 15, kbps, 2.0).unwrap();
            (0..30u64)
                .map(|n| encoder.encode(&noise_frame(n, n as f64 / 15.0)).unwrap().data.len())
                .sum()
        };
        let starved = encode_total(100);
        let generous = encode_total(2000);
        assert!(
            starved < generous,
            "rate control must squeeze at 100 kbps: {} vs {} bytes",
            starved,
            generous
        );
    }
}
