//! Capture ingest
//!
//! The caller pushes raw frames at capture cadence; bounded queues decouple the
//! push sites from the encode worker. Overflow drops the oldest queued frame
//! so the stream stays near the capture edge; drops are counted, never silent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::clock::PtsClock;
use crate::errors::{Result, StreamError};
use crate::types::{AudioFrame, VideoFrame};

/// Queue depth for pushed video frames (~2 s at 30 fps)
const VIDEO_QUEUE_DEPTH: usize = 64;
/// Queue depth for pushed audio buffers
const AUDIO_QUEUE_DEPTH: usize = 256;

pub struct FrameIngest {
    video_tx: Sender<VideoFrame>,
    audio_tx: Sender<AudioFrame>,
    // Receiver clones for the drop-oldest overflow policy.
    video_rx: Receiver<VideoFrame>,
    audio_rx: Receiver<AudioFrame>,
    clock: PtsClock,
    audio_sample_rate: u32,
    audio_channels: u16,
    video_overflow: Arc<AtomicU64>,
    audio_overflow: Arc<AtomicU64>,
}

/// Consumer ends of the ingest queues, handed to the encode worker
pub struct IngestQueues {
    pub video_rx: Receiver<VideoFrame>,
    pub audio_rx: Receiver<AudioFrame>,
}

impl FrameIngest {
    pub fn new(clock: PtsClock, audio_sample_rate: u32, audio_channels: u16) -> (Self, IngestQueues) {
        let (video_tx, video_rx) = crossbeam_channel::bounded(VIDEO_QUEUE_DEPTH);
        let (audio_tx, audio_rx) = crossbeam_channel::bounded(AUDIO_QUEUE_DEPTH);
        (
            Self {
                video_tx,
                audio_tx,
                video_rx: video_rx.clone(),
                audio_rx: audio_rx.clone(),
                clock,
                audio_sample_rate,
                audio_channels,
                video_overflow: Arc::new(AtomicU64::new(0)),
                audio_overflow: Arc::new(AtomicU64::new(0)),
            },
            IngestQueues { video_rx, audio_rx },
        )
    }

    /// Push a video frame, stamping it with the shared clock
    pub fn push_video(&self, mut frame: VideoFrame) -> Result<()> {
        frame.pts = self.clock.pts();
        self.push_video_stamped(frame)
    }

    /// Push a video frame with a caller-supplied timestamp
    pub fn push_video_at(&self, mut frame: VideoFrame, pts: f64) -> Result<()> {
        frame.pts = pts;
        self.push_video_stamped(frame)
    }

    fn push_video_stamped(&self, frame: VideoFrame) -> Result<()> {
        if frame.data.len() != frame.expected_len() {
            return Err(StreamError::InvalidConfig(format!(
                "video frame byte length {} does not match {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }
        if let Err(crossbeam_channel::TrySendError::Full(frame)) = self.video_tx.try_send(frame) {
            // Shed the stalest frame to stay near the capture edge.
            let _ = self.video_rx.try_recv();
            self.video_overflow.fetch_add(1, Ordering::Relaxed);
            log::trace!("video ingest queue full, oldest frame dropped");
            let _ = self.video_tx.try_send(frame);
        }
        Ok(())
    }

    /// Push an audio buffer, stamping it with the shared clock
    pub fn push_audio(&self, mut frame: AudioFrame) -> Result<()> {
        if frame.sample_rate != self.audio_sample_rate || frame.channels != self.audio_channels {
            return Err(StreamError::InvalidConfig(format!(
                "audio format {} Hz x{} does not match configured {} Hz x{}",
                frame.sample_rate, frame.channels, self.audio_sample_rate, self.audio_channels
            )));
        }
        frame.pts = self.clock.pts();
        if let Err(crossbeam_channel::TrySendError::Full(frame)) = self.audio_tx.try_send(frame) {
            let _ = self.audio_rx.try_recv();
            self.audio_overflow.fetch_add(1, Ordering::Relaxed);
            log::trace!("audio ingest queue full, oldest buffer dropped");
            let _ = self.audio_tx.try_send(frame);
        }
        Ok(())
    }

    /// Frames discarded because the encode worker fell behind
    pub fn video_overflow(&self) -> u64 {
        self.video_overflow.load(Ordering::Relaxed)
    }

    pub fn audio_overflow(&self) -> u64 {
        self.audio_overflow.load(Ordering::Relaxed)
    }

    pub fn clock(&self) -> &PtsClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> VideoFrame {
        VideoFrame::new(vec![0u8; 4 * 2 * 3], 4, 2, 0.0)
    }

    fn ingest() -> (FrameIngest, IngestQueues) {
        FrameIngest::new(PtsClock::new(), 48_000, 2)
    }

    #[test]
    fn test_push_stamps_with_clock() {
        let (ingest, queues) = ingest();
        ingest.push_video(frame()).unwrap();
        let received = queues.video_rx.try_recv().unwrap();
        assert!(received.pts >= 0.0);
    }

    #[test]
    fn test_explicit_pts_preserved() {
        let (ingest, queues) = ingest();
        ingest.push_video_at(frame(), 12.5).unwrap();
        assert_eq!(queues.video_rx.try_recv().unwrap().pts, 12.5);
    }

    #[test]
    fn test_bad_frame_length_rejected() {
        let (ingest, _queues) = ingest();
        let bad = VideoFrame::new(vec![0u8; 5], 4, 2, 0.0);
        assert!(ingest.push_video(bad).is_err());
    }

    #[test]
    fn test_wrong_audio_format_rejected() {
        let (ingest, _queues) = ingest();
        let wrong_rate = AudioFrame { samples: vec![0.0; 960 * 2], sample_rate: 44_100, channels: 2, pts: 0.0 };
        assert!(ingest.push_audio(wrong_rate).is_err());
        let wrong_channels = AudioFrame { samples: vec![0.0; 960], sample_rate: 48_000, channels: 1, pts: 0.0 };
        assert!(ingest.push_audio(wrong_channels).is_err());
        assert_eq!(ingest.audio_overflow(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest_not_newest() {
        let (ingest, queues) = ingest();
        for n in 0..VIDEO_QUEUE_DEPTH + 10 {
            ingest.push_video_at(frame(), n as f64).unwrap();
        }
        assert_eq!(ingest.video_overflow(), 10);
        assert_eq!(queues.video_rx.len(), VIDEO_QUEUE_DEPTH);
        // The head of the queue moved forward; the newest frames survived.
        assert_eq!(queues.video_rx.try_recv().unwrap().pts, 10.0);
        let last = queues.video_rx.try_iter().last().unwrap();
        assert_eq!(last.pts, (VIDEO_QUEUE_DEPTH + 9) as f64);
    }
}
