//! Streaming telemetry
//!
//! Counters shared between the pipeline workers and the caller. Rate figures
//! are refreshed once per second by the sender; totals accumulate from stream
//! start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

fn f64_to_bits(v: f64) -> u64 {
    v.to_bits()
}

fn bits_to_f64(v: u64) -> f64 {
    f64::from_bits(v)
}

/// Shared telemetry store
///
/// Cheap to clone; all clones observe the same counters.
#[derive(Clone, Default)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

#[derive(Default)]
struct TelemetryInner {
    encode_video_kbps: AtomicU64,
    encode_audio_kbps: AtomicU64,
    encoding_fps: AtomicU64,
    uploaded_bytes: AtomicU64,
    encoded_frames: AtomicU64,
    dropped_video_frames: AtomicU64,
    stream_id: Mutex<String>,
    rtmp_host_ip: Mutex<String>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset everything to the pre-stream state
    pub fn reset(&self) {
        let i = &self.inner;
        i.encode_video_kbps.store(0, Ordering::Relaxed);
        i.encode_audio_kbps.store(0, Ordering::Relaxed);
        i.encoding_fps.store(0, Ordering::Relaxed);
        i.uploaded_bytes.store(0, Ordering::Relaxed);
        i.encoded_frames.store(0, Ordering::Relaxed);
        i.dropped_video_frames.store(0, Ordering::Relaxed);
        i.stream_id.lock().unwrap().clear();
        i.rtmp_host_ip.lock().unwrap().clear();
    }

    pub fn set_encode_video_kbps(&self, kbps: f64) {
        self.inner.encode_video_kbps.store(f64_to_bits(kbps), Ordering::Relaxed);
    }

    pub fn set_encode_audio_kbps(&self, kbps: f64) {
        self.inner.encode_audio_kbps.store(f64_to_bits(kbps), Ordering::Relaxed);
    }

    pub fn set_encoding_fps(&self, fps: f64) {
        self.inner.encoding_fps.store(f64_to_bits(fps), Ordering::Relaxed);
    }

    pub fn add_uploaded_bytes(&self, bytes: u64) {
        self.inner.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_encoded_frames(&self) {
        self.inner.encoded_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_video_frames(&self) {
        self.inner.dropped_video_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_stream_id(&self, id: String) {
        *self.inner.stream_id.lock().unwrap() = id;
    }

    pub fn set_rtmp_host_ip(&self, ip: String) {
        *self.inner.rtmp_host_ip.lock().unwrap() = ip;
    }

    /// Encoder video output rate over the last second, kbit/s
    pub fn encode_video_kbps(&self) -> f64 {
        bits_to_f64(self.inner.encode_video_kbps.load(Ordering::Relaxed))
    }

    /// Encoder audio output rate over the last second, kbit/s
    pub fn encode_audio_kbps(&self) -> f64 {
        bits_to_f64(self.inner.encode_audio_kbps.load(Ordering::Relaxed))
    }

    /// Average encoded frame rate since stream start
    pub fn encoding_fps(&self) -> f64 {
        bits_to_f64(self.inner.encoding_fps.load(Ordering::Relaxed))
    }

    /// Total bytes handed to the network since stream start, KBytes
    pub fn uploaded_kbytes(&self) -> u64 {
        self.inner.uploaded_bytes.load(Ordering::Relaxed) / 1024
    }

    /// Total video frames encoded since stream start
    pub fn encoded_frames(&self) -> u64 {
        self.inner.encoded_frames.load(Ordering::Relaxed)
    }

    /// Encoded video frames discarded because the network could not keep up
    pub fn dropped_video_frames(&self) -> u64 {
        self.inner.dropped_video_frames.load(Ordering::Relaxed)
    }

    /// Identifier of the current publish session, empty before connect
    pub fn stream_id(&self) -> String {
        self.inner.stream_id.lock().unwrap().clone()
    }

    /// Resolved IP of the RTMP host, empty before connect
    pub fn rtmp_host_ip(&self) -> String {
        self.inner.rtmp_host_ip.lock().unwrap().clone()
    }

    /// A point-in-time copy of all counters
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            encode_video_kbps: self.encode_video_kbps(),
            encode_audio_kbps: self.encode_audio_kbps(),
            encoding_fps: self.encoding_fps(),
            uploaded_kbytes: self.uploaded_kbytes(),
            encoded_frames: self.encoded_frames(),
            dropped_video_frames: self.dropped_video_frames(),
            stream_id: self.stream_id(),
            rtmp_host_ip: self.rtmp_host_ip(),
        }
    }
}

/// A read-only view of [`Telemetry`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub encode_video_kbps: f64,
    pub encode_audio_kbps: f64,
    pub encoding_fps: f64,
    pub uploaded_kbytes: u64,
    pub encoded_frames: u64,
    pub dropped_video_frames: u64,
    pub stream_id: String,
    pub rtmp_host_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let t = Telemetry::new();
        t.add_uploaded_bytes(2048);
        t.add_uploaded_bytes(1024);
        assert_eq!(t.uploaded_kbytes(), 3);

        t.incr_encoded_frames();
        t.incr_encoded_frames();
        assert_eq!(t.encoded_frames(), 2);
    }

    #[test]
    fn test_rates_round_trip_through_atomics() {
        let t = Telemetry::new();
        t.set_encode_video_kbps(612.5);
        t.set_encoding_fps(14.97);
        assert_eq!(t.encode_video_kbps(), 612.5);
        assert!((t.encoding_fps() - 14.97).abs() < 1e-12);
    }

    #[test]
    fn test_clones_share_state() {
        let t = Telemetry::new();
        let t2 = t.clone();
        t.incr_dropped_video_frames();
        assert_eq!(t2.dropped_video_frames(), 1);
    }

    #[test]
    fn test_reset_clears_identity() {
        let t = Telemetry::new();
        t.set_stream_id("abc".into());
        t.set_rtmp_host_ip("10.0.0.1".into());
        t.reset();
        assert!(t.stream_id().is_empty());
        assert!(t.rtmp_host_ip().is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let t = Telemetry::new();
        t.set_stream_id("s1".into());
        let json = serde_json::to_string(&t.snapshot()).unwrap();
        assert!(json.contains("\"stream_id\":\"s1\""));
    }
}
