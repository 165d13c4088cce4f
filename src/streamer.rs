//! The publish-side facade
//!
//! [`Streamer`] ties the pipeline together: callers push raw frames in,
//! the encode worker mixes and compresses them, and the RTMP session drains
//! the packet queue onto the wire. One instance manages one stream at a time;
//! multiple instances compose freely.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::clock::PtsClock;
use crate::config::StreamConfig;
use crate::encode::{H264VideoEncoder, OpusAudioEncoder};
use crate::errors::{Result, StreamError};
use crate::events::{StreamErrorCode, StreamEvent, StreamMachine, StreamState};
use crate::ingest::{FrameIngest, IngestQueues};
use crate::mixer::AudioMixer;
use crate::net::{MediaPacket, RtmpSession, SEND_QUEUE_DEPTH};
use crate::stats::{Telemetry, TelemetrySnapshot};
use crate::types::{AudioFrame, VideoCodec, VideoFrame};

pub struct Streamer {
    config: StreamConfig,
    machine: Arc<StreamMachine>,
    telemetry: Telemetry,
    ingest: FrameIngest,
    queues: Arc<Mutex<Option<IngestQueues>>>,
    mixer: Arc<Mutex<AudioMixer>>,
    session: Option<RtmpSession>,
    encode_worker: Option<JoinHandle<()>>,
    encode_running: Arc<AtomicBool>,
    bitrate_tx: Option<Sender<u32>>,
}

impl Streamer {
    /// Create a streamer with a validated configuration
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let machine = Arc::new(StreamMachine::new());
        let (ingest, queues) =
            FrameIngest::new(PtsClock::new(), config.audio_sample_rate, config.audio_channels);
        let mut mixer = AudioMixer::new(config.audio_sample_rate, config.audio_channels);

        let hub = machine.clone();
        mixer.set_bgm_finish_callback(move || hub.publish(StreamEvent::BgmFinished));

        Ok(Self {
            config,
            machine,
            telemetry: Telemetry::new(),
            ingest,
            queues: Arc::new(Mutex::new(Some(queues))),
            mixer: Arc::new(Mutex::new(mixer)),
            session: None,
            encode_worker: None,
            encode_running: Arc::new(AtomicBool::new(false)),
            bitrate_tx: None,
        })
    }

    /// Connect and start publishing to `url` (`rtmp://host[:port]/app/key`)
    ///
    /// Legal from Idle or Error. The call returns once the pipeline threads
    /// are up; connection progress arrives through [`Streamer::events`].
    pub fn start_stream(&mut self, url: &str) -> Result<()> {
        match self.machine.state() {
            StreamState::Idle | StreamState::Error => {}
            other => {
                return Err(StreamError::InvalidState(format!(
                    "cannot start a stream while {:?}",
                    other
                )))
            }
        }
        if self.config.video_codec != VideoCodec::H264 {
            return Err(StreamError::CodecNotSupported(format!(
                "{:?} encoding is not available",
                self.config.video_codec
            )));
        }

        self.reap_finished();
        self.telemetry.reset();
        self.machine.transition(StreamState::Connecting)?;

        let (packet_tx, packet_rx) = crossbeam_channel::bounded(SEND_QUEUE_DEPTH);
        let (bitrate_tx, bitrate_rx) = crossbeam_channel::bounded(4);

        let session = RtmpSession::spawn(
            url.to_string(),
            self.config.clone(),
            packet_rx,
            self.machine.clone(),
            self.telemetry.clone(),
            bitrate_tx.clone(),
        )?;

        self.encode_running.store(true, Ordering::SeqCst);
        let worker = spawn_encode_worker(EncodeWorker {
            config: self.config.clone(),
            queues: self.queues.clone(),
            mixer: self.mixer.clone(),
            machine: self.machine.clone(),
            telemetry: self.telemetry.clone(),
            packet_tx,
            bitrate_rx,
            running: self.encode_running.clone(),
        })?;

        self.session = Some(session);
        self.encode_worker = Some(worker);
        self.bitrate_tx = Some(bitrate_tx);
        log::info!("stream starting: {}", url);
        Ok(())
    }

    /// Stop publishing and return to Idle; a no-op when already idle
    pub fn stop_stream(&mut self) -> Result<()> {
        if self.machine.state() == StreamState::Idle && self.session.is_none() {
            return Ok(());
        }

        match self.machine.state() {
            StreamState::Connecting | StreamState::Connected => {
                self.machine.transition(StreamState::Disconnecting)?;
            }
            _ => {}
        }

        self.encode_running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.encode_worker.take() {
            let _ = worker.join();
        }
        if let Some(session) = self.session.take() {
            session.shutdown();
            session.join();
        }
        self.bitrate_tx = None;

        match self.machine.state() {
            StreamState::Disconnecting | StreamState::Error => {
                self.machine.transition(StreamState::Idle)?;
            }
            _ => {}
        }
        // Session identity does not outlive the session.
        self.telemetry.set_stream_id(String::new());
        self.telemetry.set_rtmp_host_ip(String::new());
        log::info!("stream stopped");
        Ok(())
    }

    /// Drop handles for a session that already failed on its own
    fn reap_finished(&mut self) {
        self.encode_running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.encode_worker.take() {
            let _ = worker.join();
        }
        if let Some(session) = self.session.take() {
            session.shutdown();
            session.join();
        }
        self.bitrate_tx = None;
    }

    // Frame input

    /// Push a captured RGB24 video frame; stamped with the stream clock
    pub fn push_video(&self, frame: VideoFrame) -> Result<()> {
        self.ingest.push_video(frame)
    }

    /// Push a captured video frame with an explicit timestamp in seconds
    pub fn push_video_at(&self, frame: VideoFrame, pts: f64) -> Result<()> {
        self.ingest.push_video_at(frame, pts)
    }

    /// Push captured PCM audio; stamped with the stream clock
    pub fn push_audio(&self, frame: AudioFrame) -> Result<()> {
        self.ingest.push_audio(frame)
    }

    // Audio mixing

    /// Start background music from a WAV file, optionally looping
    pub fn start_bgm<P: AsRef<Path>>(&self, path: P, looping: bool) -> Result<()> {
        self.mixer.lock().unwrap().start_bgm(path, looping)
    }

    pub fn stop_bgm(&self) {
        self.mixer.lock().unwrap().stop_bgm();
    }

    pub fn pause_bgm(&self) {
        self.mixer.lock().unwrap().pause_bgm();
    }

    pub fn resume_bgm(&self) {
        self.mixer.lock().unwrap().resume_bgm();
    }

    /// Microphone gain, clamped to 0.0..=1.0
    pub fn set_mic_volume(&self, volume: f32) {
        self.mixer.lock().unwrap().set_mic_volume(volume);
    }

    /// Background music gain, clamped to 0.0..=1.0
    pub fn set_bgm_volume(&self, volume: f32) {
        self.mixer.lock().unwrap().set_bgm_volume(volume);
    }

    pub fn set_mixing_enabled(&self, enabled: bool) {
        self.mixer.lock().unwrap().set_mixing_enabled(enabled);
    }

    /// Mute outgoing audio; the cadence of encoded frames is preserved so
    /// players keep a continuous timeline
    pub fn set_muted(&self, muted: bool) {
        self.mixer.lock().unwrap().set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.mixer.lock().unwrap().is_muted()
    }

    /// Enable microphone reverb, level 1 (subtle) through 4 (cavernous)
    pub fn enable_reverb(&self, level: u8) -> Result<()> {
        self.mixer.lock().unwrap().enable_reverb(level)
    }

    pub fn disable_reverb(&self) {
        self.mixer.lock().unwrap().disable_reverb();
    }

    // Runtime control

    /// Retarget the video bitrate of the live encoder, clamped to the
    /// configured range; only valid while a stream is active
    pub fn set_video_bitrate(&self, kbps: u32) -> Result<()> {
        let clamped = kbps.clamp(self.config.video_min_bitrate, self.config.video_max_bitrate);
        match &self.bitrate_tx {
            Some(tx) => {
                let _ = tx.try_send(clamped);
                Ok(())
            }
            None => Err(StreamError::InvalidState("no active stream".into())),
        }
    }

    // Observation

    pub fn state(&self) -> StreamState {
        self.machine.state()
    }

    pub fn error_code(&self) -> StreamErrorCode {
        self.machine.error_code()
    }

    /// Most recently observed network condition for the current session
    pub fn net_state(&self) -> Option<crate::events::NetStateCode> {
        self.machine.net_state()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.machine.state(), StreamState::Connecting | StreamState::Connected)
    }

    /// Register for lifecycle and network-condition events
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.machine.subscribe()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Raw frames discarded at ingest because the encoder fell behind
    pub fn ingest_overflow(&self) -> (u64, u64) {
        (self.ingest.video_overflow(), self.ingest.audio_overflow())
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

struct EncodeWorker {
    config: StreamConfig,
    queues: Arc<Mutex<Option<IngestQueues>>>,
    mixer: Arc<Mutex<AudioMixer>>,
    machine: Arc<StreamMachine>,
    telemetry: Telemetry,
    packet_tx: Sender<MediaPacket>,
    bitrate_rx: Receiver<u32>,
    running: Arc<AtomicBool>,
}

fn spawn_encode_worker(worker: EncodeWorker) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("livecast-encode".to_string())
        .spawn(move || {
            let queues_slot = worker.queues.clone();
            let taken = queues_slot.lock().unwrap().take();
            let Some(queues) = taken else {
                log::error!("ingest queues already in use, encode worker exiting");
                return;
            };
            if let Err(e) = encode_loop(&worker, &queues) {
                log::error!("encode worker failed: {}", e);
                worker.machine.fail(StreamErrorCode::Internal);
            }
            // Hand the queues back so the next stream can reuse them.
            *queues_slot.lock().unwrap() = Some(queues);
        })?;
    Ok(handle)
}

fn encode_loop(worker: &EncodeWorker, queues: &IngestQueues) -> Result<()> {
    let config = &worker.config;
    let mut video_encoder = H264VideoEncoder::new(
        config.width,
        config.height,
        config.video_fps,
        config.clamped_init_bitrate(),
        config.max_key_interval_secs,
    )?;
    let mut audio_encoder =
        OpusAudioEncoder::new(config.audio_sample_rate, config.audio_channels, config.audio_kbps)?;

    // Frames arriving faster than the configured rate are thinned out.
    let min_frame_gap = 0.9 / config.video_fps as f64;
    let mut last_video_pts = f64::NEG_INFINITY;

    let mut tick_start = Instant::now();
    let mut tick_video_bytes: u64 = 0;
    let mut tick_audio_bytes: u64 = 0;
    let mut tick_frames: u64 = 0;

    while worker.running.load(Ordering::SeqCst) {
        if let Ok(kbps) = worker.bitrate_rx.try_recv() {
            video_encoder.set_target_bitrate(kbps);
        }

        crossbeam_channel::select! {
            recv(queues.video_rx) -> frame => {
                let Ok(frame) = frame else { break };
                if frame.pts - last_video_pts < min_frame_gap {
                    log::trace!("thinning video frame at pts {:.3}", frame.pts);
                    continue;
                }
                last_video_pts = frame.pts;
                let encoded = video_encoder.encode(&frame)?;
                tick_video_bytes += encoded.data.len() as u64;
                tick_frames += 1;
                worker.telemetry.incr_encoded_frames();

                let is_keyframe = encoded.is_keyframe;
                match worker.packet_tx.try_send(MediaPacket::Video(encoded)) {
                    Ok(()) => {}
                    Err(crossbeam_channel::TrySendError::Full(pkt)) if is_keyframe => {
                        // Keyframes carry the GOP; wait briefly rather than drop.
                        if worker.packet_tx.send_timeout(pkt, Duration::from_millis(200)).is_err() {
                            worker.telemetry.incr_dropped_video_frames();
                        }
                    }
                    Err(_) => {
                        worker.telemetry.incr_dropped_video_frames();
                    }
                }
            }
            recv(queues.audio_rx) -> frame => {
                let Ok(mut frame) = frame else { break };
                worker.mixer.lock().unwrap().process(&mut frame)?;
                for packet in audio_encoder.encode(&frame)? {
                    tick_audio_bytes += packet.data.len() as u64;
                    let _ = worker
                        .packet_tx
                        .send_timeout(MediaPacket::Audio(packet), Duration::from_millis(200));
                }
            }
            default(Duration::from_millis(50)) => {}
        }

        let elapsed = tick_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            worker.telemetry.set_encode_video_kbps(tick_video_bytes as f64 * 8.0 / 1000.0 / elapsed);
            worker.telemetry.set_encode_audio_kbps(tick_audio_bytes as f64 * 8.0 / 1000.0 / elapsed);
            worker.telemetry.set_encoding_fps(tick_frames as f64 / elapsed);
            tick_start = Instant::now();
            tick_video_bytes = 0;
            tick_audio_bytes = 0;
            tick_frames = 0;
        }
    }

    for packet in audio_encoder.flush()? {
        let _ = worker.packet_tx.try_send(MediaPacket::Audio(packet));
    }
    Ok(())
}
