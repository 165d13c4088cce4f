//! Playback lifecycle controller
//!
//! Buffering, pacing and reporting over a [`MediaSource`]. The controller
//! models the same lifecycle the publish side's viewers experience: content
//! loads, becomes playable, stalls when the buffer drains, and finishes with
//! an explicit reason.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::config::PlayerConfig;
use crate::errors::{Result, StreamError};
use crate::events::EventHub;
use crate::player::source::{ChunkData, MediaChunk, MediaSource, SourceInfo};
use crate::types::{NaturalSize, VideoFrame};

/// Buffered lead required before content counts as playable end to end
const PLAYTHROUGH_AHEAD_SECS: f64 = 0.5;
/// Buffered lead required to leave a stall
const STALL_RESUME_AHEAD_SECS: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Interrupted,
    SeekingForward,
    SeekingBackward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unknown,
    Playable,
    PlaythroughOk,
    Stalled,
}

/// Why playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Ended,
    Error,
    UserExited,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    PlaybackStateChanged(PlaybackState),
    LoadStateChanged(LoadState),
    NaturalSizeAvailable(NaturalSize),
    PlaybackFinished(FinishReason),
}

struct PlayerShared {
    playback: Mutex<PlaybackState>,
    load: Mutex<LoadState>,
    info: Mutex<Option<SourceInfo>>,
    position_bits: AtomicU64,
    playable_bits: AtomicU64,
    stall_duration_bits: AtomicU64,
    buffer_empty_count: AtomicU64,
    read_bytes: AtomicU64,
    last_frame: Mutex<Option<VideoFrame>>,
    running: AtomicBool,
    finished: AtomicBool,
    hub: EventHub<PlayerEvent>,
}

impl PlayerShared {
    fn new() -> Self {
        Self {
            playback: Mutex::new(PlaybackState::Stopped),
            load: Mutex::new(LoadState::Unknown),
            info: Mutex::new(None),
            position_bits: AtomicU64::new(0),
            playable_bits: AtomicU64::new(0),
            stall_duration_bits: AtomicU64::new(0),
            buffer_empty_count: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            hub: EventHub::new(),
        }
    }

    fn set_playback(&self, next: PlaybackState) {
        let mut guard = self.playback.lock().unwrap();
        if *guard != next {
            *guard = next;
            drop(guard);
            self.hub.publish(PlayerEvent::PlaybackStateChanged(next));
        }
    }

    fn set_load(&self, next: LoadState) {
        let mut guard = self.load.lock().unwrap();
        if *guard != next {
            *guard = next;
            drop(guard);
            self.hub.publish(PlayerEvent::LoadStateChanged(next));
        }
    }

    fn finish(&self, reason: FinishReason) {
        // Exactly one finish event per prepare.
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.set_playback(PlaybackState::Stopped);
            self.hub.publish(PlayerEvent::PlaybackFinished(reason));
        }
    }

    fn set_position(&self, secs: f64) {
        self.position_bits.store(secs.to_bits(), Ordering::Relaxed);
    }

    fn position(&self) -> f64 {
        f64::from_bits(self.position_bits.load(Ordering::Relaxed))
    }

    fn set_playable(&self, secs: f64) {
        self.playable_bits.store(secs.to_bits(), Ordering::Relaxed);
    }

    fn playable(&self) -> f64 {
        f64::from_bits(self.playable_bits.load(Ordering::Relaxed))
    }

    fn add_stall_duration(&self, secs: f64) {
        let prev = f64::from_bits(self.stall_duration_bits.load(Ordering::Relaxed));
        self.stall_duration_bits.store((prev + secs).to_bits(), Ordering::Relaxed);
    }
}

/// Playback controller over a pluggable source
pub struct Player {
    url: String,
    config: PlayerConfig,
    shared: Arc<PlayerShared>,
    source_slot: Arc<Mutex<Option<Box<dyn MediaSource>>>>,
    worker: Option<JoinHandle<()>>,
}

impl Player {
    pub fn new<S: MediaSource + 'static>(url: &str, config: PlayerConfig, source: S) -> Self {
        Self {
            url: url.to_string(),
            config,
            shared: Arc::new(PlayerShared::new()),
            source_slot: Arc::new(Mutex::new(Some(Box::new(source)))),
            worker: None,
        }
    }

    /// Open the source and start buffering
    ///
    /// Progress arrives through [`Player::events`]: natural size, load state
    /// edges, and with `should_autoplay` the transition into Playing.
    pub fn prepare_to_play(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(StreamError::InvalidState("player already prepared".into()));
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.finished.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let source_slot = self.source_slot.clone();
        let config = self.config.clone();
        let url = self.url.clone();
        let handle = std::thread::Builder::new()
            .name("livecast-player".to_string())
            .spawn(move || {
                let taken = source_slot.lock().unwrap().take();
                let Some(mut source) = taken else {
                    log::error!("player source already in use");
                    shared.finish(FinishReason::Error);
                    return;
                };
                playback_worker(&url, &config, &shared, source.as_mut());
                *source_slot.lock().unwrap() = Some(source);
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Begin or resume playback; requires the content to be playable
    pub fn play(&self) {
        let load = *self.shared.load.lock().unwrap();
        if matches!(load, LoadState::Playable | LoadState::PlaythroughOk) {
            self.shared.set_playback(PlaybackState::Playing);
        } else {
            log::debug!("play() before content is playable, deferred to autoplay/load");
        }
    }

    pub fn pause(&self) {
        if *self.shared.playback.lock().unwrap() == PlaybackState::Playing {
            self.shared.set_playback(PlaybackState::Paused);
        }
    }

    /// Stop playback and release the worker; finishes with UserExited
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.finish(FinishReason::UserExited);
    }

    /// Tear down and start over, optionally against a different URL
    pub fn reload(&mut self, url: Option<&str>) -> Result<()> {
        self.stop();
        if let Some(url) = url {
            self.url = url.to_string();
        }
        self.shared.set_load(LoadState::Unknown);
        self.shared.set_position(0.0);
        self.shared.set_playable(0.0);
        self.prepare_to_play()
    }

    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.shared.hub.subscribe()
    }

    pub fn playback_state(&self) -> PlaybackState {
        *self.shared.playback.lock().unwrap()
    }

    pub fn load_state(&self) -> LoadState {
        *self.shared.load.lock().unwrap()
    }

    pub fn is_playing(&self) -> bool {
        self.playback_state() == PlaybackState::Playing
    }

    /// Current playback position in seconds
    pub fn current_playback_time(&self) -> f64 {
        self.shared.position()
    }

    /// How far ahead of the position the buffer reaches, in seconds
    pub fn playable_duration(&self) -> f64 {
        self.shared.playable()
    }

    /// Total content duration in seconds; 0.0 for live
    pub fn duration(&self) -> f64 {
        self.shared.info.lock().unwrap().as_ref().map_or(0.0, |i| i.duration_secs)
    }

    pub fn natural_size(&self) -> Option<NaturalSize> {
        self.shared.info.lock().unwrap().as_ref().map(|i| i.natural_size)
    }

    pub fn server_address(&self) -> Option<String> {
        self.shared.info.lock().unwrap().as_ref().and_then(|i| i.server_address.clone())
    }

    /// Bytes downloaded so far, in megabytes
    pub fn read_size_mb(&self) -> f64 {
        self.shared.read_bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0)
    }

    /// Times playback stalled on an empty buffer
    pub fn buffer_empty_count(&self) -> u64 {
        self.shared.buffer_empty_count.load(Ordering::Relaxed)
    }

    /// Total seconds spent stalled
    pub fn buffer_empty_duration(&self) -> f64 {
        f64::from_bits(self.shared.stall_duration_bits.load(Ordering::Relaxed))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The most recently presented video frame as an image
    pub fn thumbnail_at_current_time(&self) -> Option<image::RgbImage> {
        let guard = self.shared.last_frame.lock().unwrap();
        let frame = guard.as_ref()?;
        image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn playback_worker(
    url: &str,
    config: &PlayerConfig,
    shared: &PlayerShared,
    source: &mut dyn MediaSource,
) {
    let timeout = Duration::from_secs(config.timeout_secs);
    let open_started = Instant::now();
    let info = match source.open(timeout) {
        Ok(info) if open_started.elapsed() <= timeout => info,
        Ok(_) => {
            log::warn!("source open for {} exceeded {}s timeout", url, config.timeout_secs);
            shared.finish(FinishReason::Error);
            return;
        }
        Err(e) => {
            log::error!("failed to open {}: {}", url, e);
            shared.finish(FinishReason::Error);
            return;
        }
    };
    let is_live = info.is_live();
    let natural_size = info.natural_size;
    *shared.info.lock().unwrap() = Some(info);
    shared.hub.publish(PlayerEvent::NaturalSizeAvailable(natural_size));
    shared.set_load(LoadState::Playable);
    log::info!("opened {} ({}x{}, live: {})", url, natural_size.width, natural_size.height, is_live);

    let mut tee = open_tee(config.save_local_path.as_ref());
    let mut buffer: std::collections::VecDeque<MediaChunk> = std::collections::VecDeque::new();
    let mut source_ended = false;
    let mut playthrough_reached = false;
    let mut stall_started: Option<Instant> = None;
    let buffer_cap = PLAYTHROUGH_AHEAD_SECS.max(config.buffer_time_max_secs).max(1.0);
    let mut last_tick = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        let position = shared.position();

        // Keep the buffer topped up to the cap.
        while !source_ended
            && buffer.back().map_or(true, |c| c.pts - position < buffer_cap)
        {
            match source.read() {
                Ok(Some(chunk)) => {
                    shared.read_bytes.fetch_add(chunk.byte_len as u64, Ordering::Relaxed);
                    buffer.push_back(chunk);
                }
                Ok(None) => {
                    source_ended = true;
                }
                Err(e) => {
                    log::error!("source read failed: {}", e);
                    shared.finish(FinishReason::Error);
                    return;
                }
            }
        }
        if let Some(last) = buffer.back() {
            shared.set_playable(last.pts);
        }

        // Content shorter than the playthrough lead is playable end to end
        // as soon as it is fully buffered.
        if !playthrough_reached
            && (source_ended
                || buffer.back().map_or(false, |c| c.pts - position >= PLAYTHROUGH_AHEAD_SECS))
        {
            playthrough_reached = true;
            shared.set_load(LoadState::PlaythroughOk);
            if config.should_autoplay {
                shared.set_playback(PlaybackState::Playing);
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(last_tick).as_secs_f64();
        last_tick = now;

        let state = *shared.playback.lock().unwrap();
        match state {
            PlaybackState::Playing => {
                let mut position = position + dt;

                // Live catch-up: a deep buffer means we fell behind the edge.
                if is_live && config.buffer_time_max_secs >= 0.0 {
                    let depth = shared.playable() - position;
                    if depth > config.buffer_time_max_secs {
                        shared.set_playback(PlaybackState::SeekingForward);
                        position = shared.playable() - STALL_RESUME_AHEAD_SECS;
                        while buffer.front().map_or(false, |c| c.pts < position) {
                            buffer.pop_front();
                        }
                        shared.set_playback(PlaybackState::Playing);
                        log::debug!("live catch-up skipped to {:.2}s", position);
                    }
                }

                // Deliver everything due.
                while buffer.front().map_or(false, |c| c.pts <= position) {
                    if let Some(chunk) = buffer.pop_front() {
                        deliver(shared, &chunk, tee.as_mut());
                    }
                }
                shared.set_position(position);

                if buffer.is_empty() {
                    if source_ended {
                        shared.finish(FinishReason::Ended);
                        return;
                    }
                    // Stall until the buffer recovers.
                    shared.buffer_empty_count.fetch_add(1, Ordering::Relaxed);
                    shared.set_load(LoadState::Stalled);
                    shared.set_playback(PlaybackState::Interrupted);
                    stall_started = Some(Instant::now());
                }
            }
            PlaybackState::Interrupted => {
                if buffer.back().map_or(false, |c| c.pts - position >= STALL_RESUME_AHEAD_SECS) {
                    if let Some(started) = stall_started.take() {
                        shared.add_stall_duration(started.elapsed().as_secs_f64());
                    }
                    shared.set_load(LoadState::PlaythroughOk);
                    shared.set_playback(PlaybackState::Playing);
                }
            }
            _ => {}
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

fn deliver(shared: &PlayerShared, chunk: &MediaChunk, tee: Option<&mut File>) {
    if let ChunkData::Video(frame) = &chunk.data {
        if let Some(file) = tee {
            if let Err(e) = file.write_all(&frame.data) {
                log::warn!("local save write failed: {}", e);
            }
        }
        *shared.last_frame.lock().unwrap() = Some(frame.clone());
    }
}

fn open_tee(path: Option<&PathBuf>) -> Option<File> {
    let path = path?;
    match File::create(path) {
        Ok(file) => Some(file),
        Err(e) => {
            log::warn!("cannot open {} for local save: {}", path.display(), e);
            None
        }
    }
}
