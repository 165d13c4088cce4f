// Headless publish demo
// Pushes synthetic video and audio to an RTMP URL until Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use livecast::testing::{gradient_frame, sine_frame};
use livecast::{StreamConfig, StreamEvent, Streamer};

fn main() -> anyhow::Result<()> {
    livecast::init_logging();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rtmp://localhost/live/demo".to_string());

    println!("livecast publish demo");
    println!("=====================");
    println!("target: {}", url);

    let config = StreamConfig::default();
    let fps = config.video_fps;
    let width = config.width;
    let height = config.height;
    let channels = config.audio_channels;

    let mut streamer = Streamer::new(config)?;
    let events = streamer.events();
    streamer.start_stream(&url)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nstopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    // Drain lifecycle events in the background so nothing backs up.
    let event_thread = std::thread::spawn(move || {
        while let Ok(event) = events.recv() {
            match event {
                StreamEvent::StateChanged { state, error } => {
                    println!("state: {:?} (error: {:?})", state, error)
                }
                StreamEvent::NetState(code) => println!("net: {:?}", code),
                StreamEvent::BgmFinished => println!("bgm finished"),
            }
        }
    });

    // 20 ms audio buffers, video at the configured rate.
    let audio_samples = 48_000 / 50;
    let frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
    let started = Instant::now();
    let mut video_frame_number = 0u64;
    let mut audio_frame_number = 0u64;
    let mut next_video = started;
    let mut next_audio = started;
    let mut last_report = started;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_video {
            let pts = started.elapsed().as_secs_f64();
            streamer.push_video(gradient_frame(width, height, video_frame_number, pts))?;
            video_frame_number += 1;
            next_video += frame_interval;
        }
        if now >= next_audio {
            streamer.push_audio(sine_frame(audio_frame_number, audio_samples, channels))?;
            audio_frame_number += 1;
            next_audio += Duration::from_millis(20);
        }
        if now.duration_since(last_report) >= Duration::from_secs(5) {
            last_report = now;
            let t = streamer.telemetry();
            println!(
                "video {:.0} kbps | audio {:.0} kbps | {:.1} fps | {} KB up | {} dropped",
                t.encode_video_kbps,
                t.encode_audio_kbps,
                t.encoding_fps,
                t.uploaded_kbytes,
                t.dropped_video_frames
            );
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    streamer.stop_stream()?;
    drop(streamer);
    let _ = event_thread.join();
    println!("done: {} video frames, {} audio buffers", video_frame_number, audio_frame_number);
    Ok(())
}
