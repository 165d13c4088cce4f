//! Offline pipeline tests: synthetic capture through the encoders, the audio
//! mixer with a real WAV track, and configuration round-trips.

use livecast::config::StreamConfig;
use livecast::encode::{H264VideoEncoder, OpusAudioEncoder};
use livecast::mixer::AudioMixer;
use livecast::net::flv;
use livecast::testing::{gradient_frame, sine_frame};
use livecast::types::AudioFrame;

fn write_wav(path: &std::path::Path, seconds: f64, sample_rate: u32, channels: u16) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let total = (seconds * sample_rate as f64) as usize;
    for i in 0..total {
        let t = i as f64 / sample_rate as f64;
        let value = ((2.0 * std::f64::consts::PI * 220.0 * t).sin() * 0.5 * i16::MAX as f64) as i16;
        for _ in 0..channels {
            writer.write_sample(value).unwrap();
        }
    }
    writer.finalize().unwrap();
}

#[test]
fn test_video_encode_to_rtmp_payloads() {
    let config = StreamConfig::default();
    let mut encoder = H264VideoEncoder::new(
        config.width,
        config.height,
        config.video_fps,
        config.clamped_init_bitrate(),
        config.max_key_interval_secs,
    )
    .unwrap();

    let mut keyframes = 0;
    let mut sequence_header = None;
    for n in 0..30u64 {
        let pts = n as f64 / config.video_fps as f64;
        let frame = gradient_frame(config.width, config.height, n, pts);
        let encoded = encoder.encode(&frame).unwrap();
        assert!(!encoded.data.is_empty());

        if encoded.is_keyframe {
            keyframes += 1;
            let (sps, pps) = flv::extract_parameter_sets(&encoded.data)
                .expect("keyframe carries parameter sets");
            sequence_header = Some(flv::avc_sequence_header(&sps, &pps).unwrap());
        }
        let body = flv::avc_coded_frame(&encoded.data, encoded.is_keyframe);
        assert_eq!(body[1], 1, "coded frame is an AVC NALU packet");
    }

    assert!(keyframes >= 1, "2 s of 15 fps video has at least the opening keyframe");
    let header = sequence_header.unwrap();
    assert_eq!(header[0], 0x17);
    assert_eq!(header[5], 1, "configurationVersion");
}

#[test]
fn test_audio_encode_cadence_and_packaging() {
    let mut encoder = OpusAudioEncoder::new(48_000, 2, 48).unwrap();

    // One second of pushed audio in 20 ms buffers.
    let mut packets = Vec::new();
    for n in 0..50u64 {
        packets.extend(encoder.encode(&sine_frame(n, 960, 2)).unwrap());
    }
    assert_eq!(packets.len(), 50);

    for pair in packets.windows(2) {
        assert!((pair[1].pts - pair[0].pts - 0.02).abs() < 1e-9, "20 ms cadence");
    }
    let body = flv::opus_coded_frame(&packets[0].data);
    assert_eq!(body[0], 0x91);
    assert_eq!(&body[1..5], b"Opus");
}

#[test]
fn test_mixer_blends_bgm_into_mic() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("track.wav");
    write_wav(&wav, 1.0, 48_000, 2);

    let mut mixer = AudioMixer::new(48_000, 2);
    mixer.start_bgm(&wav, false).unwrap();
    mixer.set_mic_volume(0.0);
    mixer.set_bgm_volume(1.0);

    // Silent mic input; anything non-zero in the output came from the track.
    let mut frame = AudioFrame { samples: vec![0.0f32; 960 * 2], sample_rate: 48_000, channels: 2, pts: 0.0 };
    mixer.process(&mut frame).unwrap();
    assert!(frame.samples.iter().any(|s| s.abs() > 0.01), "bgm is audible");

    // Mute replaces the mix with silence but keeps the cadence.
    mixer.set_muted(true);
    let mut muted = AudioFrame { samples: vec![0.5f32; 960 * 2], sample_rate: 48_000, channels: 2, pts: 0.02 };
    mixer.process(&mut muted).unwrap();
    assert_eq!(muted.samples.len(), 960 * 2);
    assert!(muted.samples.iter().all(|s| *s == 0.0));
}

#[test]
fn test_bgm_finish_callback_fires_once() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("short.wav");
    write_wav(&wav, 0.01, 48_000, 2); // shorter than one mix buffer

    let fired = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter = fired.clone();
    let mut mixer = AudioMixer::new(48_000, 2);
    mixer.set_bgm_finish_callback(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    mixer.start_bgm(&wav, false).unwrap();

    let mut frame = AudioFrame { samples: vec![0.0f32; 960 * 2], sample_rate: 48_000, channels: 2, pts: 0.0 };
    mixer.process(&mut frame).unwrap();
    mixer.process(&mut frame).unwrap();
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_mixer_rejects_mismatched_input() {
    let mut mixer = AudioMixer::new(48_000, 2);
    let mut frame = AudioFrame { samples: vec![0.0f32; 100], sample_rate: 44_100, channels: 2, pts: 0.0 };
    assert!(mixer.process(&mut frame).is_err());
}

#[test]
fn test_config_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.toml");

    let config = StreamConfig {
        video_fps: 24,
        video_init_bitrate: 700,
        auto_adjust_bitrate: false,
        ..StreamConfig::default()
    };
    config.save_to_file(&path).unwrap();

    let loaded = StreamConfig::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = StreamConfig::load_from_file(dir.path().join("absent.toml")).unwrap();
    assert_eq!(loaded, StreamConfig::default());
}

#[test]
fn test_default_config_matches_published_defaults() {
    let config = StreamConfig::default();
    assert_eq!(config.video_fps, 15);
    assert_eq!(config.video_init_bitrate, 600);
    assert_eq!(config.video_max_bitrate, 800);
    assert_eq!(config.video_min_bitrate, 200);
    assert_eq!(config.audio_kbps, 48);
    assert_eq!(config.max_key_interval_secs, 2.0);
    assert!(!config.auto_adjust_bitrate, "adaptive bitrate is opt-in");
    config.validate().unwrap();
}
