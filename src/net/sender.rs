//! RTMP publish session
//!
//! Owns the persistent connection: URL parsing, DNS, handshake, the
//! connect/createStream/publish command flow, and the send loop that drains
//! the encoded packet queue. Reports per-second throughput into telemetry and
//! drives the adaptive bitrate controller.

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sha2::{Digest, Sha256};

use crate::bitrate::{BitrateController, SenderFeedback};
use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};
use crate::events::{NetStateCode, StreamErrorCode, StreamMachine, StreamState};
use crate::net::amf::{decode_command, encode_command, Amf0Value};
use crate::net::chunk::{csid, msg_type, ChunkReader, ChunkWriter, Message, OUTBOUND_CHUNK_SIZE};
use crate::net::flv;
use crate::net::handshake::client_handshake;
use crate::stats::Telemetry;
use crate::types::{EncodedAudioFrame, EncodedVideoFrame};

/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for command replies during session setup
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Packet queue depth between the encode worker and the sender
pub const SEND_QUEUE_DEPTH: usize = 64;

/// An encoded access unit headed for the wire
#[derive(Debug, Clone)]
pub enum MediaPacket {
    Video(EncodedVideoFrame),
    Audio(EncodedAudioFrame),
}

/// A parsed `rtmp://host[:port]/app/streamKey` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl RtmpTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("rtmp://")
            .ok_or_else(|| StreamError::BadUrl(format!("not an rtmp:// URL: {}", url)))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| StreamError::BadUrl(format!("missing app path: {}", url)))?;
        if authority.is_empty() {
            return Err(StreamError::BadUrl(format!("missing host: {}", url)));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| StreamError::BadUrl(format!("bad port in {}", url)))?;
                (h.to_string(), port)
            }
            None => (authority.to_string(), 1935),
        };

        let (app, stream_key) = path
            .rsplit_once('/')
            .ok_or_else(|| StreamError::BadUrl(format!("missing stream key: {}", url)))?;
        if app.is_empty() || stream_key.is_empty() {
            return Err(StreamError::BadUrl(format!("empty app or stream key: {}", url)));
        }

        Ok(Self {
            host,
            port,
            app: app.to_string(),
            stream_key: stream_key.to_string(),
        })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

/// Stable identifier for one publish attempt: SHA-256 of the URL and the
/// connect wall-clock time
pub fn derive_stream_id(url: &str, connected_at: chrono::DateTime<chrono::Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(connected_at.timestamp_millis().to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

fn map_error(err: &StreamError) -> StreamErrorCode {
    match err {
        StreamError::DnsFailed(_) => StreamErrorCode::DnsFailed,
        StreamError::BadUrl(_) => StreamErrorCode::ConnectFailed,
        StreamError::ConnectFailed(_) => StreamErrorCode::ConnectFailed,
        StreamError::PublishFailed(_) => StreamErrorCode::PublishFailed,
        StreamError::ConnectionBroken(_) | StreamError::Io(_) => StreamErrorCode::ConnectionBroken,
        StreamError::Protocol(_) => StreamErrorCode::ConnectFailed,
        _ => StreamErrorCode::Internal,
    }
}

/// Running publish session; join through [`RtmpSession::join`]
pub struct RtmpSession {
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl RtmpSession {
    /// Spawn the session thread
    ///
    /// The session transitions the state machine to Connected on success and
    /// into Error on any failure. `bitrate_tx` carries new video targets back
    /// to the encode worker.
    pub fn spawn(
        url: String,
        config: StreamConfig,
        packet_rx: Receiver<MediaPacket>,
        machine: Arc<StreamMachine>,
        telemetry: Telemetry,
        bitrate_tx: Sender<u32>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let thread = std::thread::Builder::new()
            .name("livecast-rtmp".to_string())
            .spawn(move || {
                if let Err(e) = session_main(
                    &url,
                    &config,
                    packet_rx,
                    &machine,
                    &telemetry,
                    bitrate_tx,
                    &running_clone,
                ) {
                    log::error!("rtmp session ended with error: {}", e);
                    machine.fail(map_error(&e));
                    machine.publish_net_state(NetStateCode::ReconnectRequired);
                }
            })?;
        Ok(Self { thread: Some(thread), running })
    }

    /// Ask the session to stop draining and disconnect
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the session thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct Connection {
    stream: TcpStream,
    writer: ChunkWriter,
    reader: ChunkReader,
    message_stream_id: u32,
}

fn session_main(
    url: &str,
    config: &StreamConfig,
    packet_rx: Receiver<MediaPacket>,
    machine: &StreamMachine,
    telemetry: &Telemetry,
    bitrate_tx: Sender<u32>,
    running: &AtomicBool,
) -> Result<()> {
    let target = RtmpTarget::parse(url)?;
    let mut conn = match establish(&target, config, telemetry) {
        Ok(conn) => conn,
        // A stop requested during setup surfaces as whatever error the
        // torn-down socket produced; not a session failure.
        Err(_) if !running.load(Ordering::SeqCst) => return Ok(()),
        Err(e) => return Err(e),
    };
    // The Connected transition is only refused when a stop already moved the
    // machine off Connecting; exit quietly in that case too.
    if !running.load(Ordering::SeqCst) || machine.transition(StreamState::Connected).is_err() {
        let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        return Ok(());
    }
    telemetry.set_stream_id(derive_stream_id(url, chrono::Utc::now()));
    log::info!(
        "publishing to {} (app {}, key {})",
        telemetry.rtmp_host_ip(),
        target.app,
        target.stream_key
    );

    // Inbound traffic after publish is control-only; a reader thread consumes
    // it and flags when an acknowledgement is due.
    let ack_due = Arc::new(AtomicU64::new(0));
    let reader_stream = conn.stream.try_clone()?;
    let reader_running = Arc::new(AtomicBool::new(true));
    let reader_handle = spawn_control_reader(
        reader_stream,
        std::mem::take(&mut conn.reader),
        ack_due.clone(),
        reader_running.clone(),
    )?;

    let result = send_loop(
        &mut conn,
        config,
        &packet_rx,
        machine,
        telemetry,
        &bitrate_tx,
        running,
        &ack_due,
    );

    reader_running.store(false, Ordering::SeqCst);
    let _ = conn.stream.shutdown(std::net::Shutdown::Both);
    let _ = reader_handle.join();
    result
}

fn establish(target: &RtmpTarget, config: &StreamConfig, telemetry: &Telemetry) -> Result<Connection> {
    let addr = resolve(target)?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| StreamError::ConnectFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
    telemetry.set_rtmp_host_ip(addr.ip().to_string());

    client_handshake(&mut stream)?;

    let mut writer = ChunkWriter::new();
    let mut reader = ChunkReader::new();

    // Announce the outbound chunk size before anything sizeable goes out.
    writer.write_message(
        &mut stream,
        csid::CONTROL,
        &Message::set_chunk_size(OUTBOUND_CHUNK_SIZE as u32),
    )?;
    writer.set_chunk_size(OUTBOUND_CHUNK_SIZE);

    // connect
    let connect_args = [
        Amf0Value::Object(vec![
            ("app".to_string(), Amf0Value::String(target.app.clone())),
            ("flashVer".to_string(), Amf0Value::String("FMLE/3.0 (compatible; livecast)".into())),
            ("tcUrl".to_string(), Amf0Value::String(target.tc_url())),
            ("type".to_string(), Amf0Value::String("nonprivate".into())),
        ]),
    ];
    let body = encode_command("connect", 1.0, &connect_args);
    writer.write_message(&mut stream, csid::COMMAND, &Message::command(body.freeze(), 0))?;
    let reply = wait_for_command(&mut reader, &mut stream, &["_result", "_error"])?;
    if reply.name == "_error" {
        return Err(StreamError::ConnectFailed(status_code(&reply.values)));
    }

    // createStream
    let body = encode_command("createStream", 2.0, &[Amf0Value::Null]);
    writer.write_message(&mut stream, csid::COMMAND, &Message::command(body.freeze(), 0))?;
    let reply = wait_for_command(&mut reader, &mut stream, &["_result", "_error"])?;
    if reply.name == "_error" {
        return Err(StreamError::ConnectFailed(status_code(&reply.values)));
    }
    let message_stream_id = reply
        .values
        .iter()
        .find_map(Amf0Value::as_number)
        .unwrap_or(1.0) as u32;

    // publish
    let body = encode_command(
        "publish",
        3.0,
        &[
            Amf0Value::Null,
            Amf0Value::String(target.stream_key.clone()),
            Amf0Value::String("live".into()),
        ],
    );
    writer.write_message(
        &mut stream,
        csid::COMMAND,
        &Message::command(body.freeze(), message_stream_id),
    )?;
    let reply = wait_for_command(&mut reader, &mut stream, &["onStatus", "_error"])?;
    let code = status_code(&reply.values);
    if !code.contains("Publish.Start") {
        return Err(StreamError::PublishFailed(code));
    }

    // Stream preamble: metadata and the audio sequence header. The video
    // sequence header waits for the first keyframe's parameter sets.
    writer.write_message(
        &mut stream,
        csid::DATA,
        &Message::data(flv::on_metadata(config, config.clamped_init_bitrate()), message_stream_id),
    )?;
    writer.write_message(
        &mut stream,
        csid::AUDIO,
        &Message::audio(
            flv::opus_sequence_header(config.audio_channels, config.audio_sample_rate),
            message_stream_id,
            0,
        ),
    )?;

    Ok(Connection { stream, writer, reader, message_stream_id })
}

fn resolve(target: &RtmpTarget) -> Result<SocketAddr> {
    let mut addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| StreamError::DnsFailed(format!("{}: {}", target.host, e)))?;
    addrs
        .next()
        .ok_or_else(|| StreamError::DnsFailed(target.host.clone()))
}

fn wait_for_command(
    reader: &mut ChunkReader,
    stream: &mut TcpStream,
    names: &[&str],
) -> Result<crate::net::amf::CommandReply> {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    loop {
        if Instant::now() > deadline {
            return Err(StreamError::ConnectFailed("timed out waiting for server reply".into()));
        }
        let msg = reader.read_message(stream)?;
        match msg.type_id {
            msg_type::COMMAND_AMF0 => {
                let reply = decode_command(&msg.payload)?;
                if names.contains(&reply.name.as_str()) {
                    return Ok(reply);
                }
                log::trace!("ignoring command {:?} during setup", reply.name);
            }
            msg_type::WINDOW_ACK_SIZE | msg_type::SET_PEER_BANDWIDTH | msg_type::USER_CONTROL => {}
            other => log::trace!("ignoring message type {} during setup", other),
        }
    }
}

fn status_code(values: &[Amf0Value]) -> String {
    values
        .iter()
        .find_map(|v| v.field("code").and_then(Amf0Value::as_str))
        .unwrap_or("unknown")
        .to_string()
}

fn spawn_control_reader(
    mut stream: TcpStream,
    mut reader: ChunkReader,
    ack_due: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("livecast-rtmp-rx".to_string())
        .spawn(move || {
            let mut window: u64 = 2_500_000;
            let mut last_acked: u64 = 0;
            let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
            while running.load(Ordering::SeqCst) {
                match reader.read_message(&mut stream) {
                    Ok(msg) => {
                        if msg.type_id == msg_type::WINDOW_ACK_SIZE && msg.payload.len() >= 4 {
                            window = u32::from_be_bytes([
                                msg.payload[0],
                                msg.payload[1],
                                msg.payload[2],
                                msg.payload[3],
                            ]) as u64;
                        }
                        if reader.bytes_read() - last_acked >= window {
                            last_acked = reader.bytes_read();
                            ack_due.store(last_acked, Ordering::SeqCst);
                        }
                    }
                    Err(StreamError::Io(ref e))
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
            }
        })?;
    Ok(handle)
}

#[allow(clippy::too_many_arguments)]
fn send_loop(
    conn: &mut Connection,
    config: &StreamConfig,
    packet_rx: &Receiver<MediaPacket>,
    machine: &StreamMachine,
    telemetry: &Telemetry,
    bitrate_tx: &Sender<u32>,
    running: &AtomicBool,
    ack_due: &AtomicU64,
) -> Result<()> {
    let mut controller = BitrateController::new(config);
    let mut last_tick = Instant::now();
    let mut tick_bytes: u64 = 0;
    let mut last_dropped = telemetry.dropped_video_frames();
    let mut sent_avc_header = false;
    let mut last_video_ts: u32 = 0;
    let mut last_audio_ts: u32 = 0;
    let mut slow_announced = false;

    while running.load(Ordering::SeqCst) {
        match packet_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(MediaPacket::Video(frame)) => {
                if !sent_avc_header {
                    match flv::extract_parameter_sets(&frame.data) {
                        Some((sps, pps)) if frame.is_keyframe => {
                            let header = flv::avc_sequence_header(&sps, &pps)?;
                            tick_bytes += conn.writer.write_message(
                                &mut conn.stream,
                                csid::VIDEO,
                                &Message::video(header, conn.message_stream_id, 0),
                            )? as u64;
                            sent_avc_header = true;
                        }
                        _ => {
                            // Nothing decodable can precede the sequence header.
                            log::trace!("waiting for first keyframe before sending video");
                            continue;
                        }
                    }
                }
                let ts = clamp_ts(frame.pts, &mut last_video_ts);
                let body = flv::avc_coded_frame(&frame.data, frame.is_keyframe);
                let n = conn.writer.write_message(
                    &mut conn.stream,
                    csid::VIDEO,
                    &Message::video(body, conn.message_stream_id, ts),
                )?;
                tick_bytes += n as u64;
                telemetry.add_uploaded_bytes(n as u64);
            }
            Ok(MediaPacket::Audio(frame)) => {
                let ts = clamp_ts(frame.pts, &mut last_audio_ts);
                let body = flv::opus_coded_frame(&frame.data);
                let n = conn.writer.write_message(
                    &mut conn.stream,
                    csid::AUDIO,
                    &Message::audio(body, conn.message_stream_id, ts),
                )?;
                tick_bytes += n as u64;
                telemetry.add_uploaded_bytes(n as u64);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let pending_ack = ack_due.swap(0, Ordering::SeqCst);
        if pending_ack != 0 {
            conn.writer.write_message(
                &mut conn.stream,
                csid::CONTROL,
                &Message::acknowledgement(pending_ack as u32),
            )?;
        }

        if last_tick.elapsed() >= Duration::from_secs(1) {
            last_tick = Instant::now();
            let dropped_total = telemetry.dropped_video_frames();
            let dropped = dropped_total - last_dropped;
            last_dropped = dropped_total;

            if dropped > 0 && !slow_announced {
                machine.publish_net_state(NetStateCode::SendPacketSlow);
                slow_announced = true;
            } else if dropped == 0 {
                slow_announced = false;
            }

            let decision = controller.on_tick(SenderFeedback {
                queue_depth: packet_rx.len(),
                bytes_sent: tick_bytes,
                dropped_frames: dropped,
            });
            tick_bytes = 0;
            if let Some(event) = decision.event {
                machine.publish_net_state(event);
                let _ = bitrate_tx.try_send(decision.target_kbps);
            }
        }
    }

    // Best-effort polite teardown.
    let body = encode_command(
        "FCUnpublish",
        4.0,
        &[Amf0Value::Null, Amf0Value::String(String::new())],
    );
    let _ = conn
        .writer
        .write_message(&mut conn.stream, csid::COMMAND, &Message::command(body.freeze(), 0));
    let body = encode_command(
        "deleteStream",
        5.0,
        &[Amf0Value::Null, Amf0Value::Number(conn.message_stream_id as f64)],
    );
    let _ = conn
        .writer
        .write_message(&mut conn.stream, csid::COMMAND, &Message::command(body.freeze(), 0));
    let _ = conn.stream.flush();
    log::info!("rtmp session closed");
    Ok(())
}

/// Seconds to milliseconds, clamped monotonic per medium
fn clamp_ts(pts: f64, last: &mut u32) -> u32 {
    let ms = (pts * 1000.0).max(0.0) as u32;
    if ms < *last {
        *last
    } else {
        *last = ms;
        ms
    }
}
