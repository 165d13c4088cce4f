//! RTMP publishing: handshake, chunk stream, AMF0 commands, media packaging,
//! and the session thread that ties them together

pub mod amf;
pub mod chunk;
pub mod flv;
pub mod handshake;
pub mod sender;

pub use sender::{derive_stream_id, MediaPacket, RtmpSession, RtmpTarget, SEND_QUEUE_DEPTH};
