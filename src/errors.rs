//! Crate-wide error type

use thiserror::Error;

/// Errors produced by the streaming and playback engines
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("codec not supported: {0}")]
    CodecNotSupported(String),

    #[error("video encoding error: {0}")]
    VideoEncoding(String),

    #[error("audio encoding error: {0}")]
    AudioEncoding(String),

    #[error("audio mixer error: {0}")]
    Mixer(String),

    #[error("bad stream URL: {0}")]
    BadUrl(String),

    #[error("DNS resolution failed for {0}")]
    DnsFailed(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    #[error("publish refused: {0}")]
    PublishFailed(String),

    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, StreamError>;
