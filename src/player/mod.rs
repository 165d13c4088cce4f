//! Playback: lifecycle controller over pluggable media sources

pub mod controller;
pub mod source;

pub use controller::{FinishReason, LoadState, PlaybackState, Player, PlayerEvent};
pub use source::{ChunkData, MediaChunk, MediaSource, SourceInfo, SyntheticSource};
