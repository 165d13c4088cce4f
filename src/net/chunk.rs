//! RTMP chunk stream layer
//!
//! The writer splits messages into fmt0 + fmt3 chunk sequences with extended
//! timestamps where needed. The reader assembles inbound control traffic
//! (window acks, chunk-size changes, command replies) with per-csid state and
//! tracks received bytes for acknowledgement windows.

use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{Result, StreamError};

/// Default chunk payload size until re-negotiated
pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Chunk size this client announces for outbound media
pub const OUTBOUND_CHUNK_SIZE: usize = 4096;

/// Timestamp value that escapes into the extended-timestamp field
const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

/// Protocol control and media message type ids
pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

/// Chunk stream ids used by this client
pub mod csid {
    pub const CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const DATA: u32 = 5;
    pub const VIDEO: u32 = 6;
}

/// A complete RTMP message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn set_chunk_size(size: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(size);
        Self { type_id: msg_type::SET_CHUNK_SIZE, stream_id: 0, timestamp: 0, payload: payload.freeze() }
    }

    pub fn acknowledgement(sequence: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(sequence);
        Self { type_id: msg_type::ACK, stream_id: 0, timestamp: 0, payload: payload.freeze() }
    }

    pub fn command(payload: Bytes, stream_id: u32) -> Self {
        Self { type_id: msg_type::COMMAND_AMF0, stream_id, timestamp: 0, payload }
    }

    pub fn data(payload: Bytes, stream_id: u32) -> Self {
        Self { type_id: msg_type::DATA_AMF0, stream_id, timestamp: 0, payload }
    }

    pub fn audio(payload: Bytes, stream_id: u32, timestamp: u32) -> Self {
        Self { type_id: msg_type::AUDIO, stream_id, timestamp, payload }
    }

    pub fn video(payload: Bytes, stream_id: u32, timestamp: u32) -> Self {
        Self { type_id: msg_type::VIDEO, stream_id, timestamp, payload }
    }
}

/// Serializes messages into chunk sequences
pub struct ChunkWriter {
    chunk_size: usize,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }

    /// Chunk payload size for subsequent messages; announce the change to the
    /// peer with a SET_CHUNK_SIZE message before calling this
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    /// Write one message as a fmt0 chunk plus fmt3 continuations
    pub fn write_message<W: Write>(&self, out: &mut W, chunk_stream_id: u32, msg: &Message) -> Result<usize> {
        let mut written = 0;
        let extended = msg.timestamp >= EXTENDED_TIMESTAMP;
        let header_ts = if extended { EXTENDED_TIMESTAMP } else { msg.timestamp };

        let mut head = BytesMut::with_capacity(18);
        put_basic_header(&mut head, 0, chunk_stream_id);
        put_u24(&mut head, header_ts);
        put_u24(&mut head, msg.payload.len() as u32);
        head.put_u8(msg.type_id);
        head.put_u32_le(msg.stream_id);
        if extended {
            head.put_u32(msg.timestamp);
        }
        out.write_all(&head)?;
        written += head.len();

        let mut offset = 0;
        while offset < msg.payload.len() {
            if offset > 0 {
                let mut cont = BytesMut::with_capacity(7);
                put_basic_header(&mut cont, 3, chunk_stream_id);
                // Extended timestamps repeat on every continuation chunk.
                if extended {
                    cont.put_u32(msg.timestamp);
                }
                out.write_all(&cont)?;
                written += cont.len();
            }
            let take = self.chunk_size.min(msg.payload.len() - offset);
            out.write_all(&msg.payload[offset..offset + take])?;
            written += take;
            offset += take;
        }
        Ok(written)
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn put_basic_header(out: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => out.put_u8(fmt << 6 | csid as u8),
        64..=319 => {
            out.put_u8(fmt << 6);
            out.put_u8((csid - 64) as u8);
        }
        _ => {
            out.put_u8(fmt << 6 | 1);
            out.put_u16_le((csid - 64) as u16);
        }
    }
}

fn put_u24(out: &mut BytesMut, v: u32) {
    out.put_u8((v >> 16) as u8);
    out.put_u8((v >> 8) as u8);
    out.put_u8(v as u8);
}

#[derive(Debug, Clone, Default)]
struct CsidState {
    timestamp: u32,
    timestamp_delta: u32,
    /// Last fmt0/1/2 header escaped into the extended-timestamp field;
    /// fmt3 chunks on this csid then carry the 4-byte field too
    extended: bool,
    length: usize,
    type_id: u8,
    stream_id: u32,
    partial: Vec<u8>,
}

/// Assembles inbound chunk sequences into messages
pub struct ChunkReader {
    chunk_size: usize,
    states: HashMap<u32, CsidState>,
    /// Total bytes consumed, for the acknowledgement window
    bytes_read: u64,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, states: HashMap::new(), bytes_read: 0 }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read chunks until a complete message assembles
    ///
    /// Inbound SET_CHUNK_SIZE is applied transparently and also returned so
    /// the session can log it.
    pub fn read_message<R: Read>(&mut self, input: &mut R) -> Result<Message> {
        loop {
            if let Some(msg) = self.read_chunk(input)? {
                if msg.type_id == msg_type::SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                    let size = u32::from_be_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]]);
                    self.chunk_size = (size & 0x7FFF_FFFF) as usize;
                    log::debug!("peer chunk size set to {}", self.chunk_size);
                }
                return Ok(msg);
            }
        }
    }

    fn read_chunk<R: Read>(&mut self, input: &mut R) -> Result<Option<Message>> {
        let basic = read_u8(input)?;
        let fmt = basic >> 6;
        let (csid, basic_len) = match basic & 0x3F {
            0 => (64 + read_u8(input)? as u32, 2u64),
            1 => {
                let lo = read_u8(input)? as u32;
                let hi = read_u8(input)? as u32;
                (64 + lo + hi * 256, 3u64)
            }
            n => (n as u32, 1u64),
        };

        let state = self.states.entry(csid).or_default();
        let mut ts_field = 0u32;
        match fmt {
            0 => {
                ts_field = read_u24(input)?;
                state.length = read_u24(input)? as usize;
                state.type_id = read_u8(input)?;
                state.stream_id = read_u32_le(input)?;
                state.timestamp_delta = 0;
            }
            1 => {
                ts_field = read_u24(input)?;
                state.length = read_u24(input)? as usize;
                state.type_id = read_u8(input)?;
            }
            2 => {
                ts_field = read_u24(input)?;
            }
            _ => {}
        }

        if fmt < 3 {
            state.extended = ts_field == EXTENDED_TIMESTAMP;
        }
        let extended = state.extended;
        if extended {
            ts_field = read_u32(input)?;
        }

        match fmt {
            0 => state.timestamp = ts_field,
            1 | 2 => {
                state.timestamp_delta = ts_field;
                if state.partial.is_empty() {
                    state.timestamp = state.timestamp.wrapping_add(ts_field);
                }
            }
            _ => {
                if state.partial.is_empty() {
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                }
            }
        }

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        } + if extended { 4 } else { 0 };
        self.bytes_read += basic_len + header_len as u64;

        if state.length == 0 {
            return Err(StreamError::Protocol(format!("chunk for csid {} with unknown length", csid)));
        }

        let remaining = state.length - state.partial.len();
        let take = remaining.min(self.chunk_size);
        let mut buf = vec![0u8; take];
        input.read_exact(&mut buf)?;
        self.bytes_read += take as u64;
        state.partial.extend_from_slice(&buf);

        if state.partial.len() == state.length {
            let payload = Bytes::from(std::mem::take(&mut state.partial));
            return Ok(Some(Message {
                type_id: state.type_id,
                stream_id: state.stream_id,
                timestamp: state.timestamp,
                payload,
            }));
        }
        Ok(None)
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    input.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u24<R: Read>(input: &mut R) -> Result<u32> {
    let mut b = [0u8; 3];
    input.read_exact(&mut b)?;
    Ok(u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    input.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u32_le<R: Read>(input: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    input.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message, writer_chunk: usize) -> Message {
        let mut writer = ChunkWriter::new();
        writer.set_chunk_size(writer_chunk);
        let mut wire = Vec::new();
        // Announce the size the way a session would.
        let announce = Message::set_chunk_size(writer_chunk as u32);
        ChunkWriter::new()
            .write_message(&mut wire, csid::CONTROL, &announce)
            .unwrap();
        writer.write_message(&mut wire, csid::VIDEO, msg).unwrap();

        let mut reader = ChunkReader::new();
        let mut cursor = std::io::Cursor::new(wire);
        let first = reader.read_message(&mut cursor).unwrap();
        assert_eq!(first.type_id, msg_type::SET_CHUNK_SIZE);
        reader.read_message(&mut cursor).unwrap()
    }

    #[test]
    fn test_small_message_round_trip() {
        let msg = Message::video(Bytes::from(vec![1, 2, 3, 4]), 1, 40);
        let got = round_trip(&msg, 4096);
        assert_eq!(got, msg);
    }

    #[test]
    fn test_multi_chunk_message_reassembled() {
        let payload: Vec<u8> = (0..u8::MAX).cycle().take(10_000).collect();
        let msg = Message::video(Bytes::from(payload), 1, 1000);
        let got = round_trip(&msg, 512);
        assert_eq!(got.payload, msg.payload);
        assert_eq!(got.timestamp, 1000);
    }

    #[test]
    fn test_extended_timestamp_round_trip() {
        let msg = Message::video(Bytes::from(vec![9u8; 300]), 1, 0x0100_0000);
        let got = round_trip(&msg, 128);
        assert_eq!(got.timestamp, 0x0100_0000);
        assert_eq!(got.payload, msg.payload);
    }

    #[test]
    fn test_stream_stays_in_sync_after_extended_continuations() {
        // The continuation chunks repeat the 4-byte extended timestamp; the
        // reader must consume them or everything after desyncs.
        let mut writer = ChunkWriter::new();
        writer.set_chunk_size(128);
        let mut wire = Vec::new();
        let announce = Message::set_chunk_size(128);
        ChunkWriter::new().write_message(&mut wire, csid::CONTROL, &announce).unwrap();
        let big = Message::video(Bytes::from(vec![7u8; 300]), 1, 0x0100_0000);
        writer.write_message(&mut wire, csid::VIDEO, &big).unwrap();
        let small = Message::audio(Bytes::from(vec![1, 2, 3]), 1, 0x0100_0014);
        writer.write_message(&mut wire, csid::AUDIO, &small).unwrap();

        let mut reader = ChunkReader::new();
        let mut cursor = std::io::Cursor::new(wire);
        assert_eq!(reader.read_message(&mut cursor).unwrap().type_id, msg_type::SET_CHUNK_SIZE);
        assert_eq!(reader.read_message(&mut cursor).unwrap(), big);
        assert_eq!(reader.read_message(&mut cursor).unwrap(), small);
    }

    #[test]
    fn test_reader_counts_bytes() {
        let msg = Message::audio(Bytes::from(vec![5u8; 64]), 1, 20);
        let mut wire = Vec::new();
        ChunkWriter::new().write_message(&mut wire, csid::AUDIO, &msg).unwrap();

        let mut reader = ChunkReader::new();
        let mut cursor = std::io::Cursor::new(wire.clone());
        reader.read_message(&mut cursor).unwrap();
        assert_eq!(reader.bytes_read(), wire.len() as u64);
    }

    #[test]
    fn test_control_message_constructors() {
        let ack = Message::acknowledgement(0xDEAD_BEEF);
        assert_eq!(ack.type_id, msg_type::ACK);
        assert_eq!(&ack.payload[..], &0xDEAD_BEEFu32.to_be_bytes());

        let scs = Message::set_chunk_size(4096);
        assert_eq!(&scs.payload[..], &4096u32.to_be_bytes());
    }
}
