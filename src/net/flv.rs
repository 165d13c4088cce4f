//! Media payload packaging for RTMP messages
//!
//! Video uses the legacy AVC tag layout (AVCDecoderConfigurationRecord
//! sequence header, then AVCC-framed access units). Audio carries Opus with
//! the enhanced-RTMP extended audio header (fourCC signaling), since legacy
//! FLV sound formats have no Opus assignment.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{Result, StreamError};
use crate::net::amf::Amf0Value;
use crate::config::StreamConfig;

const NALU_SPS: u8 = 7;
const NALU_PPS: u8 = 8;

/// FrameType nibble values
const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;
/// CodecID for AVC in legacy tags
const CODEC_AVC: u8 = 7;
/// Extended header sound-format nibble
const AUDIO_EX_HEADER: u8 = 9;

/// Enhanced-RTMP audio packet types
const AUDIO_PACKET_SEQUENCE_START: u8 = 0;
const AUDIO_PACKET_CODED_FRAMES: u8 = 1;

const OPUS_FOURCC: &[u8; 4] = b"Opus";

/// Split an Annex B stream into NAL units (start codes stripped)
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        let code3 = data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1;
        let code4 = i + 3 < data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1;
        if code3 || code4 {
            if let Some(s) = start {
                units.push(&data[s..i]);
            }
            i += if code4 { 4 } else { 3 };
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        units.push(&data[s..]);
    }
    units.retain(|u| !u.is_empty());
    units
}

/// Extract the first SPS and PPS from an Annex B access unit
pub fn extract_parameter_sets(annex_b: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;
    for unit in split_annex_b(annex_b) {
        match unit[0] & 0x1F {
            NALU_SPS if sps.is_none() => sps = Some(unit.to_vec()),
            NALU_PPS if pps.is_none() => pps = Some(unit.to_vec()),
            _ => {}
        }
    }
    Some((sps?, pps?))
}

/// Build the AVC sequence-header tag body (AVCDecoderConfigurationRecord)
pub fn avc_sequence_header(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if sps.len() < 4 {
        return Err(StreamError::Protocol("SPS too short for configuration record".into()));
    }
    let mut out = BytesMut::with_capacity(16 + sps.len() + pps.len());
    out.put_u8(FRAME_KEY << 4 | CODEC_AVC);
    out.put_u8(0); // AVCPacketType: sequence header
    out.put_slice(&[0, 0, 0]); // composition time

    out.put_u8(1); // configurationVersion
    out.put_u8(sps[1]); // AVCProfileIndication
    out.put_u8(sps[2]); // profile_compatibility
    out.put_u8(sps[3]); // AVCLevelIndication
    out.put_u8(0xFF); // lengthSizeMinusOne = 3
    out.put_u8(0xE1); // one SPS
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(1); // one PPS
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);
    Ok(out.freeze())
}

/// Build a coded-frame video tag body: Annex B input re-framed as AVCC
pub fn avc_coded_frame(annex_b: &[u8], is_keyframe: bool) -> Bytes {
    let frame_type = if is_keyframe { FRAME_KEY } else { FRAME_INTER };
    let units = split_annex_b(annex_b);
    let body_len: usize = units.iter().map(|u| 4 + u.len()).sum();

    let mut out = BytesMut::with_capacity(5 + body_len);
    out.put_u8(frame_type << 4 | CODEC_AVC);
    out.put_u8(1); // AVCPacketType: NALU
    out.put_slice(&[0, 0, 0]); // composition time (no B frames)
    for unit in units {
        out.put_u32(unit.len() as u32);
        out.put_slice(unit);
    }
    out.freeze()
}

/// Build the Opus sequence-start tag body (OpusHead identification header)
pub fn opus_sequence_header(channels: u16, sample_rate: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + 19);
    out.put_u8(AUDIO_EX_HEADER << 4 | AUDIO_PACKET_SEQUENCE_START);
    out.put_slice(OPUS_FOURCC);

    out.put_slice(b"OpusHead");
    out.put_u8(1); // version
    out.put_u8(channels as u8);
    out.put_u16_le(312); // pre-skip, 6.5 ms at 48 kHz
    out.put_u32_le(sample_rate);
    out.put_i16_le(0); // output gain
    out.put_u8(0); // channel mapping family
    out.freeze()
}

/// Build a coded-frames audio tag body around one Opus packet
pub fn opus_coded_frame(packet: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + packet.len());
    out.put_u8(AUDIO_EX_HEADER << 4 | AUDIO_PACKET_CODED_FRAMES);
    out.put_slice(OPUS_FOURCC);
    out.put_slice(packet);
    out.freeze()
}

/// Build the `@setDataFrame onMetaData` body sent after publish
pub fn on_metadata(config: &StreamConfig, video_kbps: u32) -> Bytes {
    let meta = Amf0Value::EcmaArray(vec![
        ("width".to_string(), Amf0Value::Number(config.width as f64)),
        ("height".to_string(), Amf0Value::Number(config.height as f64)),
        ("framerate".to_string(), Amf0Value::Number(config.video_fps as f64)),
        ("videocodecid".to_string(), Amf0Value::Number(CODEC_AVC as f64)),
        ("videodatarate".to_string(), Amf0Value::Number(video_kbps as f64)),
        ("audiocodecid".to_string(), Amf0Value::String("Opus".into())),
        ("audiodatarate".to_string(), Amf0Value::Number(config.audio_kbps as f64)),
        ("audiosamplerate".to_string(), Amf0Value::Number(config.audio_sample_rate as f64)),
        ("audiochannels".to_string(), Amf0Value::Number(config.audio_channels as f64)),
        ("encoder".to_string(), Amf0Value::String(format!("livecast/{}", env!("CARGO_PKG_VERSION")))),
    ]);

    let mut out = BytesMut::with_capacity(256);
    Amf0Value::String("@setDataFrame".into()).encode(&mut out);
    Amf0Value::String("onMetaData".into()).encode(&mut out);
    meta.encode(&mut out);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b_sample() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(&[0x67, 0x42, 0xC0, 0x1E, 0xAA]); // SPS
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(&[0x68, 0xCE, 0x3C, 0x80]); // PPS
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(&[0x65, 0x88, 0x84, 0x00]); // IDR slice
        data
    }

    #[test]
    fn test_split_annex_b_handles_both_start_codes() {
        let sample = annex_b_sample();
        let units = split_annex_b(&sample);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0][0] & 0x1F, NALU_SPS);
        assert_eq!(units[1][0] & 0x1F, NALU_PPS);
        assert_eq!(units[2][0] & 0x1F, 5);
    }

    #[test]
    fn test_extract_parameter_sets() {
        let (sps, pps) = extract_parameter_sets(&annex_b_sample()).unwrap();
        assert_eq!(sps[0] & 0x1F, NALU_SPS);
        assert_eq!(pps[0] & 0x1F, NALU_PPS);
    }

    #[test]
    fn test_sequence_header_layout() {
        let (sps, pps) = extract_parameter_sets(&annex_b_sample()).unwrap();
        let body = avc_sequence_header(&sps, &pps).unwrap();
        assert_eq!(body[0], 0x17); // keyframe | AVC
        assert_eq!(body[1], 0); // sequence header
        assert_eq!(body[5], 1); // configurationVersion
        assert_eq!(body[6], sps[1]); // profile copied from SPS
    }

    #[test]
    fn test_coded_frame_is_avcc_framed() {
        let body = avc_coded_frame(&annex_b_sample(), true);
        assert_eq!(body[0], 0x17);
        assert_eq!(body[1], 1); // NALU packet
        // First NALU length prefix points at the SPS (5 bytes).
        assert_eq!(&body[5..9], &5u32.to_be_bytes());
    }

    #[test]
    fn test_inter_frame_marked() {
        let body = avc_coded_frame(&annex_b_sample(), false);
        assert_eq!(body[0], 0x27); // inter | AVC
    }

    #[test]
    fn test_opus_sequence_header() {
        let body = opus_sequence_header(2, 48_000);
        assert_eq!(body[0], 0x90); // ex-header | sequence start
        assert_eq!(&body[1..5], b"Opus");
        assert_eq!(&body[5..13], b"OpusHead");
        assert_eq!(body[14], 2); // channels
    }

    #[test]
    fn test_opus_coded_frame_wraps_packet() {
        let body = opus_coded_frame(&[0xAB, 0xCD]);
        assert_eq!(body[0], 0x91); // ex-header | coded frames
        assert_eq!(&body[5..], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_metadata_contains_dimensions() {
        let body = on_metadata(&StreamConfig::default(), 600);
        let mut slice = &body[..];
        let set_data_frame = Amf0Value::decode(&mut slice).unwrap();
        assert_eq!(set_data_frame.as_str(), Some("@setDataFrame"));
        let name = Amf0Value::decode(&mut slice).unwrap();
        assert_eq!(name.as_str(), Some("onMetaData"));
        let meta = Amf0Value::decode(&mut slice).unwrap();
        assert_eq!(meta.field("width").and_then(Amf0Value::as_number), Some(640.0));
        assert_eq!(meta.field("framerate").and_then(Amf0Value::as_number), Some(15.0));
    }
}
