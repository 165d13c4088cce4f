//! RTMP handshake (client side, plain C0/C1/C2)

use std::io::{Read, Write};

use crate::errors::{Result, StreamError};

const RTMP_VERSION: u8 = 3;
const HANDSHAKE_SIZE: usize = 1536;

/// Perform the client half of the RTMP handshake on `stream`
///
/// Sends C0+C1, reads S0+S1+S2, then sends C2 echoing S1. Uses the plain
/// (non-digest) scheme, which every mainstream ingest accepts for publishers.
pub fn client_handshake<S: Read + Write>(stream: &mut S) -> Result<()> {
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    // time(4) + zero(4) + random(1528); a counter keeps the payload cheap and
    // deterministic without depending on an RNG.
    for (i, byte) in c1[8..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    stream.write_all(&[RTMP_VERSION])?;
    stream.write_all(&c1)?;
    stream.flush()?;

    let mut s0 = [0u8; 1];
    stream.read_exact(&mut s0)?;
    if s0[0] != RTMP_VERSION {
        return Err(StreamError::Protocol(format!(
            "server requested unsupported RTMP version {}",
            s0[0]
        )));
    }

    let mut s1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1)?;
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2)?;

    // S2 must echo C1's random section; some servers echo time fields loosely,
    // so only the payload is checked.
    if s2[8..] != c1[8..] {
        return Err(StreamError::Protocol("handshake echo mismatch in S2".into()));
    }

    stream.write_all(&s1)?;
    stream.flush()?;
    log::debug!("RTMP handshake complete");
    Ok(())
}
