//! AMF0 encoding and the minimal decoding needed for command replies

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::{Result, StreamError};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;

/// An AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
}

impl Amf0Value {
    /// Encode this value onto a buffer
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Amf0Value::Number(n) => {
                out.put_u8(MARKER_NUMBER);
                out.put_f64(*n);
            }
            Amf0Value::Boolean(b) => {
                out.put_u8(MARKER_BOOLEAN);
                out.put_u8(u8::from(*b));
            }
            Amf0Value::String(s) => {
                out.put_u8(MARKER_STRING);
                put_utf8(out, s);
            }
            Amf0Value::Object(fields) => {
                out.put_u8(MARKER_OBJECT);
                put_fields(out, fields);
            }
            Amf0Value::EcmaArray(fields) => {
                out.put_u8(MARKER_ECMA_ARRAY);
                out.put_u32(fields.len() as u32);
                put_fields(out, fields);
            }
            Amf0Value::Null => out.put_u8(MARKER_NULL),
            Amf0Value::Undefined => out.put_u8(MARKER_UNDEFINED),
        }
    }

    /// Decode a single value from the front of `buf`, advancing it
    pub fn decode(buf: &mut &[u8]) -> Result<Amf0Value> {
        if buf.is_empty() {
            return Err(StreamError::Protocol("truncated AMF0 value".into()));
        }
        let marker = buf.get_u8();
        match marker {
            MARKER_NUMBER => {
                ensure(buf, 8)?;
                Ok(Amf0Value::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(Amf0Value::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(Amf0Value::String(get_utf8(buf)?)),
            MARKER_OBJECT => Ok(Amf0Value::Object(get_fields(buf)?)),
            MARKER_ECMA_ARRAY => {
                ensure(buf, 4)?;
                let _count = buf.get_u32();
                Ok(Amf0Value::EcmaArray(get_fields(buf)?))
            }
            MARKER_NULL => Ok(Amf0Value::Null),
            MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
            other => Err(StreamError::Protocol(format!("unsupported AMF0 marker 0x{:02x}", other))),
        }
    }

    /// Fetch a named field from an object or ECMA array
    pub fn field(&self, name: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(fields) | Amf0Value::EcmaArray(fields) => {
                fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Encode a command message: name, transaction id, then arguments
pub fn encode_command(name: &str, transaction_id: f64, args: &[Amf0Value]) -> BytesMut {
    let mut out = BytesMut::with_capacity(64);
    Amf0Value::String(name.to_string()).encode(&mut out);
    Amf0Value::Number(transaction_id).encode(&mut out);
    for arg in args {
        arg.encode(&mut out);
    }
    out
}

/// A decoded command reply (`_result`, `_error`, `onStatus`)
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub name: String,
    pub transaction_id: f64,
    pub values: Vec<Amf0Value>,
}

/// Decode a command message body
pub fn decode_command(mut body: &[u8]) -> Result<CommandReply> {
    let name = match Amf0Value::decode(&mut body)? {
        Amf0Value::String(s) => s,
        other => {
            return Err(StreamError::Protocol(format!(
                "command does not start with a string: {:?}",
                other
            )))
        }
    };
    let transaction_id = match Amf0Value::decode(&mut body)? {
        Amf0Value::Number(n) => n,
        _ => 0.0,
    };
    let mut values = Vec::new();
    while !body.is_empty() {
        values.push(Amf0Value::decode(&mut body)?);
    }
    Ok(CommandReply { name, transaction_id, values })
}

fn put_utf8(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn put_fields(out: &mut BytesMut, fields: &[(String, Amf0Value)]) {
    for (key, value) in fields {
        put_utf8(out, key);
        value.encode(out);
    }
    out.put_u16(0);
    out.put_u8(MARKER_OBJECT_END);
}

fn ensure(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(StreamError::Protocol("truncated AMF0 value".into()));
    }
    Ok(())
}

fn get_utf8(buf: &mut &[u8]) -> Result<String> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let (head, rest) = buf.split_at(len);
    let s = String::from_utf8(head.to_vec())
        .map_err(|_| StreamError::Protocol("invalid UTF-8 in AMF0 string".into()))?;
    *buf = rest;
    Ok(s)
}

fn get_fields(buf: &mut &[u8]) -> Result<Vec<(String, Amf0Value)>> {
    let mut fields = Vec::new();
    loop {
        let key = get_utf8(buf)?;
        if key.is_empty() {
            ensure(buf, 1)?;
            let marker = buf.get_u8();
            if marker != MARKER_OBJECT_END {
                return Err(StreamError::Protocol("missing AMF0 object end".into()));
            }
            return Ok(fields);
        }
        let value = Amf0Value::decode(buf)?;
        fields.push((key, value));
    }
}
