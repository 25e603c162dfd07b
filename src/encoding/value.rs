//! # Typed Value Codecs
//!
//! The store treats values as opaque bytes; these helpers give the
//! public API its typed surface. Booleans and integers travel as
//! varints (signed types through their unsigned bit patterns), floats
//! as little-endian fixed-width bytes, strings and byte strings with a
//! varint length prefix, and string lists as repeated length-prefixed
//! strings.
//!
//! Decoders are total: malformed or missing data yields the caller's
//! default rather than an error, per the public API contract.

use super::varint::{
    decode_varint32, decode_varint64, encode_varint32, encode_varint64, varint32_len, varint64_len,
};

pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

pub fn encode_i32(value: i32) -> Vec<u8> {
    let mut buf = vec![0u8; varint32_len(value as u32)];
    encode_varint32(value as u32, &mut buf);
    buf
}

pub fn encode_i64(value: i64) -> Vec<u8> {
    let mut buf = vec![0u8; varint64_len(value as u64)];
    encode_varint64(value as u64, &mut buf);
    buf
}

pub fn encode_f32(value: f32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn encode_f64(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn encode_str(value: &str) -> Vec<u8> {
    encode_bytes(value.as_bytes())
}

pub fn encode_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; varint32_len(value.len() as u32) + value.len()];
    let pos = encode_varint32(value.len() as u32, &mut out);
    out[pos..].copy_from_slice(value);
    out
}

pub fn encode_string_list(values: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(&encode_str(value));
    }
    out
}

pub fn decode_bool(data: &[u8], default: bool) -> bool {
    match decode_varint32(data) {
        Ok((value, _)) => value != 0,
        Err(_) => default,
    }
}

pub fn decode_i32(data: &[u8], default: i32) -> i32 {
    match decode_varint32(data) {
        Ok((value, _)) => value as i32,
        Err(_) => default,
    }
}

pub fn decode_i64(data: &[u8], default: i64) -> i64 {
    match decode_varint64(data) {
        Ok((value, _)) => value as i64,
        Err(_) => default,
    }
}

pub fn decode_f32(data: &[u8], default: f32) -> f32 {
    match data.first_chunk::<4>() {
        Some(bytes) => f32::from_le_bytes(*bytes),
        None => default,
    }
}

pub fn decode_f64(data: &[u8], default: f64) -> f64 {
    match data.first_chunk::<8>() {
        Some(bytes) => f64::from_le_bytes(*bytes),
        None => default,
    }
}

pub fn decode_str(data: &[u8]) -> Option<String> {
    let payload = decode_payload(data)?;
    String::from_utf8(payload.to_vec()).ok()
}

pub fn decode_bytes(data: &[u8]) -> Option<Vec<u8>> {
    decode_payload(data).map(<[u8]>::to_vec)
}

pub fn decode_string_list(data: &[u8]) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (len, read) = decode_varint32(&data[pos..]).ok()?;
        pos += read;
        let end = pos.checked_add(len as usize)?;
        if end > data.len() {
            return None;
        }
        out.push(String::from_utf8(data[pos..end].to_vec()).ok()?);
        pos = end;
    }
    Some(out)
}

/// Length of the payload behind the length prefix, if `data` is a
/// well-formed length-prefixed value. Used by `value_size(key, actual)`.
pub fn payload_len(data: &[u8]) -> Option<usize> {
    let (len, read) = decode_varint32(data).ok()?;
    (read + len as usize == data.len()).then_some(len as usize)
}

fn decode_payload(data: &[u8]) -> Option<&[u8]> {
    let (len, read) = decode_varint32(data).ok()?;
    let end = read.checked_add(len as usize)?;
    (end <= data.len()).then(|| &data[read..end])
}
