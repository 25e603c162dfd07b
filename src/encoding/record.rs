//! # Log Record Codec
//!
//! One log entry is `varint(key_len) ∥ key ∥ varint(value_len) ∥ value`.
//! A zero-length value is a tombstone. The full-map encoding used by
//! compaction is a plain concatenation of entries; replay applies them
//! in order with last-write-wins semantics.
//!
//! Replay is deliberately tolerant: the CRC protocol has already vouched
//! for the bytes, so a malformed tail stops the replay with a warning
//! instead of failing the whole load.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use tracing::warn;

use super::varint::{decode_varint32, encode_varint32, varint32_len};

/// Encoded size of one entry.
pub fn entry_size(key: &str, value: &[u8]) -> usize {
    varint32_len(key.len() as u32) + key.len() + varint32_len(value.len() as u32) + value.len()
}

/// Serialize one entry at the front of `dst`, returning the bytes written.
///
/// `dst` must have room for [`entry_size`] bytes.
pub fn write_entry(dst: &mut [u8], key: &str, value: &[u8]) -> Result<usize> {
    let size = entry_size(key, value);
    ensure!(
        dst.len() >= size,
        "entry of {} bytes does not fit in {} bytes of output",
        size,
        dst.len()
    );

    let mut pos = encode_varint32(key.len() as u32, dst);
    dst[pos..pos + key.len()].copy_from_slice(key.as_bytes());
    pos += key.len();
    pos += encode_varint32(value.len() as u32, &mut dst[pos..]);
    dst[pos..pos + value.len()].copy_from_slice(value);
    pos += value.len();

    Ok(pos)
}

/// Append one entry to a growable buffer.
pub fn push_entry(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    let start = out.len();
    out.resize(start + entry_size(key, value), 0);
    // write_entry cannot fail here, the buffer was sized above
    let written = write_entry(&mut out[start..], key, value).unwrap_or(0);
    out.truncate(start + written);
}

/// Encode the whole dictionary as a concatenation of entries.
///
/// Iteration order is unspecified; replay order between distinct keys
/// does not matter.
pub fn encode_map(dic: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let total: usize = dic.iter().map(|(k, v)| entry_size(k, v)).sum();
    let mut out = Vec::with_capacity(total);
    for (key, value) in dic {
        push_entry(&mut out, key, value);
    }
    out
}

/// Replay a log slice into `dic` with last-write-wins semantics.
///
/// Tombstones (zero-length values) remove the key; empty keys are
/// skipped. Returns the number of bytes consumed.
pub fn replay_into(dic: &mut HashMap<String, Vec<u8>>, bytes: &[u8]) -> usize {
    let mut pos = 0;
    while pos < bytes.len() {
        match decode_entry(&bytes[pos..]) {
            Ok((key, value, read)) => {
                if !key.is_empty() {
                    if value.is_empty() {
                        dic.remove(key);
                    } else {
                        dic.insert(key.to_owned(), value.to_vec());
                    }
                }
                pos += read;
            }
            Err(err) => {
                warn!(offset = pos, %err, "malformed log tail, stopping replay");
                break;
            }
        }
    }
    pos
}

/// Decode one entry from the front of `bytes`.
fn decode_entry(bytes: &[u8]) -> Result<(&str, &[u8], usize)> {
    let (key_len, mut pos) = decode_varint32(bytes)?;
    let key_len = key_len as usize;
    ensure!(
        pos + key_len <= bytes.len(),
        "key of {} bytes overruns buffer",
        key_len
    );
    let key = std::str::from_utf8(&bytes[pos..pos + key_len])?;
    pos += key_len;

    let (value_len, read) = decode_varint32(&bytes[pos..])?;
    pos += read;
    let value_len = value_len as usize;
    ensure!(
        pos + value_len <= bytes.len(),
        "value of {} bytes overruns buffer",
        value_len
    );
    let value = &bytes[pos..pos + value_len];
    pos += value_len;

    Ok((key, value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let mut buf = vec![0u8; entry_size("answer", b"42")];
        let written = write_entry(&mut buf, "answer", b"42").unwrap();
        assert_eq!(written, buf.len());

        let (key, value, read) = decode_entry(&buf).unwrap();
        assert_eq!(key, "answer");
        assert_eq!(value, b"42");
        assert_eq!(read, buf.len());
    }

    #[test]
    fn replay_applies_last_write_wins() {
        let mut log = Vec::new();
        push_entry(&mut log, "a", b"1");
        push_entry(&mut log, "b", b"2");
        push_entry(&mut log, "a", b"3");

        let mut dic = HashMap::new();
        let consumed = replay_into(&mut dic, &log);
        assert_eq!(consumed, log.len());
        assert_eq!(dic.len(), 2);
        assert_eq!(dic["a"], b"3");
        assert_eq!(dic["b"], b"2");
    }

    #[test]
    fn tombstone_removes_key() {
        let mut log = Vec::new();
        push_entry(&mut log, "gone", b"value");
        push_entry(&mut log, "kept", b"value");
        push_entry(&mut log, "gone", b"");

        let mut dic = HashMap::new();
        replay_into(&mut dic, &log);
        assert_eq!(dic.len(), 1);
        assert!(dic.contains_key("kept"));
    }

    #[test]
    fn replay_stops_at_malformed_tail() {
        let mut log = Vec::new();
        push_entry(&mut log, "ok", b"1");
        let good_len = log.len();
        // a key length that overruns the buffer
        log.push(0x7f);
        log.push(b'x');

        let mut dic = HashMap::new();
        let consumed = replay_into(&mut dic, &log);
        assert_eq!(consumed, good_len);
        assert_eq!(dic.len(), 1);
    }

    #[test]
    fn replay_skips_zeroed_regions() {
        // A zero byte pair decodes as an empty key with an empty value;
        // both are ignored so a zero-filled torn tail yields no entries.
        let mut log = Vec::new();
        push_entry(&mut log, "a", b"1");
        log.extend_from_slice(&[0u8; 64]);

        let mut dic = HashMap::new();
        let consumed = replay_into(&mut dic, &log);
        assert_eq!(consumed, log.len());
        assert_eq!(dic.len(), 1);
        assert_eq!(dic["a"], b"1");
    }

    #[test]
    fn encode_map_roundtrips_through_replay() {
        let mut dic = HashMap::new();
        dic.insert("one".to_owned(), b"1".to_vec());
        dic.insert("two".to_owned(), b"22".to_vec());
        dic.insert("three".to_owned(), b"333".to_vec());

        let encoded = encode_map(&dic);
        let mut decoded = HashMap::new();
        replay_into(&mut decoded, &encoded);
        assert_eq!(dic, decoded);
    }
}
