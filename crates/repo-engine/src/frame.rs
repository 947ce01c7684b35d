//! On-disk entry framing for a segment file.
//!
//! ```text
//! length: u32 le   -- total entry size, including this header
//! crc:    u32 le   -- CRC32C over everything after `length` and `crc`
//! tag:    u8       -- 0=PUT 1=DELETE 2=COMMIT
//! key:    32 bytes -- absent for COMMIT
//! payload: length - HEADER_LEN - (key? 32 : 0)
//! ```

use std::convert::TryInto;

use crc32c::crc32c;

use crate::error::{Error, Result};
use crate::key::{Key, KEY_SIZE};

/// First bytes of every segment file.
pub const MAGIC: [u8; 8] = *b"rbkseg01";

pub const LENGTH_LEN: usize = 4;
pub const CRC_LEN: usize = 4;
pub const TAG_LEN: usize = 1;
/// Bytes preceding the CRC'd region (length + crc themselves).
pub const PREFIX_LEN: usize = LENGTH_LEN + CRC_LEN;
/// Bytes of the CRC'd region preceding any key/payload.
pub const TAG_OFFSET: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Put = 0,
    Delete = 1,
    Commit = 2,
}

impl Tag {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Tag::Put),
            1 => Ok(Tag::Delete),
            2 => Ok(Tag::Commit),
            other => Err(Error::integrity(format!("unknown entry tag {other}"))),
        }
    }
}

/// A decoded log entry, borrowing nothing: owns its key/payload.
#[derive(Debug, Clone)]
pub enum Entry {
    Put { key: Key, payload: Vec<u8> },
    Delete { key: Key },
    Commit { tid: u64 },
}

impl Entry {
    pub fn tag(&self) -> Tag {
        match self {
            Entry::Put { .. } => Tag::Put,
            Entry::Delete { .. } => Tag::Delete,
            Entry::Commit { .. } => Tag::Commit,
        }
    }

    /// Encode this entry into its on-disk framed representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Entry::Put { key, payload } => {
                body.push(Tag::Put as u8);
                body.extend_from_slice(key.as_ref());
                body.extend_from_slice(payload);
            }
            Entry::Delete { key } => {
                body.push(Tag::Delete as u8);
                body.extend_from_slice(key.as_ref());
            }
            Entry::Commit { tid } => {
                body.push(Tag::Commit as u8);
                body.extend_from_slice(&tid.to_le_bytes());
            }
        }
        let crc = crc32c(&body);
        let length = (PREFIX_LEN + body.len()) as u32;

        let mut out = Vec::with_capacity(length as usize);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// The framed size this entry occupies (or would occupy) on disk.
    pub fn framed_size(&self) -> u64 {
        self.encode().len() as u64
    }

    /// Decode a single framed entry from `buf`, which must contain at least
    /// `length` bytes starting at a frame boundary.
    ///
    /// Returns the decoded entry and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < PREFIX_LEN + TAG_LEN {
            return Err(Error::integrity("truncated entry header"));
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if length < PREFIX_LEN + TAG_LEN {
            return Err(Error::integrity("entry length too small to be valid"));
        }
        if buf.len() < length {
            return Err(Error::integrity("truncated entry body"));
        }
        let expected_crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let body = &buf[PREFIX_LEN..length];
        let actual_crc = crc32c(body);
        if actual_crc != expected_crc {
            return Err(Error::integrity(format!(
                "crc mismatch: expected {expected_crc:#x} actual {actual_crc:#x}"
            )));
        }

        let tag = Tag::from_u8(body[0])?;
        let rest = &body[TAG_LEN..];
        let entry = match tag {
            Tag::Put => {
                if rest.len() < KEY_SIZE {
                    return Err(Error::integrity("PUT entry missing key"));
                }
                let key = Key::from_slice(&rest[..KEY_SIZE])
                    .ok_or_else(|| Error::integrity("malformed key"))?;
                let payload = rest[KEY_SIZE..].to_vec();
                Entry::Put { key, payload }
            }
            Tag::Delete => {
                if rest.len() != KEY_SIZE {
                    return Err(Error::integrity("DELETE entry has wrong size"));
                }
                let key = Key::from_slice(rest).ok_or_else(|| Error::integrity("malformed key"))?;
                Entry::Delete { key }
            }
            Tag::Commit => {
                if rest.len() != 8 {
                    return Err(Error::integrity("COMMIT entry has wrong size"));
                }
                let tid = u64::from_le_bytes(rest.try_into().unwrap());
                Entry::Commit { tid }
            }
        };
        Ok((entry, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_round_trips() {
        let e = Entry::Put { key: Key::from_bytes([7; KEY_SIZE]), payload: b"hello".to_vec() };
        let encoded = e.encode();
        let (decoded, consumed) = Entry::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        match decoded {
            Entry::Put { key, payload } => {
                assert_eq!(key, Key::from_bytes([7; KEY_SIZE]));
                assert_eq!(payload, b"hello");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn commit_round_trips() {
        let e = Entry::Commit { tid: 42 };
        let (decoded, _) = Entry::decode(&e.encode()).unwrap();
        match decoded {
            Entry::Commit { tid } => assert_eq!(tid, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn bitflip_in_payload_is_detected() {
        let e = Entry::Delete { key: Key::from_bytes([1; KEY_SIZE]) };
        let mut encoded = e.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Entry::decode(&encoded).is_err());
    }

    #[test]
    fn truncated_entry_is_detected() {
        let e = Entry::Put { key: Key::from_bytes([2; KEY_SIZE]), payload: vec![0; 64] };
        let encoded = e.encode();
        let truncated = &encoded[..encoded.len() - 10];
        assert!(Entry::decode(truncated).is_err());
    }
}
