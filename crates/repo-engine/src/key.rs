use std::fmt;

/// Width in bytes of an object id.
pub const KEY_SIZE: usize = 32;

/// A 256-bit content-addressed object id.
///
/// The engine is oblivious to how a key is derived (that is the chunker's
/// job, out of scope here); it only ever compares and hashes the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Parse a `Key` from a byte slice of exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_SIZE]>::try_from(bytes).ok().map(Self)
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The key whose first 4 bytes are `i` as big-endian `u32`, rest zero.
    ///
    /// Used throughout the test suite to build the concrete scenarios from
    /// the testable-properties section of the design.
    pub fn h(i: u32) -> Key {
        let mut buf = [0u8; KEY_SIZE];
        buf[..4].copy_from_slice(&i.to_be_bytes());
        Key(buf)
    }

    #[test]
    fn display_is_hex() {
        let k = h(1);
        assert_eq!(k.to_string(), "00000001000000000000000000000000000000000000000000000000000000"[..64]);
    }

    #[test]
    fn round_trip_slice() {
        let k = h(42);
        let parsed = Key::from_slice(k.as_ref()).unwrap();
        assert_eq!(k, parsed);
    }
}
