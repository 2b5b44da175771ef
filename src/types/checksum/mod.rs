#![forbid(unsafe_code)]

//! CRC32 digests of overflowed values.

/// Running digest over the chunks of one value, fed in chain order.
#[derive(Clone, Default)]
pub struct ValueDigest {
    hasher: crc32fast::Hasher,
    len: u64,
}

impl ValueDigest {
    /// Starts an empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk payload.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if nothing was fed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CRC32 of everything fed so far.
    pub fn finish(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// CRC32 of a whole value.
pub fn value_crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
