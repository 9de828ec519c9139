//! Content digests.
//!
//! Every content-addressed value in Kiln (layers, cache keys, blobs, image
//! configs) is identified by a SHA-256 digest rendered as `sha256:<hex>`.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{KilnError, KilnResult};

const ALGORITHM: &str = "sha256";
const HEX_LEN: usize = 64;

/// A `sha256:<hex>` content digest.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    /// Digest of a byte slice.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish a running hasher into a digest.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{ALGORITHM}:{}", hex::encode(hasher.finalize())))
    }

    /// Parse and validate a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidDigest`] if the algorithm is not sha256 or
    /// the hex part is malformed.
    pub fn parse(value: &str) -> KilnResult<Self> {
        let invalid = || KilnError::InvalidDigest {
            value: value.to_string(),
        };

        let (algorithm, hex_part) = value.split_once(':').ok_or_else(invalid)?;
        if algorithm != ALGORITHM
            || hex_part.len() != HEX_LEN
            || !hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }

        Ok(Self(value.to_string()))
    }

    /// The algorithm part (always `sha256`).
    #[must_use]
    pub fn algorithm(&self) -> &str {
        ALGORITHM
    }

    /// The hex part, without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// The full `sha256:<hex>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl FromStr for Digest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// An [`io::Write`] sink that hashes everything written to it.
///
/// Optionally forwards the bytes to an inner writer, so a tar stream can be
/// hashed while it is being produced.
pub struct Sha256Writer<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl Sha256Writer<io::Sink> {
    /// A writer that only hashes.
    #[must_use]
    pub fn sink() -> Self {
        Self::new(io::sink())
    }
}

impl<W: io::Write> Sha256Writer<W> {
    /// Wrap an inner writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Number of bytes written so far.
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing and return the digest with the inner writer.
    pub fn finish(self) -> (Digest, W) {
        (Digest::from_hasher(self.hasher), self.inner)
    }
}

impl<W: io::Write> io::Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
