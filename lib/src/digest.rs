//! Streaming digest computation and verification.
//!
//! Everything content-addressed in this crate funnels through the types
//! here: [`Digester`] wraps an OpenSSL hasher keyed by an OCI digest
//! algorithm, and the tee readers/writers compute digests and byte
//! counts as a side effect of normal I/O so blobs never need a second
//! pass.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use oci_spec::image::{Digest, DigestAlgorithm};
use openssl::hash::{Hasher, MessageDigest};

use crate::Error;

/// Map an OCI digest algorithm to the OpenSSL implementation.
pub(crate) fn message_digest(algorithm: &DigestAlgorithm) -> Result<MessageDigest> {
    match algorithm {
        DigestAlgorithm::Sha256 => Ok(MessageDigest::sha256()),
        DigestAlgorithm::Sha384 => Ok(MessageDigest::sha384()),
        DigestAlgorithm::Sha512 => Ok(MessageDigest::sha512()),
        o => Err(Error::Invalid(format!("unsupported digest algorithm {o}")).into()),
    }
}

/// A streaming hasher producing an algorithm-tagged [`Digest`].
pub struct Digester {
    algorithm: DigestAlgorithm,
    hasher: Hasher,
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Digester {
    /// Create a digester for the given algorithm.
    pub fn new(algorithm: &DigestAlgorithm) -> Result<Self> {
        Ok(Self {
            algorithm: algorithm.clone(),
            hasher: Hasher::new(message_digest(algorithm)?).context("Creating hasher")?,
        })
    }

    /// Shorthand for the default (SHA-256) digester.
    pub fn sha256() -> Result<Self> {
        Self::new(&DigestAlgorithm::Sha256)
    }

    /// Feed bytes into the hash.
    pub fn update(&mut self, buf: &[u8]) -> Result<()> {
        self.hasher.update(buf).context("Updating hash")?;
        Ok(())
    }

    /// Finalize and return the computed digest.
    pub fn finish(&mut self) -> Result<Digest> {
        let bytes = self.hasher.finish().context("Finalizing hash")?;
        let digest = format!("{}:{}", self.algorithm, hex::encode(bytes));
        Ok(digest.parse()?)
    }

    /// Hash the entirety of a reader, returning the digest and the byte count.
    pub fn consume(mut self, mut src: impl Read) -> Result<(Digest, u64)> {
        let mut buf = [0u8; 16384];
        let mut total = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.update(&buf[..n])?;
            total += n as u64;
        }
        Ok((self.finish()?, total))
    }
}

/// A reader that hashes and counts everything read through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    digester: Digester,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`, hashing with `algorithm`.
    pub fn new(inner: R, algorithm: &DigestAlgorithm) -> Result<Self> {
        Ok(Self {
            inner,
            digester: Digester::new(algorithm)?,
            count: 0,
        })
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Finalize, returning the digest and byte count of everything read.
    pub fn finish(mut self) -> Result<(Digest, u64)> {
        let digest = self.digester.finish()?;
        Ok((digest, self.count))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester
            .update(&buf[..n])
            .map_err(std::io::Error::other)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// A writer that hashes and counts everything written through it.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    digester: Digester,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`, hashing with `algorithm`.
    pub fn new(inner: W, algorithm: &DigestAlgorithm) -> Result<Self> {
        Ok(Self {
            inner,
            digester: Digester::new(algorithm)?,
            count: 0,
        })
    }

    /// Finalize, returning the digest, the byte count, and the inner writer.
    pub fn finish(mut self) -> Result<(Digest, u64, W)> {
        let digest = self.digester.finish()?;
        Ok((digest, self.count, self.inner))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester
            .update(&buf[..n])
            .map_err(std::io::Error::other)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader which verifies that the content read matches an expected
/// digest (and, optionally, an expected size).
///
/// Verification happens in [`VerifiedReader::close`], which first drains
/// any unread remainder so the whole stream is covered. Callers that only
/// care about existence should stat instead of opening one of these.
#[derive(Debug)]
pub struct VerifiedReader<R> {
    inner: HashingReader<R>,
    expected: Digest,
    expected_size: Option<u64>,
}

impl<R: Read> VerifiedReader<R> {
    /// Wrap `inner`; the content must hash to `expected` and (when given)
    /// be exactly `expected_size` bytes long.
    pub fn new(inner: R, expected: Digest, expected_size: Option<u64>) -> Result<Self> {
        Ok(Self {
            inner: HashingReader::new(inner, expected.algorithm())?,
            expected,
            expected_size,
        })
    }

    /// Consume the remainder of the stream and verify digest and size.
    pub fn close(mut self) -> Result<()> {
        std::io::copy(&mut self, &mut std::io::sink()).context("Draining verified reader")?;
        let expected = self.expected;
        let (computed, size) = self.inner.finish()?;
        if computed != expected {
            return Err(Error::corrupt_blob(
                &expected,
                format!("content hashed to {computed}"),
            )
            .into());
        }
        if let Some(expected_size) = self.expected_size {
            if size != expected_size {
                return Err(Error::corrupt_blob(
                    &expected,
                    format!("expected {expected_size} bytes, read {size}"),
                )
                .into());
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_DIGEST: &str =
        "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn test_digester() -> Result<()> {
        let mut d = Digester::sha256()?;
        d.update(b"hello\n")?;
        assert_eq!(d.finish()?.to_string(), HELLO_DIGEST);
        Ok(())
    }

    #[test]
    fn test_hashing_reader() -> Result<()> {
        let mut r = HashingReader::new(&b"hello\n"[..], &DigestAlgorithm::Sha256)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, b"hello\n");
        let (digest, size) = r.finish()?;
        assert_eq!(digest.to_string(), HELLO_DIGEST);
        assert_eq!(size, 6);
        Ok(())
    }

    #[test]
    fn test_verified_reader() -> Result<()> {
        let expected: Digest = HELLO_DIGEST.parse()?;
        // Happy path, including the unread remainder being drained.
        let r = VerifiedReader::new(&b"hello\n"[..], expected.clone(), Some(6))?;
        r.close()?;
        // Corrupted content.
        let r = VerifiedReader::new(&b"hellO\n"[..], expected.clone(), Some(6))?;
        let err = r.close().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptBlob { .. })
        ));
        // Truncation with a matching prefix digest is still an error.
        let truncated: Digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            .parse()?;
        let r = VerifiedReader::new(&b"hello"[..], truncated, Some(6))?;
        let err = r.close().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptBlob { .. })
        ));
        Ok(())
    }
}
