//! Pass-through reader that measures and hashes what flows through it.

use md5::{Digest, Md5};
use std::io::{self, Read};

pub struct DigestReader<R> {
    inner: R,
    hasher: Md5,
    size: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            size: 0,
        }
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Uppercase hex MD5 of the bytes read so far.
    pub fn md5_hex(&self) -> String {
        hex::encode_upper(self.hasher.clone().finalize())
    }

    /// Consume the reader, returning `(size, md5_hex)`.
    pub fn finish(self) -> (u64, String) {
        (self.size, hex::encode_upper(self.hasher.finalize()))
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.size += n as u64;
        }
        Ok(n)
    }
}
