//! Checksumming adapters for pack streams.

use sha1::{Digest, Sha1};
use std::io::{self, BufRead, Read, Write};

const BUFFER_SIZE: usize = 64 * 1024;

/// Buffered reader that hashes exactly the bytes its consumers use.
///
/// Decompressors take input through [`BufRead`] and only `consume` what the
/// zlib stream needed, so the running SHA-1 and [`HashingReader::offset`]
/// track the pack position precisely even though the inner reader is read
/// in large chunks.
pub struct HashingReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    hasher: Sha1,
    offset: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            hasher: Sha1::new(),
            offset: 0,
        }
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// SHA-1 of every byte consumed so far.
    pub fn checksum(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> io::Result<u8> {
        let byte = *self
            .fill_buf()?
            .first()
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.consume(1);
        Ok(byte)
    }

    /// Returns the inner reader. Buffered but unconsumed bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for HashingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos == self.filled {
            self.filled = loop {
                match self.inner.read(&mut self.buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let end = (self.pos + amt).min(self.filled);
        self.hasher.update(&self.buf[self.pos..end]);
        self.offset += (end - self.pos) as u64;
        self.pos = end;
    }
}

/// Writer that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
    offset: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            offset: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends the SHA-1 of everything written and returns the inner writer
    /// with that checksum.
    pub fn finish(mut self) -> io::Result<(W, [u8; 20])> {
        let checksum: [u8; 20] = self.hasher.finalize().into();
        self.inner.write_all(&checksum)?;
        self.inner.flush()?;
        Ok((self.inner, checksum))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
