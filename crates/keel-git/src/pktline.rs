//! Pkt-line framing.
//!
//! Every protocol message is framed as a pkt-line: a 4-character hex length
//! (counting the prefix itself) followed by the payload. Lengths `0000`,
//! `0001` and `0002` are the flush, delimiter and response-end markers.

use crate::{GitError, Result};
use std::io::{self, Read, Write};

/// Largest pkt-line, prefix included.
pub const MAX_PKT_LEN: usize = 65520;
/// Largest payload a single pkt-line can carry.
pub const MAX_PKT_DATA_LEN: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A payload-carrying packet.
    Data(Vec<u8>),
    /// `0000`, ending a message.
    Flush,
    /// `0001`, separating sections.
    Delimiter,
    /// `0002`, ending a stateless response.
    ResponseEnd,
}

impl PktLine {
    /// Wraps `s` verbatim, without adding a newline.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a newline-terminated data packet.
    pub fn line(s: &str) -> Self {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        Self::Data(data)
    }

    /// Wraps raw bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Wire form: hex length prefix, then the payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let mut result = format!("{:04x}", data.len() + 4).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    /// Returns true for `0000`.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Payload bytes; `None` for the marker packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Payload as UTF-8 without its trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.strip_suffix('\n').unwrap_or(s))
    }
}

/// Pulls packets off a byte stream.
///
/// Reads exactly the bytes of each packet and never buffers ahead, so the
/// underlying reader can be handed to the pack parser once the command
/// section ends.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Wraps `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    ///
    /// Returns `Ok(None)` on a clean end of stream between packets. A stream
    /// that ends inside a packet is a `Disconnect`, and an `ERR` packet is
    /// surfaced as `RemoteError`.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        if !self.fill_or_eof(&mut len_buf)? {
            return Ok(None);
        }

        if !len_buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(GitError::InvalidPktLine(format!(
                "invalid length prefix {:?}",
                String::from_utf8_lossy(&len_buf)
            )));
        }
        let len = len_buf
            .iter()
            .fold(0usize, |acc, b| acc * 16 + hex_value(*b) as usize);

        let pkt = match len {
            0 => PktLine::Flush,
            1 => PktLine::Delimiter,
            2 => PktLine::ResponseEnd,
            3 => return Err(GitError::InvalidPktLine("length too small".to_string())),
            _ if len > MAX_PKT_LEN => {
                return Err(GitError::InvalidPktLine(format!(
                    "length {} exceeds {}",
                    len, MAX_PKT_LEN
                )))
            }
            _ => {
                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data)?;
                if let Some(msg) = data.strip_prefix(b"ERR ") {
                    let msg = String::from_utf8_lossy(msg);
                    return Err(GitError::RemoteError(msg.trim_end().to_string()));
                }
                PktLine::Data(data)
            }
        };
        tracing::trace!(pkt = ?pkt, "pkt-line in");
        Ok(Some(pkt))
    }

    /// Reads the next packet, treating end of stream as a disconnect.
    pub fn read_required(&mut self) -> Result<PktLine> {
        self.read()?.ok_or(GitError::Disconnect)
    }

    /// Collects packets up to, not including, the next flush.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read_required()? {
                PktLine::Flush => break,
                pkt => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// The wrapped reader, positioned after the last packet read.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Unwraps the reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Fills `buf` completely, or returns false if the stream ended before
    /// its first byte.
    fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(GitError::Disconnect),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Frames packets onto a byte stream.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.len() > MAX_PKT_DATA_LEN {
                return Err(GitError::InvalidPktLine(format!(
                    "payload of {} bytes exceeds {}",
                    data.len(),
                    MAX_PKT_DATA_LEN
                )));
            }
        }
        tracing::trace!(pkt = ?pkt, "pkt-line out");
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes every packet in order.
    pub fn write_all(&mut self, pkts: &[PktLine]) -> Result<()> {
        pkts.iter().try_for_each(|pkt| self.write(pkt))
    }

    /// Writes raw bytes as one packet.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes `s` as a newline-terminated packet.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        self.write(&PktLine::line(s))
    }

    /// Writes an `ERR` packet.
    pub fn write_error(&mut self, message: &str) -> Result<()> {
        self.write_line(&format!("ERR {}", message))
    }

    /// Writes `0000`.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the wrapped writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
