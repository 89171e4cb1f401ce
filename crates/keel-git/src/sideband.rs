//! Side-band multiplexing.
//!
//! When a client negotiates `side-band` or `side-band-64k`, the server wraps
//! pack data, progress text and fatal errors in pkt-lines whose first payload
//! byte names the band.

use crate::pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_DATA_LEN};
use crate::{GitError, Result};
use std::io::{self, Read, Write};

/// A side-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    /// Pack data.
    Data = 1,
    /// Human-readable progress.
    Progress = 2,
    /// Fatal error message.
    Error = 3,
}

impl Band {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Which side-band flavour, if any, a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBandMode {
    /// No multiplexing: pack bytes go out raw.
    #[default]
    None,
    /// `side-band`: 1000-byte packets.
    SideBand,
    /// `side-band-64k`: full-size packets.
    SideBand64k,
}

impl SideBandMode {
    /// Picks the mode from the client's capabilities, preferring 64k.
    pub fn negotiate(side_band_64k: bool, side_band: bool) -> Self {
        if side_band_64k {
            Self::SideBand64k
        } else if side_band {
            Self::SideBand
        } else {
            Self::None
        }
    }

    /// Returns true if output is multiplexed.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Largest payload per packet, band byte excluded.
    pub fn max_payload(&self) -> usize {
        match self {
            Self::SideBand => 1000 - 4 - 1,
            _ => MAX_PKT_DATA_LEN - 1,
        }
    }
}

/// Writes band-1 data as a byte stream, splitting it into packets.
///
/// With [`SideBandMode::None`] bytes pass straight through to the inner
/// writer; progress messages are then dropped.
pub struct SideBandWriter<W: Write> {
    inner: W,
    mode: SideBandMode,
}

impl<W: Write> SideBandWriter<W> {
    /// Creates a writer over `inner`.
    pub fn new(inner: W, mode: SideBandMode) -> Self {
        Self { inner, mode }
    }

    /// Returns the mode in use.
    pub fn mode(&self) -> SideBandMode {
        self.mode
    }

    /// Sends `bytes` on `band`, splitting into as many packets as needed.
    pub fn send(&mut self, band: Band, bytes: &[u8]) -> Result<()> {
        if !self.mode.is_enabled() {
            if band == Band::Data {
                self.inner.write_all(bytes)?;
            }
            return Ok(());
        }
        let mut out = PktLineWriter::new(&mut self.inner);
        for chunk in bytes.chunks(self.mode.max_payload()) {
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(band as u8);
            payload.extend_from_slice(chunk);
            out.write(&PktLine::Data(payload))?;
        }
        Ok(())
    }

    /// Sends a progress line on band 2.
    pub fn progress(&mut self, message: &str) -> Result<()> {
        self.send(Band::Progress, message.as_bytes())
    }

    /// Sends a fatal error on band 3, or an `ERR` packet without side-band.
    pub fn error(&mut self, message: &str) -> Result<()> {
        if self.mode.is_enabled() {
            self.send(Band::Error, format!("{}\n", message).as_bytes())
        } else {
            PktLineWriter::new(&mut self.inner).write_error(message)
        }
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for SideBandWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Band::Data, buf).map_err(|e| match e {
            GitError::Io(e) => e,
            GitError::Disconnect => io::ErrorKind::BrokenPipe.into(),
            GitError::Timeout => io::ErrorKind::TimedOut.into(),
            other => io::Error::other(other.to_string()),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Output of a multiplexed stream, split by band.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demultiplexed {
    /// Concatenated band-1 bytes.
    pub data: Vec<u8>,
    /// Concatenated band-2 bytes.
    pub progress: Vec<u8>,
}

/// Reads side-band packets until a flush or end of stream.
///
/// A band-3 packet ends the read with `RemoteError`.
pub fn read_multiplexed<R: Read>(reader: &mut PktLineReader<R>) -> Result<Demultiplexed> {
    let mut out = Demultiplexed::default();
    while let Some(pkt) = reader.read()? {
        let data = match pkt {
            PktLine::Flush => break,
            PktLine::Data(data) => data,
            other => {
                return Err(GitError::Protocol(format!(
                    "unexpected packet in side-band stream: {:?}",
                    other
                )))
            }
        };
        let Some((&band, payload)) = data.split_first() else {
            return Err(GitError::Protocol("empty side-band packet".to_string()));
        };
        match Band::from_byte(band) {
            Some(Band::Data) => out.data.extend_from_slice(payload),
            Some(Band::Progress) => out.progress.extend_from_slice(payload),
            Some(Band::Error) => {
                let msg = String::from_utf8_lossy(payload);
                return Err(GitError::RemoteError(msg.trim_end().to_string()));
            }
            None => {
                return Err(GitError::Protocol(format!("unknown side-band {}", band)));
            }
        }
    }
    Ok(out)
}
