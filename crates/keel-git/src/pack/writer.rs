//! Streaming pack writer.

use super::io::HashingWriter;
use super::{
    encode_entry_header, encode_ofs_distance, EntryKind, PackOptions, PACK_SIGNATURE,
    PACK_VERSION,
};
use crate::delta::DeltaIndex;
use crate::{GitError, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use keel_storage::{GitObject, ObjectId, ObjectStore};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::io::Write;

/// Objects smaller than this are never delta-compressed.
const MIN_DELTA_SIZE: usize = 32;

/// Writes pack entries one at a time.
///
/// The entry count goes into the header up front, so callers must write
/// exactly that many entries before [`PackWriter::finish`].
pub struct PackWriter<W: Write> {
    out: HashingWriter<W>,
    expected: u32,
    written: u32,
    level: Compression,
}

impl<W: Write> PackWriter<W> {
    /// Writes the pack header for `count` entries.
    pub fn new(writer: W, count: u32) -> Result<Self> {
        let mut out = HashingWriter::new(writer);
        out.write_all(PACK_SIGNATURE)?;
        out.write_all(&PACK_VERSION.to_be_bytes())?;
        out.write_all(&count.to_be_bytes())?;
        Ok(Self {
            out,
            expected: count,
            written: 0,
            level: Compression::default(),
        })
    }

    /// Sets the zlib level used for entry bodies.
    pub fn with_compression(mut self, level: Compression) -> Self {
        self.level = level;
        self
    }

    /// Bytes written so far, which is also the offset of the next entry.
    pub fn offset(&self) -> u64 {
        self.out.offset()
    }

    /// Writes a whole object and returns its offset.
    pub fn write_entry(&mut self, object: &GitObject) -> Result<u64> {
        let mut header = Vec::with_capacity(10);
        encode_entry_header(EntryKind::Object(object.object_type), object.size(), &mut header);
        self.write_raw(&header, &object.data)
    }

    /// Writes a delta against the entry at `base_offset` and returns its offset.
    pub fn write_ofs_delta(&mut self, base_offset: u64, delta: &[u8]) -> Result<u64> {
        let distance = self
            .offset()
            .checked_sub(base_offset)
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                GitError::InvalidPack(format!("delta base offset {} is not behind", base_offset))
            })?;
        let mut header = Vec::with_capacity(20);
        encode_entry_header(EntryKind::OfsDelta, delta.len(), &mut header);
        encode_ofs_distance(distance, &mut header);
        self.write_raw(&header, delta)
    }

    /// Writes a delta against the object `base` and returns its offset.
    pub fn write_ref_delta(&mut self, base: &ObjectId, delta: &[u8]) -> Result<u64> {
        let mut header = Vec::with_capacity(30);
        encode_entry_header(EntryKind::RefDelta, delta.len(), &mut header);
        header.extend_from_slice(base.as_bytes());
        self.write_raw(&header, delta)
    }

    fn write_raw(&mut self, header: &[u8], body: &[u8]) -> Result<u64> {
        if self.written == self.expected {
            return Err(GitError::InvalidPack(format!(
                "pack declared {} entries",
                self.expected
            )));
        }
        let offset = self.offset();
        self.out.write_all(header)?;
        let mut encoder = ZlibEncoder::new(&mut self.out, self.level);
        encoder.write_all(body)?;
        encoder.finish()?;
        self.written += 1;
        Ok(offset)
    }

    /// Appends the trailer and returns the inner writer and the checksum.
    pub fn finish(self) -> Result<(W, [u8; 20])> {
        if self.written != self.expected {
            return Err(GitError::InvalidPack(format!(
                "pack declared {} entries, wrote {}",
                self.expected, self.written
            )));
        }
        Ok(self.out.finish()?)
    }
}

/// Summary of a written pack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Entries written.
    pub objects: usize,
    /// Entries stored as deltas.
    pub deltas: usize,
    /// Total pack size, trailer included.
    pub bytes: u64,
    /// Trailer checksum.
    pub checksum: [u8; 20],
}

/// A recently written object that later ones may delta against.
struct Candidate {
    id: ObjectId,
    offset: u64,
    depth: usize,
    index: DeltaIndex,
}

/// Writes the objects `ids` from `store` as a pack.
///
/// Objects are ordered by kind, then by size descending, so each one is
/// compared against the larger objects of the same kind just before it.
/// A delta is kept only when smaller than half the object it replaces.
/// Ordering uses object headers only; payloads are loaded one at a time as
/// they are written, so memory is bounded by the delta window.
pub fn write_pack<W: Write>(
    writer: W,
    store: &ObjectStore,
    ids: &[ObjectId],
    options: &PackOptions,
) -> Result<PackStats> {
    let mut order = ids
        .iter()
        .map(|id| store.header(id).map(|(kind, size)| (kind, size, *id)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    order.sort_by_key(|(kind, size, id)| (kind.pack_type(), Reverse(*size), *id));
    order.dedup_by_key(|(_, _, id)| *id);

    let count = u32::try_from(order.len())
        .map_err(|_| GitError::InvalidPack(format!("{} objects is too many", order.len())))?;
    let mut pack = PackWriter::new(writer, count)?;
    let mut stats = PackStats {
        objects: order.len(),
        ..PackStats::default()
    };
    let use_deltas = options.use_deltas && options.window > 0;
    let mut window: VecDeque<Candidate> = VecDeque::with_capacity(options.window);

    for (i, (kind, _, id)) in order.iter().enumerate() {
        if i > 0 && order[i - 1].0 != *kind {
            window.clear();
        }
        let object = store.get(id)?;

        let mut best: Option<(usize, Vec<u8>)> = None;
        if use_deltas && object.size() >= MIN_DELTA_SIZE {
            for (slot, candidate) in window.iter().enumerate() {
                if candidate.depth >= options.max_depth {
                    continue;
                }
                let limit = match &best {
                    Some((_, delta)) => delta.len() - 1,
                    None => object.size() / 2 - 1,
                };
                if let Some(delta) = candidate.index.encode(&object.data, limit) {
                    best = Some((slot, delta));
                }
            }
        }

        let (offset, depth) = match best {
            Some((slot, delta)) => {
                let base = &window[slot];
                let offset = if options.ofs_delta {
                    pack.write_ofs_delta(base.offset, &delta)?
                } else {
                    pack.write_ref_delta(&base.id, &delta)?
                };
                stats.deltas += 1;
                (offset, base.depth + 1)
            }
            None => (pack.write_entry(&object)?, 0),
        };

        if use_deltas {
            if window.len() == options.window {
                window.pop_front();
            }
            window.push_back(Candidate {
                id: object.id,
                offset,
                depth,
                index: DeltaIndex::new(object.data.clone()),
            });
        }
    }

    stats.bytes = pack.offset() + 20;
    let (_, checksum) = pack.finish()?;
    stats.checksum = checksum;
    tracing::debug!(
        objects = stats.objects,
        deltas = stats.deltas,
        bytes = stats.bytes,
        "Wrote pack"
    );
    Ok(stats)
}
