//! Streaming pack parser.

use super::io::HashingReader;
use super::{EntryKind, PACK_SIGNATURE};
use crate::delta::apply_delta;
use crate::{GitError, Result};
use flate2::bufread::ZlibDecoder;
use keel_storage::{GitObject, ObjectId, ObjectStore, ObjectType};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};

/// Longest delta chain accepted by default.
pub const DEFAULT_MAX_DELTA_DEPTH: usize = 4096;

/// Where a delta entry finds its base.
#[derive(Debug, Clone, Copy)]
enum BaseRef {
    Offset(u64),
    Id(ObjectId),
}

/// An entry as read from the stream, before delta resolution.
struct RawEntry {
    offset: u64,
    base: Option<BaseRef>,
    kind: Option<ObjectType>,
    data: Vec<u8>,
    depth: usize,
}

/// Outcome of trying to resolve one delta chain.
enum Chain {
    Resolved,
    Blocked(ObjectId),
}

/// Every object of a verified pack, in pack order.
#[derive(Debug, Clone)]
pub struct ParsedPack {
    /// Pack format version (2 or 3).
    pub version: u32,
    /// Resolved objects. Thin-pack bases taken from the store are not included.
    pub objects: Vec<GitObject>,
    /// How many entries were deltas.
    pub deltas: usize,
    /// The verified trailer.
    pub checksum: [u8; 20],
}

/// Result of ingesting a pack into a store.
#[derive(Debug, Clone, Default)]
pub struct PackSummary {
    /// IDs of the objects the pack carried, in pack order.
    pub ids: Vec<ObjectId>,
    /// How many entries were deltas.
    pub deltas: usize,
}

/// Parses pack streams.
///
/// Parsing never writes to the store; it only reads thin-pack bases from it.
#[derive(Debug, Clone)]
pub struct PackParser {
    max_delta_depth: usize,
}

impl Default for PackParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PackParser {
    /// Creates a parser with the default delta depth bound.
    pub fn new() -> Self {
        Self {
            max_delta_depth: DEFAULT_MAX_DELTA_DEPTH,
        }
    }

    /// Sets the longest delta chain accepted.
    pub fn with_max_delta_depth(mut self, depth: usize) -> Self {
        self.max_delta_depth = depth.max(1);
        self
    }

    /// Reads a whole pack from `reader`, verifying its trailer and resolving
    /// every delta.
    pub fn parse<R: Read>(&self, reader: R, store: &ObjectStore) -> Result<ParsedPack> {
        let mut input = HashingReader::new(reader);

        let mut header = [0u8; 12];
        input.read_exact(&mut header).map_err(truncated)?;
        if &header[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        tracing::debug!(version, count, "Reading pack");

        let mut entries = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            entries.push(read_entry(&mut input)?);
        }

        let actual = input.checksum();
        let mut expected = [0u8; 20];
        input.read_exact(&mut expected).map_err(truncated)?;
        if actual != expected {
            return Err(GitError::PackChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        let deltas = entries.iter().filter(|e| e.base.is_some()).count();
        let objects = self.resolve(entries, store)?;
        for object in &objects {
            if object.object_type != ObjectType::Blob {
                object.parse()?;
            }
        }

        tracing::debug!(objects = objects.len(), deltas, "Parsed pack");
        Ok(ParsedPack {
            version,
            objects,
            deltas,
            checksum: actual,
        })
    }

    /// Parses a pack and publishes its objects to `store` in one batch.
    ///
    /// Nothing is written unless the whole pack verifies.
    pub fn ingest<R: Read>(&self, reader: R, store: &ObjectStore) -> Result<PackSummary> {
        let parsed = self.parse(reader, store)?;
        let mut staged = store.stage();
        for object in parsed.objects {
            staged.insert(object);
        }
        let ids = staged.commit()?;
        tracing::info!(objects = ids.len(), deltas = parsed.deltas, "Ingested pack");
        Ok(PackSummary {
            ids,
            deltas: parsed.deltas,
        })
    }

    fn resolve(&self, mut entries: Vec<RawEntry>, store: &ObjectStore) -> Result<Vec<GitObject>> {
        let by_offset: HashMap<u64, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.offset, i))
            .collect();
        let mut resolved: Vec<Option<GitObject>> = Vec::with_capacity(entries.len());
        let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
        let mut pending = Vec::new();

        for (i, entry) in entries.iter_mut().enumerate() {
            match entry.kind {
                Some(kind) => {
                    let object = GitObject::new(kind, std::mem::take(&mut entry.data));
                    by_id.insert(object.id, i);
                    resolved.push(Some(object));
                }
                None => {
                    resolved.push(None);
                    pending.push(i);
                }
            }
        }

        // Ref deltas may name bases that are themselves deltas later in the
        // pack, so keep sweeping until a pass makes no progress.
        let mut ctx = Resolver {
            entries: &mut entries,
            resolved: &mut resolved,
            by_offset: &by_offset,
            by_id: &mut by_id,
            store,
            max_depth: self.max_delta_depth,
        };
        while !pending.is_empty() {
            let mut blocked = Vec::new();
            let mut missing = None;
            for &index in &pending {
                if ctx.resolved[index].is_some() {
                    continue;
                }
                if let Chain::Blocked(id) = ctx.resolve_chain(index)? {
                    blocked.push(index);
                    missing.get_or_insert(id);
                }
            }
            if blocked.len() == pending.len() {
                if let Some(id) = missing {
                    return Err(GitError::MissingDeltaBase(id));
                }
            }
            pending = blocked;
        }

        resolved
            .into_iter()
            .map(|object| {
                object.ok_or_else(|| GitError::InvalidPack("unresolved entry".to_string()))
            })
            .collect()
    }
}

struct Resolver<'a> {
    entries: &'a mut [RawEntry],
    resolved: &'a mut [Option<GitObject>],
    by_offset: &'a HashMap<u64, usize>,
    by_id: &'a mut HashMap<ObjectId, usize>,
    store: &'a ObjectStore,
    max_depth: usize,
}

impl Resolver<'_> {
    /// Walks from `start` towards a resolved base, then applies the chain
    /// from the base outwards.
    fn resolve_chain(&mut self, start: usize) -> Result<Chain> {
        let mut chain = vec![start];
        let mut visited = HashSet::from([start]);

        let (base, base_depth) = loop {
            let current = chain[chain.len() - 1];
            let link = self.entries[current]
                .base
                .ok_or_else(|| GitError::InvalidPack("unresolved base entry".to_string()))?;
            let next = match link {
                BaseRef::Offset(offset) => *self.by_offset.get(&offset).ok_or_else(|| {
                    GitError::InvalidPack(format!("no entry at delta base offset {}", offset))
                })?,
                BaseRef::Id(id) => match self.by_id.get(&id) {
                    Some(&index) => index,
                    None => match self.store.try_get(&id)? {
                        Some(object) => break (object, 0),
                        None => return Ok(Chain::Blocked(id)),
                    },
                },
            };
            if let Some(object) = &self.resolved[next] {
                break (object.clone(), self.entries[next].depth);
            }
            if !visited.insert(next) {
                return Err(GitError::DeltaCycle(format!(
                    "entry at offset {} is its own base",
                    self.entries[next].offset
                )));
            }
            if chain.len() >= self.max_depth {
                return Err(GitError::DeltaCycle(format!(
                    "delta chain from offset {} is deeper than {}",
                    self.entries[start].offset, self.max_depth
                )));
            }
            chain.push(next);
        };

        if base_depth + chain.len() > self.max_depth {
            return Err(GitError::DeltaCycle(format!(
                "delta chain at offset {} is deeper than {}",
                self.entries[start].offset, self.max_depth
            )));
        }

        let mut base = base;
        for (depth, &index) in (base_depth + 1..).zip(chain.iter().rev()) {
            let entry = &mut self.entries[index];
            let delta = std::mem::take(&mut entry.data);
            let data = apply_delta(&base.data, &delta)?;
            entry.depth = depth;
            let object = GitObject::new(base.object_type, data);
            self.by_id.insert(object.id, index);
            self.resolved[index] = Some(object.clone());
            base = object;
        }
        Ok(Chain::Resolved)
    }
}

fn read_entry<R: Read>(input: &mut HashingReader<R>) -> Result<RawEntry> {
    let offset = input.offset();

    let first = input.read_u8().map_err(truncated)?;
    let code = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = input.read_u8().map_err(truncated)?;
        if shift > 57 {
            return Err(GitError::InvalidPack("entry size overflows".to_string()));
        }
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    let size = usize::try_from(size)
        .map_err(|_| GitError::InvalidPack(format!("entry size {} too large", size)))?;

    let (kind, base) = match EntryKind::from_code(code)? {
        EntryKind::Object(kind) => (Some(kind), None),
        EntryKind::OfsDelta => {
            let distance = read_ofs_distance(input)?;
            if distance == 0 {
                return Err(GitError::DeltaCycle(format!(
                    "entry at offset {} is its own base",
                    offset
                )));
            }
            let base = offset.checked_sub(distance).ok_or_else(|| {
                GitError::InvalidPack(format!(
                    "delta base before start of pack at offset {}",
                    offset
                ))
            })?;
            (None, Some(BaseRef::Offset(base)))
        }
        EntryKind::RefDelta => {
            let mut id = [0u8; 20];
            input.read_exact(&mut id).map_err(truncated)?;
            (None, Some(BaseRef::Id(ObjectId::from_bytes(id))))
        }
    };

    let data = inflate(input, size)?;
    Ok(RawEntry {
        offset,
        base,
        kind,
        data,
        depth: 0,
    })
}

fn read_ofs_distance<R: Read>(input: &mut HashingReader<R>) -> Result<u64> {
    let mut byte = input.read_u8().map_err(truncated)?;
    let mut distance = (byte & 0x7f) as u64;
    while byte & 0x80 != 0 {
        byte = input.read_u8().map_err(truncated)?;
        distance = distance
            .checked_add(1)
            .and_then(|d| d.checked_mul(128))
            .ok_or_else(|| GitError::InvalidPack("delta offset overflows".to_string()))?
            | (byte & 0x7f) as u64;
    }
    Ok(distance)
}

/// Inflates one zlib stream, consuming exactly its compressed bytes.
fn inflate<R: Read>(input: &mut HashingReader<R>, size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.min(1 << 20));
    ZlibDecoder::new(input)
        .take(size as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => GitError::InvalidPack("truncated pack".to_string()),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                GitError::InvalidPack(format!("decompression failed: {}", e))
            }
            _ => e.into(),
        })?;
    if data.len() != size {
        return Err(GitError::InvalidPack(format!(
            "entry inflated to {} bytes, header says {}",
            data.len(),
            size
        )));
    }
    Ok(data)
}

fn truncated(e: io::Error) -> GitError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        GitError::InvalidPack("truncated pack".to_string())
    } else {
        e.into()
    }
}

/// Parses a pack with default settings and publishes its objects to `store`.
pub fn ingest_pack<R: Read>(reader: R, store: &ObjectStore) -> Result<PackSummary> {
    PackParser::new().ingest(reader, store)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::pack::{write_pack, PackOptions};
    use proptest::prelude::*;

    proptest! {
        /// Property: arbitrary bytes never panic the parser.
        #[test]
        fn prop_invalid_pack_no_panic(data in prop::collection::vec(any::<u8>(), 0..1000)) {
            let _ = PackParser::new().parse(&data[..], &ObjectStore::memory());
        }

        /// Property: any set of blobs survives write then parse, with or without deltas.
        #[test]
        fn prop_blob_roundtrip(
            blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..2000), 1..10),
            use_deltas in any::<bool>(),
        ) {
            let store = ObjectStore::memory();
            let ids: Vec<_> = blobs
                .into_iter()
                .map(|b| store.put(GitObject::blob(b)).unwrap())
                .collect();
            let options = PackOptions { use_deltas, ..PackOptions::default() };
            let mut pack = Vec::new();
            write_pack(&mut pack, &store, &ids, &options).unwrap();

            let fresh = ObjectStore::memory();
            ingest_pack(&pack[..], &fresh).unwrap();
            for id in &ids {
                prop_assert_eq!(fresh.get(id).unwrap(), store.get(id).unwrap());
            }
        }

        /// Property: flipping any byte is detected.
        #[test]
        fn prop_corruption_detected(
            content in prop::collection::vec(any::<u8>(), 1..500),
            position in any::<prop::sample::Index>(),
        ) {
            let store = ObjectStore::memory();
            let id = store.put(GitObject::blob(content)).unwrap();
            let mut pack = Vec::new();
            write_pack(&mut pack, &store, &[id], &PackOptions::default()).unwrap();
            let at = position.index(pack.len());
            pack[at] ^= 0x01;
            prop_assert!(PackParser::new().parse(&pack[..], &ObjectStore::memory()).is_err());
        }
    }
}
