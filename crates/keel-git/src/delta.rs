//! Git delta encoding.
//!
//! A delta starts with the base and result sizes as little-endian base-128
//! varints, followed by instructions. A copy (`1xxxxxxx`) takes up to four
//! offset bytes and three size bytes, each present only if its bit is set;
//! a size of zero means 0x10000. An insert (`0xxxxxxx`) carries 1..=127
//! literal bytes. Opcode zero is reserved.

use crate::{GitError, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// Width of the blocks the encoder indexes in the base.
const BLOCK: usize = 16;
/// Largest span a single copy instruction can express.
const MAX_COPY: usize = 0x10000;
/// Largest literal run a single insert instruction can carry.
const MAX_INSERT: usize = 127;
/// Candidates examined per block hit.
const MAX_CANDIDATES: usize = 64;

/// Reads a delta-header varint at `*pos`, advancing it.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| GitError::InvalidDelta("truncated size header".to_string()))?;
        *pos += 1;
        if shift > usize::BITS - 7 {
            return Err(GitError::InvalidDelta("size header overflows".to_string()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the base and result sizes a delta declares.
pub fn delta_sizes(delta: &[u8]) -> Result<(usize, usize)> {
    let mut pos = 0;
    let base = read_varint(delta, &mut pos)?;
    let result = read_varint(delta, &mut pos)?;
    Ok((base, result))
}

/// Reconstructs the target object from `base` and `delta`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(GitError::InvalidDelta(format!(
            "base is {} bytes, delta expects {}",
            base.len(),
            base_size
        )));
    }
    let target_size = read_varint(delta, &mut pos)?;

    // The declared size is untrusted; let the vector grow past this if needed.
    let mut out = Vec::with_capacity(target_size.min(delta.len().saturating_mul(8)));
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    offset |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    size |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = MAX_COPY;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| {
                    GitError::InvalidDelta(format!(
                        "copy {}+{} outside base of {} bytes",
                        offset,
                        size,
                        base.len()
                    ))
                })?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let end = pos + op as usize;
            let literal = delta
                .get(pos..end)
                .ok_or_else(|| GitError::InvalidDelta("truncated insert".to_string()))?;
            out.extend_from_slice(literal);
            pos = end;
        } else {
            return Err(GitError::InvalidDelta("reserved opcode 0".to_string()));
        }

        if out.len() > target_size {
            return Err(GitError::InvalidDelta(format!(
                "result exceeds declared size {}",
                target_size
            )));
        }
    }

    if out.len() != target_size {
        return Err(GitError::InvalidDelta(format!(
            "result is {} bytes, expected {}",
            out.len(),
            target_size
        )));
    }
    Ok(out)
}

fn next_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data
        .get(*pos)
        .ok_or_else(|| GitError::InvalidDelta("truncated copy instruction".to_string()))?;
    *pos += 1;
    Ok(byte)
}

/// Block index over a base object, reusable for several targets.
pub struct DeltaIndex {
    base: Bytes,
    blocks: HashMap<u128, Vec<u32>>,
}

impl DeltaIndex {
    /// Indexes every aligned 16-byte block of `base`.
    pub fn new(base: impl Into<Bytes>) -> Self {
        let base = base.into();
        let mut blocks: HashMap<u128, Vec<u32>> = HashMap::new();
        if base.len() <= u32::MAX as usize {
            for offset in (0..base.len().saturating_sub(BLOCK - 1)).step_by(BLOCK) {
                blocks
                    .entry(block_key(&base[offset..offset + BLOCK]))
                    .or_default()
                    .push(offset as u32);
            }
        }
        Self { base, blocks }
    }

    /// Returns the indexed base.
    pub fn base(&self) -> &[u8] {
        &self.base
    }

    /// Encodes `target` against the base.
    ///
    /// Returns `None` as soon as the delta would exceed `max_size` bytes.
    pub fn encode(&self, target: &[u8], max_size: usize) -> Option<Vec<u8>> {
        let base = &self.base[..];
        let mut out = Vec::new();
        write_varint(&mut out, base.len());
        write_varint(&mut out, target.len());

        let mut pos = 0;
        let mut pending = 0;
        while pos + BLOCK <= target.len() {
            let Some((mut src, mut len)) = self.longest_match(target, pos) else {
                pos += 1;
                continue;
            };
            // Grow the match backwards over bytes not yet emitted.
            let mut start = pos;
            while start > pending && src > 0 && base[src - 1] == target[start - 1] {
                start -= 1;
                src -= 1;
                len += 1;
            }
            push_insert(&mut out, &target[pending..start]);
            push_copy(&mut out, src, len);
            pos = start + len;
            pending = pos;
            if out.len() > max_size {
                return None;
            }
        }
        push_insert(&mut out, &target[pending..]);

        (out.len() <= max_size).then_some(out)
    }

    fn longest_match(&self, target: &[u8], pos: usize) -> Option<(usize, usize)> {
        let candidates = self.blocks.get(&block_key(&target[pos..pos + BLOCK]))?;
        let mut best: Option<(usize, usize)> = None;
        for &offset in candidates.iter().take(MAX_CANDIDATES) {
            let offset = offset as usize;
            let len = self.base[offset..]
                .iter()
                .zip(&target[pos..])
                .take_while(|(a, b)| a == b)
                .count();
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((offset, len));
            }
        }
        best.filter(|(_, len)| *len >= BLOCK)
    }
}

/// Encodes `target` as a delta against `base` with no size limit.
pub fn create_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    DeltaIndex::new(Bytes::copy_from_slice(base))
        .encode(target, usize::MAX)
        .unwrap_or_default()
}

fn block_key(block: &[u8]) -> u128 {
    block
        .iter()
        .fold(0u128, |acc, &b| (acc << 8) | b as u128)
}

fn push_insert(out: &mut Vec<u8>, literal: &[u8]) {
    for chunk in literal.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

fn push_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let size = len.min(MAX_COPY);
        let mut op = 0x80u8;
        let mut args = [0u8; 7];
        let mut n = 0;
        for i in 0..4 {
            let byte = (offset >> (8 * i)) as u8;
            if byte != 0 {
                op |= 1 << i;
                args[n] = byte;
                n += 1;
            }
        }
        if size != MAX_COPY {
            for i in 0..3 {
                let byte = (size >> (8 * i)) as u8;
                if byte != 0 {
                    op |= 0x10 << i;
                    args[n] = byte;
                    n += 1;
                }
            }
        }
        out.push(op);
        out.extend_from_slice(&args[..n]);
        offset += size;
        len -= size;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: applying an encoded delta reproduces the target.
        #[test]
        fn prop_delta_roundtrip(
            base in prop::collection::vec(any::<u8>(), 0..2048),
            edits in prop::collection::vec((any::<usize>(), prop::collection::vec(any::<u8>(), 0..40)), 0..8),
        ) {
            let mut target = base.clone();
            for (at, insert) in edits {
                let at = if target.is_empty() { 0 } else { at % target.len() };
                target.splice(at..at, insert);
            }
            let delta = create_delta(&base, &target);
            prop_assert_eq!(apply_delta(&base, &delta).unwrap(), target);
        }

        /// Property: arbitrary delta bytes never panic.
        #[test]
        fn prop_apply_no_panic(
            base in prop::collection::vec(any::<u8>(), 0..256),
            delta in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let _ = apply_delta(&base, &delta);
        }
    }
}
