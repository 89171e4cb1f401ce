//! Git object types and the canonical object encoding.

use crate::{Commit, Result, StorageError, Tag, Tree};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Length of the binary form.
    pub const LEN: usize = 20;
    /// Length of the hex form.
    pub const HEX_LEN: usize = 40;
    /// The all-zero id, used on the wire to mean "no object".
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a slice that must be exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| {
            StorageError::InvalidObjectId(format!("expected 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Creates an ObjectId from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != Self::HEX_LEN {
            return Err(StorageError::InvalidObjectId(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObjectId(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns true for the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Maps the wire sentinel to `None`.
    pub fn non_zero(self) -> Option<Self> {
        if self.is_zero() {
            None
        } else {
            Some(self)
        }
    }

    /// Computes the SHA-1 hash of data with a git object header.
    pub fn hash_object(object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    /// Commit object.
    Commit,
    /// Directory listing.
    Tree,
    /// File content.
    Blob,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from its name.
    pub fn parse(s: &[u8]) -> Result<Self> {
        match s {
            b"blob" => Ok(Self::Blob),
            b"tree" => Ok(Self::Tree),
            b"commit" => Ok(Self::Commit),
            b"tag" => Ok(Self::Tag),
            _ => Err(StorageError::MalformedObject(format!(
                "unknown object type: {}",
                String::from_utf8_lossy(s)
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::MalformedObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the canonical `"<type> <len>\0" + payload` encoding and its id.
pub fn encode(kind: ObjectType, payload: &[u8]) -> (ObjectId, Vec<u8>) {
    let mut bytes = format!("{} {}\0", kind.as_str(), payload.len()).into_bytes();
    bytes.extend_from_slice(payload);
    let id = ObjectId(Sha1::digest(&bytes).into());
    (id, bytes)
}

/// Parses the `"<type> <len>\0"` prefix of a canonical encoding.
///
/// Returns the type, the declared payload size and where the payload starts.
pub(crate) fn parse_header(bytes: &[u8]) -> Result<(ObjectType, usize, usize)> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StorageError::MalformedObject("missing header terminator".to_string()))?;
    let header = &bytes[..nul];
    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| StorageError::MalformedObject("missing size in header".to_string()))?;

    let kind = ObjectType::parse(&header[..space])?;
    let size: usize = std::str::from_utf8(&header[space + 1..])
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::MalformedObject("invalid size in header".to_string()))?;
    Ok((kind, size, nul + 1))
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> Result<(ObjectType, Bytes)> {
    let (kind, size, start) = parse_header(bytes)?;
    let payload = &bytes[start..];
    if payload.len() != size {
        return Err(StorageError::MalformedObject(format!(
            "header declares {} bytes, payload has {}",
            size,
            payload.len()
        )));
    }
    Ok((kind, Bytes::copy_from_slice(payload)))
}

/// A git object (blob, tree, commit, or tag) in its raw form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    /// The object's unique identifier (SHA-1 hash).
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed, without header).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the canonical encoding with header.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.object_type, &self.data).1
    }

    /// Decodes a canonical encoding with header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (kind, payload) = decode(bytes)?;
        Ok(Self::new(kind, payload))
    }

    /// Parses the payload into its structured form.
    pub fn parse(&self) -> Result<Object> {
        Ok(match self.object_type {
            ObjectType::Blob => Object::Blob(self.data.clone()),
            ObjectType::Tree => Object::Tree(Tree::decode(&self.data)?),
            ObjectType::Commit => Object::Commit(Commit::decode(&self.data)?),
            ObjectType::Tag => Object::Tag(Tag::decode(&self.data)?),
        })
    }

    /// Returns the objects this object points to, with their expected kinds.
    ///
    /// Gitlink entries are skipped; they name commits in other repositories.
    pub fn references(&self) -> Result<Vec<(ObjectId, ObjectType)>> {
        Ok(match self.parse()? {
            Object::Blob(_) => Vec::new(),
            Object::Tree(tree) => tree
                .entries
                .iter()
                .filter(|e| !e.mode.is_gitlink())
                .map(|e| {
                    let kind = if e.mode.is_tree() {
                        ObjectType::Tree
                    } else {
                        ObjectType::Blob
                    };
                    (e.id, kind)
                })
                .collect(),
            Object::Commit(commit) => {
                let mut refs = Vec::with_capacity(commit.parents.len() + 1);
                refs.push((commit.tree, ObjectType::Tree));
                refs.extend(commit.parents.iter().map(|p| (*p, ObjectType::Commit)));
                refs
            }
            Object::Tag(tag) => vec![(tag.object, tag.target_type)],
        })
    }
}

/// A parsed object, dispatched on its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    /// Opaque file content.
    Blob(Bytes),
    /// Directory listing.
    Tree(Tree),
    /// Commit.
    Commit(Commit),
    /// Annotated tag.
    Tag(Tag),
}

impl Object {
    /// Returns the object's kind.
    pub fn kind(&self) -> ObjectType {
        match self {
            Self::Blob(_) => ObjectType::Blob,
            Self::Tree(_) => ObjectType::Tree,
            Self::Commit(_) => ObjectType::Commit,
            Self::Tag(_) => ObjectType::Tag,
        }
    }

    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Blob(data) => data.to_vec(),
            Self::Tree(tree) => tree.encode(),
            Self::Commit(commit) => commit.encode(),
            Self::Tag(tag) => tag.encode(),
        }
    }

    /// Converts into the raw form, computing the id.
    pub fn into_git_object(self) -> GitObject {
        match self {
            Self::Blob(data) => GitObject::blob(data),
            other => GitObject::new(other.kind(), other.to_bytes()),
        }
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Self::Tree(tree)
    }
}

impl From<Commit> for Object {
    fn from(commit: Commit) -> Self {
        Self::Commit(commit)
    }
}

impl From<Tag> for Object {
    fn from(tag: Tag) -> Self {
        Self::Tag(tag)
    }
}
