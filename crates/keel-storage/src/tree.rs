//! Tree objects.

use crate::{ObjectId, Result, StorageError};
use std::cmp::Ordering;
use std::fmt;

/// A tree entry mode, as the octal number git writes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    /// Subdirectory.
    pub const TREE: FileMode = FileMode(0o040000);
    /// Regular non-executable file.
    pub const REGULAR: FileMode = FileMode(0o100644);
    /// Executable file.
    pub const EXECUTABLE: FileMode = FileMode(0o100755);
    /// Symbolic link.
    pub const SYMLINK: FileMode = FileMode(0o120000);
    /// Submodule commit.
    pub const GITLINK: FileMode = FileMode(0o160000);

    /// Wraps a raw mode value.
    pub fn from_raw(mode: u32) -> Self {
        Self(mode)
    }

    /// Returns the raw mode value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns true for subdirectory entries.
    pub fn is_tree(&self) -> bool {
        self.0 & 0o170000 == 0o040000
    }

    /// Returns true for submodule entries.
    pub fn is_gitlink(&self) -> bool {
        self.0 & 0o170000 == 0o160000
    }

    fn parse(s: &[u8]) -> Result<Self> {
        if s.is_empty() || s.len() > 7 || !s.iter().all(|b| (b'0'..=b'7').contains(b)) {
            return Err(StorageError::MalformedObject(format!(
                "invalid tree entry mode: {}",
                String::from_utf8_lossy(s)
            )));
        }
        let mode = s.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
        Ok(Self(mode))
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:06o})", self.0)
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// A single entry in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry mode.
    pub mode: FileMode,
    /// Entry name; git does not require it to be UTF-8.
    pub name: Vec<u8>,
    /// The object the entry points to.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Creates a tree entry.
    pub fn new(mode: FileMode, name: impl Into<Vec<u8>>, id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    /// Returns the name, lossily decoded.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Compares two entries in git's tree order, where directories sort as
    /// if their name ended with `/`.
    pub fn git_cmp(&self, other: &TreeEntry) -> Ordering {
        let a = self.name.iter().copied().chain(self.sort_suffix());
        let b = other.name.iter().copied().chain(other.sort_suffix());
        a.cmp(b)
    }

    fn sort_suffix(&self) -> Option<u8> {
        self.mode.is_tree().then_some(b'/')
    }
}

/// A directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries in git tree order.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Creates a tree from entries that are already in git order.
    pub fn new(entries: Vec<TreeEntry>) -> Self {
        Self { entries }
    }

    /// Creates a tree, sorting the entries into git order.
    pub fn sorted(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.git_cmp(b));
        Self { entries }
    }

    /// Finds an entry by name.
    pub fn get(&self, name: &[u8]) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Serializes the tree payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 40);
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    /// Parses a tree payload.
    ///
    /// Entries must be strictly increasing in git order.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut entries: Vec<TreeEntry> = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let space = rest.iter().position(|&b| b == b' ').ok_or_else(|| {
                StorageError::MalformedObject("truncated tree entry mode".to_string())
            })?;
            let mode = FileMode::parse(&rest[..space])?;
            rest = &rest[space + 1..];

            let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                StorageError::MalformedObject("truncated tree entry name".to_string())
            })?;
            let name = &rest[..nul];
            if name.is_empty() || name.contains(&b'/') {
                return Err(StorageError::MalformedObject(format!(
                    "invalid tree entry name: {:?}",
                    String::from_utf8_lossy(name)
                )));
            }
            rest = &rest[nul + 1..];

            if rest.len() < ObjectId::LEN {
                return Err(StorageError::MalformedObject(
                    "truncated tree entry id".to_string(),
                ));
            }
            let id = ObjectId::from_slice(&rest[..ObjectId::LEN])?;
            rest = &rest[ObjectId::LEN..];

            let entry = TreeEntry::new(mode, name, id);
            if let Some(prev) = entries.last() {
                if prev.git_cmp(&entry) != Ordering::Less {
                    return Err(StorageError::MalformedObject(format!(
                        "tree entries out of order at {:?}",
                        entry.name_lossy()
                    )));
                }
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }
}
