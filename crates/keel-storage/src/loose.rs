//! Loose-object directory backend.
//!
//! Each object lives at `objects/<first two hex>/<remaining hex>` as the
//! zlib-deflated canonical encoding, the same layout git uses. Files are
//! written to a temporary name in the fan-out directory and renamed into
//! place, so readers never observe a partial object.

use crate::object::parse_header;
use crate::{
    compress_loose, decompress_loose, CompressionLevel, GitObject, ObjectId, ObjectStoreBackend,
    ObjectType, Result, StorageError,
};
use flate2::read::ZlibDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Object backend over a loose-object directory.
#[derive(Debug)]
pub struct LooseBackend {
    root: PathBuf,
    level: CompressionLevel,
}

impl LooseBackend {
    /// Opens (creating if needed) the object directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            level: CompressionLevel::default(),
        })
    }

    /// Sets the compression level used for new objects.
    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Returns the object directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn read_object(&self, id: &ObjectId, path: &Path) -> Result<GitObject> {
        let compressed = fs::read(path)?;
        let encoded = decompress_loose(&compressed)?;
        let object = GitObject::decode(&encoded)?;
        if object.id != *id {
            return Err(StorageError::MalformedObject(format!(
                "loose object {} hashes to {}",
                id, object.id
            )));
        }
        Ok(object)
    }

    /// Inflates only as much of the file as the object header needs.
    fn read_header(&self, path: &Path) -> Result<(ObjectType, usize)> {
        let mut prefix = Vec::with_capacity(HEADER_PEEK);
        ZlibDecoder::new(BufReader::new(File::open(path)?))
            .take(HEADER_PEEK as u64)
            .read_to_end(&mut prefix)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let (kind, size, _) = parse_header(&prefix)?;
        Ok((kind, size))
    }
}

/// Enough inflated bytes to cover `"commit <u64>\0"`.
const HEADER_PEEK: usize = 32;

impl ObjectStoreBackend for LooseBackend {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        let id = object.id;
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }

        let dir = path
            .parent()
            .ok_or_else(|| StorageError::Io(io::Error::other("object path has no parent")))?;
        fs::create_dir_all(dir)?;

        let compressed = compress_loose(&object.encode(), self.level)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        tracing::trace!(id = %id, path = %path.display(), "Wrote loose object");
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let path = self.object_path(id);
        match self.read_object(id, &path) {
            Ok(object) => Ok(Some(object)),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.object_path(id).is_file())
    }

    fn header(&self, id: &ObjectId) -> Result<Option<(ObjectType, usize)>> {
        match self.read_header(&self.object_path(id)) {
            Ok(header) => Ok(Some(header)),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.list_objects()?.len())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for fanout in fs::read_dir(&self.root)? {
            let fanout = fanout?;
            let prefix = fanout.file_name().to_string_lossy().into_owned();
            if prefix.len() != 2 || !fanout.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fanout.path())? {
                let entry = entry?;
                let rest = entry.file_name().to_string_lossy().into_owned();
                // Temporary files never parse as ids.
                if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix, rest)) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LooseBackend::open(dir.path().join("objects")).unwrap();
        let blob = GitObject::blob(b"hello\n".to_vec());
        let id = backend.put(blob.clone()).unwrap();

        let path = dir
            .path()
            .join("objects/ce/013625030ba8dba906f756967f9e9ca394464a");
        assert!(path.is_file());
        assert_eq!(backend.get(&id).unwrap(), Some(blob));
        assert!(backend.contains(&id).unwrap());
    }

    #[test]
    fn test_loose_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LooseBackend::open(dir.path()).unwrap();
        let id = ObjectId::from_bytes([5; 20]);
        assert_eq!(backend.get(&id).unwrap(), None);
        assert!(!backend.contains(&id).unwrap());
    }

    #[test]
    fn test_loose_header_reads_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LooseBackend::open(dir.path()).unwrap();
        let blob = GitObject::blob(vec![b'x'; 100_000]);
        let id = backend.put(blob).unwrap();
        assert_eq!(backend.header(&id).unwrap(), Some((ObjectType::Blob, 100_000)));

        let empty = backend.put(GitObject::new(ObjectType::Tree, Vec::new())).unwrap();
        assert_eq!(backend.header(&empty).unwrap(), Some((ObjectType::Tree, 0)));
        assert_eq!(backend.header(&ObjectId::from_bytes([5; 20])).unwrap(), None);
    }

    #[test]
    fn test_loose_file_is_git_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LooseBackend::open(dir.path()).unwrap();
        let tree = GitObject::new(ObjectType::Tree, Vec::new());
        backend.put(tree.clone()).unwrap();

        let raw = fs::read(dir.path().join("4b/825dc642cb6eb9a060e54bf8d69288fbee4904")).unwrap();
        assert_eq!(decompress_loose(&raw).unwrap(), b"tree 0\0");
    }

    #[test]
    fn test_loose_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LooseBackend::open(dir.path()).unwrap();
        let blob = GitObject::blob(b"original".to_vec());
        let id = backend.put(blob).unwrap();

        let other = compress_loose(b"blob 5\0other", CompressionLevel::Fast).unwrap();
        let hex = id.to_hex();
        fs::write(dir.path().join(&hex[..2]).join(&hex[2..]), other).unwrap();

        assert!(matches!(
            backend.get(&id),
            Err(StorageError::MalformedObject(_))
        ));
    }

    #[test]
    fn test_loose_list_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = LooseBackend::open(dir.path()).unwrap();
            for i in 0..5 {
                backend
                    .put(GitObject::blob(format!("blob {}", i).into_bytes()))
                    .unwrap();
            }
        }
        let backend = LooseBackend::open(dir.path()).unwrap();
        assert_eq!(backend.len().unwrap(), 5);
    }
}
