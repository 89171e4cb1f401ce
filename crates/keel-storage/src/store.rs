//! Object store and repository handles.

use crate::{
    CacheConfig, CachedStorage, GitObject, LooseBackend, MemoryBackend, Object, ObjectId,
    ObjectStoreBackend, ObjectType, RefStore, Result, StorageError,
};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Content-addressed object store over a pluggable backend.
///
/// Cloning is cheap and yields a handle to the same objects.
#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn ObjectStoreBackend>,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore").finish_non_exhaustive()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::memory()
    }
}

impl ObjectStore {
    /// Creates a store over the given backend.
    pub fn new(backend: impl ObjectStoreBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Creates an empty in-memory store.
    pub fn memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Returns true if the object is stored.
    pub fn has(&self, id: &ObjectId) -> Result<bool> {
        self.backend.contains(id)
    }

    /// Retrieves an object, failing with `ObjectNotFound` if absent.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.backend
            .get(id)?
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Returns an object's type and payload size without loading it where
    /// the backend allows.
    pub fn header(&self, id: &ObjectId) -> Result<(ObjectType, usize)> {
        self.backend
            .header(id)?
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Retrieves an object if present.
    pub fn try_get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        self.backend.get(id)
    }

    /// Stores an object and returns its ID.
    pub fn put(&self, object: GitObject) -> Result<ObjectId> {
        self.backend.put(object)
    }

    /// Serializes and stores a structured object.
    pub fn put_object(&self, object: impl Into<Object>) -> Result<ObjectId> {
        self.put(object.into().into_git_object())
    }

    /// Stores a group of objects in one backend batch.
    pub fn put_all(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        self.backend.batch_put(objects)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> Result<usize> {
        self.backend.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty()
    }

    /// Lists all object IDs.
    pub fn list_objects(&self) -> Result<Vec<ObjectId>> {
        self.backend.list_objects()
    }

    /// Starts a staging buffer whose objects become visible only on commit.
    pub fn stage(&self) -> StagedObjects {
        StagedObjects {
            store: self.clone(),
            objects: HashMap::new(),
            order: Vec::new(),
            committed: false,
        }
    }
}

/// Objects buffered for a single all-or-nothing write.
///
/// Dropping the buffer without calling [`StagedObjects::commit`] discards
/// everything it holds.
pub struct StagedObjects {
    store: ObjectStore,
    objects: HashMap<ObjectId, GitObject>,
    order: Vec<ObjectId>,
    committed: bool,
}

impl StagedObjects {
    /// Buffers an object and returns its ID.
    pub fn insert(&mut self, object: GitObject) -> ObjectId {
        let id = object.id;
        if !self.objects.contains_key(&id) {
            self.order.push(id);
            self.objects.insert(id, object);
        }
        id
    }

    /// Returns a staged object.
    pub fn get(&self, id: &ObjectId) -> Option<&GitObject> {
        self.objects.get(id)
    }

    /// Finds an object among the staged ones, then in the store.
    pub fn lookup(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        match self.objects.get(id) {
            Some(object) => Ok(Some(object.clone())),
            None => self.store.try_get(id),
        }
    }

    /// Number of staged objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Staged IDs in insertion order.
    pub fn ids(&self) -> &[ObjectId] {
        &self.order
    }

    /// Publishes every staged object in one batch.
    pub fn commit(mut self) -> Result<Vec<ObjectId>> {
        let mut objects = std::mem::take(&mut self.objects);
        let batch: Vec<GitObject> = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| objects.remove(&id))
            .collect();
        self.committed = true;
        let count = batch.len();
        let ids = self.store.put_all(batch)?;
        tracing::debug!(objects = count, "Committed staged objects");
        Ok(ids)
    }
}

impl Drop for StagedObjects {
    fn drop(&mut self) {
        if !self.committed && !self.objects.is_empty() {
            tracing::debug!(objects = self.objects.len(), "Discarded staged objects");
        }
    }
}

/// A git repository: an object store plus a ref store, addressed by name.
#[derive(Debug)]
pub struct Repository {
    /// Repository name.
    pub name: String,
    /// Object store.
    pub objects: ObjectStore,
    /// Reference store.
    pub refs: RefStore,
}

impl Repository {
    /// Branch `HEAD` points at in a new repository.
    pub const DEFAULT_BRANCH: &'static str = "refs/heads/main";

    /// Creates a repository from existing stores.
    pub fn new(name: impl Into<String>, objects: ObjectStore, refs: RefStore) -> Self {
        Self {
            name: name.into(),
            objects,
            refs,
        }
    }

    /// Creates an empty in-memory repository with `HEAD` on the default branch.
    pub fn in_memory(name: impl Into<String>) -> Self {
        let refs = RefStore::new();
        // A fresh ref store always accepts HEAD.
        let _ = refs.set_symbolic("HEAD", Self::DEFAULT_BRANCH);
        Self::new(name, ObjectStore::memory(), refs)
    }

    /// Opens (or initializes) an on-disk repository rooted at `dir`.
    ///
    /// Objects live under `dir/objects`, refs in `dir/packed-refs`.
    pub fn open(name: impl Into<String>, dir: &Path, cache: CacheConfig) -> Result<Self> {
        let backend = LooseBackend::open(dir.join("objects"))?;
        let objects = ObjectStore::new(CachedStorage::new(backend, cache));
        let refs = RefStore::open(dir.join("packed-refs"))?;
        if refs.reference("HEAD").is_none() {
            refs.set_symbolic("HEAD", Self::DEFAULT_BRANCH)?;
        }
        Ok(Self::new(name, objects, refs))
    }

    /// Resolves `HEAD` to a commit, if the branch it names exists.
    pub fn head(&self) -> Option<ObjectId> {
        self.refs.get("HEAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Commit, FileMode, Tree, TreeEntry};

    #[test]
    fn test_object_store_roundtrip() {
        let store = ObjectStore::memory();
        let blob = GitObject::blob(b"Hello, World!".to_vec());
        let id = store.put(blob).unwrap();

        let retrieved = store.get(&id).unwrap();
        assert_eq!(retrieved.data.as_ref(), b"Hello, World!");
        assert!(store.has(&id).unwrap());
    }

    #[test]
    fn test_get_missing() {
        let store = ObjectStore::memory();
        assert!(matches!(
            store.get(&ObjectId::ZERO),
            Err(StorageError::ObjectNotFound(_))
        ));
        assert!(store.try_get(&ObjectId::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = ObjectStore::memory();
        let a = store.put(GitObject::blob(b"x".to_vec())).unwrap();
        let b = store.put(GitObject::blob(b"x".to_vec())).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_staged_objects_commit() {
        let store = ObjectStore::memory();
        let mut staged = store.stage();
        let id = staged.insert(GitObject::blob(b"staged".to_vec()));
        staged.insert(GitObject::blob(b"staged".to_vec()));

        assert_eq!(staged.len(), 1);
        assert!(!store.has(&id).unwrap());
        assert!(staged.lookup(&id).unwrap().is_some());

        staged.commit().unwrap();
        assert!(store.has(&id).unwrap());
    }

    #[test]
    fn test_staged_objects_drop_discards() {
        let store = ObjectStore::memory();
        let id = {
            let mut staged = store.stage();
            staged.insert(GitObject::blob(b"gone".to_vec()))
        };
        assert!(!store.has(&id).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_staged_lookup_falls_back_to_store() {
        let store = ObjectStore::memory();
        let id = store.put(GitObject::blob(b"base".to_vec())).unwrap();
        let staged = store.stage();
        assert!(staged.lookup(&id).unwrap().is_some());
        assert!(staged.get(&id).is_none());
    }

    #[test]
    fn test_repository_in_memory() {
        let repo = Repository::in_memory("demo");
        assert_eq!(repo.refs.head_target().as_deref(), Some("refs/heads/main"));
        assert_eq!(repo.head(), None);

        let blob = repo.objects.put(GitObject::blob(b"content".to_vec())).unwrap();
        let tree = repo
            .objects
            .put_object(Tree::new(vec![TreeEntry::new(FileMode::REGULAR, "f", blob)]))
            .unwrap();
        let sig = "A <a@example.com> 1 +0000";
        let commit = repo
            .objects
            .put_object(Commit::new(tree, vec![], sig, sig, "init\n"))
            .unwrap();
        repo.refs.update("refs/heads/main", None, Some(commit)).unwrap();

        assert_eq!(repo.head(), Some(commit));
    }

    #[test]
    fn test_repository_open_persists() {
        let dir = tempfile::tempdir().unwrap();
        let blob = {
            let repo = Repository::open("disk", dir.path(), CacheConfig::default()).unwrap();
            let blob = repo.objects.put(GitObject::blob(b"persisted".to_vec())).unwrap();
            repo.refs.update("refs/tags/b", None, Some(blob)).unwrap();
            blob
        };

        let repo = Repository::open("disk", dir.path(), CacheConfig::default()).unwrap();
        assert!(repo.objects.has(&blob).unwrap());
        assert_eq!(repo.refs.get("refs/tags/b"), Some(blob));
        assert_eq!(repo.refs.head_target().as_deref(), Some("refs/heads/main"));
    }
}
