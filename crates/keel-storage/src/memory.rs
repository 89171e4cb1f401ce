//! In-memory object backend.

use crate::{GitObject, ObjectId, ObjectStoreBackend, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Objects held in a hash map behind a read-write lock.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<ObjectId, GitObject>>,
}

impl MemoryBackend {
    /// Creates a new in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStoreBackend for MemoryBackend {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        let id = object.id;
        self.objects.write().entry(id).or_insert(object);
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        Ok(self.objects.read().get(id).cloned())
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.read().contains_key(id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.objects.read().len())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self.objects.read().keys().copied().collect())
    }

    /// The whole batch becomes visible under a single write lock.
    fn batch_put(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        let mut map = self.objects.write();
        Ok(objects
            .into_iter()
            .map(|object| {
                let id = object.id;
                map.entry(id).or_insert(object);
                id
            })
            .collect())
    }
}
