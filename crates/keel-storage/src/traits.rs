//! Storage backend traits.
//!
//! Objects are immutable and content-addressed, so a backend only has to
//! store, look up and enumerate them. Nothing in this crate deletes objects.

use crate::{GitObject, ObjectId, ObjectType, Result};
use std::sync::Arc;

/// Where objects physically live.
///
/// [`MemoryBackend`](crate::MemoryBackend) and
/// [`LooseBackend`](crate::LooseBackend) implement it; [`CachedStorage`](crate::CachedStorage)
/// wraps either.
pub trait ObjectStoreBackend: Send + Sync {
    /// Stores an object and returns its ID. Storing an object twice is a no-op.
    fn put(&self, object: GitObject) -> Result<ObjectId>;

    /// Looks up an object; `Ok(None)` if absent.
    fn get(&self, id: &ObjectId) -> Result<Option<GitObject>>;

    /// Existence check that avoids reading the payload where possible.
    fn contains(&self, id: &ObjectId) -> Result<bool>;

    /// Type and payload size of an object; `Ok(None)` if absent.
    ///
    /// Backends that can answer without materializing the payload override
    /// this.
    fn header(&self, id: &ObjectId) -> Result<Option<(ObjectType, usize)>> {
        Ok(self.get(id)?.map(|o| (o.object_type, o.size())))
    }

    /// Number of stored objects.
    fn len(&self) -> Result<usize>;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every stored object id, in no particular order.
    fn list_objects(&self) -> Result<Vec<ObjectId>>;

    /// Stores a group of objects. Backends that can make the whole group
    /// visible at once override this.
    fn batch_put(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        objects.into_iter().map(|obj| self.put(obj)).collect()
    }

    /// Makes earlier writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ObjectStoreBackend + ?Sized> ObjectStoreBackend for Arc<T> {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        (**self).put(object)
    }

    fn get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        (**self).get(id)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        (**self).contains(id)
    }

    fn header(&self, id: &ObjectId) -> Result<Option<(ObjectType, usize)>> {
        (**self).header(id)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        (**self).list_objects()
    }

    fn batch_put(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        (**self).batch_put(objects)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // Records calls so the default methods can be observed.
    #[derive(Default)]
    struct RecordingStorage {
        puts: Mutex<Vec<ObjectId>>,
    }

    impl ObjectStoreBackend for RecordingStorage {
        fn put(&self, object: GitObject) -> Result<ObjectId> {
            self.puts.lock().push(object.id);
            Ok(object.id)
        }

        fn get(&self, _id: &ObjectId) -> Result<Option<GitObject>> {
            Ok(None)
        }

        fn contains(&self, id: &ObjectId) -> Result<bool> {
            Ok(self.puts.lock().contains(id))
        }

        fn len(&self) -> Result<usize> {
            Ok(self.puts.lock().len())
        }

        fn list_objects(&self) -> Result<Vec<ObjectId>> {
            Ok(self.puts.lock().clone())
        }
    }

    #[test]
    fn test_header_default_reads_object() {
        let storage = crate::MemoryBackend::new();
        let id = storage.put(GitObject::blob(b"twelve bytes".to_vec())).unwrap();
        assert_eq!(storage.header(&id).unwrap(), Some((ObjectType::Blob, 12)));

        let ghost = GitObject::blob(b"never stored".to_vec()).id;
        assert_eq!(storage.header(&ghost).unwrap(), None);
    }

    #[test]
    fn test_is_empty_default() {
        let storage = RecordingStorage::default();
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn test_batch_put_default_puts_each() {
        let storage = Arc::new(RecordingStorage::default());
        let objects = vec![
            GitObject::blob(b"one".to_vec()),
            GitObject::blob(b"two".to_vec()),
        ];
        let expected: Vec<_> = objects.iter().map(|o| o.id).collect();

        let ids = storage.batch_put(objects).unwrap();
        assert_eq!(ids, expected);
        assert_eq!(storage.len().unwrap(), 2);
        assert!(storage.contains(&expected[1]).unwrap());
    }
}
