//! Git object storage for Keel.
//!
//! This crate provides the object codec (blobs, trees, commits, tags),
//! a content-addressed object store over pluggable backends, reachability
//! traversal, and a ref store with compare-and-swap updates.

mod cache;
mod commit;
mod compression;
mod error;
mod graph;
mod loose;
mod memory;
mod object;
mod refs;
mod store;
mod traits;
mod tree;

pub use cache::{CacheConfig, CacheStats, CachedStorage};
pub use commit::{Commit, Tag};
pub use compression::{compress_loose, decompress_loose, CompressionLevel};
pub use error::StorageError;
pub use loose::LooseBackend;
pub use memory::MemoryBackend;
pub use object::{decode, encode, GitObject, Object, ObjectId, ObjectType};
pub use refs::{validate_ref_name, RefStore, RefUpdate, Reference};
pub use store::{ObjectStore, Repository, StagedObjects};
pub use traits::ObjectStoreBackend;
pub use tree::{FileMode, Tree, TreeEntry};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
