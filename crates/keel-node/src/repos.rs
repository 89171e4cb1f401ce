//! Repository registry.
//!
//! Maps repository names to open [`Repository`] handles. The registry is
//! owned by the application state and handed to transports explicitly.

use keel_storage::{CacheConfig, Repository, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest accepted repository name.
pub const MAX_NAME_LEN: usize = 100;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("repository not found: {0}")]
    NotFound(String),
    #[error("invalid repository name: {0}")]
    InvalidName(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Where repositories live.
#[derive(Debug, Clone)]
enum Location {
    Memory,
    Disk { root: PathBuf, cache: CacheConfig },
}

/// Named repositories, opened lazily from disk or held in memory.
#[derive(Debug)]
pub struct RepoRegistry {
    location: Location,
    repos: RwLock<HashMap<String, Arc<Repository>>>,
}

impl RepoRegistry {
    /// A registry whose repositories live only in memory.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// A registry storing each repository under `root/<name>.git`.
    pub fn on_disk(root: impl Into<PathBuf>, cache: CacheConfig) -> Self {
        Self {
            location: Location::Disk {
                root: root.into(),
                cache,
            },
            repos: RwLock::new(HashMap::new()),
        }
    }

    fn dir(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{}.git", name))
    }

    /// Returns an existing repository.
    pub fn get(&self, name: &str) -> Result<Arc<Repository>, RegistryError> {
        let name = normalize_name(name)?;
        if let Some(repo) = self.repos.read().get(name) {
            return Ok(repo.clone());
        }
        match &self.location {
            Location::Memory => Err(RegistryError::NotFound(name.to_string())),
            Location::Disk { root, .. } if !Self::dir(root, name).is_dir() => {
                Err(RegistryError::NotFound(name.to_string()))
            }
            Location::Disk { .. } => self.open(name),
        }
    }

    /// Returns the repository, creating an empty one if it does not exist.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Repository>, RegistryError> {
        match self.get(name) {
            Err(RegistryError::NotFound(_)) => self.open(normalize_name(name)?),
            other => other,
        }
    }

    /// Opens or creates `name` and caches the handle. Two racing callers
    /// end up sharing whichever handle was inserted first.
    fn open(&self, name: &str) -> Result<Arc<Repository>, RegistryError> {
        let mut repos = self.repos.write();
        if let Some(repo) = repos.get(name) {
            return Ok(repo.clone());
        }
        let repo = match &self.location {
            Location::Memory => Repository::in_memory(name),
            Location::Disk { root, cache } => {
                Repository::open(name, &Self::dir(root, name), cache.clone())?
            }
        };
        tracing::info!(name = %name, "Opened repository");
        let repo = Arc::new(repo);
        repos.insert(name.to_string(), repo.clone());
        Ok(repo)
    }

    /// Names of the repositories opened so far.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of repositories opened so far.
    pub fn len(&self) -> usize {
        self.repos.read().len()
    }

    /// Returns true if no repository has been opened.
    pub fn is_empty(&self) -> bool {
        self.repos.read().is_empty()
    }
}

/// Strips an optional `.git` suffix and checks what remains.
///
/// Names are a single path segment of ASCII letters, digits, `-`, `_` and
/// `.`, not starting with `.` and never containing `..`.
pub fn normalize_name(raw: &str) -> Result<&str, RegistryError> {
    let name = raw.strip_suffix(".git").unwrap_or(raw);
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(RegistryError::InvalidName(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_storage::GitObject;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("demo.git").unwrap(), "demo");
        assert_eq!(normalize_name("my-repo_2").unwrap(), "my-repo_2");
        assert!(normalize_name("").is_err());
        assert!(normalize_name(".git").is_err());
        assert!(normalize_name("..").is_err());
        assert!(normalize_name("a..b").is_err());
        assert!(normalize_name("a/b").is_err());
        assert!(normalize_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_in_memory_registry() {
        let registry = RepoRegistry::in_memory();
        assert!(matches!(
            registry.get("demo"),
            Err(RegistryError::NotFound(_))
        ));

        let created = registry.get_or_create("demo.git").unwrap();
        let fetched = registry.get("demo").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(registry.list(), vec!["demo".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_on_disk_registry_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let registry = RepoRegistry::on_disk(dir.path(), CacheConfig::default());
            assert!(registry.get("demo").is_err());
            let repo = registry.get_or_create("demo").unwrap();
            let id = repo.objects.put(GitObject::blob(b"kept".to_vec())).unwrap();
            repo.refs.update("refs/heads/main", None, Some(id)).unwrap();
            id
        };
        assert!(dir.path().join("demo.git").is_dir());

        let registry = RepoRegistry::on_disk(dir.path(), CacheConfig::default());
        let repo = registry.get("demo").unwrap();
        assert_eq!(repo.refs.get("refs/heads/main"), Some(id));
        assert!(repo.objects.has(&id).unwrap());
    }

    proptest! {
        #[test]
        fn prop_normalized_names_are_single_segments(raw in "\\PC{0,40}") {
            if let Ok(name) = normalize_name(&raw) {
                prop_assert!(!name.is_empty());
                prop_assert!(!name.contains('/'));
                prop_assert!(!name.contains(".."));
                prop_assert!(!name.starts_with('.'));
            }
        }

        #[test]
        fn prop_git_suffix_is_optional(name in "[a-z0-9][a-z0-9_-]{0,20}") {
            let with_suffix = format!("{}.git", name);
            prop_assert_eq!(normalize_name(&name).unwrap(), name.as_str());
            prop_assert_eq!(normalize_name(&with_suffix).unwrap(), name.as_str());
        }
    }
}
