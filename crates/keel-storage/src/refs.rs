//! Git reference management.
//!
//! Refs change only through compare-and-swap: every update names the value
//! the caller believes is current, and the update is rejected when the store
//! holds something else. When opened on a file, the whole table is rewritten
//! atomically after each successful update while the write lock is held.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Symbolic refs nest at most this deep.
const MAX_SYMREF_DEPTH: usize = 5;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// One compare-and-swap ref change.
///
/// `old: None` means the ref must not exist; `new: None` deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Full ref name.
    pub name: String,
    /// Value the caller expects to replace.
    pub old: Option<ObjectId>,
    /// Value to store.
    pub new: Option<ObjectId>,
}

impl RefUpdate {
    /// Creates an update.
    pub fn new(name: impl Into<String>, old: Option<ObjectId>, new: Option<ObjectId>) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }
}

/// Checks a ref name against git's naming rules.
pub fn validate_ref_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Err(StorageError::InvalidRef(format!("{}: {}", name, why)));

    if !name.starts_with("refs/") {
        return invalid("must start with refs/");
    }
    if name.ends_with('/') || name.ends_with('.') {
        return invalid("must not end with '/' or '.'");
    }
    if name.contains("..") || name.contains("@{") {
        return invalid("must not contain '..' or '@{'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return invalid(&format!("forbidden character {:?}", c));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return invalid("empty path component");
        }
        if component.starts_with('.') {
            return invalid("path component starts with '.'");
        }
        if component.ends_with(".lock") {
            return invalid("path component ends with .lock");
        }
    }
    Ok(())
}

/// Thread-safe reference store.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<BTreeMap<String, Reference>>,
    path: Option<PathBuf>,
}

impl RefStore {
    /// Creates a new empty in-memory reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a file-backed store, loading existing refs if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let refs = match fs::read_to_string(&path) {
            Ok(contents) => parse_refs_file(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), refs = refs.len(), "Loaded refs");
        Ok(Self {
            refs: RwLock::new(refs),
            path: Some(path),
        })
    }

    /// Returns the raw reference stored under `name`.
    pub fn reference(&self, name: &str) -> Option<Reference> {
        self.refs.read().get(name).cloned()
    }

    /// Resolves a ref (following symbolic refs) to an object id.
    pub fn get(&self, name: &str) -> Option<ObjectId> {
        let refs = self.refs.read();
        resolve(&refs, name)
    }

    /// Returns the ref `HEAD` points at, if it is symbolic.
    pub fn head_target(&self) -> Option<String> {
        match self.refs.read().get("HEAD")? {
            Reference::Symbolic(target) => Some(target.clone()),
            Reference::Direct(_) => None,
        }
    }

    /// Gets the current branch name (if HEAD is symbolic).
    pub fn current_branch(&self) -> Option<String> {
        self.head_target()
            .and_then(|target| target.strip_prefix("refs/heads/").map(|s| s.to_string()))
    }

    /// Lists every ref that resolves to an object, sorted by name.
    ///
    /// Symbolic refs are resolved; dangling ones are omitted.
    pub fn list(&self) -> Vec<(String, ObjectId)> {
        let refs = self.refs.read();
        refs.keys()
            .filter_map(|name| resolve(&refs, name).map(|id| (name.clone(), id)))
            .collect()
    }

    /// Lists refs under a prefix, sorted by name.
    pub fn list_prefix(&self, prefix: &str) -> Vec<(String, ObjectId)> {
        let refs = self.refs.read();
        refs.range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter_map(|(name, _)| resolve(&refs, name).map(|id| (name.clone(), id)))
            .collect()
    }

    /// Returns true if no refs are stored.
    pub fn is_empty(&self) -> bool {
        self.refs.read().is_empty()
    }

    /// Points `HEAD` at a branch.
    pub fn set_symbolic(&self, name: &str, target: &str) -> Result<()> {
        if name != "HEAD" {
            return Err(StorageError::InvalidRef(format!(
                "{}: only HEAD may be symbolic",
                name
            )));
        }
        validate_ref_name(target)?;

        let mut refs = self.refs.write();
        let previous = refs.insert(name.to_string(), Reference::Symbolic(target.to_string()));
        if let Err(e) = self.persist(&refs) {
            restore(&mut refs, name, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Compare-and-swap update of a single ref.
    ///
    /// Succeeds only when the current value equals `expected_old`
    /// (`None` = absent). `new: None` deletes the ref.
    pub fn update(
        &self,
        name: &str,
        expected_old: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        validate_ref_name(name)?;

        let mut refs = self.refs.write();
        check_current(&refs, name, expected_old)?;
        let previous = apply(&mut refs, name, new);
        if let Err(e) = self.persist(&refs) {
            restore(&mut refs, name, previous);
            return Err(e);
        }

        tracing::debug!(
            name = %name,
            old = ?expected_old,
            new = ?new,
            "Updated ref"
        );
        Ok(())
    }

    /// Applies every update or none of them.
    pub fn update_atomic(&self, updates: &[RefUpdate]) -> Result<()> {
        for (i, update) in updates.iter().enumerate() {
            validate_ref_name(&update.name)?;
            if updates[..i].iter().any(|u| u.name == update.name) {
                return Err(StorageError::InvalidRef(format!(
                    "{}: updated twice in one transaction",
                    update.name
                )));
            }
        }

        let mut refs = self.refs.write();
        for update in updates {
            check_current(&refs, &update.name, update.old)?;
        }

        let previous: Vec<_> = updates
            .iter()
            .map(|u| (u.name.as_str(), apply(&mut refs, &u.name, u.new)))
            .collect();
        if let Err(e) = self.persist(&refs) {
            for (name, prev) in previous.into_iter().rev() {
                restore(&mut refs, name, prev);
            }
            return Err(e);
        }

        tracing::debug!(refs = updates.len(), "Applied atomic ref transaction");
        Ok(())
    }

    fn persist(&self, refs: &BTreeMap<String, Reference>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut out = io::BufWriter::new(tmp.as_file_mut());
            for (name, reference) in refs {
                match reference {
                    Reference::Direct(id) => writeln!(out, "{} {}", id, name)?,
                    Reference::Symbolic(target) => writeln!(out, "ref:{} {}", target, name)?,
                }
            }
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

fn resolve(refs: &BTreeMap<String, Reference>, name: &str) -> Option<ObjectId> {
    let mut current = name;
    for _ in 0..=MAX_SYMREF_DEPTH {
        match refs.get(current)? {
            Reference::Direct(id) => return Some(*id),
            Reference::Symbolic(target) => current = target,
        }
    }
    None
}

fn check_current(
    refs: &BTreeMap<String, Reference>,
    name: &str,
    expected: Option<ObjectId>,
) -> Result<()> {
    let actual = refs.get(name).and_then(Reference::as_direct);
    if actual != expected {
        return Err(StorageError::RefUpdateConflict {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn apply(
    refs: &mut BTreeMap<String, Reference>,
    name: &str,
    new: Option<ObjectId>,
) -> Option<Reference> {
    match new {
        Some(id) => refs.insert(name.to_string(), Reference::Direct(id)),
        None => refs.remove(name),
    }
}

fn restore(refs: &mut BTreeMap<String, Reference>, name: &str, previous: Option<Reference>) {
    match previous {
        Some(reference) => {
            refs.insert(name.to_string(), reference);
        }
        None => {
            refs.remove(name);
        }
    }
}

fn parse_refs_file(contents: &str) -> Result<BTreeMap<String, Reference>> {
    let mut refs = BTreeMap::new();
    for line in contents.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (value, name) = line
            .split_once(' ')
            .ok_or_else(|| StorageError::InvalidRef(format!("malformed refs line: {}", line)))?;
        let reference = match value.strip_prefix("ref:") {
            Some(target) => Reference::Symbolic(target.to_string()),
            None => Reference::Direct(ObjectId::from_hex(value)?),
        };
        refs.insert(name.to_string(), reference);
    }
    Ok(refs)
}
