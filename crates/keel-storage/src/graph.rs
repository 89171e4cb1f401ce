//! Reachability over the object graph.
//!
//! All walks keep an explicit frontier so deep histories cannot exhaust the
//! stack.

use crate::{Commit, ObjectId, ObjectStore, ObjectType, Result, StorageError, Tag};
use std::collections::{HashSet, VecDeque};

/// Tags nest at most this deep when peeling.
const MAX_PEEL_DEPTH: usize = 32;

impl ObjectStore {
    /// Returns every object reachable from `roots` that is not reachable
    /// from `exclude`.
    ///
    /// Objects missing on the `exclude` side are skipped: the peer may name
    /// objects this store never had. A missing object on the `roots` side
    /// fails with `IncompleteObjectGraph`. Gitlinks are not followed.
    pub fn reachable_from(
        &self,
        roots: &[ObjectId],
        exclude: &[ObjectId],
    ) -> Result<HashSet<ObjectId>> {
        let excluded = self.closure_tolerant(exclude)?;

        let mut result = HashSet::new();
        let mut frontier: VecDeque<(ObjectId, Option<ObjectType>)> =
            roots.iter().map(|id| (*id, None)).collect();

        while let Some((id, expected)) = frontier.pop_front() {
            if excluded.contains(&id) || result.contains(&id) {
                continue;
            }
            if expected == Some(ObjectType::Blob) {
                if !self.has(&id)? {
                    return Err(StorageError::IncompleteObjectGraph { missing: id });
                }
                result.insert(id);
                continue;
            }

            let object = self
                .try_get(&id)?
                .ok_or(StorageError::IncompleteObjectGraph { missing: id })?;
            check_kind(&id, expected, object.object_type)?;
            result.insert(id);
            for (child, kind) in object.references()? {
                if !excluded.contains(&child) && !result.contains(&child) {
                    frontier.push_back((child, Some(kind)));
                }
            }
        }

        tracing::trace!(
            roots = roots.len(),
            exclude = exclude.len(),
            objects = result.len(),
            "Computed reachable set"
        );
        Ok(result)
    }

    /// Verifies that every object reachable from `root` is stored, without
    /// descending into `known_good` objects (tips whose closure is already
    /// known to be complete).
    pub fn check_connectivity(&self, root: &ObjectId, known_good: &[ObjectId]) -> Result<()> {
        let mut seen: HashSet<ObjectId> = known_good.iter().copied().collect();
        let mut frontier = vec![(*root, None)];

        while let Some((id, expected)) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            if expected == Some(ObjectType::Blob) {
                if !self.has(&id)? {
                    return Err(StorageError::IncompleteObjectGraph { missing: id });
                }
                continue;
            }

            let object = self
                .try_get(&id)?
                .ok_or(StorageError::IncompleteObjectGraph { missing: id })?;
            check_kind(&id, expected, object.object_type)?;
            for (child, kind) in object.references()? {
                if !seen.contains(&child) {
                    frontier.push((child, Some(kind)));
                }
            }
        }
        Ok(())
    }

    /// Returns true if the commit history starting at `start` contains any of
    /// `targets`. Tags are peeled first; missing commits end their branch of
    /// the walk.
    pub fn reaches_any(&self, start: &ObjectId, targets: &HashSet<ObjectId>) -> Result<bool> {
        if targets.is_empty() {
            return Ok(false);
        }
        let start = self.peel(start)?;
        let mut seen = HashSet::new();
        let mut frontier = vec![start];

        while let Some(id) = frontier.pop() {
            if targets.contains(&id) {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            let Some(object) = self.try_get(&id)? else {
                continue;
            };
            if object.object_type != ObjectType::Commit {
                continue;
            }
            let commit = Commit::decode(&object.data)?;
            frontier.extend(commit.parents.into_iter().filter(|p| !seen.contains(p)));
        }
        Ok(false)
    }

    /// Returns true if `ancestor` is `descendant` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
        let ancestor = self.peel(ancestor)?;
        self.reaches_any(descendant, &HashSet::from([ancestor]))
    }

    /// Follows annotated tags until reaching a non-tag object.
    ///
    /// Returns `id` itself when it is not a tag or is not stored.
    pub fn peel(&self, id: &ObjectId) -> Result<ObjectId> {
        let mut current = *id;
        for _ in 0..MAX_PEEL_DEPTH {
            match self.try_get(&current)? {
                Some(object) if object.object_type == ObjectType::Tag => {
                    current = Tag::decode(&object.data)?.object;
                }
                _ => return Ok(current),
            }
        }
        Err(StorageError::MalformedObject(format!(
            "tag chain from {} is too deep",
            id
        )))
    }

    fn closure_tolerant(&self, roots: &[ObjectId]) -> Result<HashSet<ObjectId>> {
        let mut seen = HashSet::new();
        let mut frontier: Vec<ObjectId> = roots.to_vec();

        while let Some(id) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(object) = self.try_get(&id)? else {
                continue;
            };
            for (child, kind) in object.references()? {
                if kind == ObjectType::Blob {
                    seen.insert(child);
                } else if !seen.contains(&child) {
                    frontier.push(child);
                }
            }
        }
        Ok(seen)
    }
}

fn check_kind(id: &ObjectId, expected: Option<ObjectType>, actual: ObjectType) -> Result<()> {
    match expected {
        Some(kind) if kind != actual => Err(StorageError::MalformedObject(format!(
            "{} is a {}, referenced as a {}",
            id, actual, kind
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileMode, GitObject, Tree, TreeEntry};

    const SIG: &str = "T <t@example.com> 1700000000 +0000";

    struct Fixture {
        store: ObjectStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ObjectStore::memory(),
            }
        }

        fn blob(&self, content: &str) -> ObjectId {
            self.store
                .put(GitObject::blob(content.as_bytes().to_vec()))
                .unwrap()
        }

        fn tree(&self, entries: Vec<TreeEntry>) -> ObjectId {
            self.store.put_object(Tree::sorted(entries)).unwrap()
        }

        fn commit(&self, tree: ObjectId, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
            self.store
                .put_object(Commit::new(tree, parents, SIG, SIG, msg))
                .unwrap()
        }

        /// A commit whose tree holds one file with the given content.
        fn simple_commit(
            &self,
            content: &str,
            parents: Vec<ObjectId>,
        ) -> (ObjectId, ObjectId, ObjectId) {
            let blob = self.blob(content);
            let tree = self.tree(vec![TreeEntry::new(FileMode::REGULAR, "file", blob)]);
            let commit = self.commit(tree, parents, content);
            (commit, tree, blob)
        }
    }

    #[test]
    fn test_reachable_from_root_commit() {
        let fx = Fixture::new();
        let (c, t, b) = fx.simple_commit("one", vec![]);
        let set = fx.store.reachable_from(&[c], &[]).unwrap();
        assert_eq!(set, HashSet::from([c, t, b]));
    }

    #[test]
    fn test_reachable_excludes_parent_closure() {
        let fx = Fixture::new();
        let (p, _, _) = fx.simple_commit("one", vec![]);
        let (c, t, b) = fx.simple_commit("two", vec![p]);
        let set = fx.store.reachable_from(&[c], &[p]).unwrap();
        assert_eq!(set, HashSet::from([c, t, b]));
    }

    #[test]
    fn test_reachable_shares_unchanged_blobs() {
        let fx = Fixture::new();
        let shared = fx.blob("shared");
        let t1 = fx.tree(vec![TreeEntry::new(FileMode::REGULAR, "a", shared)]);
        let p = fx.commit(t1, vec![], "p");
        let new = fx.blob("new");
        let t2 = fx.tree(vec![
            TreeEntry::new(FileMode::REGULAR, "a", shared),
            TreeEntry::new(FileMode::REGULAR, "b", new),
        ]);
        let c = fx.commit(t2, vec![p], "c");

        let set = fx.store.reachable_from(&[c], &[p]).unwrap();
        assert_eq!(set, HashSet::from([c, t2, new]));
    }

    #[test]
    fn test_reachable_tolerates_unknown_exclude() {
        let fx = Fixture::new();
        let (c, _, _) = fx.simple_commit("one", vec![]);
        let unknown = ObjectId::from_bytes([0xee; 20]);
        let set = fx.store.reachable_from(&[c], &[unknown]).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_reachable_missing_root_side() {
        let fx = Fixture::new();
        let missing = ObjectId::from_bytes([0xaa; 20]);
        let tree = fx.tree(vec![TreeEntry::new(FileMode::REGULAR, "gone", missing)]);
        let c = fx.commit(tree, vec![], "broken");

        match fx.store.reachable_from(&[c], &[]) {
            Err(StorageError::IncompleteObjectGraph { missing: m }) => assert_eq!(m, missing),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gitlinks_not_traversed() {
        let fx = Fixture::new();
        let sub = ObjectId::from_bytes([0x5b; 20]);
        let tree = fx.tree(vec![TreeEntry::new(FileMode::GITLINK, "vendor", sub)]);
        let c = fx.commit(tree, vec![], "submodule");

        let set = fx.store.reachable_from(&[c], &[]).unwrap();
        assert_eq!(set, HashSet::from([c, tree]));
        fx.store.check_connectivity(&c, &[]).unwrap();
    }

    #[test]
    fn test_reachable_through_tag() {
        let fx = Fixture::new();
        let (c, t, b) = fx.simple_commit("tagged", vec![]);
        let tag = fx
            .store
            .put_object(Tag::new(c, ObjectType::Commit, "v1", Some(SIG.into()), "v1\n"))
            .unwrap();

        let set = fx.store.reachable_from(&[tag], &[]).unwrap();
        assert_eq!(set, HashSet::from([tag, c, t, b]));
        assert_eq!(fx.store.peel(&tag).unwrap(), c);
    }

    #[test]
    fn test_check_connectivity_stops_at_known_good() {
        let fx = Fixture::new();
        let (p, _, _) = fx.simple_commit("one", vec![]);
        let (c, _, _) = fx.simple_commit("two", vec![p]);
        fx.store.check_connectivity(&c, &[p]).unwrap();
        fx.store.check_connectivity(&c, &[]).unwrap();

        // Parent absent and not known to be good: incomplete.
        let ghost = ObjectId::from_bytes([0x77; 20]);
        let (orphan, _, _) = fx.simple_commit("three", vec![ghost]);
        assert!(matches!(
            fx.store.check_connectivity(&orphan, &[p]),
            Err(StorageError::IncompleteObjectGraph { missing }) if missing == ghost
        ));
    }

    #[test]
    fn test_check_connectivity_rejects_wrong_kind() {
        let fx = Fixture::new();
        let blob = fx.blob("not a tree");
        let c = fx.commit(blob, vec![], "bad");
        assert!(matches!(
            fx.store.check_connectivity(&c, &[]),
            Err(StorageError::MalformedObject(_))
        ));
    }

    #[test]
    fn test_is_ancestor() {
        let fx = Fixture::new();
        let (a, _, _) = fx.simple_commit("a", vec![]);
        let (b, _, _) = fx.simple_commit("b", vec![a]);
        let (c, _, _) = fx.simple_commit("c", vec![b]);
        let (side, _, _) = fx.simple_commit("side", vec![a]);

        assert!(fx.store.is_ancestor(&a, &c).unwrap());
        assert!(fx.store.is_ancestor(&c, &c).unwrap());
        assert!(!fx.store.is_ancestor(&c, &a).unwrap());
        assert!(!fx.store.is_ancestor(&side, &c).unwrap());
    }

    #[test]
    fn test_reaches_any_merge() {
        let fx = Fixture::new();
        let (root, _, _) = fx.simple_commit("root", vec![]);
        let (left, _, _) = fx.simple_commit("left", vec![root]);
        let (right, _, _) = fx.simple_commit("right", vec![root]);
        let (merge, _, _) = fx.simple_commit("merge", vec![left, right]);

        assert!(fx
            .store
            .reaches_any(&merge, &HashSet::from([right]))
            .unwrap());
        assert!(!fx
            .store
            .reaches_any(&left, &HashSet::from([right]))
            .unwrap());
        assert!(!fx.store.reaches_any(&merge, &HashSet::new()).unwrap());
    }

    #[test]
    fn test_deep_history_does_not_recurse() {
        let fx = Fixture::new();
        let blob = fx.blob("same");
        let tree = fx.tree(vec![TreeEntry::new(FileMode::REGULAR, "f", blob)]);
        let mut tip = fx.commit(tree, vec![], "0");
        let root = tip;
        for i in 1..5_000 {
            tip = fx.commit(tree, vec![tip], &i.to_string());
        }
        assert!(fx.store.is_ancestor(&root, &tip).unwrap());
        assert_eq!(fx.store.reachable_from(&[tip], &[]).unwrap().len(), 5_002);
    }
}
