//! Commit and annotated tag objects.
//!
//! Identity lines and messages are kept as raw bytes: git does not require
//! them to be UTF-8, and re-encoding a parsed object must not alter it.

use crate::{ObjectId, ObjectType, Result, StorageError};

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// The root tree.
    pub tree: ObjectId,
    /// Parent commits, empty for a root commit.
    pub parents: Vec<ObjectId>,
    /// Author line, e.g. `Jane <jane@example.com> 1700000000 +0000`.
    pub author: Vec<u8>,
    /// Committer line.
    pub committer: Vec<u8>,
    /// Headers after `committer` (`encoding`, `gpgsig`, `mergetag`, ...).
    /// Multi-line values are stored with their continuation prefix removed.
    pub extra_headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Everything after the blank line.
    pub message: Vec<u8>,
}

impl Commit {
    /// Creates a commit with no extra headers.
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: impl Into<Vec<u8>>,
        committer: impl Into<Vec<u8>>,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            tree,
            parents,
            author: author.into(),
            committer: committer.into(),
            extra_headers: Vec::new(),
            message: message.into(),
        }
    }

    /// Returns the value of the first extra header with the given key.
    pub fn header(&self, key: &[u8]) -> Option<&[u8]> {
        self.extra_headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Serializes the commit payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.message.len());
        write_header(&mut out, b"tree", self.tree.to_hex().as_bytes());
        for parent in &self.parents {
            write_header(&mut out, b"parent", parent.to_hex().as_bytes());
        }
        write_header(&mut out, b"author", &self.author);
        write_header(&mut out, b"committer", &self.committer);
        for (key, value) in &self.extra_headers {
            write_header(&mut out, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// Parses a commit payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(data)?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key.as_slice() {
                b"tree" if tree.is_none() && author.is_none() => {
                    tree = Some(parse_hex_id(&value, "tree")?)
                }
                b"parent" if tree.is_some() && author.is_none() => {
                    parents.push(parse_hex_id(&value, "parent")?)
                }
                b"author" if tree.is_some() && author.is_none() => author = Some(value),
                b"committer" if author.is_some() && committer.is_none() => {
                    committer = Some(value)
                }
                _ if committer.is_some() => extra_headers.push((key, value)),
                _ => {
                    return Err(StorageError::MalformedObject(format!(
                        "unexpected commit header: {}",
                        String::from_utf8_lossy(&key)
                    )))
                }
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| missing("commit", "tree"))?,
            parents,
            author: author.ok_or_else(|| missing("commit", "author"))?,
            committer: committer.ok_or_else(|| missing("commit", "committer"))?,
            extra_headers,
            message: message.to_vec(),
        })
    }
}

/// An annotated tag object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// The tagged object.
    pub object: ObjectId,
    /// Kind of the tagged object.
    pub target_type: ObjectType,
    /// Tag name.
    pub name: Vec<u8>,
    /// Tagger line; very old tags have none.
    pub tagger: Option<Vec<u8>>,
    /// Headers after `tagger`.
    pub extra_headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Everything after the blank line, including any signature block.
    pub message: Vec<u8>,
}

impl Tag {
    /// Creates a tag with no extra headers.
    pub fn new(
        object: ObjectId,
        target_type: ObjectType,
        name: impl Into<Vec<u8>>,
        tagger: Option<Vec<u8>>,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            object,
            target_type,
            name: name.into(),
            tagger,
            extra_headers: Vec::new(),
            message: message.into(),
        }
    }

    /// Serializes the tag payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.message.len());
        write_header(&mut out, b"object", self.object.to_hex().as_bytes());
        write_header(&mut out, b"type", self.target_type.as_str().as_bytes());
        write_header(&mut out, b"tag", &self.name);
        if let Some(tagger) = &self.tagger {
            write_header(&mut out, b"tagger", tagger);
        }
        for (key, value) in &self.extra_headers {
            write_header(&mut out, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// Parses a tag payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(data)?;

        let mut object = None;
        let mut target_type = None;
        let mut name = None;
        let mut tagger = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key.as_slice() {
                b"object" if object.is_none() => object = Some(parse_hex_id(&value, "object")?),
                b"type" if object.is_some() && target_type.is_none() => {
                    target_type = Some(ObjectType::parse(&value)?)
                }
                b"tag" if target_type.is_some() && name.is_none() => name = Some(value),
                b"tagger" if name.is_some() && tagger.is_none() && extra_headers.is_empty() => {
                    tagger = Some(value)
                }
                _ if name.is_some() => extra_headers.push((key, value)),
                _ => {
                    return Err(StorageError::MalformedObject(format!(
                        "unexpected tag header: {}",
                        String::from_utf8_lossy(&key)
                    )))
                }
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| missing("tag", "object"))?,
            target_type: target_type.ok_or_else(|| missing("tag", "type"))?,
            name: name.ok_or_else(|| missing("tag", "tag"))?,
            tagger,
            extra_headers,
            message: message.to_vec(),
        })
    }
}

type Headers = Vec<(Vec<u8>, Vec<u8>)>;

/// Splits a payload into its header list and message. Continuation lines
/// (leading space) are folded into the previous header's value.
fn split_headers(data: &[u8]) -> Result<(Headers, &[u8])> {
    let mut headers: Headers = Vec::new();
    let mut rest = data;

    loop {
        if rest.is_empty() {
            return Ok((headers, rest));
        }
        let (line, tail) = match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => (&rest[..nl], &rest[nl + 1..]),
            None => {
                return Err(StorageError::MalformedObject(
                    "unterminated header line".to_string(),
                ))
            }
        };
        rest = tail;

        if line.is_empty() {
            return Ok((headers, rest));
        }
        if let Some(cont) = line.strip_prefix(b" ") {
            let (_, value) = headers.last_mut().ok_or_else(|| {
                StorageError::MalformedObject("continuation line without header".to_string())
            })?;
            value.push(b'\n');
            value.extend_from_slice(cont);
            continue;
        }
        let space = line.iter().position(|&b| b == b' ').ok_or_else(|| {
            StorageError::MalformedObject(format!(
                "header without value: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
        headers.push((line[..space].to_vec(), line[space + 1..].to_vec()));
    }
}

fn write_header(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend_from_slice(key);
    out.push(b' ');
    for (i, line) in value.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\n ");
        }
        out.extend_from_slice(line);
    }
    out.push(b'\n');
}

fn parse_hex_id(value: &[u8], field: &str) -> Result<ObjectId> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| ObjectId::from_hex(s).ok())
        .ok_or_else(|| StorageError::MalformedObject(format!("invalid {} id", field)))
}

fn missing(kind: &str, field: &str) -> StorageError {
    StorageError::MalformedObject(format!("{} is missing the {} header", kind, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GitObject;

    const SIG: &[u8] = b"A U Thor <author@example.com> 1700000000 +0000";

    #[test]
    fn test_commit_roundtrip() {
        let commit = Commit::new(
            ObjectId::from_bytes([1; 20]),
            vec![ObjectId::from_bytes([2; 20]), ObjectId::from_bytes([3; 20])],
            SIG,
            SIG,
            "Merge branch 'topic'\n",
        );
        let decoded = Commit::decode(&commit.encode()).unwrap();
        assert_eq!(decoded, commit);
    }

    #[test]
    fn test_commit_encoding_layout() {
        let tree = ObjectId::from_hex("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        let commit = Commit::new(tree, vec![], SIG, SIG, "initial\n");
        let obj = GitObject::new(ObjectType::Commit, commit.encode());
        assert_eq!(
            obj.data.as_ref(),
            b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
              author A U Thor <author@example.com> 1700000000 +0000\n\
              committer A U Thor <author@example.com> 1700000000 +0000\n\
              \n\
              initial\n"
                .as_ref()
        );
    }

    #[test]
    fn test_gpgsig_preserved_verbatim() {
        let raw = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
author A <a@example.com> 1 +0000\n\
committer A <a@example.com> 1 +0000\n\
gpgsig -----BEGIN PGP SIGNATURE-----\n \n iQEzBAABCAAdFiEE\n -----END PGP SIGNATURE-----\n\
\n\
signed\n";
        let commit = Commit::decode(raw).unwrap();
        let sig = commit.header(b"gpgsig").unwrap();
        assert!(sig.starts_with(b"-----BEGIN PGP SIGNATURE-----\n\n"));
        assert!(sig.ends_with(b"-----END PGP SIGNATURE-----"));
        assert_eq!(commit.encode(), raw.to_vec());
    }

    #[test]
    fn test_non_utf8_message() {
        let raw = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
author A <a@example.com> 1 +0000\n\
committer A <a@example.com> 1 +0000\n\
encoding ISO-8859-1\n\
\n\
caf\xe9\n";
        let commit = Commit::decode(raw).unwrap();
        assert_eq!(commit.header(b"encoding"), Some(b"ISO-8859-1".as_ref()));
        assert_eq!(commit.message, b"caf\xe9\n");
        assert_eq!(commit.encode(), raw.to_vec());
    }

    #[test]
    fn test_commit_missing_headers() {
        let no_tree = b"author A <a@example.com> 1 +0000\ncommitter A <a@example.com> 1 +0000\n\nm";
        assert!(matches!(
            Commit::decode(no_tree),
            Err(StorageError::MalformedObject(_))
        ));

        let no_committer =
            b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\nauthor A <a@example.com> 1 +0000\n\nm";
        assert!(Commit::decode(no_committer).is_err());

        let no_author = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\ncommitter A <a@example.com> 1 +0000\n\nm";
        assert!(Commit::decode(no_author).is_err());
    }

    #[test]
    fn test_commit_bad_tree_id() {
        let raw = b"tree nothex\nauthor A <a> 1 +0000\ncommitter A <a> 1 +0000\n\n";
        assert!(Commit::decode(raw).is_err());
    }

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag::new(
            ObjectId::from_bytes([7; 20]),
            ObjectType::Commit,
            "v1.0.0",
            Some(SIG.to_vec()),
            "Release 1.0.0\n",
        );
        let decoded = Tag::decode(&tag.encode()).unwrap();
        assert_eq!(decoded, tag);
    }

    #[test]
    fn test_tag_without_tagger() {
        let raw = b"object 4b825dc642cb6eb9a060e54bf8d69288fbee4904\ntype tree\ntag old\n\nold tag\n";
        let tag = Tag::decode(raw).unwrap();
        assert_eq!(tag.tagger, None);
        assert_eq!(tag.target_type, ObjectType::Tree);
        assert_eq!(tag.encode(), raw.to_vec());
    }

    #[test]
    fn test_tag_missing_headers() {
        assert!(Tag::decode(b"type commit\ntag v1\n\n").is_err());
        assert!(
            Tag::decode(b"object 4b825dc642cb6eb9a060e54bf8d69288fbee4904\ntag v1\n\n").is_err()
        );
        assert!(
            Tag::decode(b"object 4b825dc642cb6eb9a060e54bf8d69288fbee4904\ntype commit\n\n")
                .is_err()
        );
    }
}
