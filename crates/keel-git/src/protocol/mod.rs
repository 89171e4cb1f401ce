//! Git smart protocol (v0) for fetch and push.
//!
//! Covers the ref advertisement shared by both services and dispatch to the
//! `upload-pack` and `receive-pack` sessions. The same code serves smart
//! HTTP (stateless, one request per negotiation round) and stdio/SSH
//! (stateful, one connection for the whole exchange).
//! See: https://git-scm.com/docs/pack-protocol

mod receive_pack;
mod upload_pack;

pub use receive_pack::{
    serve_receive_pack, PushOutcome, PushPolicy, ReceivePackAction, ReceivePackSession,
    RefCommand, RefStatus,
};
pub use upload_pack::{serve_upload_pack, FetchOutcome, UploadPackAction, UploadPackSession};

use crate::pack::PackOptions;
use crate::pktline::{PktLine, PktLineWriter};
use crate::sideband::{SideBandMode, SideBandWriter};
use crate::{GitError, Result};
use keel_storage::{ObjectId, Repository};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Agent string sent in capability lists.
pub const AGENT: &str = concat!("keel/", env!("CARGO_PKG_VERSION"));

/// The two smart-protocol services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl Service {
    /// Returns the service name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Capabilities advertised on the first ref line.
    pub fn capabilities(&self) -> String {
        let caps = match self {
            Self::UploadPack => {
                "multi_ack multi_ack_detailed side-band side-band-64k ofs-delta no-progress"
            }
            Self::ReceivePack => "report-status delete-refs side-band-64k quiet atomic ofs-delta",
        };
        format!("{} agent={}", caps, AGENT)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            _ => Err(GitError::Protocol(format!("unknown service: {}", s))),
        }
    }
}

/// Capabilities a client requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(Vec<String>);

impl Capabilities {
    /// Parses a space-separated capability list.
    pub fn parse(s: &str) -> Self {
        Self(s.split_whitespace().map(str::to_string).collect())
    }

    /// Returns true if `name` was requested, with or without a value.
    pub fn contains(&self, name: &str) -> bool {
        self.0
            .iter()
            .any(|cap| cap == name || cap.split_once('=').is_some_and(|(k, _)| k == name))
    }

    /// Returns the value of a `key=value` capability.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find_map(|cap| cap.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
    }

    /// Iterates the raw capability strings.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// How a session is driven.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// One negotiation round per request (smart HTTP).
    pub stateless: bool,
    /// Send the ref advertisement before reading (stdio/SSH).
    pub advertise: bool,
    /// Pack production settings for fetches.
    pub pack: PackOptions,
    /// Ref update rules for pushes.
    pub policy: PushPolicy,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            stateless: false,
            advertise: true,
            pack: PackOptions::default(),
            policy: PushPolicy::default(),
        }
    }
}

impl ServeOptions {
    /// Options for a smart-HTTP POST: stateless, advertisement already sent.
    pub fn http() -> Self {
        Self {
            stateless: true,
            advertise: false,
            ..Self::default()
        }
    }
}

/// What a finished session did.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// An `upload-pack` session.
    Fetch(FetchOutcome),
    /// A `receive-pack` session.
    Push(PushOutcome),
}

/// Writes the ref advertisement for `service`.
///
/// With `http_preamble`, the `# service=` line and a flush come first, as
/// smart HTTP `info/refs` responses require.
pub fn advertise_refs<W: Write>(
    writer: W,
    repo: &Repository,
    service: Service,
    http_preamble: bool,
) -> Result<()> {
    let mut out = PktLineWriter::new(writer);
    if http_preamble {
        out.write_line(&format!("# service={}", service))?;
        out.flush_pkt()?;
    }

    let mut lines: Vec<(ObjectId, String)> = Vec::new();
    for (name, id) in repo.refs.list() {
        if name == "HEAD" {
            if service == Service::ReceivePack {
                continue;
            }
            lines.push((id, name));
            continue;
        }
        let peeled = match service {
            Service::UploadPack if name.starts_with("refs/tags/") => {
                Some(repo.objects.peel(&id)?).filter(|p| *p != id)
            }
            _ => None,
        };
        lines.push((id, name.clone()));
        if let Some(peeled) = peeled {
            lines.push((peeled, format!("{}^{{}}", name)));
        }
    }

    let mut caps = service.capabilities();
    if service == Service::UploadPack && lines.first().is_some_and(|(_, n)| n == "HEAD") {
        if let Some(target) = repo.refs.head_target() {
            caps.push_str(&format!(" symref=HEAD:{}", target));
        }
    }

    match lines.split_first() {
        Some(((id, name), rest)) => {
            out.write(&PktLine::from_string(&format!("{} {}\0{}\n", id, name, caps)))?;
            for (id, name) in rest {
                out.write_line(&format!("{} {}", id, name))?;
            }
        }
        None => {
            out.write(&PktLine::from_string(&format!(
                "{} capabilities^{{}}\0{}\n",
                ObjectId::ZERO,
                caps
            )))?;
        }
    }
    out.flush_pkt()?;
    out.flush()?;

    tracing::debug!(
        repo = %repo.name,
        service = %service,
        refs = lines.len(),
        "Advertised refs"
    );
    Ok(())
}

/// Runs one session of `service` over `reader`/`writer`.
pub fn serve<R: Read, W: Write>(
    service: Service,
    reader: R,
    writer: W,
    repo: &Repository,
    options: &ServeOptions,
) -> Result<SessionOutcome> {
    match service {
        Service::UploadPack => {
            serve_upload_pack(reader, writer, repo, options).map(SessionOutcome::Fetch)
        }
        Service::ReceivePack => {
            serve_receive_pack(reader, writer, repo, options).map(SessionOutcome::Push)
        }
    }
}

/// Tells the peer why `service` is ending the session.
///
/// Goes out as an `ERR` packet, or on band 3 once side-band is active. Nothing
/// is sent when the peer has already gone or sent its own error.
pub(crate) fn send_fatal<W: Write>(
    writer: W,
    mode: SideBandMode,
    service: Service,
    error: &GitError,
) {
    if matches!(error, GitError::Disconnect | GitError::RemoteError(_)) {
        return;
    }
    let service = service.name().trim_start_matches("git-");
    let mut band = SideBandWriter::new(writer, mode);
    let _ = band.error(&format!("{}: {}", service, error));
    let _ = band.flush();
}

/// Parses the object id at the start of `s`.
pub(crate) fn parse_id(s: &str) -> Result<ObjectId> {
    let hex = s
        .get(..ObjectId::HEX_LEN)
        .ok_or_else(|| GitError::Protocol(format!("expected object id in {:?}", s)))?;
    ObjectId::from_hex(hex).map_err(|_| GitError::Protocol(format!("invalid object id {:?}", hex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineReader;
    use keel_storage::{GitObject, ObjectType, Tag};
    use std::io::Cursor;

    fn read_lines(data: &[u8]) -> Vec<PktLine> {
        let mut reader = PktLineReader::new(Cursor::new(data));
        let mut out = Vec::new();
        while let Some(pkt) = reader.read().unwrap() {
            out.push(pkt);
        }
        out
    }

    #[test]
    fn test_service_names() {
        assert_eq!("git-upload-pack".parse::<Service>().unwrap(), Service::UploadPack);
        assert_eq!(Service::ReceivePack.to_string(), "git-receive-pack");
        assert!("git-frobnicate".parse::<Service>().is_err());
    }

    #[test]
    fn test_capabilities_parse() {
        let caps = Capabilities::parse("multi_ack_detailed side-band-64k agent=git/2.43.0");
        assert!(caps.contains("side-band-64k"));
        assert!(!caps.contains("side-band"));
        assert!(caps.contains("agent"));
        assert_eq!(caps.get("agent"), Some("git/2.43.0"));
        assert_eq!(caps.iter().count(), 3);
    }

    #[test]
    fn test_advertise_empty_repo() {
        let repo = Repository::in_memory("empty");
        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::UploadPack, true).unwrap();

        let lines = read_lines(&out);
        assert_eq!(lines[0].as_str(), Some("# service=git-upload-pack"));
        assert!(lines[1].is_flush());
        let first = lines[2].as_str().unwrap();
        assert!(first.starts_with(&format!("{} capabilities^{{}}\0", ObjectId::ZERO)));
        assert!(!first.contains("symref"));
        assert!(lines[3].is_flush());
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_advertise_upload_pack() {
        let repo = Repository::in_memory("test");
        let blob = repo.objects.put(GitObject::blob(b"test".to_vec())).unwrap();
        repo.refs.update("refs/heads/main", None, Some(blob)).unwrap();
        let tag = repo
            .objects
            .put_object(Tag::new(blob, ObjectType::Blob, "v1", None, "release\n"))
            .unwrap();
        repo.refs.update("refs/tags/v1", None, Some(tag)).unwrap();

        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::UploadPack, false).unwrap();
        let lines: Vec<String> = read_lines(&out)
            .iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect();

        assert_eq!(
            lines[0],
            format!(
                "{} HEAD\0{} symref=HEAD:refs/heads/main",
                blob,
                Service::UploadPack.capabilities()
            )
        );
        assert_eq!(lines[1], format!("{} refs/heads/main", blob));
        assert_eq!(lines[2], format!("{} refs/tags/v1", tag));
        assert_eq!(lines[3], format!("{} refs/tags/v1^{{}}", blob));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_advertise_receive_pack_omits_head() {
        let repo = Repository::in_memory("test");
        let blob = repo.objects.put(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.update("refs/heads/main", None, Some(blob)).unwrap();

        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::ReceivePack, false).unwrap();
        let lines = read_lines(&out);
        let first = lines[0].as_str().unwrap();
        assert!(first.starts_with(&format!("{} refs/heads/main\0", blob)));
        assert!(first.contains("report-status"));
        assert!(first.contains(&format!("agent={}", AGENT)));
        assert!(lines[1].is_flush());
    }

    #[test]
    fn test_parse_id() {
        let id = ObjectId::from_bytes([0xab; 20]);
        assert_eq!(parse_id(&format!("{} rest", id)).unwrap(), id);
        assert!(matches!(parse_id("abc"), Err(GitError::Protocol(_))));
        assert!(parse_id(&"z".repeat(40)).is_err());
    }
}
