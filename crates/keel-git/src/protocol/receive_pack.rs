//! `git-receive-pack`: accepting pushes.

use super::{advertise_refs, parse_id, send_fatal, Capabilities, ServeOptions, Service};
use crate::pack::{PackParser, PackSummary};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{SideBandMode, SideBandWriter};
use crate::{GitError, Result};
use keel_storage::{validate_ref_name, ObjectId, RefUpdate, Repository};
use std::io::{Read, Write};

/// A ref update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    /// Value the client believes the ref has (zero for create).
    pub old: ObjectId,
    /// Value to set (zero for delete).
    pub new: ObjectId,
    /// Reference name.
    pub name: String,
}

impl RefCommand {
    /// Parses `<old> <new> <name>`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GitError::Protocol(format!("malformed command {:?}", line)));
        };
        if old.len() != ObjectId::HEX_LEN || new.len() != ObjectId::HEX_LEN || name.is_empty() {
            return Err(GitError::Protocol(format!("malformed command {:?}", line)));
        }
        Ok(Self {
            old: parse_id(old)?,
            new: parse_id(new)?,
            name: name.to_string(),
        })
    }

    /// Returns true if this creates the ref.
    pub fn is_create(&self) -> bool {
        self.old.is_zero()
    }

    /// Returns true if this deletes the ref.
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    fn as_update(&self) -> RefUpdate {
        RefUpdate::new(self.name.clone(), self.old.non_zero(), self.new.non_zero())
    }
}

/// What happened to one ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// Updated.
    Ok,
    /// Refused, with the reason sent to the client.
    Rejected(String),
}

impl RefStatus {
    /// Returns true if the ref was updated.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Server-side rules for pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPolicy {
    /// Apply every command or none, even if the client did not ask.
    pub atomic: bool,
    /// Refuse updates that are not fast-forwards.
    pub deny_non_fast_forwards: bool,
    /// Refuse all deletions.
    pub deny_deletes: bool,
    /// Refuse deleting the branch `HEAD` points at.
    pub deny_delete_current: bool,
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            atomic: false,
            deny_non_fast_forwards: false,
            deny_deletes: false,
            deny_delete_current: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingCommands,
    AwaitingPack,
    Ready,
    Reported,
}

/// What the driver should do after feeding a packet to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePackAction {
    /// Read the next packet.
    Continue,
    /// Hand the rest of the stream to [`ReceivePackSession::receive_pack`].
    ReceivePack,
    /// No pack follows; call [`ReceivePackSession::apply`].
    Apply,
    /// The client sent no commands; end the session.
    Close,
}

/// Server side of one push, advanced one packet at a time.
pub struct ReceivePackSession<'a> {
    repo: &'a Repository,
    policy: PushPolicy,
    state: State,
    caps: Capabilities,
    commands: Vec<RefCommand>,
    unpack: Option<std::result::Result<PackSummary, String>>,
    statuses: Vec<RefStatus>,
}

impl<'a> ReceivePackSession<'a> {
    /// Starts a session after the advertisement has been sent.
    pub fn new(repo: &'a Repository, policy: PushPolicy) -> Self {
        Self {
            repo,
            policy,
            state: State::AwaitingCommands,
            caps: Capabilities::default(),
            commands: Vec::new(),
            unpack: None,
            statuses: Vec::new(),
        }
    }

    /// Commands received so far.
    pub fn commands(&self) -> &[RefCommand] {
        &self.commands
    }

    /// Capabilities from the first command line.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Returns true if every command must succeed together.
    pub fn is_atomic(&self) -> bool {
        self.policy.atomic || self.caps.contains("atomic")
    }

    fn side_band(&self) -> SideBandMode {
        SideBandMode::negotiate(
            self.caps.contains("side-band-64k"),
            self.caps.contains("side-band"),
        )
    }

    /// Feeds one packet from the command section.
    pub fn advance(&mut self, pkt: PktLine) -> Result<ReceivePackAction> {
        if self.state != State::AwaitingCommands {
            return Err(GitError::Protocol(format!(
                "unexpected {:?} after command list",
                pkt
            )));
        }
        let data = match pkt {
            PktLine::Flush if self.commands.is_empty() => {
                self.state = State::Reported;
                return Ok(ReceivePackAction::Close);
            }
            PktLine::Flush if self.commands.iter().all(RefCommand::is_delete) => {
                self.state = State::Ready;
                return Ok(ReceivePackAction::Apply);
            }
            PktLine::Flush => {
                self.state = State::AwaitingPack;
                return Ok(ReceivePackAction::ReceivePack);
            }
            PktLine::Data(data) => data,
            other => {
                return Err(GitError::Protocol(format!(
                    "unexpected {:?} in command list",
                    other
                )))
            }
        };

        let line = std::str::from_utf8(&data)
            .map_err(|_| GitError::Protocol("command is not UTF-8".to_string()))?;
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = match line.split_once('\0') {
            Some((command, caps)) if self.commands.is_empty() => {
                self.caps = Capabilities::parse(caps);
                tracing::debug!(caps = %caps, "Client capabilities");
                command
            }
            Some((command, _)) => command,
            None => line,
        };
        self.commands.push(RefCommand::parse(line)?);
        Ok(ReceivePackAction::Continue)
    }

    /// Reads the pack that follows the command list and publishes its
    /// objects. On failure nothing is stored and every command will be
    /// reported as rejected.
    pub fn receive_pack<R: Read>(&mut self, reader: R) -> Result<PackSummary> {
        if self.state != State::AwaitingPack {
            return Err(GitError::Protocol("no pack expected".to_string()));
        }
        self.state = State::Ready;
        match PackParser::new().ingest(reader, &self.repo.objects) {
            Ok(summary) => {
                self.unpack = Some(Ok(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(repo = %self.repo.name, error = %e, "Unpack failed");
                self.unpack = Some(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Validates and applies every command, returning their statuses in
    /// command order.
    pub fn apply(&mut self) -> Result<&[RefStatus]> {
        if self.state != State::Ready {
            return Err(GitError::Protocol("nothing to apply".to_string()));
        }
        self.state = State::Reported;

        if let Some(Err(_)) = &self.unpack {
            let rejected = RefStatus::Rejected("unpacker error".to_string());
            self.statuses = vec![rejected; self.commands.len()];
            return Ok(&self.statuses);
        }

        let checks: Vec<std::result::Result<(), String>> = self
            .commands
            .iter()
            .map(|command| self.validate(command))
            .collect::<Result<_>>()?;

        self.statuses = if self.is_atomic() {
            self.apply_atomic(checks)
        } else {
            self.commands
                .iter()
                .zip(checks)
                .map(|(command, check)| match check {
                    Err(reason) => RefStatus::Rejected(reason),
                    Ok(()) => match self.repo.refs.update(
                        &command.name,
                        command.old.non_zero(),
                        command.new.non_zero(),
                    ) {
                        Ok(()) => RefStatus::Ok,
                        Err(e) => RefStatus::Rejected(e.to_string()),
                    },
                })
                .collect()
        };

        for (command, status) in self.commands.iter().zip(&self.statuses) {
            match status {
                RefStatus::Ok => tracing::debug!(
                    repo = %self.repo.name,
                    name = %command.name,
                    old = %command.old,
                    new = %command.new,
                    "Updated ref"
                ),
                RefStatus::Rejected(reason) => tracing::warn!(
                    repo = %self.repo.name,
                    name = %command.name,
                    reason = %reason,
                    "Rejected ref update"
                ),
            }
        }
        Ok(&self.statuses)
    }

    fn apply_atomic(&self, checks: Vec<std::result::Result<(), String>>) -> Vec<RefStatus> {
        if checks.iter().any(|c| c.is_err()) {
            return checks
                .into_iter()
                .map(|check| match check {
                    Err(reason) => RefStatus::Rejected(reason),
                    Ok(()) => RefStatus::Rejected("atomic push failed".to_string()),
                })
                .collect();
        }
        let updates: Vec<RefUpdate> = self.commands.iter().map(RefCommand::as_update).collect();
        match self.repo.refs.update_atomic(&updates) {
            Ok(()) => vec![RefStatus::Ok; self.commands.len()],
            Err(e) => vec![RefStatus::Rejected(e.to_string()); self.commands.len()],
        }
    }

    /// Checks one command against the ref rules and the object graph.
    ///
    /// The outer error is a storage failure; the inner one is a rejection.
    fn validate(&self, command: &RefCommand) -> Result<std::result::Result<(), String>> {
        if validate_ref_name(&command.name).is_err() {
            return Ok(Err("funny refname".to_string()));
        }

        if command.is_delete() {
            if self.policy.deny_deletes {
                return Ok(Err("deletion prohibited".to_string()));
            }
            if self.policy.deny_delete_current
                && self.repo.refs.head_target().as_deref() == Some(command.name.as_str())
            {
                return Ok(Err("deletion of the current branch prohibited".to_string()));
            }
            return Ok(Ok(()));
        }

        let tips: Vec<ObjectId> = self
            .repo
            .refs
            .list()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        match self.repo.objects.check_connectivity(&command.new, &tips) {
            Ok(()) => {}
            Err(keel_storage::StorageError::IncompleteObjectGraph { missing }) => {
                tracing::debug!(name = %command.name, %missing, "Push is missing an object");
                return Ok(Err("IncompleteObjectGraph".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if self.policy.deny_non_fast_forwards
            && !command.is_create()
            && !self.repo.objects.is_ancestor(&command.old, &command.new)?
        {
            return Ok(Err("non-fast-forward".to_string()));
        }
        Ok(Ok(()))
    }

    /// Builds the `report-status` response, or nothing if the client did not
    /// ask for one.
    pub fn report(&self) -> Vec<PktLine> {
        if !self.caps.contains("report-status") {
            return Vec::new();
        }
        let mut lines = vec![match &self.unpack {
            Some(Err(reason)) => PktLine::line(&format!("unpack {}", reason)),
            _ => PktLine::line("unpack ok"),
        }];
        for (command, status) in self.commands.iter().zip(&self.statuses) {
            lines.push(match status {
                RefStatus::Ok => PktLine::line(&format!("ok {}", command.name)),
                RefStatus::Rejected(reason) => {
                    PktLine::line(&format!("ng {} {}", command.name, reason))
                }
            });
        }
        lines.push(PktLine::Flush);

        let mode = self.side_band();
        if !mode.is_enabled() {
            return lines;
        }
        let encoded: Vec<u8> = lines.iter().flat_map(PktLine::encode).collect();
        let mut muxed = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = SideBandWriter::new(&mut muxed, mode).write_all(&encoded);
        let mut packets = Vec::new();
        let mut reader = PktLineReader::new(&muxed[..]);
        while let Ok(Some(pkt)) = reader.read() {
            packets.push(pkt);
        }
        packets.push(PktLine::Flush);
        packets
    }
}

/// Summary of a served push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Each command with what happened to it.
    pub results: Vec<(RefCommand, RefStatus)>,
    /// Objects the pack carried.
    pub objects: usize,
}

/// Serves `git-receive-pack` over a byte stream.
pub fn serve_receive_pack<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    repo: &Repository,
    options: &ServeOptions,
) -> Result<PushOutcome> {
    if options.advertise {
        advertise_refs(&mut writer, repo, Service::ReceivePack, false)?;
    }
    let mut input = PktLineReader::new(reader);
    let mut out = PktLineWriter::new(writer);
    let mut session = ReceivePackSession::new(repo, options.policy.clone());

    let mut unpack_error = None;
    loop {
        let action = match input.read() {
            Ok(Some(pkt)) => session.advance(pkt),
            Ok(None) if session.commands().is_empty() => return Ok(PushOutcome::default()),
            Ok(None) => Err(GitError::Disconnect),
            Err(e) => Err(e),
        };
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(repo = %repo.name, error = %e, "Push aborted");
                send_fatal(out.inner_mut(), SideBandMode::None, Service::ReceivePack, &e);
                return Err(e);
            }
        };
        match action {
            ReceivePackAction::Continue => {}
            ReceivePackAction::Close => return Ok(PushOutcome::default()),
            ReceivePackAction::Apply => break,
            ReceivePackAction::ReceivePack => {
                if let Err(e) = session.receive_pack(input.inner_mut()) {
                    if e.is_transport() {
                        tracing::warn!(repo = %repo.name, error = %e, "Push aborted");
                        send_fatal(out.inner_mut(), session.side_band(), Service::ReceivePack, &e);
                        return Err(e);
                    }
                    unpack_error = Some(e);
                }
                break;
            }
        }
    }

    session.apply()?;
    let report = session.report();
    if let Some(e) = unpack_error {
        if report.is_empty() {
            let _ = out.write_error(&format!("receive-pack: unpack failed: {}", e));
        } else {
            let _ = out.write_all(&report);
        }
        let _ = out.flush();
        return Err(e);
    }
    out.write_all(&report)?;
    out.flush()?;

    let objects = match &session.unpack {
        Some(Ok(summary)) => summary.ids.len(),
        _ => 0,
    };
    let outcome = PushOutcome {
        results: session
            .commands
            .iter()
            .cloned()
            .zip(session.statuses.iter().cloned())
            .collect(),
        objects,
    };
    tracing::info!(
        repo = %repo.name,
        commands = outcome.results.len(),
        accepted = outcome.results.iter().filter(|(_, s)| s.is_ok()).count(),
        objects,
        "Served push"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{write_pack, PackOptions};
    use keel_storage::{Commit, FileMode, GitObject, ObjectStore, Tree, TreeEntry};

    const SIG: &str = "Dev <dev@example.com> 1700000000 +0000";

    /// Builds a commit in a scratch store and returns it with a pack of its
    /// objects.
    fn commit_pack(parents: Vec<ObjectId>, content: &str, base: &ObjectStore) -> (ObjectId, Vec<u8>) {
        let blob = base.put(GitObject::blob(content.as_bytes().to_vec())).unwrap();
        let tree = base
            .put_object(Tree::sorted(vec![TreeEntry::new(FileMode::REGULAR, "f", blob)]))
            .unwrap();
        let commit = base
            .put_object(Commit::new(tree, parents.clone(), SIG, SIG, content))
            .unwrap();
        let exclude: Vec<ObjectId> = parents;
        let ids: Vec<_> = base
            .reachable_from(&[commit], &exclude)
            .unwrap()
            .into_iter()
            .collect();
        let mut pack = Vec::new();
        write_pack(&mut pack, base, &ids, &PackOptions::default()).unwrap();
        (commit, pack)
    }

    fn command(old: Option<ObjectId>, new: Option<ObjectId>, name: &str, caps: &str) -> PktLine {
        let old = old.unwrap_or(ObjectId::ZERO);
        let new = new.unwrap_or(ObjectId::ZERO);
        if caps.is_empty() {
            PktLine::line(&format!("{} {} {}", old, new, name))
        } else {
            PktLine::line(&format!("{} {} {}\0{}", old, new, name, caps))
        }
    }

    #[test]
    fn test_parse_command() {
        let old = ObjectId::from_bytes([1; 20]);
        let cmd = RefCommand::parse(&format!("{} {} refs/heads/main", old, ObjectId::ZERO)).unwrap();
        assert_eq!(cmd.old, old);
        assert!(cmd.is_delete());
        assert!(!cmd.is_create());
        assert!(RefCommand::parse("garbage").is_err());
        assert!(RefCommand::parse(&format!("{} {}", old, old)).is_err());
    }

    #[test]
    fn test_create_ref() {
        let repo = Repository::in_memory("r");
        let scratch = ObjectStore::memory();
        let (commit, pack) = commit_pack(vec![], "hello", &scratch);

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        assert_eq!(
            session
                .advance(command(None, Some(commit), "refs/heads/main", "report-status"))
                .unwrap(),
            ReceivePackAction::Continue
        );
        assert_eq!(
            session.advance(PktLine::Flush).unwrap(),
            ReceivePackAction::ReceivePack
        );
        session.receive_pack(&pack[..]).unwrap();
        assert_eq!(session.apply().unwrap(), &[RefStatus::Ok]);
        assert_eq!(repo.refs.get("refs/heads/main"), Some(commit));

        assert_eq!(
            session.report(),
            vec![
                PktLine::line("unpack ok"),
                PktLine::line("ok refs/heads/main"),
                PktLine::Flush
            ]
        );
    }

    #[test]
    fn test_missing_object_rejected() {
        let repo = Repository::in_memory("r");
        let scratch = ObjectStore::memory();
        let (commit, _) = commit_pack(vec![], "hello", &scratch);
        // Ship only the commit: its tree and blob never arrive.
        let mut pack = Vec::new();
        write_pack(&mut pack, &scratch, &[commit], &PackOptions::default()).unwrap();

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(None, Some(commit), "refs/heads/feature", "report-status"))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.receive_pack(&pack[..]).unwrap();
        let statuses = session.apply().unwrap().to_vec();
        assert!(matches!(&statuses[0], RefStatus::Rejected(r) if r == "IncompleteObjectGraph"));
        assert_eq!(repo.refs.get("refs/heads/feature"), None);
    }

    #[test]
    fn test_delete_only_skips_pack() {
        let repo = Repository::in_memory("r");
        let id = repo.objects.put(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.update("refs/heads/old", None, Some(id)).unwrap();

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(Some(id), None, "refs/heads/old", "report-status delete-refs"))
            .unwrap();
        assert_eq!(
            session.advance(PktLine::Flush).unwrap(),
            ReceivePackAction::Apply
        );
        assert_eq!(session.apply().unwrap(), &[RefStatus::Ok]);
        assert_eq!(repo.refs.get("refs/heads/old"), None);
    }

    #[test]
    fn test_delete_current_branch_denied() {
        let repo = Repository::in_memory("r");
        let id = repo.objects.put(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.update("refs/heads/main", None, Some(id)).unwrap();

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(Some(id), None, "refs/heads/main", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        assert!(!session.apply().unwrap()[0].is_ok());
        assert_eq!(repo.refs.get("refs/heads/main"), Some(id));
        // No report-status requested.
        assert!(session.report().is_empty());
    }

    #[test]
    fn test_deny_deletes() {
        let repo = Repository::in_memory("r");
        let id = repo.objects.put(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.update("refs/heads/topic", None, Some(id)).unwrap();

        let policy = PushPolicy {
            deny_deletes: true,
            ..PushPolicy::default()
        };
        let mut session = ReceivePackSession::new(&repo, policy);
        session
            .advance(command(Some(id), None, "refs/heads/topic", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        assert_eq!(
            session.apply().unwrap(),
            &[RefStatus::Rejected("deletion prohibited".to_string())]
        );
    }

    #[test]
    fn test_non_fast_forward_denied() {
        let repo = Repository::in_memory("r");
        let (first, pack) = commit_pack(vec![], "first", &repo.objects);
        ingest(&repo, &pack);
        repo.refs.update("refs/heads/main", None, Some(first)).unwrap();
        // An unrelated root commit.
        let (other, pack) = commit_pack(vec![], "other", &repo.objects);

        let policy = PushPolicy {
            deny_non_fast_forwards: true,
            ..PushPolicy::default()
        };
        let mut session = ReceivePackSession::new(&repo, policy);
        session
            .advance(command(Some(first), Some(other), "refs/heads/main", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.receive_pack(&pack[..]).unwrap();
        assert_eq!(
            session.apply().unwrap(),
            &[RefStatus::Rejected("non-fast-forward".to_string())]
        );
        assert_eq!(repo.refs.get("refs/heads/main"), Some(first));
    }

    #[test]
    fn test_stale_old_value_rejected() {
        let repo = Repository::in_memory("r");
        let (first, _) = commit_pack(vec![], "first", &repo.objects);
        let (second, pack) = commit_pack(vec![first], "second", &repo.objects);
        repo.refs.update("refs/heads/main", None, Some(second)).unwrap();

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        // Client thinks main is at `first`.
        session
            .advance(command(Some(first), Some(second), "refs/heads/main", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.receive_pack(&pack[..]).unwrap();
        assert!(!session.apply().unwrap()[0].is_ok());
    }

    #[test]
    fn test_atomic_push_all_or_nothing() {
        let repo = Repository::in_memory("r");
        let scratch = ObjectStore::memory();
        let (good, pack) = commit_pack(vec![], "good", &scratch);

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(None, Some(good), "refs/heads/a", "report-status atomic"))
            .unwrap();
        session
            .advance(command(None, Some(good), "refs/heads/bad..name", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.receive_pack(&pack[..]).unwrap();
        assert!(session.is_atomic());

        let statuses = session.apply().unwrap().to_vec();
        assert_eq!(
            statuses,
            vec![
                RefStatus::Rejected("atomic push failed".to_string()),
                RefStatus::Rejected("funny refname".to_string()),
            ]
        );
        assert_eq!(repo.refs.get("refs/heads/a"), None);
    }

    #[test]
    fn test_per_ref_independence() {
        let repo = Repository::in_memory("r");
        let scratch = ObjectStore::memory();
        let (good, pack) = commit_pack(vec![], "good", &scratch);

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(None, Some(good), "refs/heads/a", "report-status"))
            .unwrap();
        session
            .advance(command(None, Some(good), "refs/heads/bad..name", ""))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.receive_pack(&pack[..]).unwrap();
        let statuses = session.apply().unwrap().to_vec();
        assert_eq!(statuses[0], RefStatus::Ok);
        assert!(!statuses[1].is_ok());
        assert_eq!(repo.refs.get("refs/heads/a"), Some(good));
    }

    #[test]
    fn test_corrupt_pack_rejects_everything() {
        let repo = Repository::in_memory("r");
        let scratch = ObjectStore::memory();
        let (commit, mut pack) = commit_pack(vec![], "hello", &scratch);
        let last = pack.len() - 1;
        pack[last] ^= 0xff;

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(None, Some(commit), "refs/heads/main", "report-status"))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        assert!(matches!(
            session.receive_pack(&pack[..]),
            Err(GitError::PackChecksumMismatch { .. })
        ));
        session.apply().unwrap();

        let report = session.report();
        assert!(report[0].as_str().unwrap().starts_with("unpack pack checksum mismatch"));
        assert_eq!(report[1].as_str(), Some("ng refs/heads/main unpacker error"));
        assert_eq!(repo.objects.len().unwrap(), 0);
    }

    #[test]
    fn test_report_wrapped_in_sideband() {
        let repo = Repository::in_memory("r");
        let id = repo.objects.put(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.update("refs/heads/topic", None, Some(id)).unwrap();

        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        session
            .advance(command(
                Some(id),
                None,
                "refs/heads/topic",
                "report-status side-band-64k",
            ))
            .unwrap();
        session.advance(PktLine::Flush).unwrap();
        session.apply().unwrap();

        let report = session.report();
        assert_eq!(report.len(), 2);
        assert!(report[1].is_flush());
        let data = report[0].data().unwrap();
        assert_eq!(data[0], 1);
        let inner: Vec<u8> = [
            PktLine::line("unpack ok").encode(),
            PktLine::line("ok refs/heads/topic").encode(),
            PktLine::Flush.encode(),
        ]
        .concat();
        assert_eq!(&data[1..], &inner[..]);
    }

    #[test]
    fn test_flush_only_closes() {
        let repo = Repository::in_memory("r");
        let mut session = ReceivePackSession::new(&repo, PushPolicy::default());
        assert_eq!(
            session.advance(PktLine::Flush).unwrap(),
            ReceivePackAction::Close
        );
    }

    fn ingest(repo: &Repository, pack: &[u8]) {
        PackParser::new().ingest(pack, &repo.objects).unwrap();
    }
}
