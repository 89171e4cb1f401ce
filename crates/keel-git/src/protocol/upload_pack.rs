//! `git-upload-pack`: serving fetches and clones.

use super::{advertise_refs, parse_id, send_fatal, Capabilities, ServeOptions, Service};
use crate::pack::{write_pack, PackOptions, PackStats};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{SideBandMode, SideBandWriter};
use crate::{GitError, Result};
use keel_storage::{ObjectId, Repository};
use std::collections::HashSet;
use std::io::{Read, Write};

/// Acknowledgement flavour the client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiAck {
    None,
    Basic,
    Detailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingWants,
    Negotiating,
    Done,
}

/// What the driver should do after feeding a packet to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPackAction {
    /// Read the next packet.
    Continue,
    /// Send these packets, then keep reading.
    Reply(Vec<PktLine>),
    /// Send these packets and end the session without a pack.
    Finish(Vec<PktLine>),
    /// Send these packets, then the pack.
    SendPack(Vec<PktLine>),
}

/// Server side of one fetch negotiation, advanced one packet at a time.
///
/// The session never touches refs and only reads from the object store.
pub struct UploadPackSession<'a> {
    repo: &'a Repository,
    stateless: bool,
    state: State,
    caps: Capabilities,
    multi_ack: MultiAck,
    wants: Vec<ObjectId>,
    want_set: HashSet<ObjectId>,
    common: Vec<ObjectId>,
    common_set: HashSet<ObjectId>,
    /// Wants already known to reach a common commit.
    satisfied: HashSet<ObjectId>,
    got_common: bool,
    got_other: bool,
}

impl<'a> UploadPackSession<'a> {
    /// Starts a session after the advertisement has been sent.
    pub fn new(repo: &'a Repository, stateless: bool) -> Self {
        Self {
            repo,
            stateless,
            state: State::AwaitingWants,
            caps: Capabilities::default(),
            multi_ack: MultiAck::None,
            wants: Vec::new(),
            want_set: HashSet::new(),
            common: Vec::new(),
            common_set: HashSet::new(),
            satisfied: HashSet::new(),
            got_common: false,
            got_other: false,
        }
    }

    /// Objects the client asked for.
    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    /// Haves we recognised, in the order received.
    pub fn common(&self) -> &[ObjectId] {
        &self.common
    }

    /// Capabilities from the first want line.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Side-band flavour for the pack response.
    pub fn side_band(&self) -> SideBandMode {
        SideBandMode::negotiate(
            self.caps.contains("side-band-64k"),
            self.caps.contains("side-band"),
        )
    }

    /// Returns true if nothing has been requested yet, so end of input is a
    /// clean close.
    pub fn is_idle(&self) -> bool {
        self.state == State::AwaitingWants && self.wants.is_empty()
    }

    /// Feeds one packet from the client.
    pub fn advance(&mut self, pkt: PktLine) -> Result<UploadPackAction> {
        match self.state {
            State::AwaitingWants => self.on_want_section(pkt),
            State::Negotiating => self.on_have_section(pkt),
            State::Done => Err(GitError::Protocol(
                "unexpected packet after done".to_string(),
            )),
        }
    }

    fn on_want_section(&mut self, pkt: PktLine) -> Result<UploadPackAction> {
        let line = match &pkt {
            PktLine::Flush if self.wants.is_empty() => {
                tracing::debug!(repo = %self.repo.name, "Client wants nothing");
                self.state = State::Done;
                return Ok(UploadPackAction::Finish(Vec::new()));
            }
            PktLine::Flush => {
                self.state = State::Negotiating;
                return Ok(UploadPackAction::Continue);
            }
            PktLine::Data(_) => pkt.as_str().unwrap_or_default(),
            other => {
                return Err(GitError::Protocol(format!(
                    "unexpected {:?} in want list",
                    other
                )))
            }
        };

        if let Some(rest) = line.strip_prefix("want ") {
            let id = parse_id(rest)?;
            if self.wants.is_empty() {
                self.set_capabilities(rest.get(ObjectId::HEX_LEN..).unwrap_or_default());
            }
            if !self.repo.objects.has(&id)? {
                return Err(GitError::UnknownWant(id));
            }
            if self.want_set.insert(id) {
                self.wants.push(id);
            }
            return Ok(UploadPackAction::Continue);
        }

        let keyword = line.split(' ').next().unwrap_or_default();
        if matches!(
            keyword,
            "shallow" | "deepen" | "deepen-since" | "deepen-not" | "filter"
        ) {
            return Err(GitError::Protocol(format!(
                "{} is not supported by this server",
                keyword
            )));
        }
        Err(GitError::Protocol(format!("expected want, got {:?}", line)))
    }

    fn set_capabilities(&mut self, caps: &str) {
        self.caps = Capabilities::parse(caps);
        self.multi_ack = if self.caps.contains("multi_ack_detailed") {
            MultiAck::Detailed
        } else if self.caps.contains("multi_ack") {
            MultiAck::Basic
        } else {
            MultiAck::None
        };
        tracing::debug!(caps = %caps.trim(), "Client capabilities");
    }

    fn on_have_section(&mut self, pkt: PktLine) -> Result<UploadPackAction> {
        match &pkt {
            PktLine::Flush => return self.on_flush(),
            PktLine::Data(_) => {}
            other => {
                return Err(GitError::Protocol(format!(
                    "unexpected {:?} during negotiation",
                    other
                )))
            }
        }
        let line = pkt.as_str().unwrap_or_default();

        if line == "done" {
            self.state = State::Done;
            let reply = match self.common.last() {
                Some(last) if self.multi_ack != MultiAck::None => {
                    vec![PktLine::line(&format!("ACK {}", last))]
                }
                Some(_) => Vec::new(),
                None => vec![PktLine::line("NAK")],
            };
            return Ok(UploadPackAction::SendPack(reply));
        }

        let Some(rest) = line.strip_prefix("have ") else {
            return Err(GitError::Protocol(format!("expected have, got {:?}", line)));
        };
        let id = parse_id(rest)?;
        let mut reply = Vec::new();

        if self.repo.objects.has(&id)? {
            if self.common_set.insert(id) {
                self.common.push(id);
                self.got_common = true;
                match self.multi_ack {
                    MultiAck::Detailed => reply.push(ack(&id, "common")),
                    MultiAck::Basic => reply.push(ack(&id, "continue")),
                    MultiAck::None if self.common.len() == 1 => {
                        reply.push(PktLine::line(&format!("ACK {}", id)))
                    }
                    MultiAck::None => {}
                }
            }
        } else {
            self.got_other = true;
            if self.multi_ack != MultiAck::None && self.ok_to_give_up()? {
                let status = match self.multi_ack {
                    MultiAck::Detailed => "ready",
                    _ => "continue",
                };
                reply.push(ack(&id, status));
            }
        }

        Ok(if reply.is_empty() {
            UploadPackAction::Continue
        } else {
            UploadPackAction::Reply(reply)
        })
    }

    fn on_flush(&mut self) -> Result<UploadPackAction> {
        let mut reply = Vec::new();
        if self.multi_ack != MultiAck::None && self.got_common && !self.got_other {
            if let Some(last) = self.common.last().copied() {
                if self.ok_to_give_up()? {
                    let status = match self.multi_ack {
                        MultiAck::Detailed => "ready",
                        _ => "continue",
                    };
                    reply.push(ack(&last, status));
                }
            }
        }
        // Clients in multi-ack mode block on this NAK even after a ready.
        if self.common.is_empty() || self.multi_ack != MultiAck::None {
            reply.push(PktLine::line("NAK"));
        }
        self.got_common = false;
        self.got_other = false;

        if self.stateless {
            self.state = State::Done;
            Ok(UploadPackAction::Finish(reply))
        } else {
            Ok(UploadPackAction::Reply(reply))
        }
    }

    /// Returns true once every want reaches a common commit.
    fn ok_to_give_up(&mut self) -> Result<bool> {
        if self.common_set.is_empty() {
            return Ok(false);
        }
        for want in &self.wants {
            if self.satisfied.contains(want) {
                continue;
            }
            if !self.repo.objects.reaches_any(want, &self.common_set)? {
                return Ok(false);
            }
            self.satisfied.insert(*want);
        }
        Ok(true)
    }

    /// Every object the pack must carry: reachable from the wants, minus
    /// everything reachable from the common haves.
    pub fn pack_objects(&self) -> Result<Vec<ObjectId>> {
        let set = self
            .repo
            .objects
            .reachable_from(&self.wants, &self.common)?;
        Ok(set.into_iter().collect())
    }
}

fn ack(id: &ObjectId, status: &str) -> PktLine {
    PktLine::line(&format!("ACK {} {}", id, status))
}

/// Summary of a served fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Number of distinct wants.
    pub wants: usize,
    /// Number of recognised haves.
    pub common: usize,
    /// The pack sent, if negotiation reached one.
    pub pack: Option<PackStats>,
}

/// Serves `git-upload-pack` over a byte stream.
pub fn serve_upload_pack<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    repo: &Repository,
    options: &ServeOptions,
) -> Result<FetchOutcome> {
    if options.advertise {
        advertise_refs(&mut writer, repo, Service::UploadPack, false)?;
    }
    let mut input = PktLineReader::new(reader);
    let mut out = PktLineWriter::new(writer);
    let mut session = UploadPackSession::new(repo, options.stateless);

    loop {
        let action = match input.read() {
            Ok(Some(pkt)) => session.advance(pkt),
            Ok(None) if session.is_idle() => return Ok(FetchOutcome::default()),
            Ok(None) => Err(GitError::Disconnect),
            Err(e) => Err(e),
        };
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(repo = %repo.name, error = %e, "Fetch negotiation failed");
                send_fatal(out.inner_mut(), SideBandMode::None, Service::UploadPack, &e);
                return Err(e);
            }
        };
        match action {
            UploadPackAction::Continue => {}
            UploadPackAction::Reply(reply) => {
                out.write_all(&reply)?;
                out.flush()?;
            }
            UploadPackAction::Finish(reply) => {
                out.write_all(&reply)?;
                out.flush()?;
                return Ok(outcome(&session, None));
            }
            UploadPackAction::SendPack(reply) => {
                out.write_all(&reply)?;
                let stats = send_pack(out.inner_mut(), &session, &options.pack)?;
                out.flush()?;
                tracing::info!(
                    repo = %repo.name,
                    wants = session.wants().len(),
                    common = session.common().len(),
                    objects = stats.objects,
                    deltas = stats.deltas,
                    bytes = stats.bytes,
                    "Served fetch"
                );
                return Ok(outcome(&session, Some(stats)));
            }
        }
    }
}

fn outcome(session: &UploadPackSession<'_>, pack: Option<PackStats>) -> FetchOutcome {
    FetchOutcome {
        wants: session.wants().len(),
        common: session.common().len(),
        pack,
    }
}

fn send_pack<W: Write>(
    writer: W,
    session: &UploadPackSession<'_>,
    options: &PackOptions,
) -> Result<PackStats> {
    let caps = session.capabilities();
    let mut band = SideBandWriter::new(writer, session.side_band());
    let progress = !caps.contains("no-progress");
    let options = PackOptions {
        ofs_delta: options.ofs_delta && caps.contains("ofs-delta"),
        ..options.clone()
    };

    let result = (|| -> Result<PackStats> {
        let ids = session.pack_objects()?;
        if progress {
            band.progress(&format!("Enumerating objects: {}, done.\n", ids.len()))?;
        }
        let stats = write_pack(&mut band, &session.repo.objects, &ids, &options)?;
        if progress {
            band.progress(&format!(
                "Total {} (delta {}), reused 0 (delta 0)\n",
                stats.objects, stats.deltas
            ))?;
        }
        Ok(stats)
    })();

    match result {
        Ok(stats) => {
            if band.mode().is_enabled() {
                PktLineWriter::new(band.inner_mut()).flush_pkt()?;
            }
            Ok(stats)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Pack generation failed");
            let mode = band.mode();
            send_fatal(band.inner_mut(), mode, Service::UploadPack, &e);
            Err(e)
        }
    }
}
