//! Stdio transport.
//!
//! Runs one stateful session over stdin/stdout, the way `git-upload-pack`
//! and `git-receive-pack` run behind an SSH forced command.

use crate::repos::{normalize_name, RepoRegistry};
use anyhow::{anyhow, bail, Context};
use keel_git::{serve, GitError, ServeOptions, Service, SessionOutcome};
use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Bytes read per chunk by the background reader.
const CHUNK_SIZE: usize = 64 * 1024;

/// A reader that fails with `TimedOut` when its source stays silent too long.
///
/// Blocking reads happen on a background thread that hands chunks over a
/// channel; the session side waits on the channel with a deadline. The
/// thread exits once the source reaches EOF or the reader is dropped and the
/// next chunk arrives.
pub struct IdleTimeoutReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
    idle: Duration,
    eof: bool,
}

impl IdleTimeoutReader {
    /// Starts reading `source` in the background.
    pub fn spawn<R: Read + Send + 'static>(mut source: R, idle: Duration) -> io::Result<Self> {
        let (tx, chunks) = mpsc::sync_channel(4);
        thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || loop {
                let mut buf = vec![0; CHUNK_SIZE];
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.truncate(n);
                        if tx.send(Ok(buf)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            })?;
        Ok(Self {
            chunks,
            pending: Vec::new(),
            pos: 0,
            idle,
            eof: false,
        })
    }
}

impl Read for IdleTimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.pending.len() {
            if self.eof {
                return Ok(0);
            }
            match self.chunks.recv_timeout(self.idle) {
                Ok(chunk) => {
                    self.pending = chunk?;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Disconnected) => self.eof = true,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no input for {:?}", self.idle),
                    ));
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Splits an SSH command such as `git-upload-pack '/demo.git'` into the
/// service and the repository name.
pub fn parse_ssh_command(command: &str) -> anyhow::Result<(Service, String)> {
    let (program, path) = command
        .trim()
        .split_once(' ')
        .ok_or_else(|| anyhow!("expected `<service> <repo>`, got {:?}", command))?;
    // `git upload-pack` is also accepted.
    let program = match program {
        "git" => {
            let (sub, rest) = path
                .trim()
                .split_once(' ')
                .ok_or_else(|| anyhow!("expected `git <service> <repo>`, got {:?}", command))?;
            return parse_ssh_command(&format!("git-{} {}", sub, rest));
        }
        other => other,
    };
    let service: Service = program.parse()?;
    let path = path.trim().trim_matches(|c| c == '\'' || c == '"');
    let name = path.trim_start_matches('/').trim_start_matches("~/");
    let name = normalize_name(name)?.to_string();
    Ok((service, name))
}

/// Serves one session of `service` on `name` over `reader`/`writer`.
pub fn serve_stdio<R: Read, W: Write>(
    registry: &RepoRegistry,
    service: Service,
    name: &str,
    reader: R,
    writer: W,
    options: &ServeOptions,
    auto_create: bool,
) -> anyhow::Result<SessionOutcome> {
    let repo = match service {
        Service::ReceivePack if auto_create => registry.get_or_create(name)?,
        _ => registry.get(name)?,
    };
    tracing::info!(repo = %repo.name, service = %service, "Starting stdio session");

    let mut writer = BufWriter::new(writer);
    let result = serve(service, reader, &mut writer, &repo, options);
    writer.flush().context("flushing stdout")?;
    match result {
        Ok(outcome) => Ok(outcome),
        Err(GitError::Timeout) => bail!("client went idle: {}", GitError::Timeout),
        Err(e) if e.is_transport() => bail!("client disconnected: {}", e),
        Err(e) => Err(e.into()),
    }
}

/// Runs `service` on `name` over the process's stdin and stdout.
///
/// The session aborts with a timeout once stdin is silent for `idle_timeout`.
pub fn run(
    registry: &RepoRegistry,
    service: Service,
    name: &str,
    options: &ServeOptions,
    auto_create: bool,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    let stdin = IdleTimeoutReader::spawn(io::stdin(), idle_timeout)
        .context("starting stdin reader")?;
    let stdout = io::stdout().lock();
    serve_stdio(registry, service, name, stdin, stdout, options, auto_create)?;
    Ok(())
}
