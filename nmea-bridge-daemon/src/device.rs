//! Device channel: the PTY gpsd reads from.
//!
//! The slave end gets a fresh `/dev/pts/N` name on every process start; the
//! symlink at the configured link path is what stays fixed, so gpsd's own
//! configuration never changes across bridge restarts or modem renumbering.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::{chown, ttyname, Gid, Group, Uid};

use crate::error::{io_err, sys_err, DaemonError};

/// Mode of the consumer-facing end: read-write for owner and group only.
pub const SLAVE_MODE: u32 = 0o660;

/// Where forwarded sentences go. Implemented by [`DeviceChannel`]; the event
/// loop only depends on this.
pub trait SentenceSink: Send {
    /// Stable path the consumer opens.
    fn consumer_path(&self) -> &Path;

    /// Writes every `$`-prefixed line of `payload`, `\r\n` terminated.
    /// Returns the number of sentences written.
    fn forward(&mut self, payload: &str) -> Result<usize, DaemonError>;

    /// Removes the consumer path and closes the write end. Idempotent.
    fn teardown(&mut self) -> Result<(), DaemonError>;
}

/// Who may open the consumer end.
#[derive(Debug, Clone)]
pub struct DeviceOwnership {
    pub owner: Uid,
    pub group: String,
}

#[derive(Debug)]
pub struct DeviceChannel {
    master: Option<File>,
    link: PathBuf,
    slave_path: PathBuf,
    /// Unwritten end of a sentence cut short by a full PTY buffer.
    backlog: Vec<u8>,
}

impl DeviceChannel {
    /// Allocates the PTY, hands its slave end to `ownership` and links
    /// `link` to it.
    ///
    /// # Errors
    /// PTY allocation and group lookup failures are fatal for the bridge.
    pub fn create(link: &Path, ownership: &DeviceOwnership) -> Result<Self, DaemonError> {
        let gid = lookup_group(&ownership.group)?;

        let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(DaemonError::Pty)?;
        set_nonblocking(&pty.master)?;
        let slave_path = ttyname(pty.slave.as_fd()).map_err(DaemonError::Pty)?;
        // gpsd opens the slave by path; the bridge only needs the master.
        drop(pty.slave);

        chown(&slave_path, Some(ownership.owner), Some(gid))
            .map_err(|e| sys_err("chown", &slave_path, e))?;
        fs::set_permissions(&slave_path, fs::Permissions::from_mode(SLAVE_MODE))
            .map_err(|e| io_err(&slave_path, e))?;

        replace_link(link, &slave_path)?;

        tracing::info!(
            slave = %slave_path.display(),
            link = %link.display(),
            group = %ownership.group,
            "device channel ready",
        );

        Ok(Self {
            master: Some(File::from(pty.master)),
            link: link.to_path_buf(),
            slave_path,
            backlog: Vec::new(),
        })
    }

    /// The real `/dev/pts/N` path behind the link.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }
}

impl SentenceSink for DeviceChannel {
    fn consumer_path(&self) -> &Path {
        &self.link
    }

    fn forward(&mut self, payload: &str) -> Result<usize, DaemonError> {
        let (framed, count) = frame_sentences(payload);
        if count == 0 {
            return Ok(0);
        }
        let Some(master) = self.master.as_mut() else {
            return Err(DaemonError::ChannelClosed("device channel torn down"));
        };
        let dropped = deliver(master, &mut self.backlog, &framed)
            .map_err(|e| io_err(&self.slave_path, e))?;
        if dropped > 0 {
            return Err(DaemonError::ReaderStalled { dropped });
        }
        Ok(count)
    }

    fn teardown(&mut self) -> Result<(), DaemonError> {
        let removed = remove_link(&self.link);
        if self.master.take().is_some() {
            tracing::info!(link = %self.link.display(), "device channel closed");
        }
        removed
    }
}

/// Trims each line of `payload` and keeps the ones that start with `$`,
/// each followed by `\r\n`. Returns the bytes and the sentence count.
pub fn frame_sentences(payload: &str) -> (Vec<u8>, usize) {
    let mut framed = Vec::with_capacity(payload.len() + 16);
    let mut count = 0;
    for line in payload.lines().map(str::trim) {
        if !line.starts_with('$') {
            continue;
        }
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
        count += 1;
    }
    (framed, count)
}

/// Writes `backlog`, then `framed`, into a non-blocking writer and returns
/// how many sentences were dropped.
///
/// A sentence cut short by `WouldBlock` keeps its unwritten end in `backlog`
/// and is completed before anything else is written. Sentences that could not
/// be started are dropped whole, so the reader never sees a split line.
fn deliver<W: Write>(out: &mut W, backlog: &mut Vec<u8>, framed: &[u8]) -> io::Result<usize> {
    if !backlog.is_empty() {
        let written = write_until_blocked(out, backlog)?;
        backlog.drain(..written);
        if !backlog.is_empty() {
            return Ok(count_sentences(framed));
        }
    }

    let written = write_until_blocked(out, framed)?;
    let rest = &framed[written..];
    let at_boundary = written == 0 || framed[written - 1] == b'\n';
    let cut = if at_boundary {
        0
    } else {
        rest.iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |i| i + 1)
    };
    backlog.extend_from_slice(&rest[..cut]);
    Ok(count_sentences(&rest[cut..]))
}

fn write_until_blocked<W: Write>(out: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match out.write(&buf[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

fn count_sentences(framed: &[u8]) -> usize {
    framed.iter().filter(|&&b| b == b'\n').count()
}

fn lookup_group(name: &str) -> Result<Gid, DaemonError> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(DaemonError::GroupNotFound(name.to_string())),
        Err(source) => Err(DaemonError::GroupLookup {
            group: name.to_string(),
            source,
        }),
    }
}

/// A reader that stalls must never stall the event loop: writes fail with
/// `WouldBlock` instead.
fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<(), DaemonError> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(DaemonError::Pty)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(DaemonError::Pty)?;
    Ok(())
}

fn replace_link(link: &Path, target: &Path) -> Result<(), DaemonError> {
    match fs::symlink_metadata(link) {
        Ok(_) => {
            tracing::warn!(link = %link.display(), "removing stale object at device link");
            fs::remove_file(link).map_err(|e| io_err(link, e))?;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(link, err)),
    }
    symlink(target, link).map_err(|e| io_err(link, e))
}

fn remove_link(link: &Path) -> Result<(), DaemonError> {
    match fs::remove_file(link) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(link, err)),
    }
}
