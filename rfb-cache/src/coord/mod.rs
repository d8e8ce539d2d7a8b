//! Multi-viewer cache coordination.
//!
//! Several viewer processes may share one persistent cache directory, but
//! exactly one of them owns writes. At creation time each process elects a
//! role for the directory: the first to take the advisory lock on
//! `coord.lock` becomes **master**, later arrivals become **slaves** and
//! talk to the master over the `coord.sock` stream socket, and any process
//! that cannot use the filesystem machinery at all falls back to
//! **standalone** (every operation a benign no-op).
//!
//! The master runs a poll-driven server thread: it accepts slaves, answers
//! HELLO with a WELCOME index snapshot, persists slave write requests
//! through the caller-supplied callback, and broadcasts index updates.
//! Slaves run a reader thread and offer a synchronous [`CacheCoordinator::request_write`]
//! that blocks the caller until the master acks (or a timeout).
//!
//! A slave whose master goes away simply stops running; it does not attempt
//! re-election.

pub mod protocol;

mod master;
mod slave;

use crate::index::WireIndexEntry;
use bytes::BytesMut;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::kill;
use nix::sys::socket::{recv, send, MsgFlags};
use nix::unistd::Pid;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use master::MasterCoordinator;
use slave::SlaveCoordinator;

/// Poll cadence of the master server thread and the slave reader thread.
pub const POLL_TIMEOUT_MS: i32 = 100;

/// How long a slave's initial connect and HELLO may take.
pub const CONNECT_TIMEOUT_MS: u64 = 2000;

/// How long a slave waits for a write ack before giving up.
pub const WRITE_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Delay before re-probing a contended lock whose holder looks dead.
const MASTER_RETRY_DELAY_MS: u64 = 100;

/// Cap on EAGAIN retries in [`send_all`]; with the poll timeout this bounds
/// a stuck send at roughly the write-request timeout.
const SEND_RETRY_LIMIT: u32 = 50;

/// Master lock sentinel file name.
pub const LOCK_FILE_NAME: &str = "coord.lock";

/// Master PID file name.
pub const PID_FILE_NAME: &str = "coord.pid";

/// Coordinator socket file name.
pub const SOCKET_FILE_NAME: &str = "coord.sock";

/// Role of a process for one cache directory. Fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    Uninitialized,
    Master,
    Slave,
    Standalone,
}

/// Canonical coordination paths under a cache directory.
#[derive(Debug, Clone)]
pub(crate) struct CoordPaths {
    pub lock: PathBuf,
    pub pid: PathBuf,
    pub sock: PathBuf,
}

impl CoordPaths {
    fn new(dir: &Path) -> Self {
        Self {
            lock: dir.join(LOCK_FILE_NAME),
            pid: dir.join(PID_FILE_NAME),
            sock: dir.join(SOCKET_FILE_NAME),
        }
    }
}

/// Called whenever new entries enter the local view: the WELCOME snapshot,
/// an INDEX_UPDATE broadcast, or replayed local writes.
pub type IndexUpdateCallback = Arc<dyn Fn(&[WireIndexEntry]) + Send + Sync>;

/// Invoked on the master to persist a payload to shard storage. Returns the
/// completed entry (shard id and offset filled in) on success.
pub type WriteRequestCallback =
    Arc<dyn Fn(&WireIndexEntry, &[u8]) -> Option<WireIndexEntry> + Send + Sync>;

/// The two knobs the coordinator consumes.
#[derive(Clone)]
pub struct CoordCallbacks {
    pub index_update: IndexUpdateCallback,
    pub write_request: WriteRequestCallback,
}

/// Aggregate coordinator statistics.
///
/// Master roles populate the first four fields, slaves the last two;
/// standalone coordinators report all zeros.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoordStats {
    pub connected_slaves: usize,
    pub write_requests_recv: u64,
    pub index_updates_sent: u64,
    pub bytes_written_for_slaves: u64,
    pub write_requests_sent: u64,
    pub index_updates_recv: u64,
}

enum Inner {
    Master(MasterCoordinator),
    Slave(SlaveCoordinator),
    Standalone,
}

/// Coordinator facade. Created by [`CacheCoordinator::create`], torn down by
/// [`CacheCoordinator::stop`] (also run on drop).
pub struct CacheCoordinator {
    role: CoordinatorRole,
    inner: Inner,
}

impl CacheCoordinator {
    /// Elect a role for `dir` and build the matching coordinator.
    ///
    /// `seed_entries` and `current_shard` initialise the master's index
    /// snapshot (ignored for other roles). Any unrecoverable filesystem
    /// problem yields a standalone coordinator, never an error.
    pub fn create(
        dir: &Path,
        callbacks: CoordCallbacks,
        seed_entries: Vec<WireIndexEntry>,
        current_shard: u32,
    ) -> Self {
        match elect(dir) {
            Election::Master { lock_file, paths } => {
                tracing::info!(dir = %dir.display(), "elected cache coordinator master");
                Self {
                    role: CoordinatorRole::Master,
                    inner: Inner::Master(MasterCoordinator::new(
                        paths,
                        lock_file,
                        callbacks,
                        seed_entries,
                        current_shard,
                    )),
                }
            }
            Election::Slave { paths } => {
                tracing::info!(dir = %dir.display(), "joining cache coordinator as slave");
                Self {
                    role: CoordinatorRole::Slave,
                    inner: Inner::Slave(SlaveCoordinator::new(paths, callbacks.index_update)),
                }
            }
            Election::Standalone => {
                tracing::info!(dir = %dir.display(), "cache coordination unavailable, standalone");
                Self::standalone()
            }
        }
    }

    /// A coordinator that never coordinates.
    pub fn standalone() -> Self {
        Self {
            role: CoordinatorRole::Standalone,
            inner: Inner::Standalone,
        }
    }

    pub fn role(&self) -> CoordinatorRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == CoordinatorRole::Master
    }

    pub fn is_slave(&self) -> bool {
        self.role == CoordinatorRole::Slave
    }

    /// Start the role's background thread.
    ///
    /// A master binds its socket and spawns the server thread; a slave
    /// connects, sends HELLO, and spawns the reader. On failure the
    /// coordinator downgrades itself to standalone and returns false.
    pub fn start(&mut self) -> bool {
        let ok = match &mut self.inner {
            Inner::Master(master) => master.start(),
            Inner::Slave(slave) => slave.start(),
            Inner::Standalone => true,
        };
        if !ok {
            tracing::warn!(role = ?self.role, "coordinator start failed, falling back to standalone");
            self.stop();
            self.inner = Inner::Standalone;
            self.role = CoordinatorRole::Standalone;
        }
        ok
    }

    /// Stop the coordinator and release its resources. Idempotent.
    ///
    /// A master notifies connected slaves with MASTER_EXIT, joins the server
    /// thread, releases the advisory lock, and unlinks its socket and PID
    /// files. A slave sends a best-effort SLAVE_EXIT and joins the reader.
    pub fn stop(&mut self) {
        match &mut self.inner {
            Inner::Master(master) => master.stop(),
            Inner::Slave(slave) => slave.stop(),
            Inner::Standalone => {}
        }
    }

    /// Persist one cache entry through the coordination layer.
    ///
    /// On a slave this is the synchronous write RPC: it forwards the entry
    /// and payload to the master and blocks until WRITE_ACK / WRITE_NACK or
    /// the timeout. On a master the write callback runs directly and the
    /// completed entry is broadcast to slaves. Standalone returns `None`.
    pub fn request_write(
        &self,
        entry: &WireIndexEntry,
        payload: &[u8],
    ) -> Option<WireIndexEntry> {
        match &self.inner {
            Inner::Master(master) => master.local_write(entry, payload),
            Inner::Slave(slave) => slave.request_write(entry, payload),
            Inner::Standalone => None,
        }
    }

    /// Enter locally completed writes into the master's snapshot and
    /// broadcast them to all connected slaves. No-op for other roles.
    pub fn publish_entries(&self, entries: &[WireIndexEntry]) {
        if let Inner::Master(master) = &self.inner {
            master.publish(entries);
        }
    }

    /// Tune how long a slave's [`Self::request_write`] waits for the
    /// master's ack. Defaults to [`WRITE_REQUEST_TIMEOUT_MS`]; other roles
    /// ignore it.
    pub fn set_write_request_timeout(&self, timeout: std::time::Duration) {
        if let Inner::Slave(slave) = &self.inner {
            slave.set_write_request_timeout(timeout);
        }
    }

    /// Current statistics for this coordinator.
    pub fn stats(&self) -> CoordStats {
        match &self.inner {
            Inner::Master(master) => master.stats(),
            Inner::Slave(slave) => slave.stats(),
            Inner::Standalone => CoordStats::default(),
        }
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Election {
    Master { lock_file: File, paths: CoordPaths },
    Slave { paths: CoordPaths },
    Standalone,
}

/// Role election for a cache directory.
///
/// The winner of a non-blocking exclusive advisory lock on `coord.lock`
/// becomes master; if the lock is contended but the recorded master PID is
/// dead, one delayed retry gives the stale lock a chance to have been
/// released. Every unrecoverable filesystem error degrades to standalone.
fn elect(dir: &Path) -> Election {
    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(0o755);
    if let Err(err) = builder.create(dir) {
        tracing::warn!(dir = %dir.display(), %err, "cannot create cache directory");
        return Election::Standalone;
    }

    let paths = CoordPaths::new(dir);
    let lock_file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .open(&paths.lock)
    {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %paths.lock.display(), %err, "cannot open lock file");
            return Election::Standalone;
        }
    };

    match try_lock_exclusive(&lock_file) {
        Ok(true) => finish_master_election(lock_file, paths),
        Ok(false) => {
            // Contended. If the recorded holder is dead the lock may be
            // moments from release; retry once after a short wait.
            let holder = read_pid_file(&paths.pid);
            if holder.is_some_and(|pid| !pid_alive(pid)) {
                std::thread::sleep(std::time::Duration::from_millis(MASTER_RETRY_DELAY_MS));
                match try_lock_exclusive(&lock_file) {
                    Ok(true) => return finish_master_election(lock_file, paths),
                    Ok(false) => {}
                    Err(_) => return Election::Standalone,
                }
            }
            Election::Slave { paths }
        }
        Err(err) => {
            tracing::warn!(%err, "advisory lock unavailable");
            Election::Standalone
        }
    }
}

fn finish_master_election(lock_file: File, paths: CoordPaths) -> Election {
    // Stale-master cleanup: a dead PID on record means the old socket file
    // is garbage and would shadow our fresh bind.
    if let Some(pid) = read_pid_file(&paths.pid) {
        if pid != 0 && !pid_alive(pid) {
            tracing::info!(stale_pid = pid, "cleaning up socket of dead master");
            let _ = std::fs::remove_file(&paths.sock);
        }
    }
    if let Err(err) = write_pid_file(&paths.pid, std::process::id()) {
        tracing::warn!(path = %paths.pid.display(), %err, "cannot write pid file");
        return Election::Standalone;
    }
    Election::Master { lock_file, paths }
}

#[allow(deprecated)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    ) {
        Ok(()) => Ok(true),
        Err(Errno::EWOULDBLOCK) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// True when `pid` refers to a live process (or one we may not signal).
fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{}", pid)
}

/// Send the whole buffer on a non-blocking socket.
///
/// `MSG_NOSIGNAL` keeps a disconnected peer from raising SIGPIPE; EINTR is
/// retried transparently and EAGAIN waits for writability, bounded so a
/// wedged peer cannot stall the caller forever.
pub(crate) fn send_all(fd: BorrowedFd<'_>, mut bytes: &[u8]) -> std::io::Result<()> {
    let mut retries = 0u32;
    while !bytes.is_empty() {
        match send(
            fd.as_raw_fd(),
            bytes,
            MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(n) => {
                bytes = &bytes[n..];
                retries = 0;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                retries += 1;
                if retries > SEND_RETRY_LIMIT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "peer not accepting data",
                    ));
                }
                let mut fds = [PollFd::new(&fd, PollFlags::POLLOUT)];
                match poll(&mut fds, POLL_TIMEOUT_MS) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Drain everything currently readable into `buf`.
///
/// Returns `Ok(false)` when the peer has closed the connection.
pub(crate) fn recv_available(fd: BorrowedFd<'_>, buf: &mut BytesMut) -> std::io::Result<bool> {
    let mut chunk = [0u8; 4096];
    loop {
        match recv(fd.as_raw_fd(), &mut chunk, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Ok(false),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(true),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Poll a single descriptor for input, returning the revents.
///
/// EINTR reports as no events; the caller's loop just comes around again.
pub(crate) fn poll_events(fd: BorrowedFd<'_>, timeout_ms: i32) -> std::io::Result<PollFlags> {
    let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout_ms) {
        Ok(_) => Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
        Err(Errno::EINTR) => Ok(PollFlags::empty()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_layout() {
        let paths = CoordPaths::new(Path::new("/var/cache/rfb"));
        assert_eq!(paths.lock, Path::new("/var/cache/rfb/coord.lock"));
        assert_eq!(paths.pid, Path::new("/var/cache/rfb/coord.pid"));
        assert_eq!(paths.sock, Path::new("/var/cache/rfb/coord.sock"));
    }

    #[test]
    fn test_pid_alive_self_and_dead() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));

        // A freshly reaped child is a dead pid.
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        write_pid_file(&path, 12345).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "12345\n");
        assert_eq!(read_pid_file(&path), Some(12345));
    }

    #[test]
    fn test_pid_file_garbage_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, "not a pid\n").unwrap();
        assert_eq!(read_pid_file(&path), None);
        assert_eq!(read_pid_file(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_lock_contended_within_process() {
        let dir = tempdir().unwrap();
        let paths = CoordPaths::new(dir.path());

        let first = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&paths.lock)
            .unwrap();
        assert!(try_lock_exclusive(&first).unwrap());

        // A second descriptor onto the same lock file must see contention.
        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&paths.lock)
            .unwrap();
        assert!(!try_lock_exclusive(&second).unwrap());

        // Dropping the holder releases the lock.
        drop(first);
        assert!(try_lock_exclusive(&second).unwrap());
    }
}
