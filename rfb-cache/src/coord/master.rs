//! Master side of the cache coordinator.
//!
//! The master owns the socket, the PID file, and the advisory lock for the
//! cache directory, and runs one poll-driven server thread. All per-client
//! state (the descriptor set and inbound buffers) lives inside that thread;
//! the foreground only touches the index snapshot, the stats, and the
//! pending-broadcast queue, each behind its own mutex.

use super::protocol::{CoordMessage, COORD_PROTOCOL_VERSION};
use super::{
    recv_available, send_all, CoordCallbacks, CoordPaths, CoordStats, POLL_TIMEOUT_MS,
};
use crate::index::WireIndexEntry;
use bytes::{Buf, BytesMut};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use rfb_protocol::batch::{batches, DEFAULT_BATCH_SIZE};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// The master's view of the persistent index, handed to slaves in WELCOME.
struct MasterIndex {
    entries: BTreeMap<u64, WireIndexEntry>,
    current_shard: u32,
    sequence: u32,
}

struct MasterShared {
    stop: AtomicBool,
    callbacks: CoordCallbacks,
    index: Mutex<MasterIndex>,
    stats: Mutex<CoordStats>,
    /// Locally completed writes awaiting broadcast by the server thread.
    pending: Mutex<Vec<WireIndexEntry>>,
}

/// One connected slave: its socket and partially received bytes.
struct Client {
    stream: UnixStream,
    buf: BytesMut,
    pid: u32,
}

pub(crate) struct MasterCoordinator {
    paths: CoordPaths,
    /// Holds the advisory lock for the lifetime of the role.
    lock_file: Option<File>,
    shared: Arc<MasterShared>,
    server: Option<JoinHandle<()>>,
}

impl MasterCoordinator {
    pub(crate) fn new(
        paths: CoordPaths,
        lock_file: File,
        callbacks: CoordCallbacks,
        seed_entries: Vec<WireIndexEntry>,
        current_shard: u32,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for entry in seed_entries {
            entries.insert(entry.cache_id, entry);
        }
        Self {
            paths,
            lock_file: Some(lock_file),
            shared: Arc::new(MasterShared {
                stop: AtomicBool::new(false),
                callbacks,
                index: Mutex::new(MasterIndex {
                    entries,
                    current_shard,
                    sequence: 0,
                }),
                stats: Mutex::new(CoordStats::default()),
                pending: Mutex::new(Vec::new()),
            }),
            server: None,
        }
    }

    /// Bind the coordinator socket and spawn the server thread.
    pub(crate) fn start(&mut self) -> bool {
        if self.server.is_some() {
            return true;
        }
        let listener = match bind_socket(&self.paths) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(path = %self.paths.sock.display(), %err, "cannot bind coordinator socket");
                return false;
            }
        };
        if let Err(err) = listener.set_nonblocking(true) {
            tracing::warn!(%err, "cannot make coordinator socket non-blocking");
            return false;
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("cache-coord-master".into())
            .spawn(move || run_server(listener, shared));
        match handle {
            Ok(handle) => {
                self.server = Some(handle);
                true
            }
            Err(err) => {
                tracing::warn!(%err, "cannot spawn coordinator server thread");
                false
            }
        }
    }

    /// Stop the server, notify slaves, and release all process-wide state.
    ///
    /// Idempotent: once the lock is released this is a no-op, so a stopped
    /// coordinator cannot unlink the files of a successor master.
    pub(crate) fn stop(&mut self) {
        if self.lock_file.is_none() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.server.take() {
            if handle.join().is_err() {
                tracing::error!("coordinator server thread panicked");
            }
        }
        let _ = std::fs::remove_file(&self.paths.sock);
        let _ = std::fs::remove_file(&self.paths.pid);
        // Dropping the file releases the advisory lock.
        self.lock_file.take();
    }

    /// Persist an entry via the write callback and broadcast the result.
    pub(crate) fn local_write(
        &self,
        entry: &WireIndexEntry,
        payload: &[u8],
    ) -> Option<WireIndexEntry> {
        let completed = (self.shared.callbacks.write_request)(entry, payload)?;
        self.publish(&[completed]);
        Some(completed)
    }

    /// Enter entries into the snapshot and queue them for broadcast.
    pub(crate) fn publish(&self, entries: &[WireIndexEntry]) {
        if entries.is_empty() {
            return;
        }
        {
            let mut index = self.shared.index.lock();
            for entry in entries {
                if entry.shard > index.current_shard {
                    index.current_shard = entry.shard;
                }
                index.entries.insert(entry.cache_id, *entry);
            }
        }
        self.shared.pending.lock().extend_from_slice(entries);
    }

    pub(crate) fn stats(&self) -> CoordStats {
        *self.shared.stats.lock()
    }
}

fn bind_socket(paths: &CoordPaths) -> std::io::Result<UnixListener> {
    match UnixListener::bind(&paths.sock) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // We hold the lock, so any existing socket file is a leftover.
            std::fs::remove_file(&paths.sock)?;
            UnixListener::bind(&paths.sock)
        }
        Err(err) => Err(err),
    }
}

fn run_server(listener: UnixListener, shared: Arc<MasterShared>) {
    let mut clients: Vec<Client> = Vec::new();

    while !shared.stop.load(Ordering::Acquire) {
        let mut accept_ready = false;
        let mut events: Vec<PollFlags> = Vec::with_capacity(clients.len());
        {
            let listener_fd = listener.as_fd();
            let client_fds: Vec<_> = clients.iter().map(|client| client.stream.as_fd()).collect();
            let mut fds = Vec::with_capacity(clients.len() + 1);
            fds.push(PollFd::new(&listener_fd, PollFlags::POLLIN));
            for client_fd in &client_fds {
                fds.push(PollFd::new(client_fd, PollFlags::POLLIN));
            }
            match poll(&mut fds, POLL_TIMEOUT_MS) {
                Ok(_) => {
                    accept_ready = fds[0]
                        .revents()
                        .unwrap_or(PollFlags::empty())
                        .contains(PollFlags::POLLIN);
                    for fd in &fds[1..] {
                        events.push(fd.revents().unwrap_or(PollFlags::empty()));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    tracing::error!(%err, "coordinator poll failed");
                    break;
                }
            }
        }

        if accept_ready {
            accept_clients(&listener, &mut clients, &shared);
        }

        let mut drop_list: Vec<usize> = Vec::new();
        for (i, revents) in events.iter().enumerate() {
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
            {
                drop_list.push(i);
                continue;
            }
            if revents.contains(PollFlags::POLLIN) && !service_client(i, &mut clients, &shared)
            {
                drop_list.push(i);
            }
        }
        for &i in drop_list.iter().rev() {
            let client = clients.remove(i);
            tracing::debug!(pid = client.pid, "slave disconnected");
        }
        if !drop_list.is_empty() {
            shared.stats.lock().connected_slaves = clients.len();
        }

        broadcast_pending(&mut clients, &shared);
    }

    // Announce shutdown to every connected slave.
    let exit = CoordMessage::MasterExit.encode();
    for client in &clients {
        let _ = send_all(client.stream.as_fd(), &exit);
    }
    shared.stats.lock().connected_slaves = 0;
}

fn accept_clients(listener: &UnixListener, clients: &mut Vec<Client>, shared: &MasterShared) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::warn!(%err, "dropping client that cannot go non-blocking");
                    continue;
                }
                tracing::debug!("accepted coordinator client");
                clients.push(Client {
                    stream,
                    buf: BytesMut::new(),
                    pid: 0,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, "coordinator accept failed");
                break;
            }
        }
    }
    shared.stats.lock().connected_slaves = clients.len();
}

/// Read and dispatch everything the client has sent. Returns false when the
/// client must be dropped.
fn service_client(i: usize, clients: &mut [Client], shared: &MasterShared) -> bool {
    match recv_available(clients[i].stream.as_fd(), &mut clients[i].buf) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(err) => {
            tracing::warn!(pid = clients[i].pid, %err, "error reading from slave");
            return false;
        }
    }

    loop {
        let parsed = CoordMessage::parse(&clients[i].buf);
        match parsed {
            Ok(Some((message, consumed))) => {
                clients[i].buf.advance(consumed);
                if !dispatch(i, clients, shared, message) {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(err) => {
                tracing::error!(pid = clients[i].pid, %err, "malformed coordinator message");
                return false;
            }
        }
    }
}

fn dispatch(i: usize, clients: &mut [Client], shared: &MasterShared, message: CoordMessage) -> bool {
    match message {
        CoordMessage::Hello { version, pid } => {
            if version != COORD_PROTOCOL_VERSION {
                tracing::error!(
                    slave_version = version,
                    our_version = COORD_PROTOCOL_VERSION,
                    "slave speaks a different coordinator protocol"
                );
                return false;
            }
            clients[i].pid = pid;
            let (entries, current_shard) = {
                let index = shared.index.lock();
                (
                    index.entries.values().copied().collect::<Vec<_>>(),
                    index.current_shard,
                )
            };
            tracing::info!(pid, entries = entries.len(), "slave connected, sending welcome");
            let welcome = CoordMessage::Welcome {
                version: COORD_PROTOCOL_VERSION,
                master_pid: std::process::id(),
                current_shard,
                entries,
            }
            .encode();
            send_all(clients[i].stream.as_fd(), &welcome).is_ok()
        }

        CoordMessage::WriteRequest { entry, payload } => {
            let completed = (shared.callbacks.write_request)(&entry, &payload);
            {
                let mut stats = shared.stats.lock();
                stats.write_requests_recv += 1;
                if completed.is_some() {
                    stats.bytes_written_for_slaves += payload.len() as u64;
                }
            }
            match completed {
                Some(done) => {
                    let correlation = {
                        let mut index = shared.index.lock();
                        if done.shard > index.current_shard {
                            index.current_shard = done.shard;
                        }
                        index.entries.insert(done.cache_id, done);
                        index.sequence += 1;
                        index.sequence
                    };
                    let ack = CoordMessage::WriteAck {
                        entry: done,
                        correlation,
                    }
                    .encode();
                    if send_all(clients[i].stream.as_fd(), &ack).is_err() {
                        return false;
                    }

                    // Every *other* live slave learns about the new entry.
                    let update = CoordMessage::IndexUpdate {
                        sequence: correlation,
                        entries: vec![done],
                    }
                    .encode();
                    let mut sent = 0u64;
                    for (j, other) in clients.iter().enumerate() {
                        if j == i {
                            continue;
                        }
                        match send_all(other.stream.as_fd(), &update) {
                            Ok(()) => sent += 1,
                            Err(err) => {
                                tracing::warn!(pid = other.pid, %err, "index update not delivered")
                            }
                        }
                    }
                    shared.stats.lock().index_updates_sent += sent;
                    true
                }
                None => {
                    tracing::warn!(
                        pid = clients[i].pid,
                        cache_id = entry.cache_id,
                        "write request failed, sending nack"
                    );
                    send_all(clients[i].stream.as_fd(), &CoordMessage::WriteNack.encode())
                        .is_ok()
                }
            }
        }

        CoordMessage::QueryIndex { hash, .. } => {
            let mut id = [0u8; 8];
            id.copy_from_slice(&hash[..8]);
            let cache_id = u64::from_be_bytes(id);
            let entry = shared.index.lock().entries.get(&cache_id).copied();
            let resp = CoordMessage::QueryResponse { entry }.encode();
            send_all(clients[i].stream.as_fd(), &resp).is_ok()
        }

        CoordMessage::Ping => {
            send_all(clients[i].stream.as_fd(), &CoordMessage::Pong.encode()).is_ok()
        }
        CoordMessage::Pong => true,

        CoordMessage::SlaveExit => {
            tracing::info!(pid = clients[i].pid, "slave exiting cleanly");
            false
        }

        other => {
            tracing::error!(
                pid = clients[i].pid,
                message_type = other.message_type(),
                "unexpected message from slave"
            );
            false
        }
    }
}

/// Broadcast queued local publishes to every connected slave.
fn broadcast_pending(clients: &mut [Client], shared: &MasterShared) {
    let pending: Vec<WireIndexEntry> = std::mem::take(&mut *shared.pending.lock());
    if pending.is_empty() || clients.is_empty() {
        return;
    }
    for batch in batches(&pending, DEFAULT_BATCH_SIZE) {
        let sequence = {
            let mut index = shared.index.lock();
            index.sequence += 1;
            index.sequence
        };
        let update = CoordMessage::IndexUpdate {
            sequence,
            entries: batch.to_vec(),
        }
        .encode();
        let mut sent = 0u64;
        for client in clients.iter() {
            match send_all(client.stream.as_fd(), &update) {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::warn!(pid = client.pid, %err, "index update not delivered")
                }
            }
        }
        shared.stats.lock().index_updates_sent += sent;
    }
}
