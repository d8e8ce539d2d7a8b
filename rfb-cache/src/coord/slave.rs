//! Slave side of the cache coordinator.
//!
//! A slave owns one socket to the master. A reader thread polls it at the
//! shared 100 ms cadence and dispatches inbound messages; the foreground
//! calls [`SlaveCoordinator::request_write`], a synchronous RPC realised as
//! a single-slot rendezvous (mutex + condvar) between the caller and the
//! reader thread that receives the ack.

use super::protocol::{CoordMessage, COORD_PROTOCOL_VERSION};
use super::{
    poll_events, recv_available, send_all, CoordPaths, CoordStats, IndexUpdateCallback,
    CONNECT_TIMEOUT_MS, POLL_TIMEOUT_MS, WRITE_REQUEST_TIMEOUT_MS,
};
use crate::index::WireIndexEntry;
use bytes::{Buf, BytesMut};
use nix::poll::PollFlags;
use parking_lot::{Condvar, Mutex};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Rendezvous slot between `request_write` and the reader thread.
#[derive(Default)]
struct PendingWrite {
    ack_received: bool,
    success: bool,
    entry: Option<WireIndexEntry>,
}

struct SlaveShared {
    stop: AtomicBool,
    running: AtomicBool,
    /// Serialises writes to the single outbound socket.
    socket: Mutex<Option<UnixStream>>,
    write: Mutex<PendingWrite>,
    write_cond: Condvar,
    /// Write-ack timeout in milliseconds; [`WRITE_REQUEST_TIMEOUT_MS`]
    /// unless tuned.
    write_timeout_ms: AtomicU64,
    stats: Mutex<CoordStats>,
    index_update: IndexUpdateCallback,
}

impl SlaveShared {
    /// Close the socket, fail any pending write, and mark the slave as no
    /// longer running. Used for master exit, socket errors, and stop().
    ///
    /// No re-election is attempted; the surrounding code treats the slave
    /// as having fallen back to standalone.
    fn handle_master_exit(&self) {
        self.socket.lock().take();
        {
            let mut write = self.write.lock();
            write.ack_received = true;
            write.success = false;
        }
        self.write_cond.notify_all();
        self.running.store(false, Ordering::Release);
    }
}

pub(crate) struct SlaveCoordinator {
    paths: CoordPaths,
    shared: Arc<SlaveShared>,
    reader: Option<JoinHandle<()>>,
}

impl SlaveCoordinator {
    pub(crate) fn new(paths: CoordPaths, index_update: IndexUpdateCallback) -> Self {
        Self {
            paths,
            shared: Arc::new(SlaveShared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                socket: Mutex::new(None),
                write: Mutex::new(PendingWrite::default()),
                write_cond: Condvar::new(),
                write_timeout_ms: AtomicU64::new(WRITE_REQUEST_TIMEOUT_MS),
                stats: Mutex::new(CoordStats::default()),
                index_update,
            }),
            reader: None,
        }
    }

    /// Connect to the master, send HELLO, and spawn the reader thread.
    ///
    /// Returns false on any connect failure; the slave does not retry.
    pub(crate) fn start(&mut self) -> bool {
        if self.reader.is_some() {
            return self.shared.running.load(Ordering::Acquire);
        }

        let stream = match UnixStream::connect(&self.paths.sock) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(path = %self.paths.sock.display(), %err, "cannot connect to master");
                return false;
            }
        };
        // The connect timeout also covers the HELLO handshake write.
        let timeout = Some(Duration::from_millis(CONNECT_TIMEOUT_MS));
        let _ = stream.set_read_timeout(timeout);
        let _ = stream.set_write_timeout(timeout);
        if let Err(err) = stream.set_nonblocking(true) {
            tracing::warn!(%err, "cannot make slave socket non-blocking");
            return false;
        }

        let hello = CoordMessage::Hello {
            version: COORD_PROTOCOL_VERSION,
            pid: std::process::id(),
        }
        .encode();
        if let Err(err) = send_all(stream.as_fd(), &hello) {
            tracing::warn!(%err, "cannot send hello to master");
            return false;
        }

        let reader_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                tracing::warn!(%err, "cannot clone slave socket");
                return false;
            }
        };
        *self.shared.socket.lock() = Some(stream);
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("cache-coord-slave".into())
            .spawn(move || run_reader(reader_stream, shared));
        match handle {
            Ok(handle) => {
                self.reader = Some(handle);
                true
            }
            Err(err) => {
                tracing::warn!(%err, "cannot spawn slave reader thread");
                self.shared.handle_master_exit();
                false
            }
        }
    }

    /// Stop the slave: best-effort SLAVE_EXIT, then join the reader.
    pub(crate) fn stop(&mut self) {
        if let Some(socket) = self.shared.socket.lock().as_ref() {
            let _ = send_all(socket.as_fd(), &CoordMessage::SlaveExit.encode());
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                tracing::error!("slave reader thread panicked");
            }
        }
        self.shared.handle_master_exit();
    }

    /// Synchronous write RPC to the master.
    ///
    /// Sends WRITE_REQ and blocks until the reader thread delivers the ack,
    /// a nack, or the 5 second timeout expires. Returns the completed entry
    /// on success.
    pub(crate) fn request_write(
        &self,
        entry: &WireIndexEntry,
        payload: &[u8],
    ) -> Option<WireIndexEntry> {
        if !self.shared.running.load(Ordering::Acquire) {
            return None;
        }

        let frame = CoordMessage::WriteRequest {
            entry: *entry,
            payload: payload.to_vec(),
        }
        .encode();

        {
            // The pending slot is cleared under the socket mutex so the
            // reader cannot observe a half-reset rendezvous.
            let socket = self.shared.socket.lock();
            let Some(stream) = socket.as_ref() else {
                return None;
            };
            *self.shared.write.lock() = PendingWrite::default();
            if let Err(err) = send_all(stream.as_fd(), &frame) {
                tracing::warn!(%err, "write request not sent");
                drop(socket);
                self.shared.handle_master_exit();
                return None;
            }
        }

        let timeout = self.shared.write_timeout_ms.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(timeout);
        let mut write = self.shared.write.lock();
        while !write.ack_received {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(cache_id = entry.cache_id, "write request timed out");
                return None;
            }
            let _ = self
                .shared
                .write_cond
                .wait_for(&mut write, deadline - now);
        }

        if write.success {
            self.shared.stats.lock().write_requests_sent += 1;
            write.entry.take()
        } else {
            None
        }
    }

    /// Tune how long [`Self::request_write`] waits for an ack.
    pub(crate) fn set_write_request_timeout(&self, timeout: Duration) {
        self.shared
            .write_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> CoordStats {
        *self.shared.stats.lock()
    }
}

fn run_reader(stream: UnixStream, shared: Arc<SlaveShared>) {
    let mut buf = BytesMut::new();

    while !shared.stop.load(Ordering::Acquire) {
        let revents = match poll_events(stream.as_fd(), POLL_TIMEOUT_MS) {
            Ok(revents) => revents,
            Err(err) => {
                tracing::warn!(%err, "slave poll failed");
                shared.handle_master_exit();
                return;
            }
        };

        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            tracing::info!("master connection lost");
            shared.handle_master_exit();
            return;
        }
        if !revents.contains(PollFlags::POLLIN) {
            continue;
        }

        match recv_available(stream.as_fd(), &mut buf) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("master closed the connection");
                shared.handle_master_exit();
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "error reading from master");
                shared.handle_master_exit();
                return;
            }
        }

        loop {
            let parsed = CoordMessage::parse(&buf);
            match parsed {
                Ok(Some((message, consumed))) => {
                    buf.advance(consumed);
                    if !handle_message(&shared, message) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(%err, "malformed message from master");
                    shared.handle_master_exit();
                    return;
                }
            }
        }
    }
}

/// Dispatch one inbound message. Returns false when the reader must stop.
fn handle_message(shared: &SlaveShared, message: CoordMessage) -> bool {
    match message {
        CoordMessage::Welcome {
            version,
            master_pid,
            current_shard,
            entries,
        } => {
            tracing::info!(
                master_pid,
                version,
                current_shard,
                entries = entries.len(),
                "received index snapshot from master"
            );
            (shared.index_update)(&entries);
            true
        }

        CoordMessage::IndexUpdate { sequence, entries } => {
            tracing::debug!(sequence, entries = entries.len(), "index update");
            (shared.index_update)(&entries);
            shared.stats.lock().index_updates_recv += 1;
            true
        }

        CoordMessage::WriteAck { entry, .. } => {
            {
                let mut write = shared.write.lock();
                write.entry = Some(entry);
                write.success = true;
                write.ack_received = true;
            }
            shared.write_cond.notify_all();
            true
        }

        CoordMessage::WriteNack => {
            {
                let mut write = shared.write.lock();
                write.success = false;
                write.ack_received = true;
            }
            shared.write_cond.notify_all();
            true
        }

        CoordMessage::MasterExit => {
            tracing::info!("master announced shutdown");
            shared.handle_master_exit();
            false
        }

        CoordMessage::Ping => {
            // Reply on the shared socket so the send is serialised with
            // any concurrent write request.
            if let Some(socket) = shared.socket.lock().as_ref() {
                let _ = send_all(socket.as_fd(), &CoordMessage::Pong.encode());
            }
            true
        }
        CoordMessage::Pong => true,

        CoordMessage::QueryResponse { entry } => {
            // Synchronous query RPC is not wired up yet; log and move on.
            tracing::debug!(found = entry.is_some(), "unsolicited query response");
            true
        }

        other => {
            tracing::error!(
                message_type = other.message_type(),
                "unexpected message from master"
            );
            shared.handle_master_exit();
            false
        }
    }
}
