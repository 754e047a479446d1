//! Client Sessions
//!
//! Per-connection state and the shared write handle. The read side stays
//! owned by the session task; the write side is wrapped in a mutex-guarded
//! handle so asynchronous pub/sub deliveries and synchronous replies can
//! interleave only at frame boundaries, never inside one.
//!
//! The hub holds a weak-shaped [`SessionHandle`] (id + writer + version),
//! not the session itself; the session tells the hub to drop it during
//! teardown, which breaks the ownership cycle between the two.

use crate::protocol::{RespValue, RespVersion};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Semaphore};

/// Monotonic session id source.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The sharable write side of a session.
///
/// `send` serializes whole frames under the write mutex; the semaphore is
/// the per-session outbound capacity knob, bounding how many senders may
/// be queued on a slow socket at once.
pub struct SessionHandle {
    pub id: u64,
    pub addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    resp_version: AtomicU8,
    outbound: Semaphore,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl SessionHandle {
    pub fn new(addr: SocketAddr, writer: OwnedWriteHalf, outbound_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            writer: Mutex::new(writer),
            resp_version: AtomicU8::new(2),
            outbound: Semaphore::new(outbound_capacity.max(1)),
        })
    }

    pub fn version(&self) -> RespVersion {
        match self.resp_version.load(Ordering::Relaxed) {
            3 => RespVersion::Resp3,
            _ => RespVersion::Resp2,
        }
    }

    pub fn set_version(&self, version: RespVersion) {
        self.resp_version
            .store(version.as_number() as u8, Ordering::Relaxed);
    }

    /// Writes one complete frame. Holds the write mutex for exactly one
    /// value, so concurrent senders interleave at frame boundaries.
    pub async fn send(&self, value: &RespValue) -> std::io::Result<()> {
        let _permit = self
            .outbound
            .acquire()
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed"))?;
        let frame = value.encode(self.version());
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Writes a batch of frames under one mutex acquisition (SUBSCRIBE
    /// replies come one frame per channel and must not interleave with a
    /// delivery in the middle of the batch).
    pub async fn send_all(&self, values: &[RespValue]) -> std::io::Result<()> {
        let _permit = self
            .outbound
            .acquire()
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed"))?;
        let mut frame = Vec::new();
        for value in values {
            value.encode_into(&mut frame, self.version());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Tears the socket down; subsequent sends fail fast.
    pub async fn shutdown(&self) {
        self.outbound.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Mutable per-session state, owned by the session task alone.
#[derive(Debug)]
pub struct Session {
    pub handle: Arc<SessionHandle>,
    /// Authenticated, or no password configured.
    pub authenticated: bool,
    /// `CLIENT SETNAME`.
    pub name: Option<String>,
    /// `CLIENT SETINFO` lib-name/lib-ver, joined.
    pub lib_info: Option<String>,
    /// MULTI state: `Some` while queueing.
    pub queued: Option<Vec<Vec<Bytes>>>,
    /// A queueing error happened; EXEC must abort.
    pub dirty: bool,
    pub created_at: std::time::Instant,
}

impl Session {
    pub fn new(handle: Arc<SessionHandle>, auth_required: bool) -> Self {
        Self {
            handle,
            authenticated: !auth_required,
            name: None,
            lib_info: None,
            queued: None,
            dirty: false,
            created_at: std::time::Instant::now(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.queued.is_some()
    }

    /// Leaves MULTI state, dropping the queue.
    pub fn discard_transaction(&mut self) {
        self.queued = None;
        self.dirty = false;
    }

    /// RESET: back to a fresh session (except identity and auth gate).
    pub fn reset(&mut self, auth_required: bool) {
        self.discard_transaction();
        self.name = None;
        self.authenticated = !auth_required;
        self.handle.set_version(RespVersion::Resp2);
    }
}
