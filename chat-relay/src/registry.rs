//! Shared table of sessions that completed their handshake.
//!
//! Every insert, removal and iteration happens under one lock, and the lock is
//! never held across network I/O: [`Registry::snapshot`] copies the current
//! sessions out so callers write to peers after it has been released.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::Mutex,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub type ConnId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long closing a session waits on its writer before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Server-side state for one registered connection.
///
/// The session handler owns the read half of the connection; the registry and
/// the dispatcher reach the peer through the write half kept here.
pub struct Session {
    id: ConnId,
    name: String,
    addr: SocketAddr,
    // `None` once the connection has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl Session {
    pub fn new<W>(id: ConnId, name: String, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            name,
            addr,
            writer: Mutex::new(Some(Box::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Writes one pre-encoded line to this peer.
    ///
    /// Concurrent senders are serialized per peer, so lines never interleave.
    /// A write still pending when the session is closed fails with
    /// `NotConnected` and releases the writer.
    pub async fn send(&self, line: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        self.write_unless_closed(&mut writer, line).await
    }

    /// Closes the connection and wakes the session's read loop.
    ///
    /// Calling this again after the connection is closed is a no-op. Never
    /// waits longer than [`CLOSE_TIMEOUT`] on the writer.
    pub async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        let writer = timeout(CLOSE_TIMEOUT, self.writer.lock())
            .await
            .map_err(|_| timed_out())?
            .take();
        match writer {
            Some(mut writer) => timeout(CLOSE_TIMEOUT, writer.shutdown())
                .await
                .map_err(|_| timed_out())?,
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    async fn write_unless_closed(
        &self,
        writer: &mut Option<BoxedWriter>,
        line: &[u8],
    ) -> io::Result<()> {
        select! {
            biased;
            _ = self.closed.cancelled() => Err(not_connected()),
            result = write_line(writer, line) => result,
        }
    }
}

async fn write_line(writer: &mut Option<BoxedWriter>, line: &[u8]) -> io::Result<()> {
    let writer = writer.as_mut().ok_or_else(not_connected)?;
    writer.write_all(line).await?;
    writer.flush().await
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session closed")
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "timed out closing session")
}

pub struct Registry {
    sessions: Mutex<HashMap<ConnId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a session, returning any session previously stored under its id.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id(), session)
    }

    /// Registers `session` and writes `greeting` to it as its first line.
    ///
    /// The session's writer is held across the insert, so a broadcast that
    /// observes the new session queues behind the greeting.
    pub async fn register_with_greeting(
        &self,
        session: Arc<Session>,
        greeting: &[u8],
    ) -> io::Result<()> {
        let mut writer = session.writer.lock().await;
        self.register(Arc::clone(&session)).await;
        session.write_unless_closed(&mut writer, greeting).await
    }

    pub async fn unregister(&self, id: ConnId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id)
    }

    /// Copies the registered sessions, ordered by connection id.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut snapshot: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        snapshot.sort_by_key(|session| session.id());
        snapshot
    }

    pub async fn contains(&self, id: ConnId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
