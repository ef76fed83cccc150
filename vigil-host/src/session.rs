//! Connection sessions: one owned socket and one read-loop task per agent.
//!
//! A session is created on accept, learns its device identity from the first
//! valid telemetry frame, and is torn down exactly once on end-of-stream,
//! read error, or explicit close. Nothing a single session does can affect
//! another session or the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::DeviceRegistry;
use crate::sink::TelemetrySink;
use crate::wire::{self, CommandFrame, Frame};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already closed")]
    Closed,
    #[error("socket write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Server-side state for one accepted TCP connection.
///
/// The write half lives behind an async mutex so `send` is safe from any
/// task, concurrently with the read loop and with other sends.
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    device: Mutex<Option<String>>,
    open: AtomicBool,
}

impl Session {
    /// Split an accepted stream into a session (owning the write half) and
    /// the read half its read loop will consume.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> (Arc<Self>, OwnedReadHalf) {
        let (reader, writer) = stream.into_split();
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            peer,
            writer: tokio::sync::Mutex::new(Some(writer)),
            device: Mutex::new(None),
            open: AtomicBool::new(true),
        });
        (session, reader)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Last device identity this session reported, if any yet.
    pub fn device(&self) -> Option<String> {
        self.device.lock().clone()
    }

    /// Record the reported identity; returns the previous one.
    fn set_device(&self, device_id: &str) -> Option<String> {
        self.device.lock().replace(device_id.to_string())
    }

    /// Write one command frame to the peer.
    ///
    /// The remote side may already be gone, so a failure here is an ordinary
    /// outcome for callers, never fatal. A failed write also closes the
    /// session, since the socket is no longer trustworthy.
    pub async fn send(&self, frame: &CommandFrame) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("dropping {:?} for closed session {}", frame, self.peer);
            return Err(SessionError::Closed);
        };
        if let Err(e) = writer.write_all(&wire::encode(frame)).await {
            drop(guard);
            warn!("write to {} failed: {e}", self.peer);
            self.close().await;
            return Err(SessionError::Write(e));
        }
        Ok(())
    }

    /// Close the underlying socket. Idempotent; only the first call shuts
    /// the write half down.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(mut writer) = self.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        }
    }
}

/// Read frames from one session's socket until it closes or errors, then
/// tear the session down: socket closed, registry entries removed, session
/// dropped from the live set.
pub(crate) async fn run_session(
    session: Arc<Session>,
    reader: OwnedReadHalf,
    registry: DeviceRegistry,
    sessions: SessionSet,
    sink: Arc<dyn TelemetrySink>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match wire::decode(line.as_bytes()) {
                    Ok(Frame::Telemetry(record)) => {
                        if let Some(previous) = session.set_device(&record.device_id) {
                            if previous != record.device_id {
                                registry.remove_if(&previous, &session);
                            }
                        }
                        registry.register(&record.device_id, &session);
                        sink.submit_telemetry(record);
                    }
                    Ok(Frame::Control(control)) => {
                        debug!("ignoring control frame {} from {}", control.kind, session.peer);
                    }
                    // A single bad frame must not end an otherwise healthy
                    // connection.
                    Err(e) => warn!("bad frame from {}: {e}", session.peer),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("read error from {}: {e}", session.peer);
                break;
            }
        }
    }

    session.close().await;
    registry.unregister_all(&session);
    sessions.remove(session.id);
    info!("agent disconnected from {}", session.peer);
}

struct SessionEntry {
    session: Arc<Session>,
    task: Option<JoinHandle<()>>,
}

/// The server's set of live sessions. Owns each `Arc<Session>` and its task
/// handle; the device registry only ever holds weak references.
#[derive(Clone, Default)]
pub struct SessionSet {
    inner: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl SessionSet {
    pub fn insert(&self, session: &Arc<Session>) {
        self.inner
            .lock()
            .insert(session.id(), SessionEntry { session: session.clone(), task: None });
    }

    /// Attach the read-loop task handle to an already-inserted session. If
    /// the session finished before the handle arrived there is nothing left
    /// to supervise.
    pub fn attach_task(&self, id: Uuid, task: JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.inner.lock().remove(&id);
    }

    /// Point-in-time snapshot of the live sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().values().map(|entry| entry.session.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Take everything out for a supervised stop.
    pub(crate) fn drain(&self) -> Vec<(Arc<Session>, Option<JoinHandle<()>>)> {
        self.inner
            .lock()
            .drain()
            .map(|(_, entry)| (entry.session, entry.task))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (session, _reader) = Session::new(server, peer);

        assert!(session.is_open());
        session.close().await;
        session.close().await;
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn send_after_close_fails_without_panicking() {
        let (_client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (session, _reader) = Session::new(server, peer);

        session.close().await;
        let result = session.send(&CommandFrame::Shutdown).await;
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn set_device_returns_previous_identity() {
        let (_client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (session, _reader) = Session::new(server, peer);

        assert_eq!(session.set_device("Agent-01"), None);
        assert_eq!(session.set_device("Agent-02"), Some("Agent-01".into()));
        assert_eq!(session.device(), Some("Agent-02".into()));
    }

    #[tokio::test]
    async fn snapshot_reflects_inserts_and_removes() {
        let set = SessionSet::default();
        let (_c1, s1) = socket_pair().await;
        let (_c2, s2) = socket_pair().await;
        let peer1 = s1.peer_addr().unwrap();
        let peer2 = s2.peer_addr().unwrap();
        let (session1, _r1) = Session::new(s1, peer1);
        let (session2, _r2) = Session::new(s2, peer2);

        set.insert(&session1);
        set.insert(&session2);
        assert_eq!(set.len(), 2);

        set.remove(session1.id());
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), session2.id());
    }
}
