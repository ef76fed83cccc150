//! Ingestion server: the composition root for this core.
//!
//! Owns the listening socket, the live-session set, the device registry and
//! the command dispatcher, all constructed once and passed by reference to
//! every task; no process-wide state. The accept loop and each session run
//! as supervised tasks, so the whole thing can be stopped in tests without
//! relying on process exit.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::info;

use crate::config::HostConfig;
use crate::dispatch::CommandDispatcher;
use crate::registry::DeviceRegistry;
use crate::session::{run_session, Session, SessionSet};
use crate::sink::TelemetrySink;

pub struct IngestionServer {
    config: HostConfig,
    registry: DeviceRegistry,
    sessions: SessionSet,
    dispatcher: CommandDispatcher,
    sink: Arc<dyn TelemetrySink>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    accept_abort: parking_lot::Mutex<Option<AbortHandle>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl IngestionServer {
    pub fn new(config: HostConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        let registry = DeviceRegistry::new();
        let sessions = SessionSet::default();
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            sessions.clone(),
            sink.clone(),
            config.operator.clone(),
            config.auth.expire_sec,
        );
        Self {
            config,
            registry,
            sessions,
            dispatcher,
            sink,
            accept_task: tokio::sync::Mutex::new(None),
            accept_abort: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// The command surface handed to operator-facing collaborators.
    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    /// Bound address once started. Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn device_count(&self) -> usize {
        self.registry.device_count()
    }

    /// Bind the listener and spawn the accept loop. Idempotent: calling
    /// again while running is a no-op and never creates a second listener.
    pub async fn start(&self) -> Result<()> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() || self.accept_abort.lock().is_some() {
            info!("ingestion server already running");
            return Ok(());
        }

        let bind_to = (self.config.listen.host.as_str(), self.config.listen.port);
        let listener = TcpListener::bind(bind_to)
            .await
            .with_context(|| format!("failed to bind {}:{}", bind_to.0, bind_to.1))?;
        let addr = listener.local_addr().context("listener has no local address")?;
        *self.local_addr.lock() = Some(addr);
        info!("listening on {addr}");

        let task = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.sessions.clone(),
            self.dispatcher.clone(),
            self.sink.clone(),
        ));
        *self.accept_abort.lock() = Some(task.abort_handle());
        *accept_task = Some(task);
        Ok(())
    }

    /// Block until the accept loop ends. It only ends when the listener
    /// itself fails (the one unrecoverable condition, surfaced to the
    /// caller) or when [`shutdown`](Self::shutdown) cancels it.
    pub async fn wait(&self) -> Result<()> {
        let task = self.accept_task.lock().await.take();
        let Some(task) = task else {
            bail!("ingestion server is not running");
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(e).context("accept loop panicked"),
        }
    }

    /// Stop accepting, close every session, clear the registry.
    pub async fn shutdown(&self) {
        if let Some(abort) = self.accept_abort.lock().take() {
            abort.abort();
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        for (session, task) in self.sessions.drain() {
            if let Some(task) = task {
                task.abort();
            }
            session.close().await;
            self.registry.unregister_all(&session);
        }
        *self.local_addr.lock() = None;
        info!("ingestion server stopped");
    }
}

/// Accept connections forever, one session task per socket. Session errors
/// never reach this loop; an accept error ends it and is surfaced through
/// [`IngestionServer::wait`].
async fn accept_loop(
    listener: TcpListener,
    registry: DeviceRegistry,
    sessions: SessionSet,
    dispatcher: CommandDispatcher,
    sink: Arc<dyn TelemetrySink>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        info!("agent connected from {peer}");

        let (session, reader) = Session::new(stream, peer);
        sessions.insert(&session);

        let task = tokio::spawn({
            let session = session.clone();
            let registry = registry.clone();
            let sessions = sessions.clone();
            let dispatcher = dispatcher.clone();
            let sink = sink.clone();
            async move {
                // The challenge is delivered from the session's own task so
                // a stalled peer cannot hold up the accept loop.
                dispatcher.send_challenge(&session).await;
                run_session(session, reader, registry, sessions, sink).await;
            }
        });
        sessions.attach_task(session.id(), task);
    }
}
