//! Command dispatch: auth challenges on connect, targeted shutdown by device
//! identity, broadcast shutdown to every live session.
//!
//! Delivery is fire-and-forget; there is no acknowledgement protocol, so the
//! dispatcher can only report what it attempted, never what an agent acted
//! on.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;
use crate::session::{Session, SessionSet};
use crate::sink::{AuditEntry, TelemetrySink};
use crate::wire::CommandFrame;

const SHUTDOWN_COMMAND: &str = "SHUTDOWN";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No live session for that identity, or the send itself failed because
    /// the peer was already gone. Callers treat both the same way.
    #[error("device {0} is not connected")]
    DeviceNotConnected(String),
}

/// One-time auth code generator. One RNG instance for the whole process,
/// serialized behind a lock.
#[derive(Clone)]
pub struct CodeGenerator {
    rng: Arc<Mutex<StdRng>>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self { rng: Arc::new(Mutex::new(StdRng::from_entropy())) }
    }

    /// Uniform 6-digit numeric code.
    pub fn issue(&self) -> String {
        self.rng.lock().gen_range(100_000..=999_999).to_string()
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends command frames to sessions, resolving targets through the device
/// registry, and records an audit entry for every dispatched command.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: DeviceRegistry,
    sessions: SessionSet,
    sink: Arc<dyn TelemetrySink>,
    codes: CodeGenerator,
    operator: String,
    auth_expire_sec: u32,
}

impl CommandDispatcher {
    pub fn new(
        registry: DeviceRegistry,
        sessions: SessionSet,
        sink: Arc<dyn TelemetrySink>,
        operator: String,
        auth_expire_sec: u32,
    ) -> Self {
        Self {
            registry,
            sessions,
            sink,
            codes: CodeGenerator::new(),
            operator,
            auth_expire_sec,
        }
    }

    /// Deliver a fresh one-time code to a newly accepted session. The code
    /// is advisory: nothing verifies it against any later client action.
    pub async fn send_challenge(&self, session: &Arc<Session>) {
        let frame = CommandFrame::AuthChallenge {
            code: self.codes.issue(),
            expire_sec: self.auth_expire_sec,
        };
        if session.send(&frame).await.is_err() {
            debug!("auth challenge not delivered to {}", session.peer());
        }
    }

    /// Send a shutdown to exactly one identified device.
    pub async fn send_targeted(&self, device_id: &str) -> Result<(), DispatchError> {
        let session = self
            .registry
            .lookup(device_id)
            .filter(|session| session.is_open())
            .ok_or_else(|| DispatchError::DeviceNotConnected(device_id.to_string()))?;

        session
            .send(&CommandFrame::Shutdown)
            .await
            .map_err(|_| DispatchError::DeviceNotConnected(device_id.to_string()))?;

        self.sink
            .submit_audit(AuditEntry::new(&self.operator, Some(device_id), SHUTDOWN_COMMAND, None));
        info!("sent shutdown to {device_id}");
        Ok(())
    }

    /// Send a shutdown to every live session, identified or not. Each send
    /// runs as its own task so one slow peer cannot starve the rest.
    /// Returns the number of sessions attempted, not how many succeeded.
    pub async fn broadcast(&self) -> usize {
        let snapshot = self.sessions.snapshot();
        let attempted = snapshot.len();

        for session in snapshot {
            tokio::spawn(async move {
                if session.send(&CommandFrame::Shutdown).await.is_err() {
                    warn!("shutdown not delivered to {}", session.peer());
                }
            });
        }

        if attempted > 0 {
            self.sink
                .submit_audit(AuditEntry::new(&self.operator, None, SHUTDOWN_COMMAND, None));
        }
        info!("broadcast shutdown to {attempted} sessions");
        attempted
    }
}
