//! Device registry: logical device identity -> currently-active session.
//!
//! At most one entry per identity; a reconnecting device supersedes its old
//! entry (last-writer-wins). Entries are weak references, the session set
//! keeps sessions alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::session::Session;

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<HashMap<String, Weak<Session>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a device identity to a session, overwriting any prior mapping.
    pub fn register(&self, device_id: &str, session: &Arc<Session>) {
        self.devices
            .lock()
            .insert(device_id.to_string(), Arc::downgrade(session));
    }

    /// Resolve a device identity to its live session. A dangling entry is
    /// pruned on the way out.
    pub fn lookup(&self, device_id: &str) -> Option<Arc<Session>> {
        let mut devices = self.devices.lock();
        if let Some(weak) = devices.get(device_id) {
            if let Some(session) = weak.upgrade() {
                return Some(session);
            }
            devices.remove(device_id);
        }
        None
    }

    /// Remove every mapping that points at the given session. Called at
    /// session teardown; a no-op for sessions that never identified.
    pub fn unregister_all(&self, session: &Arc<Session>) {
        let target = Arc::downgrade(session);
        self.devices.lock().retain(|_, candidate| !candidate.ptr_eq(&target));
    }

    /// Remove one identity, but only while it still points at the given
    /// session. Used when a session re-identifies, so a newer session's
    /// mapping is never clobbered.
    pub fn remove_if(&self, device_id: &str, session: &Arc<Session>) {
        let target = Arc::downgrade(session);
        let mut devices = self.devices.lock();
        if devices.get(device_id).is_some_and(|candidate| candidate.ptr_eq(&target)) {
            devices.remove(device_id);
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        // The client half may drop; the session owns the server half.
        drop(client.unwrap());
        let stream = accepted.unwrap().0;
        let peer = stream.peer_addr().unwrap();
        let (session, _reader) = Session::new(stream, peer);
        session
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let registry = DeviceRegistry::new();
        let first = test_session().await;
        let second = test_session().await;

        registry.register("Agent-02", &first);
        registry.register("Agent-02", &second);

        let resolved = registry.lookup("Agent-02").unwrap();
        assert_eq!(resolved.id(), second.id());
        assert_eq!(registry.device_count(), 1);
    }

    #[tokio::test]
    async fn unregister_all_only_touches_that_session() {
        let registry = DeviceRegistry::new();
        let doomed = test_session().await;
        let survivor = test_session().await;

        registry.register("Agent-01", &doomed);
        registry.register("Agent-03", &doomed);
        registry.register("Agent-02", &survivor);

        registry.unregister_all(&doomed);

        assert!(registry.lookup("Agent-01").is_none());
        assert!(registry.lookup("Agent-03").is_none());
        assert_eq!(registry.lookup("Agent-02").unwrap().id(), survivor.id());
    }

    #[tokio::test]
    async fn unregister_all_is_safe_for_unregistered_sessions() {
        let registry = DeviceRegistry::new();
        let never_registered = test_session().await;
        registry.unregister_all(&never_registered);
        assert_eq!(registry.device_count(), 0);
    }

    #[tokio::test]
    async fn lookup_prunes_dead_entries() {
        let registry = DeviceRegistry::new();
        {
            let session = test_session().await;
            registry.register("Agent-04", &session);
        }
        assert!(registry.lookup("Agent-04").is_none());
        assert_eq!(registry.device_count(), 0);
    }

    #[tokio::test]
    async fn remove_if_spares_a_newer_mapping() {
        let registry = DeviceRegistry::new();
        let old = test_session().await;
        let new = test_session().await;

        registry.register("Agent-05", &new);
        registry.remove_if("Agent-05", &old);

        assert_eq!(registry.lookup("Agent-05").unwrap().id(), new.id());
    }
}
