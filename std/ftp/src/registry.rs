//! Registry of live sessions keyed by opaque handles.
//!
//! The registry map is guarded by a plain mutex that is never held across
//! I/O. Each session sits behind its own async mutex; protocol calls run on
//! the blocking pool with that lock held, so calls on one handle are
//! serialized while different handles proceed independently.

use crate::config::BusyPolicy;
use crate::endpoint::TransferControl;
use crate::error::{ToolError, ToolResult};
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinError;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) fn worker_failed(err: JoinError) -> ToolError {
    ToolError::Protocol(format!("session worker failed: {err}"))
}

/// Public description of a registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub connected_at: DateTime<Utc>,
}

pub struct SessionSlot {
    info: SessionInfo,
    session: Arc<AsyncMutex<Session>>,
    transfer: Arc<TransferControl>,
}

impl SessionSlot {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn transfer(&self) -> &TransferControl {
        &self.transfer
    }
}

impl fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSlot")
            .field("info", &self.info)
            .field("transfer_active", &self.transfer.is_active())
            .finish_non_exhaustive()
    }
}

pub struct Registry {
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
    policy: BusyPolicy,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Registry {
    pub fn new(policy: BusyPolicy) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an authenticated session under a fresh handle.
    pub fn create(&self, session: Session) -> String {
        let mut slots = self.slots();
        let handle = loop {
            let candidate = Uuid::new_v4().to_string();
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        let info = SessionInfo {
            session_id: handle.clone(),
            host: session.host().to_string(),
            port: session.port(),
            user: session.user().to_string(),
            connected_at: Utc::now(),
        };
        info!(
            session_id = %handle,
            host = %info.host,
            port = info.port,
            user = %info.user,
            "session registered"
        );
        slots.insert(
            handle.clone(),
            Arc::new(SessionSlot {
                info,
                session: Arc::new(AsyncMutex::new(session)),
                transfer: Arc::new(TransferControl::default()),
            }),
        );
        handle
    }

    pub fn resolve(&self, handle: &str) -> ToolResult<Arc<SessionSlot>> {
        self.slots()
            .get(handle)
            .cloned()
            .ok_or_else(|| ToolError::SessionNotFound(handle.to_string()))
    }

    /// Unregister `handle`. Absent handles are ignored.
    pub fn remove(&self, handle: &str) -> Option<Arc<SessionSlot>> {
        self.slots().remove(handle)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    /// Registered sessions, oldest first.
    pub fn summaries(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.slots().values().map(|s| s.info.clone()).collect();
        infos.sort_by_key(|i| i.connected_at);
        infos
    }

    fn is_current(&self, handle: &str, slot: &Arc<SessionSlot>) -> bool {
        self.slots()
            .get(handle)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    // Remove only if `handle` still maps to `slot`.
    fn evict(&self, handle: &str, slot: &Arc<SessionSlot>) {
        let mut slots = self.slots();
        if slots.get(handle).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(handle);
            warn!(session_id = %handle, host = %slot.info.host, "connection lost, session evicted");
        }
    }

    async fn acquire(
        &self,
        handle: &str,
    ) -> ToolResult<(Arc<SessionSlot>, OwnedMutexGuard<Session>)> {
        let slot = self.resolve(handle)?;
        let guard = match self.policy {
            BusyPolicy::Queue => slot.session.clone().lock_owned().await,
            BusyPolicy::Reject => slot
                .session
                .clone()
                .try_lock_owned()
                .map_err(|_| ToolError::SessionBusy(handle.to_string()))?,
        };
        // The session may have been disconnected while we waited.
        if !self.is_current(handle, &slot) {
            return Err(ToolError::SessionNotFound(handle.to_string()));
        }
        Ok((slot, guard))
    }

    /// Run `op` against the session on the blocking pool.
    ///
    /// Sessions that lose their control connection during `op` are evicted.
    pub async fn run<T, F>(&self, handle: &str, op: F) -> ToolResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session, &TransferControl) -> ToolResult<T> + Send + 'static,
    {
        let (slot, guard) = self.acquire(handle).await?;
        let transfer = Arc::clone(&slot.transfer);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = op(&mut *guard, &*transfer);
            let connected = guard.is_connected();
            (connected, result)
        })
        .await;
        let (connected, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                self.evict(handle, &slot);
                return Err(worker_failed(err));
            }
        };
        if !connected {
            self.evict(handle, &slot);
        }
        result
    }

    /// Request cancellation of the transfer running on `handle`.
    pub fn abort_transfer(&self, handle: &str) -> ToolResult<()> {
        let slot = self.resolve(handle)?;
        if !slot.transfer.request_abort() {
            return Err(ToolError::NoActiveTransfer(handle.to_string()));
        }
        info!(session_id = %handle, "transfer abort requested");
        Ok(())
    }

    /// Unregister `handle` and close its connection once any running call
    /// finishes. Returns whether the handle was registered.
    pub async fn disconnect(&self, handle: &str) -> bool {
        let Some(slot) = self.remove(handle) else {
            return false;
        };
        Self::close(handle, slot).await;
        true
    }

    /// Close every session; used at shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<SessionSlot>)> = self.slots().drain().collect();
        for (handle, slot) in drained {
            Self::close(&handle, slot).await;
        }
    }

    async fn close(handle: &str, slot: Arc<SessionSlot>) {
        let guard = slot.session.clone().lock_owned().await;
        let quit = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            if guard.is_connected() {
                guard.quit()
            } else {
                Ok(())
            }
        })
        .await;
        match quit {
            Ok(Ok(())) => info!(session_id = %handle, "session closed"),
            Ok(Err(err)) => {
                warn!(session_id = %handle, error = %err, "QUIT failed, connection dropped")
            }
            Err(err) => warn!(session_id = %handle, error = %err, "close task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BusyPolicy;
    use crate::error::{ErrorKind, ToolError};
    use crate::listing::ListMode;
    use crate::memory::{MemoryConnector, MemoryFs, params};
    use crate::registry::Registry;
    use crate::session::Session;
    use std::collections::HashSet;

    fn open(fs: &MemoryFs) -> Session {
        Session::open(&MemoryConnector::new(fs.clone()), &params(), true).unwrap()
    }

    #[tokio::test]
    async fn handles_are_unique() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        let handles: HashSet<String> = (0..20).map(|_| registry.create(open(&fs))).collect();
        assert_eq!(handles.len(), 20);
        assert_eq!(registry.len(), 20);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        let handle = registry.create(open(&fs));
        assert!(registry.disconnect(&handle).await);
        assert!(!registry.disconnect(&handle).await);
        let err = registry.resolve(&handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lost_connection_evicts_session() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        let handle = registry.create(open(&fs));
        fs.set_broken(true);
        let err = registry
            .run(&handle, |s, _| s.list(None, ListMode::Default))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectivityError);
        let err = registry
            .run(&handle, |s, _| s.list(None, ListMode::Default))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn ordinary_errors_keep_session() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        let handle = registry.create(open(&fs));
        let err = registry
            .run(&handle, |s, _| s.size("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathNotFound(_)));
        assert!(registry.resolve(&handle).is_ok());
    }

    #[tokio::test]
    async fn abort_without_transfer_fails() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        let handle = registry.create(open(&fs));
        let err = registry.abort_transfer(&handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveTransferError);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let fs = MemoryFs::new();
        let registry = Registry::new(BusyPolicy::Queue);
        registry.create(open(&fs));
        registry.create(open(&fs));
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(registry.summaries().is_empty());
    }
}
