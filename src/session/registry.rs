//! # Session Registry
//!
//! The only place that knows which calls are live. The WebSocket layer talks to
//! sessions exclusively through it.
//!
//! ## Contract:
//! - `create(connection_id)` spawns a session task, or fails with `DuplicateConnection`
//!   or `SessionLimit`
//! - `get(connection_id)` returns the session's handle or `NotFound`
//! - `remove(connection_id)` cancels the silence timer and tells the task to stop;
//!   removing twice is a no-op
//!
//! ## Rust Concepts:
//! - **Arc<RwLock<HashMap>>**: Accept and close on different worker threads see one map
//! - **Short critical sections**: The lock is only held to insert, look up or take out a
//!   handle, never while talking to a session
//! - **Serial numbers**: A finished task removes its own entry only if the entry is still
//!   the one it was created for, so it cannot evict a newer session with the same id

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::monitor::EventReporter;
use crate::session::machine::{CallSession, FrameSink, SessionInput};
use crate::session::timer::SilenceTimer;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cheap, cloneable reference to a live session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection_id: String,
    serial: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
    timer: SilenceTimer,
}

impl SessionHandle {
    /// Queue one raw carrier frame. Frames are processed in the order they are queued.
    pub fn deliver(&self, raw: String) -> Result<(), SessionError> {
        self.inbox
            .send(SessionInput::Inbound(raw))
            .map_err(|_| SessionError::Closed(self.connection_id.clone()))
    }

    /// Cancel the silence timer and ask the task to stop.
    fn close(&self) {
        self.timer.cancel();
        // The task may already have exited on its own
        let _ = self.inbox.send(SessionInput::Close);
    }
}

/// All live call sessions, keyed by connection identity.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    reporter: Arc<dyn EventReporter>,
    next_serial: Arc<AtomicU64>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(reporter: Arc<dyn EventReporter>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            reporter,
            next_serial: Arc::new(AtomicU64::new(1)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session for a newly accepted connection.
    ///
    /// ## What happens:
    /// 1. Under the write lock: reject duplicates and enforce `max_concurrent_sessions`
    /// 2. Insert the handle, then spawn the session task
    /// 3. When the task finishes (stop event, send failure, close) it removes its own entry
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(
        &self,
        connection_id: &str,
        config: &SessionConfig,
        sink: Arc<dyn FrameSink>,
    ) -> Result<SessionHandle, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = SilenceTimer::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let handle = SessionHandle {
            connection_id: connection_id.to_string(),
            serial,
            inbox: tx.clone(),
            timer: timer.clone(),
        };

        {
            let mut sessions = self.write();
            if sessions.contains_key(connection_id) {
                warn!(connection_id, "Rejecting duplicate connection");
                return Err(SessionError::DuplicateConnection(connection_id.to_string()));
            }
            if sessions.len() >= config.max_concurrent_sessions {
                warn!(connection_id, limit = config.max_concurrent_sessions, "Session limit reached");
                return Err(SessionError::SessionLimit(config.max_concurrent_sessions));
            }
            sessions.insert(connection_id.to_string(), handle.clone());
        }

        let session = CallSession::new(
            connection_id.to_string(),
            config.clone(),
            timer,
            sink,
            self.reporter.clone(),
            tx.downgrade(),
        );
        drop(tx);

        let registry = self.clone();
        let id = connection_id.to_string();
        tokio::spawn(async move {
            session.run(rx).await;
            registry.forget(&id, serial);
        });

        info!(connection_id, active = self.len(), "📞 Session created");
        Ok(handle)
    }

    pub fn get(&self, connection_id: &str) -> Result<SessionHandle, SessionError> {
        self.read()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(connection_id.to_string()))
    }

    /// Tear a session down. Returns `false` if there was nothing to remove.
    pub fn remove(&self, connection_id: &str) -> bool {
        let removed = self.write().remove(connection_id);
        match removed {
            Some(handle) => {
                handle.close();
                info!(connection_id, active = self.len(), "📴 Session removed");
                true
            }
            None => {
                debug!(connection_id, "Session already removed");
                false
            }
        }
    }

    /// Route one raw text frame to the session that owns `connection_id`.
    pub fn dispatch(&self, connection_id: &str, raw: String) -> Result<(), SessionError> {
        self.get(connection_id)?.deliver(raw)
    }

    /// Drop the entry for a task that has finished, unless it was already replaced.
    fn forget(&self, connection_id: &str, serial: u64) {
        let mut sessions = self.write();
        if sessions.get(connection_id).is_some_and(|h| h.serial == serial) {
            if let Some(handle) = sessions.remove(connection_id) {
                handle.timer.cancel();
            }
            debug!(connection_id, "Finished session released");
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
