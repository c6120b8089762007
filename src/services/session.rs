//! Per-user session bookkeeping: cancellation signals, current script, the
//! synthesis tasks a session spawned and the temporary artifacts it owns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::error::PipelineError;
use crate::core::io::ArtifactHandle;
use crate::core::script::ScriptKey;
use crate::core::state::{SessionState, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Stop,
    Skip,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    current_script: Option<ScriptKey>,
    owned: HashSet<ArtifactHandle>,
}

#[derive(Debug)]
pub struct SessionHandle {
    user: UserId,
    stop: CancellationToken,
    skip: AtomicBool,
    tasks: TaskTracker,
    inner: Mutex<Session>,
}

impl SessionHandle {
    fn new(user: UserId) -> Self {
        Self {
            user,
            stop: CancellationToken::new(),
            skip: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            inner: Mutex::new(Session {
                state: SessionState::Negotiating,
                current_script: None,
                owned: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Synthesis jobs spawned for this session. Cleanup waits for them
    /// before removing the session folder.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Flags the script in progress for skipping and returns its key.
    pub fn request_skip(&self) -> Option<ScriptKey> {
        self.skip.store(true, Ordering::SeqCst);
        self.lock().current_script
    }

    pub fn is_skipping(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    pub fn reset_skip(&self) {
        self.skip.store(false, Ordering::SeqCst);
    }

    /// Pending cancellation, stop taking precedence over skip.
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.is_stopped() {
            Some(Interrupt::Stop)
        } else if self.is_skipping() {
            Some(Interrupt::Skip)
        } else {
            None
        }
    }

    pub fn set_current(&self, script: Option<ScriptKey>) {
        self.lock().current_script = script;
    }

    pub fn set_state(&self, state: SessionState) {
        let mut session = self.lock();
        if session.state != state {
            log::debug!("Session {}: {:?} -> {:?}", self.user, session.state, state);
            session.state = state;
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Registers a temporary artifact. Must happen before the artifact can
    /// be created.
    pub fn own(&self, handle: ArtifactHandle) {
        self.lock().owned.insert(handle);
    }

    pub fn disown(&self, handle: &str) -> bool {
        self.lock().owned.remove(handle)
    }

    pub fn take_owned(&self) -> Vec<ArtifactHandle> {
        let mut handles: Vec<_> = self.lock().owned.drain().collect();
        handles.sort();
        handles
    }
}

/// At most one live session per user.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails with `SessionBusy` while the user still has a live session.
    pub fn create(&self, user: &str) -> Result<Arc<SessionHandle>, PipelineError> {
        let mut sessions = self.lock();
        if sessions.contains_key(user) {
            return Err(PipelineError::SessionBusy(user.to_string()));
        }
        let handle = Arc::new(SessionHandle::new(user.to_string()));
        sessions.insert(user.to_string(), handle.clone());
        log::info!("Session created for {}", user);
        Ok(handle)
    }

    pub fn get(&self, user: &str) -> Option<Arc<SessionHandle>> {
        self.lock().get(user).cloned()
    }

    /// Removes `handle` if it is still the user's registered session.
    pub fn remove(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.lock();
        match sessions.get(handle.user()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(handle.user());
                log::info!("Session closed for {}", handle.user());
                true
            }
            _ => false,
        }
    }

    pub fn signal_stop(&self, user: &str) -> Result<(), PipelineError> {
        let handle = self
            .get(user)
            .ok_or_else(|| PipelineError::NoActiveSession(user.to_string()))?;
        log::info!("Stop requested by {}", user);
        handle.request_stop();
        Ok(())
    }

    pub fn signal_skip(&self, user: &str) -> Result<Option<ScriptKey>, PipelineError> {
        let handle = self
            .get(user)
            .ok_or_else(|| PipelineError::NoActiveSession(user.to_string()))?;
        let current = handle.request_skip();
        log::info!("Skip requested by {} (script {:?})", user, current);
        Ok(current)
    }
}
