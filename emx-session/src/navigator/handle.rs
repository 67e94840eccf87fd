//! Session actors
//!
//! Each live session runs as one task that owns its [`FlowNavigator`].
//! Callers send commands over an mpsc channel and await a oneshot reply, so
//! a session's state is only ever touched by its own task. An actor stops
//! once its session is DONE or failed to sequence; the registry drops the
//! closed handle the next time the key is looked up.

use super::{FlowNavigator, NavigationOutcome, SessionServices, SessionView, SubmitOutcome};
use crate::aggregator::DeviceClass;
use crate::error::{Error, Result};
use crate::session::{FlowPhase, SessionKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Login { credential: String, reply: Reply<SessionView> },
    View { reply: Reply<SessionView> },
    Submit { answer: Value, metadata: Option<Value>, reply: Reply<(SubmitOutcome, SessionView)> },
    Navigate { index: usize, reply: Reply<NavigationOutcome> },
    AppendRecording { step_id: String, samples: Vec<Value>, reply: Reply<usize> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable address of a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Spawn the actor and run LOADING with the given credential
    pub async fn spawn(
        key: SessionKey,
        credential: Option<String>,
        device: DeviceClass,
        services: Arc<SessionServices>,
    ) -> (Self, JoinHandle<()>, Result<()>) {
        let mut navigator = FlowNavigator::new(key.clone(), device, Arc::clone(&services));
        let loaded = navigator.load(credential.as_deref()).await;

        let (tx, rx) = mpsc::channel(services.settings.session_command_buffer);
        let interval = services.settings.snapshot_interval;
        let task = tokio::spawn(run(navigator, rx, interval));

        (Self { key, tx }, task, loaded)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::NotFound(format!("session {} is not running", self.key)))?;
        rx.await
            .map_err(|_| Error::NotFound(format!("session {} stopped before replying", self.key)))?
    }

    pub async fn login(&self, credential: String) -> Result<SessionView> {
        self.request(|reply| SessionCommand::Login { credential, reply }).await
    }

    pub async fn view(&self) -> Result<SessionView> {
        self.request(|reply| SessionCommand::View { reply }).await
    }

    /// Submit the current step's answer; returns the session as left by it
    pub async fn submit(&self, answer: Value, metadata: Option<Value>) -> Result<(SubmitOutcome, SessionView)> {
        self.request(|reply| SessionCommand::Submit { answer, metadata, reply })
            .await
    }

    pub async fn navigate(&self, index: usize) -> Result<NavigationOutcome> {
        self.request(|reply| SessionCommand::Navigate { index, reply }).await
    }

    pub async fn append_recording(&self, step_id: String, samples: Vec<Value>) -> Result<usize> {
        self.request(|reply| SessionCommand::AppendRecording { step_id, samples, reply })
            .await
    }

    /// Stop the actor after a final snapshot
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run(
    mut navigator: FlowNavigator,
    mut rx: mpsc::Receiver<SessionCommand>,
    snapshot_interval: std::time::Duration,
) {
    let key = navigator.key().clone();
    let mut ticker = tokio::time::interval(snapshot_interval);
    ticker.tick().await;
    if matches!(navigator.phase(), FlowPhase::Error { .. }) {
        debug!(session = %key, "Session failed to load, actor not kept");
        return;
    }
    debug!(session = %key, "Session actor started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    // Every handle dropped
                    navigator.shutdown().await;
                    break;
                };
                match command {
                    SessionCommand::Login { credential, reply } => {
                        let result = navigator.login(&credential).await.map(|_| navigator.view());
                        let _ = reply.send(result);
                    }
                    SessionCommand::View { reply } => {
                        let _ = reply.send(Ok(navigator.view()));
                    }
                    SessionCommand::Submit { answer, metadata, reply } => {
                        let result = navigator
                            .submit_answer(answer, metadata)
                            .await
                            .map(|outcome| (outcome, navigator.view()));
                        let finished = matches!(result, Ok((SubmitOutcome::Completed { .. }, _)));
                        if finished {
                            // Handles report closed before the caller sees the reply
                            rx.close();
                        }
                        let _ = reply.send(result);
                        if finished {
                            navigator.shutdown().await;
                            info!(session = %key, "Session finished, actor released");
                            break;
                        }
                    }
                    SessionCommand::Navigate { index, reply } => {
                        let _ = reply.send(navigator.navigate_to(index).await);
                    }
                    SessionCommand::AppendRecording { step_id, samples, reply } => {
                        let _ = reply.send(navigator.append_recording(&step_id, samples).await);
                    }
                    SessionCommand::Shutdown { reply } => {
                        navigator.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if matches!(navigator.phase(), FlowPhase::InProgress { .. }) {
                    navigator.persist().await;
                }
            }
        }
    }

    debug!(session = %key, "Session actor stopped");
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

/// Registry of live session actors, one per (study, participant)
pub struct SessionManager {
    services: Arc<SessionServices>,
    sessions: std::sync::Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionManager {
    pub fn new(services: Arc<SessionServices>) -> Self {
        Self {
            services,
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<SessionServices> {
        &self.services
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(sessions.entry(key.clone()).or_default())
    }

    /// Whether `slot` is still the registered slot for `key`
    fn is_registered(&self, key: &SessionKey, slot: &Slot) -> bool {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(key).is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Forget `slot`; callers hold its lock, so waiters on it see it unregistered
    fn unregister(&self, key: &SessionKey, slot: &Slot) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            sessions.remove(key);
        }
    }

    /// Number of registry entries, live or not yet reaped
    pub fn registered(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Start the session, or return the running one
    ///
    /// A session that ended in the error phase is replaced by a fresh actor.
    /// A finished session is resumed only to report its final view.
    pub async fn start(
        &self,
        key: SessionKey,
        credential: Option<String>,
        device: DeviceClass,
    ) -> Result<SessionView> {
        let (slot, mut guard) = loop {
            let slot = self.slot(&key);
            let guard = Arc::clone(&slot).lock_owned().await;
            // Reaped while we waited; take the fresh slot instead
            if self.is_registered(&key, &slot) {
                break (slot, guard);
            }
        };

        if let Some(existing) = guard.as_ref().filter(|h| !h.is_closed()) {
            let view = existing.view().await?;
            if view.phase == FlowPhase::Login {
                if let Some(credential) = credential.filter(|c| !c.trim().is_empty()) {
                    return existing.login(credential).await;
                }
                return Ok(view);
            }
            if !matches!(view.phase, FlowPhase::Error { .. }) {
                debug!(session = %key, "Session already running");
                return Ok(view);
            }
            info!(session = %key, "Restarting failed session");
            existing.shutdown().await;
        }

        let (handle, _task, loaded) =
            SessionHandle::spawn(key.clone(), credential, device, Arc::clone(&self.services)).await;

        if let Err(e) = loaded {
            *guard = None;
            self.unregister(&key, &slot);
            warn!(session = %key, error = %e, "Session could not be sequenced");
            return Err(e);
        }

        let view = handle.view().await?;
        if view.phase == FlowPhase::Done {
            handle.shutdown().await;
            *guard = None;
            self.unregister(&key, &slot);
            debug!(session = %key, "Session already finished");
            return Ok(view);
        }

        *guard = Some(handle);
        info!(session = %key, "Session started");
        Ok(view)
    }

    /// Handle for a running session
    pub async fn get(&self, key: &SessionKey) -> Result<SessionHandle> {
        let slot = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.get(key).cloned()
        };
        let Some(slot) = slot else {
            return Err(Error::NotFound(format!("session {}", key)));
        };
        let mut guard = slot.lock().await;
        match guard.as_ref().filter(|h| !h.is_closed()) {
            Some(handle) => Ok(handle.clone()),
            None => {
                *guard = None;
                self.unregister(key, &slot);
                debug!(session = %key, "Reaped closed session");
                Err(Error::NotFound(format!("session {}", key)))
            }
        }
    }

    /// Stop and forget a session, e.g. after its ledger data was deleted
    pub async fn remove(&self, key: &SessionKey) {
        let slot = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.remove(key)
        };
        if let Some(slot) = slot {
            if let Some(handle) = slot.lock().await.take() {
                handle.shutdown().await;
            }
        }
    }

    /// Snapshot and stop every session; called on server shutdown
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.values().cloned().collect()
        };
        let count = slots.len();
        for slot in slots {
            if let Some(handle) = slot.lock().await.take() {
                handle.shutdown().await;
            }
        }
        info!(sessions = count, "All sessions stopped");
    }
}
