//! Flow Navigator
//!
//! The per-session state machine:
//! `LOADING -> LOGIN | SEQUENCING -> IN_PROGRESS(i) -> DONE`, with `ERROR`
//! when no usable sequence can be built. A navigator owns its
//! `SessionState` exclusively; other tasks reach it through
//! [`handle::SessionHandle`].

pub mod handle;
pub mod progress;

pub use handle::{SessionHandle, SessionManager};
pub use progress::Progress;

use crate::admission::{Admission, AdmissionController, SqliteQuotaProvider};
use crate::aggregator::{DbStepSource, DeviceClass, ModuleConfigAggregator, StepSource};
use crate::cache::{LocalCache, RecordingBuffer, SessionSnapshot};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::ledger::{reconcile, should_record, ResponseLedger, ResponseRecord, SqliteDocumentStore};
use crate::session::{FlowPhase, SessionKey, SessionState};
use crate::state::SharedState;
use crate::steps::StepDescriptor;
use chrono::{DateTime, Utc};
use emx_common::events::SessionEvent;
use emx_common::time::elapsed_ms;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a navigator talks to
#[derive(Clone)]
pub struct SessionServices {
    pub aggregator: Arc<ModuleConfigAggregator>,
    pub ledger: ResponseLedger,
    pub cache: Arc<LocalCache>,
    pub admission: Arc<AdmissionController>,
    pub state: Arc<SharedState>,
    pub settings: RuntimeSettings,
}

impl SessionServices {
    /// Wire every collaborator over one database and cache directory
    ///
    /// `remote_sources` are consulted before the local module tables, so a
    /// remote config for a kind wins over a local one.
    pub fn new(
        db: Pool<Sqlite>,
        cache_dir: impl Into<PathBuf>,
        settings: RuntimeSettings,
        remote_sources: Vec<Arc<dyn StepSource>>,
    ) -> Self {
        let state = Arc::new(SharedState::new(settings.event_channel_capacity));

        let mut sources = remote_sources;
        sources.extend(DbStepSource::all(&db));
        let aggregator = Arc::new(ModuleConfigAggregator::new(
            sources,
            settings.source_fetch_timeout,
            Arc::clone(&state),
        ));

        let ledger = ResponseLedger::new(
            Arc::new(SqliteDocumentStore::new(db.clone())),
            settings.ledger_max_write_attempts,
            settings.ledger_retry_backoff,
        );
        let admission = Arc::new(AdmissionController::new(
            db.clone(),
            Arc::new(SqliteQuotaProvider::new(db)),
            Arc::new(ledger.clone()),
            Arc::clone(&state),
        ));

        Self {
            aggregator,
            ledger,
            cache: Arc::new(LocalCache::new(cache_dir.into())),
            admission,
            state,
            settings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotVisited,
    OutOfRange,
    NotInProgress,
}

/// Result of a navigation request; a denial is a no-op, not an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NavigationOutcome {
    Moved { index: usize },
    Denied { requested: usize, reason: DenyReason },
}

impl NavigationOutcome {
    pub fn moved(&self) -> bool {
        matches!(self, NavigationOutcome::Moved { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Advanced {
        index: usize,
    },
    Completed {
        completed_at: DateTime<Utc>,
        /// Absent when admission failed; the client retries it separately
        admission: Option<Admission>,
    },
}

/// What the presentation layer sees of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub study_id: String,
    pub participant_id: String,
    #[serde(flatten)]
    pub phase: FlowPhase,
    pub current_step: Option<StepDescriptor>,
    pub current_index: usize,
    pub max_visited_index: usize,
    pub step_count: usize,
    pub progress: Progress,
    pub degraded: bool,
    pub reentry_count: u32,
    pub answered_steps: Vec<String>,
}

pub struct FlowNavigator {
    state: SessionState,
    answers: BTreeMap<String, ResponseRecord>,
    reentry_count: u32,
    device: DeviceClass,
    recording: Option<RecordingBuffer>,
    services: Arc<SessionServices>,
}

impl FlowNavigator {
    pub fn new(key: SessionKey, device: DeviceClass, services: Arc<SessionServices>) -> Self {
        Self {
            state: SessionState::loading(key),
            answers: BTreeMap::new(),
            reentry_count: 0,
            device,
            recording: None,
            services,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.state.key
    }

    pub fn phase(&self) -> &FlowPhase {
        &self.state.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn answers(&self) -> &BTreeMap<String, ResponseRecord> {
        &self.answers
    }

    /// Leave LOADING: to LOGIN without a credential, otherwise build the sequence
    pub async fn load(&mut self, credential: Option<&str>) -> Result<()> {
        if self.state.phase != FlowPhase::Loading {
            return Err(Error::InvalidState(format!("cannot load from {:?}", self.state.phase)));
        }

        match credential.map(str::trim).filter(|c| !c.is_empty()) {
            None => {
                debug!(session = %self.state.key, "No session credential, waiting for login");
                self.state.phase = FlowPhase::Login;
                Ok(())
            }
            Some(_) => {
                self.state.phase = FlowPhase::Sequencing;
                self.sequence().await
            }
        }
    }

    /// LOGIN -> SEQUENCING with the supplied credential
    pub async fn login(&mut self, credential: &str) -> Result<()> {
        if self.state.phase != FlowPhase::Login {
            return Err(Error::InvalidState(format!("cannot log in from {:?}", self.state.phase)));
        }
        if credential.trim().is_empty() {
            return Err(Error::BadRequest("credential must not be empty".to_string()));
        }

        self.state.phase = FlowPhase::Sequencing;
        self.sequence().await
    }

    /// Resume from the cached snapshot, or aggregate a fresh sequence
    async fn sequence(&mut self) -> Result<()> {
        let key = self.state.key.clone();

        let durable = match self.services.ledger.find(&key.study_id, &key.participant_id).await {
            Ok(doc) => doc.map(|d| d.responses).unwrap_or_default(),
            Err(e) => {
                warn!(session = %key, error = %e, "Ledger unavailable on load, using local cache only");
                Vec::new()
            }
        };

        let cached = match self.services.cache.load(&key).await {
            Ok(snapshot) => snapshot.filter(|s| {
                s.state.steps.len() >= 2
                    && matches!(s.state.phase, FlowPhase::InProgress { .. } | FlowPhase::Done)
            }),
            Err(e) => {
                warn!(session = %key, error = %e, "Could not read session snapshot");
                None
            }
        };

        let resumed = cached.is_some();
        match cached {
            Some(snapshot) => {
                self.reentry_count = snapshot.reentry_count + 1;
                self.answers = reconcile(&durable, &snapshot.responses);
                self.state = snapshot.state;
                self.state.step_entered_at = Utc::now();
                info!(
                    session = %key,
                    current_index = self.state.current_index,
                    reentry_count = self.reentry_count,
                    "Session resumed from snapshot"
                );
            }
            None => match self.services.aggregator.aggregate(&key.study_id, self.device).await {
                Ok(sequence) => {
                    self.state = SessionState::new(key.clone(), sequence.steps, sequence.degraded);
                    self.answers = reconcile(&durable, &BTreeMap::new());
                }
                Err(e) => {
                    self.fail(e.to_string());
                    return Err(e);
                }
            },
        }

        self.services.state.broadcast_event(SessionEvent::SessionStarted {
            study_id: key.study_id.clone(),
            participant_id: key.participant_id.clone(),
            step_count: self.state.steps.len(),
            degraded: self.state.degraded,
            resumed,
            timestamp: Utc::now(),
        });

        self.persist().await;
        self.enter_step().await;
        Ok(())
    }

    fn fail(&mut self, reason: String) {
        error!(session = %self.state.key, reason = %reason, "Session failed");
        self.state.phase = FlowPhase::Error { reason: reason.clone() };
        self.services.state.broadcast_event(SessionEvent::SessionFailed {
            study_id: self.state.key.study_id.clone(),
            participant_id: self.state.key.participant_id.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Current step while IN_PROGRESS
    pub fn current_step(&self) -> Option<&StepDescriptor> {
        match self.state.phase {
            FlowPhase::InProgress { .. } => self.state.current_step(),
            _ => None,
        }
    }

    pub fn progress(&self) -> Progress {
        progress::compute(
            self.state.steps.len(),
            self.state.current_index,
            self.state.phase == FlowPhase::Done,
        )
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            study_id: self.state.key.study_id.clone(),
            participant_id: self.state.key.participant_id.clone(),
            phase: self.state.phase.clone(),
            current_step: self.current_step().cloned(),
            current_index: self.state.current_index,
            max_visited_index: self.state.max_visited_index,
            step_count: self.state.steps.len(),
            progress: self.progress(),
            degraded: self.state.degraded,
            reentry_count: self.reentry_count,
            answered_steps: self.answers.keys().cloned().collect(),
        }
    }

    /// Complete the current step with `answer` and move on
    ///
    /// The answer is written through the ledger before the state changes; a
    /// failed write leaves the participant on the same step.
    pub async fn submit_answer(&mut self, answer: Value, metadata: Option<Value>) -> Result<SubmitOutcome> {
        let FlowPhase::InProgress { index } = self.state.phase else {
            return Err(Error::InvalidState(format!(
                "cannot submit an answer in {:?}",
                self.state.phase
            )));
        };
        let step = self.state.steps[index].clone();
        let key = self.state.key.clone();
        let now = Utc::now();

        let mut meta = match metadata {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("client".to_string(), other);
                map
            }
            None => Map::new(),
        };
        meta.insert("duration_ms".to_string(), json!(elapsed_ms(&self.state.step_entered_at, &now)));
        // The recording is stored with the answer; the partial is dropped only after this write
        if let Some(buffer) = self.recording.as_ref().filter(|b| b.step_id() == step.id) {
            let samples = buffer.samples().await;
            meta.insert("recorded_samples".to_string(), json!(samples.len()));
            meta.insert("samples".to_string(), Value::Array(samples));
        }

        let record = ResponseRecord::new(&step.id, step.kind, &step.display_name, answer, now)
            .with_metadata(Some(Value::Object(meta)));

        self.services
            .ledger
            .record(&key.study_id, &key.participant_id, record.clone())
            .await?;

        if should_record(record.kind, &record.value) {
            match self.answers.get_mut(&step.id) {
                Some(existing) => {
                    existing.value = record.value;
                    existing.metadata = record.metadata;
                    existing.updated_at = existing.updated_at.max(record.updated_at);
                }
                None => {
                    self.answers.insert(step.id.clone(), record);
                }
            }
        }

        if self.state.is_last(index) {
            // On a failed completion the participant stays here, recording intact
            let outcome = self.complete().await?;
            self.leave_step().await;
            Ok(outcome)
        } else {
            self.leave_step().await;
            self.move_to(index + 1).await;
            Ok(SubmitOutcome::Advanced { index: index + 1 })
        }
    }

    /// Jump to step `index` if it was visited or answered; otherwise a no-op
    pub async fn navigate_to(&mut self, index: usize) -> Result<NavigationOutcome> {
        let FlowPhase::InProgress { index: current } = self.state.phase else {
            return Ok(NavigationOutcome::Denied {
                requested: index,
                reason: DenyReason::NotInProgress,
            });
        };

        let Some(target) = self.state.steps.get(index) else {
            return Ok(self.deny(index, DenyReason::OutOfRange));
        };

        let allowed = index <= self.state.max_visited_index || self.answers.contains_key(&target.id);
        if !allowed {
            return Ok(self.deny(index, DenyReason::NotVisited));
        }

        if index != current {
            self.leave_step().await;
            self.move_to(index).await;
        }
        Ok(NavigationOutcome::Moved { index })
    }

    fn deny(&self, requested: usize, reason: DenyReason) -> NavigationOutcome {
        debug!(
            session = %self.state.key,
            requested,
            max_visited_index = self.state.max_visited_index,
            ?reason,
            "Navigation denied"
        );
        self.services.state.broadcast_event(SessionEvent::NavigationDenied {
            study_id: self.state.key.study_id.clone(),
            participant_id: self.state.key.participant_id.clone(),
            requested_index: requested,
            max_visited_index: self.state.max_visited_index,
            timestamp: Utc::now(),
        });
        NavigationOutcome::Denied { requested, reason }
    }

    /// Add samples to the current timed step's buffer
    pub async fn append_recording(&mut self, step_id: &str, samples: Vec<Value>) -> Result<usize> {
        match &self.recording {
            Some(buffer) if buffer.step_id() == step_id => Ok(buffer.append(samples).await),
            _ => Err(Error::BadRequest(format!("step {} is not recording", step_id))),
        }
    }

    async fn move_to(&mut self, to: usize) {
        let from = self.state.current_index;
        self.state.current_index = to;
        self.state.max_visited_index = self.state.max_visited_index.max(to);
        self.state.phase = FlowPhase::InProgress { index: to };
        self.state.step_entered_at = Utc::now();

        self.services.state.broadcast_event(SessionEvent::StepAdvanced {
            study_id: self.state.key.study_id.clone(),
            participant_id: self.state.key.participant_id.clone(),
            from_index: from,
            to_index: to,
            timestamp: Utc::now(),
        });

        self.persist().await;
        self.enter_step().await;
    }

    async fn complete(&mut self) -> Result<SubmitOutcome> {
        let key = self.state.key.clone();

        // Durable completion first; admission may be retried later
        let completed_at = self
            .services
            .ledger
            .mark_completed(&key.study_id, &key.participant_id, Utc::now())
            .await?;

        self.state.phase = FlowPhase::Done;
        self.state.ended_at = Some(completed_at);
        info!(
            session = %key,
            elapsed_ms = elapsed_ms(&self.state.started_at, &completed_at),
            "Session completed"
        );

        self.services.state.broadcast_event(SessionEvent::SessionCompleted {
            study_id: key.study_id.clone(),
            participant_id: key.participant_id.clone(),
            completed_at,
            timestamp: Utc::now(),
        });
        self.persist().await;

        let admission = match self
            .services
            .admission
            .admit(&key.study_id, &key.participant_id, completed_at)
            .await
        {
            Ok(admission) => Some(admission),
            Err(e) => {
                warn!(session = %key, error = %e, "Admission failed, client may retry");
                None
            }
        };

        Ok(SubmitOutcome::Completed {
            completed_at,
            admission,
        })
    }

    /// Start the step's recording buffer when it is a timed step
    async fn enter_step(&mut self) {
        let Some(step) = self.current_step() else {
            return;
        };
        if !step.kind.is_timed() {
            return;
        }
        let step_id = step.id.clone();

        let initial = match self.services.cache.load_partial(&self.state.key, &step_id).await {
            Ok(partial) => partial.map(|p| p.samples).unwrap_or_default(),
            Err(e) => {
                warn!(session = %self.state.key, step_id = %step_id, error = %e, "Could not restore partial buffer");
                Vec::new()
            }
        };

        self.recording = Some(RecordingBuffer::start(
            Arc::clone(&self.services.cache),
            self.state.key.clone(),
            step_id,
            initial,
            self.services.settings.recording_flush_interval,
        ));
    }

    /// Stop the step's recording; no flush can happen after this returns
    async fn leave_step(&mut self) {
        if let Some(buffer) = self.recording.take() {
            let step_id = buffer.step_id().to_string();
            let samples = buffer.stop().await;
            let result = if self.answers.contains_key(&step_id) {
                self.services.cache.clear_partial(&self.state.key, &step_id).await
            } else if samples.is_empty() {
                Ok(())
            } else {
                // Left without answering: keep what was captured for a revisit
                self.services
                    .cache
                    .save_partial(&self.state.key, &step_id, samples)
                    .await
                    .map(|_| ())
            };
            if let Err(e) = result {
                warn!(session = %self.state.key, step_id = %step_id, error = %e, "Could not update partial buffer");
            }
        }
    }

    /// Snapshot the session into the local cache
    ///
    /// Cache failures are logged, never surfaced: the ledger stays authoritative.
    pub async fn persist(&self) {
        if self.state.steps.is_empty() {
            return;
        }
        let snapshot = SessionSnapshot::new(self.state.clone(), self.answers.clone(), self.reentry_count);
        if let Err(e) = self.services.cache.save(&snapshot).await {
            warn!(session = %self.state.key, error = %e, "Session snapshot failed");
        }
    }

    /// Stop timers and write a final snapshot
    pub async fn shutdown(&mut self) {
        self.leave_step().await;
        self.persist().await;
    }
}
