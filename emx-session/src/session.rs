//! Session data model

use crate::steps::StepDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one participant's session in one study
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub study_id: String,
    pub participant_id: String,
}

impl SessionKey {
    pub fn new(study_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study_id, self.participant_id)
    }
}

/// Navigator state machine phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowPhase {
    Loading,
    Login,
    Sequencing,
    InProgress { index: usize },
    Done,
    Error { reason: String },
}

impl FlowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowPhase::Done | FlowPhase::Error { .. })
    }
}

/// Live state of one session, owned by its navigator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub key: SessionKey,
    /// Frozen for the session's lifetime
    pub steps: Vec<StepDescriptor>,
    pub current_index: usize,
    pub max_visited_index: usize,
    pub phase: FlowPhase,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// When the participant entered the current step
    pub step_entered_at: DateTime<Utc>,
}

impl SessionState {
    /// State before a sequence exists
    pub fn loading(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            steps: Vec::new(),
            current_index: 0,
            max_visited_index: 0,
            phase: FlowPhase::Loading,
            degraded: false,
            started_at: now,
            ended_at: None,
            step_entered_at: now,
        }
    }

    /// State at the first step of a freshly built sequence
    pub fn new(key: SessionKey, steps: Vec<StepDescriptor>, degraded: bool) -> Self {
        let now = Utc::now();
        Self {
            key,
            steps,
            current_index: 0,
            max_visited_index: 0,
            phase: FlowPhase::InProgress { index: 0 },
            degraded,
            started_at: now,
            ended_at: None,
            step_entered_at: now,
        }
    }

    pub fn current_step(&self) -> Option<&StepDescriptor> {
        self.steps.get(self.current_index)
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.steps.len()
    }
}
