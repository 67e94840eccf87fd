//! Event types broadcast by the session engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admission outcome for one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionDecision {
    Qualified,
    DisqualifiedOverquota,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Qualified => "QUALIFIED",
            AdmissionDecision::DisqualifiedOverquota => "DISQUALIFIED_OVERQUOTA",
        }
    }

    /// Decision for a 1-based rank against an optional quota (None = unlimited)
    pub fn for_rank(rank: i64, quota: Option<i64>) -> Self {
        match quota {
            Some(q) if rank > q => AdmissionDecision::DisqualifiedOverquota,
            _ => AdmissionDecision::Qualified,
        }
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUALIFIED" => Ok(AdmissionDecision::Qualified),
            "DISQUALIFIED_OVERQUOTA" => Ok(AdmissionDecision::DisqualifiedOverquota),
            other => Err(format!("unknown admission decision: {}", other)),
        }
    }
}

/// Session engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Session entered IN_PROGRESS (fresh start or resume)
    SessionStarted {
        study_id: String,
        participant_id: String,
        step_count: usize,
        degraded: bool,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Current step changed by completion or navigation
    StepAdvanced {
        study_id: String,
        participant_id: String,
        from_index: usize,
        to_index: usize,
        timestamp: DateTime<Utc>,
    },

    /// Navigation request rejected
    NavigationDenied {
        study_id: String,
        participant_id: String,
        requested_index: usize,
        max_visited_index: usize,
        timestamp: DateTime<Utc>,
    },

    /// Final step completed
    SessionCompleted {
        study_id: String,
        participant_id: String,
        completed_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Session reached the terminal error state
    SessionFailed {
        study_id: String,
        participant_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A step source failed or timed out during aggregation
    SourceDegraded {
        study_id: String,
        source: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// First admission decision for a participant
    AdmissionDecided {
        study_id: String,
        participant_id: String,
        rank: i64,
        decision: AdmissionDecision,
        quota: Option<i64>,
        /// Why the participant is over quota, when they are
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Earlier decision recomputed after a displacing insertion
    AdmissionRevised {
        study_id: String,
        participant_id: String,
        rank: i64,
        previous_decision: AdmissionDecision,
        decision: AdmissionDecision,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "SessionStarted",
            SessionEvent::StepAdvanced { .. } => "StepAdvanced",
            SessionEvent::NavigationDenied { .. } => "NavigationDenied",
            SessionEvent::SessionCompleted { .. } => "SessionCompleted",
            SessionEvent::SessionFailed { .. } => "SessionFailed",
            SessionEvent::SourceDegraded { .. } => "SourceDegraded",
            SessionEvent::AdmissionDecided { .. } => "AdmissionDecided",
            SessionEvent::AdmissionRevised { .. } => "AdmissionRevised",
        }
    }
}
