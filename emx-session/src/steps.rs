//! Step kinds and descriptors
//!
//! `StepKind` is a closed enumeration assigned once, when a source's config is
//! turned into steps. Everything downstream (category buckets, bookend
//! handling, progress) is a total match over it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Eye-tracking stimulus variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StimulusKind {
    Heatmap,
    Gaze,
    Fixation,
    Saccade,
    General,
}

/// Cognitive task question types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CognitiveKind {
    ShortText,
    LongText,
    SingleChoice,
    MultipleChoice,
    LinearScale,
    Ranking,
    NavigationFlow,
    PreferenceTest,
}

/// Voice-of-customer scale types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmartVocKind {
    Csat,
    Ces,
    Cv,
    Nps,
    Nev,
    Voc,
}

impl StimulusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StimulusKind::Heatmap => "heatmap",
            StimulusKind::Gaze => "gaze",
            StimulusKind::Fixation => "fixation",
            StimulusKind::Saccade => "saccade",
            StimulusKind::General => "general",
        }
    }

    /// Parse a source type name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_name(&s.to_ascii_lowercase())
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "heatmap" => Some(StimulusKind::Heatmap),
            "gaze" => Some(StimulusKind::Gaze),
            "fixation" => Some(StimulusKind::Fixation),
            "saccade" => Some(StimulusKind::Saccade),
            "general" => Some(StimulusKind::General),
            _ => None,
        }
    }
}

impl CognitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CognitiveKind::ShortText => "short_text",
            CognitiveKind::LongText => "long_text",
            CognitiveKind::SingleChoice => "single_choice",
            CognitiveKind::MultipleChoice => "multiple_choice",
            CognitiveKind::LinearScale => "linear_scale",
            CognitiveKind::Ranking => "ranking",
            CognitiveKind::NavigationFlow => "navigation_flow",
            CognitiveKind::PreferenceTest => "preference_test",
        }
    }

    /// Parse a source type name; accepts `short_text`, `SHORT_TEXT` and `cognitive_short_text`
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::from_name(lower.strip_prefix("cognitive_").unwrap_or(&lower))
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "short_text" => Some(CognitiveKind::ShortText),
            "long_text" => Some(CognitiveKind::LongText),
            "single_choice" => Some(CognitiveKind::SingleChoice),
            "multiple_choice" => Some(CognitiveKind::MultipleChoice),
            "linear_scale" => Some(CognitiveKind::LinearScale),
            "ranking" => Some(CognitiveKind::Ranking),
            "navigation_flow" => Some(CognitiveKind::NavigationFlow),
            "preference_test" => Some(CognitiveKind::PreferenceTest),
            _ => None,
        }
    }

    /// Fallback title when the question has none
    pub fn display_name(&self) -> &'static str {
        match self {
            CognitiveKind::ShortText => "Short answer",
            CognitiveKind::LongText => "Long answer",
            CognitiveKind::SingleChoice => "Single choice",
            CognitiveKind::MultipleChoice => "Multiple choice",
            CognitiveKind::LinearScale => "Linear scale",
            CognitiveKind::Ranking => "Ranking",
            CognitiveKind::NavigationFlow => "Navigation flow",
            CognitiveKind::PreferenceTest => "Preference test",
        }
    }
}

impl SmartVocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmartVocKind::Csat => "csat",
            SmartVocKind::Ces => "ces",
            SmartVocKind::Cv => "cv",
            SmartVocKind::Nps => "nps",
            SmartVocKind::Nev => "nev",
            SmartVocKind::Voc => "voc",
        }
    }

    /// Parse a source type name; accepts `CSAT`, `csat` and `smartvoc_csat`
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::from_name(lower.strip_prefix("smartvoc_").unwrap_or(&lower))
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "csat" => Some(SmartVocKind::Csat),
            "ces" => Some(SmartVocKind::Ces),
            "cv" => Some(SmartVocKind::Cv),
            "nps" => Some(SmartVocKind::Nps),
            "nev" => Some(SmartVocKind::Nev),
            "voc" => Some(SmartVocKind::Voc),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SmartVocKind::Csat => "Customer satisfaction",
            SmartVocKind::Ces => "Customer effort",
            SmartVocKind::Cv => "Customer value",
            SmartVocKind::Nps => "Net promoter score",
            SmartVocKind::Nev => "Net emotional value",
            SmartVocKind::Voc => "Voice of customer",
        }
    }
}

/// Closed set of step kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StepKind {
    Demographic,
    EyeTracking(StimulusKind),
    Welcome,
    Cognitive(CognitiveKind),
    SmartVoc(SmartVocKind),
    ModuleFeedback,
    ImageFeedback,
    ThankYou,
}

/// Ledger bucket a step's responses are indexed into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Demographic,
    Stimulus,
    Bookend,
    Cognitive,
    SmartVoc,
    Feedback,
}

impl StepKind {
    pub fn category(&self) -> StepCategory {
        match self {
            StepKind::Demographic => StepCategory::Demographic,
            StepKind::EyeTracking(_) => StepCategory::Stimulus,
            StepKind::Welcome | StepKind::ThankYou => StepCategory::Bookend,
            StepKind::Cognitive(_) => StepCategory::Cognitive,
            StepKind::SmartVoc(_) => StepCategory::SmartVoc,
            StepKind::ModuleFeedback | StepKind::ImageFeedback => StepCategory::Feedback,
        }
    }

    pub fn is_bookend(&self) -> bool {
        self.category() == StepCategory::Bookend
    }

    /// Steps that record samples over a time window
    pub fn is_timed(&self) -> bool {
        matches!(self, StepKind::EyeTracking(_))
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Demographic => f.write_str("demographic"),
            StepKind::EyeTracking(k) => write!(f, "eye_tracking_{}", k.as_str()),
            StepKind::Welcome => f.write_str("welcome"),
            StepKind::Cognitive(k) => write!(f, "cognitive_{}", k.as_str()),
            StepKind::SmartVoc(k) => write!(f, "smartvoc_{}", k.as_str()),
            StepKind::ModuleFeedback => f.write_str("module_feedback"),
            StepKind::ImageFeedback => f.write_str("image_feedback"),
            StepKind::ThankYou => f.write_str("thank_you"),
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "demographic" => Some(StepKind::Demographic),
            "welcome" => Some(StepKind::Welcome),
            "module_feedback" => Some(StepKind::ModuleFeedback),
            "image_feedback" => Some(StepKind::ImageFeedback),
            "thank_you" => Some(StepKind::ThankYou),
            other => {
                if let Some(rest) = other.strip_prefix("eye_tracking_") {
                    StimulusKind::from_name(rest).map(StepKind::EyeTracking)
                } else if let Some(rest) = other.strip_prefix("cognitive_") {
                    CognitiveKind::from_name(rest).map(StepKind::Cognitive)
                } else if let Some(rest) = other.strip_prefix("smartvoc_") {
                    SmartVocKind::from_name(rest).map(StepKind::SmartVoc)
                } else {
                    None
                }
            }
        };
        kind.ok_or_else(|| format!("unknown step kind: {}", s))
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for StepKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One step of a session's sequence; immutable once the sequence is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub kind: StepKind,
    pub display_name: String,
    /// Source-specific configuration passed through to the presentation layer
    #[serde(default)]
    pub config: serde_json::Value,
    /// Default step created by the aggregator rather than a source
    #[serde(default)]
    pub synthesized: bool,
}

impl StepDescriptor {
    pub fn new(
        id: impl Into<String>,
        kind: StepKind,
        display_name: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: display_name.into(),
            config,
            synthesized: false,
        }
    }

    pub fn synthesized(mut self) -> Self {
        self.synthesized = true;
        self
    }

    pub fn is_bookend(&self) -> bool {
        self.kind.is_bookend()
    }
}
