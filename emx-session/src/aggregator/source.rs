//! Step source collaborator interface

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of module configuration a source serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Demographic,
    EyeTracking,
    Welcome,
    Cognitive,
    SmartVoc,
    Feedback,
    ThankYou,
}

impl SourceKind {
    /// Every kind, in canonical sequence order
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Demographic,
        SourceKind::EyeTracking,
        SourceKind::Welcome,
        SourceKind::Cognitive,
        SourceKind::SmartVoc,
        SourceKind::Feedback,
        SourceKind::ThankYou,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Demographic => "demographic",
            SourceKind::EyeTracking => "eye_tracking",
            SourceKind::Welcome => "welcome",
            SourceKind::Cognitive => "cognitive",
            SourceKind::SmartVoc => "smartvoc",
            SourceKind::Feedback => "feedback",
            SourceKind::ThankYou => "thank_you",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown source kind: {}", s))
    }
}

/// Raw configuration returned by a source
#[derive(Debug, Clone, PartialEq)]
pub struct StepSourceData {
    pub kind: SourceKind,
    pub config: Value,
}

/// One independently-fetched provider of module configuration
#[async_trait]
pub trait StepSource: Send + Sync {
    /// Which module this source serves
    fn kind(&self) -> SourceKind;

    /// Source label for logs (defaults to the kind)
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Fetch the study's configuration
    ///
    /// * `Ok(Some(_))` - configuration found
    /// * `Ok(None)` - the study has no configuration for this module
    /// * `Err(_)` - fetch failed (logged and skipped by the aggregator)
    async fn get_config(&self, study_id: &str) -> Result<Option<StepSourceData>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("screener".parse::<SourceKind>().is_err());
    }
}
