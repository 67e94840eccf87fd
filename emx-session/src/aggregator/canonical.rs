//! Canonical step ordering
//!
//! Turns the configs that sources returned into one ordered sequence:
//! demographic, stimulus, welcome, cognitive tasks, SmartVOC tasks, feedback
//! fillers, thank-you. Missing bookends and fillers are synthesized.

use super::source::SourceKind;
use crate::steps::{CognitiveKind, SmartVocKind, StepDescriptor, StepKind, StimulusKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Participant device class, used to filter device-dependent stimulus steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    pub fn is_mobile(&self) -> bool {
        matches!(self, DeviceClass::Mobile | DeviceClass::Tablet)
    }
}

const DEFAULT_WELCOME_TITLE: &str = "Welcome";
const DEFAULT_THANK_YOU_TITLE: &str = "Thank you";

/// Build the ordered sequence from the configs that were found
pub fn build_sequence(found: &HashMap<SourceKind, Value>, device: DeviceClass) -> Vec<StepDescriptor> {
    let mut steps = Vec::new();

    if let Some(cfg) = found.get(&SourceKind::Demographic) {
        steps.extend(demographic_steps(cfg));
    }
    if let Some(cfg) = found.get(&SourceKind::EyeTracking) {
        steps.extend(stimulus_steps(cfg, device));
    }

    steps.push(bookend_step(
        found.get(&SourceKind::Welcome),
        StepKind::Welcome,
        "welcome",
        DEFAULT_WELCOME_TITLE,
    ));

    if let Some(cfg) = found.get(&SourceKind::Cognitive) {
        steps.extend(question_steps(cfg, "cognitive", |t| {
            CognitiveKind::parse(t).map(|k| (StepKind::Cognitive(k), k.display_name()))
        }));
    }
    if let Some(cfg) = found.get(&SourceKind::SmartVoc) {
        steps.extend(question_steps(cfg, "smartvoc", |t| {
            SmartVocKind::parse(t).map(|k| (StepKind::SmartVoc(k), k.display_name()))
        }));
    }

    steps.extend(filler_steps(found.get(&SourceKind::Feedback)));

    steps.push(bookend_step(
        found.get(&SourceKind::ThankYou),
        StepKind::ThankYou,
        "thank_you",
        DEFAULT_THANK_YOU_TITLE,
    ));

    dedupe_ids(&mut steps);
    steps
}

/// Fewer than two non-bookend steps came from real source data
pub fn is_degraded(steps: &[StepDescriptor]) -> bool {
    steps
        .iter()
        .filter(|s| !s.is_bookend() && !s.synthesized)
        .count()
        < 2
}

fn is_enabled(v: &Value) -> bool {
    v.get("enabled").and_then(Value::as_bool).unwrap_or(true)
}

fn title_of(v: &Value) -> Option<String> {
    v.get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn id_of(v: &Value) -> Option<String> {
    match v.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// One demographic step when at least one question is enabled
fn demographic_steps(cfg: &Value) -> Vec<StepDescriptor> {
    let any_enabled = match cfg.get("questions") {
        Some(Value::Object(map)) => map.values().any(is_enabled),
        Some(Value::Array(list)) => list.iter().any(is_enabled),
        _ => false,
    };

    if !any_enabled {
        return Vec::new();
    }

    let title = title_of(cfg).unwrap_or_else(|| "Demographic questions".to_string());
    vec![StepDescriptor::new("demographic", StepKind::Demographic, title, cfg.clone())]
}

/// One step per stimulus; none on mobile devices when the link disallows them
fn stimulus_steps(cfg: &Value, device: DeviceClass) -> Vec<StepDescriptor> {
    let allow_mobile = cfg
        .pointer("/link_config/allow_mobile")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if device.is_mobile() && !allow_mobile {
        return Vec::new();
    }

    let Some(stimuli) = cfg.get("stimuli").and_then(Value::as_array) else {
        return Vec::new();
    };

    stimuli
        .iter()
        .enumerate()
        .filter(|(_, s)| is_enabled(s))
        .filter_map(|(i, s)| {
            let raw_type = s.get("type").and_then(Value::as_str).unwrap_or("general");
            let Some(kind) = StimulusKind::parse(raw_type) else {
                warn!(stimulus_type = raw_type, "Skipping stimulus with unknown type");
                return None;
            };
            let id = id_of(s).unwrap_or_else(|| (i + 1).to_string());
            let title = title_of(s).unwrap_or_else(|| format!("Stimulus {}", i + 1));
            Some(StepDescriptor::new(
                format!("eye_tracking_{}", id),
                StepKind::EyeTracking(kind),
                title,
                s.clone(),
            ))
        })
        .collect()
}

/// One step per question, in declared order; unknown question types are skipped
fn question_steps<F>(cfg: &Value, prefix: &str, classify: F) -> Vec<StepDescriptor>
where
    F: Fn(&str) -> Option<(StepKind, &'static str)>,
{
    let Some(questions) = cfg.get("questions").and_then(Value::as_array) else {
        return Vec::new();
    };

    questions
        .iter()
        .enumerate()
        .filter(|(_, q)| is_enabled(q))
        .filter_map(|(i, q)| {
            let raw_type = q.get("type").and_then(Value::as_str).unwrap_or_default();
            let Some((kind, fallback_title)) = classify(raw_type) else {
                warn!(module = prefix, question_type = raw_type, "Skipping question with unmapped type");
                return None;
            };
            let id = id_of(q).unwrap_or_else(|| (i + 1).to_string());
            let title = title_of(q).unwrap_or_else(|| fallback_title.to_string());
            Some(StepDescriptor::new(format!("{}_{}", prefix, id), kind, title, q.clone()))
        })
        .collect()
}

fn bookend_step(cfg: Option<&Value>, kind: StepKind, id: &str, default_title: &str) -> StepDescriptor {
    match cfg.filter(|c| is_enabled(c)) {
        Some(c) => {
            let title = title_of(c).unwrap_or_else(|| default_title.to_string());
            StepDescriptor::new(id, kind, title, c.clone())
        }
        None => StepDescriptor::new(id, kind, default_title, json!({ "title": default_title }))
            .synthesized(),
    }
}

/// Module and image feedback fillers, each synthesized when not supplied
fn filler_steps(cfg: Option<&Value>) -> Vec<StepDescriptor> {
    let fillers = [
        (StepKind::ModuleFeedback, "module_feedback", "How was this module?"),
        (StepKind::ImageFeedback, "image_feedback", "What did you think of the images?"),
    ];

    fillers
        .into_iter()
        .filter_map(|(kind, key, default_title)| match cfg.and_then(|c| c.get(key)) {
            Some(c) if !is_enabled(c) => None,
            Some(c) => {
                let title = title_of(c).unwrap_or_else(|| default_title.to_string());
                Some(StepDescriptor::new(key, kind, title, c.clone()))
            }
            None => Some(
                StepDescriptor::new(key, kind, default_title, json!({ "title": default_title }))
                    .synthesized(),
            ),
        })
        .collect()
}

/// Suffix repeated ids (`x`, `x-2`, `x-3`) so ids stay unique within the session
fn dedupe_ids(steps: &mut [StepDescriptor]) {
    let mut seen = HashSet::new();
    for step in steps.iter_mut() {
        if seen.insert(step.id.clone()) {
            continue;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}-{}", step.id, n);
            if seen.insert(candidate.clone()) {
                step.id = candidate;
                break;
            }
            n += 1;
        }
    }
}
