//! Module Config Aggregator
//!
//! Fetches every step source concurrently, each under its own timeout, and
//! joins all of them before ordering. A failing source contributes no steps.

pub mod canonical;
pub mod db_source;
pub mod http_source;
pub mod source;

pub use canonical::{build_sequence, is_degraded, DeviceClass};
pub use db_source::DbStepSource;
pub use http_source::HttpStepSource;
pub use source::{SourceKind, StepSource, StepSourceData};

use crate::error::{Error, Result};
use crate::state::SharedState;
use crate::steps::StepDescriptor;
use emx_common::events::SessionEvent;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one aggregation
#[derive(Debug, Clone)]
pub struct StepSequence {
    pub steps: Vec<StepDescriptor>,
    /// Fewer than two non-bookend steps came from source data
    pub degraded: bool,
    /// Sources that failed or timed out
    pub failed_sources: Vec<String>,
}

enum FetchOutcome {
    Found(StepSourceData),
    Missing,
    Failed(Error),
}

pub struct ModuleConfigAggregator {
    sources: Vec<Arc<dyn StepSource>>,
    timeout: Duration,
    state: Arc<SharedState>,
}

impl ModuleConfigAggregator {
    pub fn new(sources: Vec<Arc<dyn StepSource>>, timeout: Duration, state: Arc<SharedState>) -> Self {
        Self {
            sources,
            timeout,
            state,
        }
    }

    /// Build the step sequence for a study
    ///
    /// Fails with `Error::Sequencing` only when no source returned any data.
    pub async fn aggregate(&self, study_id: &str, device: DeviceClass) -> Result<StepSequence> {
        let fetches = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            let timeout = self.timeout;
            async move {
                let outcome = match tokio::time::timeout(timeout, source.get_config(study_id)).await {
                    Ok(Ok(Some(data))) => FetchOutcome::Found(data),
                    Ok(Ok(None)) => FetchOutcome::Missing,
                    Ok(Err(e)) => FetchOutcome::Failed(e),
                    Err(_) => FetchOutcome::Failed(Error::ConfigFetch {
                        source_kind: source.kind().to_string(),
                        message: format!("timed out after {} ms", timeout.as_millis()),
                    }),
                };
                (source.name(), source.kind(), outcome)
            }
        });

        // join_all keeps source order, so the result never depends on timing
        let results = join_all(fetches).await;

        let mut found: HashMap<SourceKind, Value> = HashMap::new();
        let mut failed_sources = Vec::new();

        for (name, kind, outcome) in results {
            match outcome {
                FetchOutcome::Found(data) => {
                    if data.kind != kind {
                        warn!(study_id, source = %name, "Source returned config for a different kind");
                    }
                    found.entry(kind).or_insert(data.config);
                }
                FetchOutcome::Missing => {
                    debug!(study_id, source = %name, "No configuration for module");
                }
                FetchOutcome::Failed(e) => {
                    warn!(study_id, source = %name, error = %e, "Step source failed, skipping");
                    self.state.broadcast_event(SessionEvent::SourceDegraded {
                        study_id: study_id.to_string(),
                        source: name.clone(),
                        reason: e.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                    failed_sources.push(name);
                }
            }
        }

        if found.is_empty() {
            return Err(Error::Sequencing(format!(
                "no step source returned configuration for study {}",
                study_id
            )));
        }

        let steps = build_sequence(&found, device);
        let degraded = is_degraded(&steps);
        if degraded {
            warn!(study_id, step_count = steps.len(), "Step sequence is degraded");
        }

        info!(
            study_id,
            step_count = steps.len(),
            sources_found = found.len(),
            sources_failed = failed_sources.len(),
            "Step sequence built"
        );

        Ok(StepSequence {
            steps,
            degraded,
            failed_sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedSource {
        kind: SourceKind,
        config: Option<Value>,
        delay: Duration,
        fail: bool,
    }

    impl FixedSource {
        fn found(kind: SourceKind, config: Value) -> Arc<dyn StepSource> {
            Arc::new(Self { kind, config: Some(config), delay: Duration::ZERO, fail: false })
        }
    }

    #[async_trait]
    impl StepSource for FixedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn get_config(&self, _study_id: &str) -> Result<Option<StepSourceData>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::ConfigFetch {
                    source_kind: self.kind.to_string(),
                    message: "boom".into(),
                });
            }
            Ok(self.config.clone().map(|config| StepSourceData { kind: self.kind, config }))
        }
    }

    fn aggregator(sources: Vec<Arc<dyn StepSource>>) -> ModuleConfigAggregator {
        ModuleConfigAggregator::new(sources, Duration::from_millis(100), Arc::new(SharedState::default()))
    }

    fn cognitive(n: usize) -> Value {
        let questions: Vec<Value> = (0..n)
            .map(|i| json!({"id": format!("q{}", i), "type": "short_text"}))
            .collect();
        json!({ "questions": questions })
    }

    #[tokio::test]
    async fn test_failing_and_slow_sources_contribute_nothing() {
        let sources: Vec<Arc<dyn StepSource>> = vec![
            FixedSource::found(SourceKind::Cognitive, cognitive(2)),
            Arc::new(FixedSource {
                kind: SourceKind::SmartVoc,
                config: Some(json!({"questions": [{"type": "NPS"}]})),
                delay: Duration::from_secs(5),
                fail: false,
            }),
            Arc::new(FixedSource {
                kind: SourceKind::Demographic,
                config: None,
                delay: Duration::ZERO,
                fail: true,
            }),
        ];

        let state = Arc::new(SharedState::default());
        let mut events = state.subscribe_events();
        let agg = ModuleConfigAggregator::new(sources, Duration::from_millis(50), Arc::clone(&state));

        let seq = agg.aggregate("study-1", DeviceClass::Desktop).await.unwrap();
        assert!(!seq.steps.iter().any(|s| matches!(s.kind, crate::steps::StepKind::SmartVoc(_))));
        assert!(!seq.steps.iter().any(|s| s.kind == crate::steps::StepKind::Demographic));
        assert_eq!(seq.failed_sources.len(), 2);
        assert!(!seq.degraded);

        let first = events.try_recv().unwrap();
        assert_eq!(first.event_type(), "SourceDegraded");
    }

    #[tokio::test]
    async fn test_step_count_is_contributions_plus_bookends() {
        let agg = aggregator(vec![
            FixedSource::found(SourceKind::Cognitive, cognitive(3)),
            FixedSource::found(
                SourceKind::Feedback,
                json!({"module_feedback": {}, "image_feedback": {}}),
            ),
        ]);

        let seq = agg.aggregate("study-1", DeviceClass::Desktop).await.unwrap();
        assert_eq!(seq.steps.len(), 3 + 2 + 2);
        assert_eq!(seq.steps.first().map(|s| s.kind), Some(crate::steps::StepKind::Welcome));
        assert_eq!(seq.steps.last().map(|s| s.kind), Some(crate::steps::StepKind::ThankYou));
    }

    #[tokio::test]
    async fn test_all_sources_missing_is_fatal() {
        let agg = aggregator(vec![Arc::new(FixedSource {
            kind: SourceKind::Cognitive,
            config: None,
            delay: Duration::ZERO,
            fail: false,
        })]);

        let err = agg.aggregate("study-1", DeviceClass::Desktop).await.unwrap_err();
        assert!(matches!(err, Error::Sequencing(_)));
    }

    #[tokio::test]
    async fn test_first_source_of_a_kind_wins() {
        let agg = aggregator(vec![
            FixedSource::found(SourceKind::Cognitive, cognitive(1)),
            FixedSource::found(SourceKind::Cognitive, cognitive(4)),
        ]);

        let seq = agg.aggregate("study-1", DeviceClass::Desktop).await.unwrap();
        let tasks = seq
            .steps
            .iter()
            .filter(|s| matches!(s.kind, crate::steps::StepKind::Cognitive(_)))
            .count();
        assert_eq!(tasks, 1);
        assert!(seq.degraded);
    }
}
