//! Partial buffer flushing for long-running steps
//!
//! A timed step (e.g. a recording window) accumulates samples in memory and
//! a background task flushes the whole buffer into the session snapshot on
//! its own interval. On crash only the last interval is lost.

use super::LocalCache;
use crate::session::SessionKey;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct RecordingBuffer {
    step_id: String,
    samples: Arc<Mutex<Vec<Value>>>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RecordingBuffer {
    /// Start buffering for `step_id`, seeded with samples restored from cache
    pub fn start(
        cache: Arc<LocalCache>,
        key: SessionKey,
        step_id: impl Into<String>,
        initial: Vec<Value>,
        interval: Duration,
    ) -> Self {
        let step_id = step_id.into();
        let samples = Arc::new(Mutex::new(initial));
        let token = CancellationToken::new();

        let handle = tokio::spawn(flush_loop(
            cache,
            key,
            step_id.clone(),
            Arc::clone(&samples),
            token.clone(),
            interval,
        ));

        Self {
            step_id,
            samples,
            token,
            handle,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub async fn append(&self, mut chunk: Vec<Value>) -> usize {
        let mut samples = self.samples.lock().await;
        samples.append(&mut chunk);
        samples.len()
    }

    /// Copy of everything buffered so far
    pub async fn samples(&self) -> Vec<Value> {
        self.samples.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.lock().await.is_empty()
    }

    /// Stop the flusher and wait for it, returning the buffered samples
    ///
    /// Once this returns the flusher can no longer write.
    pub async fn stop(self) -> Vec<Value> {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(step_id = %self.step_id, error = %e, "Recording flusher ended abnormally");
        }
        std::mem::take(&mut *self.samples.lock().await)
    }
}

async fn flush_loop(
    cache: Arc<LocalCache>,
    key: SessionKey,
    step_id: String,
    samples: Arc<Mutex<Vec<Value>>>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; nothing to flush yet
    ticker.tick().await;
    let mut last_flushed = usize::MAX;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = samples.lock().await.clone();
                if snapshot.len() == last_flushed {
                    continue;
                }
                match cache.save_partial(&key, &step_id, snapshot.clone()).await {
                    Ok(true) => {
                        last_flushed = snapshot.len();
                        debug!(session = %key, step_id = %step_id, samples = snapshot.len(), "Flushed partial buffer");
                    }
                    Ok(false) => debug!(session = %key, step_id = %step_id, "No snapshot yet, partial flush skipped"),
                    Err(e) => warn!(session = %key, step_id = %step_id, error = %e, "Partial flush failed"),
                }
            }
        }
    }
}
