use crate::errors::{AppError, AppResult};
use crate::models::{Metrics, ThreadMetricsSummary};
use std::collections::HashMap;
use std::sync::Mutex;

/// Metrics of the current turn on one connection.
///
/// A `metrics` event replaces the whole snapshot; nothing is merged. The raw
/// payload is kept as received and read back with absent fields as zero.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    raw: Option<serde_json::Value>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.raw = None;
    }

    pub fn replace(&mut self, payload: serde_json::Value) {
        self.raw = Some(payload);
    }

    pub fn raw(&self) -> Option<&serde_json::Value> {
        self.raw.as_ref()
    }

    /// `performance.totalTime` when the payload carries it as a number.
    pub fn total_time(&self) -> Option<f64> {
        self.raw
            .as_ref()
            .and_then(|raw| raw.pointer("/performance/totalTime"))
            .and_then(serde_json::Value::as_f64)
    }

    pub fn current(&self) -> Metrics {
        match &self.raw {
            Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|error| {
                tracing::debug!(error = %error, "metrics payload has unexpected shape, reading as zero");
                Metrics::default()
            }),
            None => Metrics::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ThreadTiming {
    latest: Metrics,
    mean_total_time: f64,
    samples: u64,
}

/// Process-wide response times, keyed by thread. Survives turns and
/// reconnects.
#[derive(Debug, Default)]
pub struct ResponseTimeTracker {
    threads: Mutex<HashMap<String, ThreadTiming>>,
    latest: Mutex<Option<Metrics>>,
}

impl ResponseTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `metrics` as the latest for the thread. Only payloads that
    /// reported a `total_time` count towards the mean.
    pub fn record(&self, thread_id: &str, metrics: &Metrics, total_time: Option<f64>) -> AppResult<()> {
        {
            let mut threads = self.lock_threads()?;
            let timing = threads.entry(thread_id.to_string()).or_default();
            if let Some(total_time) = total_time {
                timing.samples += 1;
                timing.mean_total_time += (total_time - timing.mean_total_time) / timing.samples as f64;
            }
            timing.latest = metrics.clone();
        }
        let mut latest = self
            .latest
            .lock()
            .map_err(|_| AppError::Internal("metrics mutex poisoned".to_string()))?;
        *latest = Some(metrics.clone());
        Ok(())
    }

    pub fn summary(&self, thread_id: &str) -> AppResult<ThreadMetricsSummary> {
        let threads = self.lock_threads()?;
        let timing = threads.get(thread_id).cloned().unwrap_or_default();
        Ok(ThreadMetricsSummary {
            thread_id: thread_id.to_string(),
            latest: timing.latest,
            average_response_time_ms: timing.mean_total_time,
            samples: timing.samples,
        })
    }

    /// Most recently recorded metrics on any thread.
    pub fn latest(&self) -> AppResult<Metrics> {
        let latest = self
            .latest
            .lock()
            .map_err(|_| AppError::Internal("metrics mutex poisoned".to_string()))?;
        Ok(latest.clone().unwrap_or_default())
    }

    fn lock_threads(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, ThreadTiming>>> {
        self.threads
            .lock()
            .map_err(|_| AppError::Internal("metrics mutex poisoned".to_string()))
    }
}
