//! Session metrics
//!
//! Three primitives: monotonic counters, last-write-wins gauges, and
//! timing series that keep the most recent 1,000 samples and report
//! p50/p95/p99 on snapshot. A snapshot is logged periodically at INFO
//! and served by the health probe.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

/// Samples retained per timing series
const TIMING_WINDOW: usize = 1000;

/// Metric series names
pub mod names {
    pub const SESSION_COUNT: &str = "voice.session.count";
    pub const RECONNECT_COUNT: &str = "voice.reconnect.count";
    pub const RECONNECT_SUCCESS: &str = "voice.reconnect.success";
    pub const STT_REQUESTS: &str = "voice.stt.requests";
    pub const TTS_REQUESTS: &str = "voice.tts.requests";
    pub const TTS_CACHE_HITS: &str = "voice.tts.cache_hits";
    pub const TTS_CACHE_MISSES: &str = "voice.tts.cache_misses";
    pub const LLM_ERRORS: &str = "voice.llm.errors";
    pub const OPUS_DECODE_ERRORS: &str = "voice.opus.decode_errors";
    pub const SILENCE_PROMPTS: &str = "voice.heartbeat.silence_prompts";
    pub const STALLS_DETECTED: &str = "voice.heartbeat.stalls_detected";
    pub const IDLE_DISCONNECTS: &str = "voice.idle_disconnects";
    pub const CAPTURE_DROPPED: &str = "voice.capture.dropped";

    pub const CACHE_SIZE_BYTES: &str = "voice.tts.cache_size_bytes";
    pub const SESSION_DURATION_SEC: &str = "voice.session.duration_sec";

    pub const STT_LATENCY_MS: &str = "voice.stt.latency_ms";
    pub const TTS_LATENCY_MS: &str = "voice.tts.latency_ms";
    pub const LLM_LATENCY_MS: &str = "voice.llm.latency_ms";
    pub const E2E_LATENCY_MS: &str = "voice.pipeline.e2e_latency_ms";
}

/// Summary of one timing series
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct TimingSummary {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time view of every series
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub timings: BTreeMap<String, TimingSummary>,
}

#[derive(Default)]
struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, i64>,
    timings: HashMap<String, VecDeque<f64>>,
}

/// Counter/gauge/timing registry, shared per session
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    /// Increment a counter by `delta`
    pub fn increment_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Read a counter (0 when never incremented)
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Set a gauge (last write wins)
    pub fn set_gauge(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.gauges.insert(name.to_string(), value);
    }

    /// Read a gauge
    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<i64> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.gauges.get(name).copied()
    }

    /// Record one timing sample in milliseconds
    pub fn record_timing(&self, name: &str, millis: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let series = inner.timings.entry(name.to_string()).or_default();
        if series.len() == TIMING_WINDOW {
            series.pop_front();
        }
        series.push_back(millis);
    }

    /// Number of samples recorded for a timing series
    #[must_use]
    pub fn timing_count(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.timings.get(name).map_or(0, VecDeque::len)
    }

    /// Snapshot every series
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let counters = inner
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let gauges = inner.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let timings = inner
            .timings
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(k, samples)| (k.clone(), summarize(samples)))
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            timings,
        }
    }

    /// Log the current snapshot at INFO as one structured line
    pub fn log_snapshot(&self) {
        let snapshot = self.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::info!(metrics = %json, "metrics snapshot"),
            Err(e) => tracing::warn!(error = %e, "metrics snapshot serialization failed"),
        }
    }
}

/// Percentiles over the retained window: index = floor(pct/100 * n),
/// clamped to n-1.
fn summarize(samples: &VecDeque<f64>) -> TimingSummary {
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pick = |pct: f64| -> f64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let idx = ((pct / 100.0 * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
        sorted[idx]
    };

    TimingSummary {
        count: sorted.len(),
        p50: pick(50.0),
        p95: pick(95.0),
        p99: pick(99.0),
    }
}
