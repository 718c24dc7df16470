use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub frames_written: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    pub frames_in: u64,
    pub frames_out: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    /// Process-wide collector served by the metrics endpoint.
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_stage_frames(&self, stage: &str, frames_in: u64, frames_out: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.stages.entry(stage.to_string()).or_default();
            metrics.frames_in += frames_in;
            metrics.frames_out += frames_out;
        }
    }

    pub fn record_output(&self, bytes: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.frames_written += 1;
            guard.bytes_written += bytes;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Adds the elapsed time to its stage when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "stage call recorded");
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        frames_written = snapshot.frames_written,
        bytes_written = snapshot.bytes_written,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            frames_in = metrics.frames_in,
            frames_out = metrics.frames_out,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters: [(&str, &str, &str, u64); 2] = [
            (
                "bunker_transcode_frames_written_total",
                "Frames handed to the writer",
                "counter",
                self.frames_written,
            ),
            (
                "bunker_transcode_bytes_written_total",
                "Payload bytes handed to the writer",
                "counter",
                self.bytes_written,
            ),
        ];
        for (name, help, kind, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} {kind}");
            let _ = writeln!(output, "{name} {value}");
        }

        let per_stage = [
            ("bunker_transcode_stage_calls_total", "Stage invocation count", "counter"),
            (
                "bunker_transcode_stage_duration_seconds_total",
                "Accumulated stage duration in seconds",
                "counter",
            ),
            (
                "bunker_transcode_stage_duration_seconds_max",
                "Maximum stage call duration in seconds",
                "gauge",
            ),
            ("bunker_transcode_stage_frames_in_total", "Frames consumed by the stage", "counter"),
            ("bunker_transcode_stage_frames_out_total", "Frames drained from the stage", "counter"),
        ];
        for (name, help, kind) in per_stage {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} {kind}");
        }
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "bunker_transcode_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "bunker_transcode_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "bunker_transcode_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "bunker_transcode_stage_frames_in_total{{stage=\"{stage}\"}} {}",
                metrics.frames_in
            );
            let _ = writeln!(
                output,
                "bunker_transcode_stage_frames_out_total{{stage=\"{stage}\"}} {}",
                metrics.frames_out
            );
        }
        let _ = writeln!(
            output,
            "# HELP bunker_transcode_pipeline_duration_seconds Total pipeline duration"
        );
        let _ = writeln!(output, "# TYPE bunker_transcode_pipeline_duration_seconds gauge");
        let _ = writeln!(
            output,
            "bunker_transcode_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_and_frames_land_in_snapshot() {
        let metrics = MetricsCollector::new();
        drop(metrics.start_stage("MFXDEC"));
        metrics.record_stage_frames("MFXDEC", 3, 2);
        metrics.record_output(10);
        let snapshot = metrics.snapshot();
        let dec = &snapshot.stages["MFXDEC"];
        assert_eq!(dec.calls, 1);
        assert_eq!((dec.frames_in, dec.frames_out), (3, 2));
        let text = snapshot.to_prometheus();
        assert!(text.contains("bunker_transcode_stage_frames_in_total{stage=\"MFXDEC\"} 3"));
        assert!(text.contains("bunker_transcode_bytes_written_total 10"));
    }
}
