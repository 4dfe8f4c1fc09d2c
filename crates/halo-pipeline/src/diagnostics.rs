//! Run diagnostics: wall-clock timing and byte counts per phase.
//!
//! Each participant of a run (the leader, every worker, or a single
//! serial process) collects one [`RunDiagnostics`]. Phases are recorded
//! in the order they ran. Durations are serialized as fractional
//! seconds (`f64`) for JSON compatibility, since
//! [`std::time::Duration`] does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Dimensions;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected by one participant over one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Phases in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Wall-clock duration from the first phase to the last (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Totals across all phases.
    pub summary: RunSummary,
}

/// Diagnostics for a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Phase name as shown in reports.
    pub name: String,
    /// Wall-clock duration of this phase (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Phase-specific metrics.
    pub metrics: StageMetrics,
}

/// Phase-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Inputs decoded and validated.
    Parse {
        /// Declared image shape.
        dimensions: Dimensions,
        /// Parsed filter width.
        filter_width: u32,
        /// Parsed filter height.
        filter_height: u32,
    },
    /// Messages moved between participants.
    Transfer {
        /// Number of point-to-point or collective messages.
        messages: u64,
        /// Payload bytes moved.
        bytes: u64,
    },
    /// Convolution kernel executed.
    Convolve {
        /// Output rows computed.
        rows: u32,
        /// Output pixels computed.
        pixels: u64,
    },
    /// Iterative re-filtering finished.
    Converge {
        /// Passes run.
        iterations: u32,
        /// Distance between the last two images.
        final_distance: f64,
    },
    /// Result bytes written to the output sink.
    Write {
        /// Bytes written.
        bytes: u64,
    },
    /// Blocked on other participants; nothing measured locally.
    Wait,
}

/// Totals for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Image shape, once known.
    pub dimensions: Option<Dimensions>,
    /// Filter radius, once known.
    pub filter_radius: Option<u32>,
    /// Number of workers in the pool (0 for a serial run).
    pub workers: usize,
    /// Payload bytes sent by this participant.
    pub bytes_sent: u64,
    /// Payload bytes received by this participant.
    pub bytes_received: u64,
}

impl RunDiagnostics {
    /// Append a phase.
    pub fn record(&mut self, name: impl Into<String>, duration: Duration, metrics: StageMetrics) {
        self.stages.push(StageDiagnostics {
            name: name.into(),
            duration,
            metrics,
        });
    }

    /// Look up the first phase with the given name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Human-readable multi-line report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run Diagnostics Report\n{}", "=".repeat(60)));
        if let Some(dims) = self.summary.dimensions {
            lines.push(format!("Image: {dims}"));
        }
        if let Some(radius) = self.summary.filter_radius {
            lines.push(format!("Filter radius: {radius}"));
        }
        lines.push(format!("Workers: {}", self.summary.workers));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>10} {:>10}  {}",
            "Phase", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(72));

        let total_ms = duration_ms(self.total_duration);
        for stage in &self.stages {
            let ms = duration_ms(stage.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            lines.push(format!(
                "{:<16} {:>8.3}ms {:>9.1}%  {}",
                stage.name,
                ms,
                pct,
                format_metrics(&stage.metrics),
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "Bytes sent: {}  received: {}",
            self.summary.bytes_sent, self.summary.bytes_received,
        ));

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Parse {
            dimensions,
            filter_width,
            filter_height,
        } => format!("image {dimensions}, filter {filter_width}x{filter_height}"),
        StageMetrics::Transfer { messages, bytes } => format!("{messages} msgs, {bytes} bytes"),
        StageMetrics::Convolve { rows, pixels } => format!("{rows} rows, {pixels} px"),
        StageMetrics::Converge {
            iterations,
            final_distance,
        } => format!("{iterations} passes, distance {final_distance:.3}"),
        StageMetrics::Write { bytes } => format!("{bytes} bytes"),
        StageMetrics::Wait => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> RunDiagnostics {
        let mut diag = RunDiagnostics::default();
        diag.record(
            "parse",
            Duration::from_millis(2),
            StageMetrics::Parse {
                dimensions: Dimensions::new(8, 8, 1),
                filter_width: 3,
                filter_height: 3,
            },
        );
        diag.record(
            "distribute",
            Duration::from_millis(5),
            StageMetrics::Transfer {
                messages: 4,
                bytes: 96,
            },
        );
        diag.total_duration = Duration::from_millis(10);
        diag.summary = RunSummary {
            dimensions: Some(Dimensions::new(8, 8, 1)),
            filter_radius: Some(1),
            workers: 2,
            bytes_sent: 96,
            bytes_received: 64,
        };
        diag
    }

    #[test]
    fn report_lists_every_stage() {
        let report = sample().report();
        assert!(report.contains("parse"));
        assert!(report.contains("distribute"));
        assert!(report.contains("4 msgs, 96 bytes"));
        assert!(report.contains("Workers: 2"));
        assert!(report.contains("8x8x1"));
    }

    #[test]
    fn report_with_zero_total_does_not_divide_by_zero() {
        let mut diag = RunDiagnostics::default();
        diag.record("wait", Duration::ZERO, StageMetrics::Wait);
        let report = diag.report();
        assert!(report.contains("0.0%"));
    }

    #[test]
    fn stage_lookup_by_name() {
        let diag = sample();
        assert_eq!(diag.stage("distribute").unwrap().duration, Duration::from_millis(5));
        assert!(diag.stage("collect").is_none());
    }

    #[test]
    fn json_round_trip_keeps_durations() {
        let diag = sample();
        let json = serde_json::to_string(&diag).unwrap();
        let back: RunDiagnostics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages.len(), 2);
        assert_eq!(back.total_duration, Duration::from_millis(10));
        assert_eq!(back.summary, diag.summary);
    }

    #[test]
    fn negative_duration_rejected() {
        let json = r#"{"name":"x","duration":-1.0,"metrics":"Wait"}"#;
        assert!(serde_json::from_str::<StageDiagnostics>(json).is_err());
    }
}
