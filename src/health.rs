//! Device Health Monitoring
//!
//! Converts raw flow counters into per-device `HealthSnapshot`s on a
//! fixed tick and raises a `HealthAlert` once a device has spent N
//! consecutive intervals at `Degraded` or worse. The tick source lives in
//! the device manager so tests can drive evaluation directly.

use serde::{Deserialize, Serialize};

use crate::device::DeviceState;
use crate::util::now_ns;

/// Overall device condition, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Point-in-time device health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub device_id: String,
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub connection_stable: bool,
    pub samples_per_sec: f64,
    pub bits_per_sec: f64,
    /// Observed device-to-ingest latency
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<f32>,
    /// Fill fraction of the device's delivery queue
    pub queue_fill: f32,
    pub ts_ns: i64,
}

/// Raised after `threshold` consecutive degraded-or-worse intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub device_id: String,
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub consecutive_intervals: u32,
    pub ts_ns: i64,
}

/// Flow counters the manager increments as driver events arrive
#[derive(Debug, Clone, Default)]
pub struct FlowCounters {
    pub samples: u64,
    pub bytes: u64,
    pub gaps: u64,
    pub faults: u64,
    /// Latency of the most recent chunk, ns
    pub last_latency_ns: i64,
    pub last_chunk_ts_ns: i64,
    pub battery_pct: Option<f32>,
    pub queue_fill: f32,
}

/// Per-device health evaluator
#[derive(Debug)]
pub struct HealthMonitor {
    device_id: String,
    nominal_rate_hz: f64,
    alert_threshold: u32,
    prev: FlowCounters,
    degraded_streak: u32,
    alerted: bool,
}

/// Data rate below this fraction of nominal is degraded
const RATE_DEGRADED_FRACTION: f64 = 0.5;
/// Latency beyond which delivery counts as degraded
const LATENCY_DEGRADED_MS: f64 = 250.0;
/// Silence beyond this many ns while streaming is critical
const SILENCE_CRITICAL_NS: i64 = 3_000_000_000;

impl HealthMonitor {
    pub fn new(device_id: impl Into<String>, nominal_rate_hz: f64, alert_threshold: u32) -> Self {
        Self {
            device_id: device_id.into(),
            nominal_rate_hz,
            alert_threshold: alert_threshold.max(1),
            prev: FlowCounters::default(),
            degraded_streak: 0,
            alerted: false,
        }
    }

    /// Evaluate one tick. `elapsed_s` is the interval since the previous
    /// evaluation; `counters` is a snapshot of the device's counters.
    pub fn evaluate(
        &mut self,
        state: DeviceState,
        counters: &FlowCounters,
        elapsed_s: f64,
        now_ts_ns: i64,
    ) -> (HealthSnapshot, Option<HealthAlert>) {
        let mut reasons = Vec::new();
        let mut status = HealthStatus::Healthy;
        let mut raise = |s: HealthStatus, reason: String, reasons: &mut Vec<String>| {
            reasons.push(reason);
            if s > status {
                status = s;
            }
        };

        let samples_delta = counters.samples.saturating_sub(self.prev.samples);
        let bytes_delta = counters.bytes.saturating_sub(self.prev.bytes);
        let gaps_delta = counters.gaps.saturating_sub(self.prev.gaps);
        let faults_delta = counters.faults.saturating_sub(self.prev.faults);
        let samples_per_sec = if elapsed_s > 0.0 {
            samples_delta as f64 / elapsed_s
        } else {
            0.0
        };
        let bits_per_sec = if elapsed_s > 0.0 {
            bytes_delta as f64 * 8.0 / elapsed_s
        } else {
            0.0
        };
        let latency_ms = counters.last_latency_ns as f64 / 1e6;

        if state == DeviceState::Streaming {
            let silent_ns = now_ts_ns.saturating_sub(counters.last_chunk_ts_ns);
            if counters.last_chunk_ts_ns > 0 && silent_ns > SILENCE_CRITICAL_NS {
                raise(
                    HealthStatus::Critical,
                    format!("no data for {} ms", silent_ns / 1_000_000),
                    &mut reasons,
                );
            } else if self.nominal_rate_hz > 0.0
                && samples_per_sec < self.nominal_rate_hz * RATE_DEGRADED_FRACTION
            {
                raise(
                    HealthStatus::Degraded,
                    format!(
                        "data rate {:.0}/s below nominal {:.0}/s",
                        samples_per_sec, self.nominal_rate_hz
                    ),
                    &mut reasons,
                );
            }
            if gaps_delta > 0 {
                raise(
                    HealthStatus::Degraded,
                    format!("{} sequence gaps this interval", gaps_delta),
                    &mut reasons,
                );
            }
            if latency_ms > LATENCY_DEGRADED_MS {
                raise(
                    HealthStatus::Degraded,
                    format!("delivery latency {:.0} ms", latency_ms),
                    &mut reasons,
                );
            }
        }
        if faults_delta > 0 {
            raise(
                HealthStatus::Unhealthy,
                format!("{} driver faults this interval", faults_delta),
                &mut reasons,
            );
        }
        if state == DeviceState::Errored {
            raise(
                HealthStatus::Unhealthy,
                "driver in errored state".to_string(),
                &mut reasons,
            );
        }
        if let Some(battery) = counters.battery_pct {
            if battery < 10.0 {
                raise(
                    HealthStatus::Degraded,
                    format!("battery at {:.0}%", battery),
                    &mut reasons,
                );
            }
        }

        let snapshot = HealthSnapshot {
            device_id: self.device_id.clone(),
            status,
            reasons: reasons.clone(),
            connection_stable: faults_delta == 0 && state != DeviceState::Errored,
            samples_per_sec,
            bits_per_sec,
            latency_ms,
            battery_pct: counters.battery_pct,
            queue_fill: counters.queue_fill,
            ts_ns: now_ts_ns,
        };

        // Alert once per excursion, after the streak crosses the threshold
        let alert = if status >= HealthStatus::Degraded {
            self.degraded_streak += 1;
            if self.degraded_streak >= self.alert_threshold && !self.alerted {
                self.alerted = true;
                Some(HealthAlert {
                    device_id: self.device_id.clone(),
                    status,
                    reasons,
                    consecutive_intervals: self.degraded_streak,
                    ts_ns: now_ts_ns,
                })
            } else {
                None
            }
        } else {
            self.degraded_streak = 0;
            self.alerted = false;
            None
        };

        self.prev = counters.clone();
        (snapshot, alert)
    }
}

/// Convenience snapshot for a device that has never streamed
pub fn idle_snapshot(device_id: &str, state: DeviceState) -> HealthSnapshot {
    HealthSnapshot {
        device_id: device_id.to_string(),
        status: if state == DeviceState::Errored {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        },
        reasons: Vec::new(),
        connection_stable: state != DeviceState::Errored,
        samples_per_sec: 0.0,
        bits_per_sec: 0.0,
        latency_ms: 0.0,
        battery_pct: None,
        queue_fill: 0.0,
        ts_ns: now_ns(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(samples: u64, gaps: u64) -> FlowCounters {
        FlowCounters {
            samples,
            bytes: samples * 4,
            gaps,
            faults: 0,
            last_latency_ns: 5_000_000,
            last_chunk_ts_ns: 1_000_000_000,
            battery_pct: None,
            queue_fill: 0.1,
        }
    }

    #[test]
    fn test_full_rate_is_healthy() {
        let mut monitor = HealthMonitor::new("dev", 1000.0, 3);
        let (snap, alert) = monitor.evaluate(
            DeviceState::Streaming,
            &counters(1000, 0),
            1.0,
            1_000_000_100,
        );
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!(alert.is_none());
        assert!((snap.samples_per_sec - 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_low_rate_degraded_and_alert_after_threshold() {
        let mut monitor = HealthMonitor::new("dev", 1000.0, 3);
        let mut total = 0u64;
        let mut alerts = 0;
        for tick in 1..=5 {
            total += 100; // 10 % of nominal
            let (snap, alert) = monitor.evaluate(
                DeviceState::Streaming,
                &counters(total, 0),
                1.0,
                1_000_000_000 + tick,
            );
            assert_eq!(snap.status, HealthStatus::Degraded, "tick {tick}");
            if alert.is_some() {
                alerts += 1;
                assert_eq!(alert.unwrap().consecutive_intervals, 3);
                assert_eq!(tick, 3);
            }
        }
        // One alert per excursion, not one per tick
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_recovery_resets_streak() {
        let mut monitor = HealthMonitor::new("dev", 1000.0, 2);
        let mut total = 0u64;
        // Two degraded ticks fire an alert
        for tick in 1..=2 {
            total += 10;
            monitor.evaluate(DeviceState::Streaming, &counters(total, 0), 1.0, tick);
        }
        // A healthy tick resets
        total += 1000;
        let (snap, _) = monitor.evaluate(DeviceState::Streaming, &counters(total, 0), 1.0, 10);
        assert_eq!(snap.status, HealthStatus::Healthy);
        // Degradation alerts again after the threshold
        total += 10;
        monitor.evaluate(DeviceState::Streaming, &counters(total, 0), 1.0, 11);
        total += 10;
        let (_, alert) = monitor.evaluate(DeviceState::Streaming, &counters(total, 0), 1.0, 12);
        assert!(alert.is_some());
    }

    #[test]
    fn test_silence_is_critical() {
        let mut monitor = HealthMonitor::new("dev", 1000.0, 3);
        let mut c = counters(1000, 0);
        c.last_chunk_ts_ns = 1_000_000_000;
        let now = 1_000_000_000 + SILENCE_CRITICAL_NS + 1;
        let (snap, _) = monitor.evaluate(DeviceState::Streaming, &c, 1.0, now);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert!(snap.reasons.iter().any(|r| r.contains("no data")));
    }

    #[test]
    fn test_gaps_degrade() {
        let mut monitor = HealthMonitor::new("dev", 100.0, 3);
        let (snap, _) =
            monitor.evaluate(DeviceState::Streaming, &counters(200, 4), 1.0, 1_000_000_100);
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert!(snap.reasons.iter().any(|r| r.contains("gaps")));
    }

    #[test]
    fn test_errored_state_unhealthy() {
        let mut monitor = HealthMonitor::new("dev", 100.0, 3);
        let (snap, _) = monitor.evaluate(DeviceState::Errored, &counters(0, 0), 1.0, 100);
        assert_eq!(snap.status, HealthStatus::Unhealthy);
        assert!(!snap.connection_stable);
    }

    #[test]
    fn test_idle_device_not_judged_on_rate() {
        let mut monitor = HealthMonitor::new("dev", 1000.0, 3);
        let (snap, alert) =
            monitor.evaluate(DeviceState::Connected, &counters(0, 0), 1.0, 100);
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!(alert.is_none());
    }
}
