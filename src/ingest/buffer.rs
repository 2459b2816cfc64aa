//! Ingestion Buffer Accounting & Shedding
//!
//! The bounded buffer protects the publish path; once occupancy crosses
//! the high watermark the service starts refusing work, shedding the
//! lowest-priority device streams first. Priority follows signal quality:
//! a device's share of shed chunks converges to
//! `(1/quality_i) / Σ(1/quality_j)`, ties broken toward the device with
//! the most recent packet loss.
//!
//! Admission rate follows AIMD against pipeline lag: +5 %/s while lag is
//! comfortably inside the SLA, halved the moment it exceeds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Occupancy
// ============================================================================

/// Shared occupancy gauge for the bounded ingest buffer
#[derive(Debug)]
pub struct BufferGauge {
    occupancy: AtomicUsize,
    capacity: usize,
    high_watermark: f64,
}

impl BufferGauge {
    pub fn new(capacity: usize, high_watermark: f64) -> Self {
        Self {
            occupancy: AtomicUsize::new(0),
            capacity: capacity.max(1),
            high_watermark: high_watermark.clamp(0.0, 1.0),
        }
    }

    /// Reserve a slot; false when the buffer is completely full
    pub fn acquire(&self) -> bool {
        let mut current = self.occupancy.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.occupancy.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn release(&self) {
        let prev = self.occupancy.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "buffer release without acquire");
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::SeqCst)
    }

    pub fn fill_fraction(&self) -> f64 {
        self.occupancy() as f64 / self.capacity as f64
    }

    /// Above the high watermark producers see Busy and shedding starts
    pub fn over_watermark(&self) -> bool {
        self.fill_fraction() > self.high_watermark
    }
}

// ============================================================================
// Shed policy
// ============================================================================

#[derive(Debug, Clone, Default)]
struct DeviceLoad {
    quality: f64,
    recent_loss: u64,
    shed: u64,
}

/// Quality-weighted load shedding.
///
/// `should_shed` is consulted per arriving chunk only while the buffer
/// is over its watermark; it keeps per-device counters so the realized
/// shed distribution tracks the inverse-quality weights.
#[derive(Debug, Default)]
pub struct ShedPolicy {
    devices: HashMap<String, DeviceLoad>,
    total_shed: u64,
}

impl ShedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a device's standing from its latest quality report
    pub fn observe(&mut self, device_id: &str, quality: f64, recent_loss: u64) {
        let entry = self.devices.entry(device_id.to_string()).or_default();
        entry.quality = quality.clamp(1e-3, 1.0);
        entry.recent_loss = recent_loss;
    }

    /// Inverse-quality weight, normalized across known devices
    fn shed_share(&self, device_id: &str) -> f64 {
        let total: f64 = self.devices.values().map(|d| 1.0 / d.quality).sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.devices
            .get(device_id)
            .map(|d| (1.0 / d.quality) / total)
            .unwrap_or(0.0)
    }

    /// Decide whether to shed this arriving chunk. Deterministic
    /// largest-deficit selection: the device furthest behind its
    /// inverse-quality shed quota gives way first.
    pub fn should_shed(&mut self, device_id: &str) -> bool {
        if !self.devices.contains_key(device_id) {
            // Unknown stream: be conservative, shed it
            self.total_shed += 1;
            return true;
        }
        let share = self.shed_share(device_id);
        let (deficit, tie_loss) = {
            let device = &self.devices[device_id];
            (
                share * (self.total_shed + 1) as f64 - device.shed as f64,
                device.recent_loss,
            )
        };

        // A device behind its quota sheds; at the margin the device with
        // more recent packet loss gives way
        let max_loss = self.devices.values().map(|d| d.recent_loss).max().unwrap_or(0);
        let shed = deficit > 0.5 || (deficit > 0.0 && tie_loss >= max_loss);

        if shed {
            let device = self.devices.get_mut(device_id).expect("observed above");
            device.shed += 1;
            self.total_shed += 1;
        }
        shed
    }

    pub fn total_shed(&self) -> u64 {
        self.total_shed
    }

    pub fn shed_count(&self, device_id: &str) -> u64 {
        self.devices.get(device_id).map(|d| d.shed).unwrap_or(0)
    }
}

// ============================================================================
// AIMD admission
// ============================================================================

/// Additive increase per second while the pipeline is comfortably ahead
const AIMD_INCREASE_PER_S: f64 = 0.05;
/// Multiplicative decrease on SLA breach
const AIMD_DECREASE: f64 = 0.5;
/// Lag fraction of the SLA below which the rate may grow
const AIMD_HEADROOM: f64 = 0.5;

/// Admission-rate controller fed with observed consumer lag
#[derive(Debug, Clone)]
pub struct AdmissionController {
    /// Current admission rate as a fraction of nominal [min_rate, 1.0]
    rate: f64,
    min_rate: f64,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            rate: 1.0,
            min_rate: 0.05,
        }
    }

    /// Fold in one lag observation. `lag_over_sla` is observed lag
    /// divided by the SLA bound; `elapsed_s` is the time since the last
    /// observation.
    pub fn update(&mut self, lag_over_sla: f64, elapsed_s: f64) {
        if lag_over_sla > 1.0 {
            self.rate *= AIMD_DECREASE;
        } else if lag_over_sla < AIMD_HEADROOM {
            self.rate += AIMD_INCREASE_PER_S * elapsed_s;
        }
        self.rate = self.rate.clamp(self.min_rate, 1.0);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Deterministic admission: admit `rate` fraction of a uniform
    /// arrival stream using an error accumulator.
    pub fn admit(&mut self, accumulator: &mut f64) -> bool {
        *accumulator += self.rate;
        if *accumulator >= 1.0 {
            *accumulator -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_acquire_release() {
        let gauge = BufferGauge::new(2, 0.8);
        assert!(gauge.acquire());
        assert!(gauge.acquire());
        assert!(!gauge.acquire());
        gauge.release();
        assert!(gauge.acquire());
        assert_eq!(gauge.occupancy(), 2);
    }

    #[test]
    fn test_watermark() {
        let gauge = BufferGauge::new(10, 0.8);
        for _ in 0..8 {
            gauge.acquire();
        }
        assert!(!gauge.over_watermark());
        gauge.acquire();
        assert!(gauge.over_watermark());
    }

    #[test]
    fn test_shed_shares_track_inverse_quality() {
        // Devices at quality 0.9 / 0.6 / 0.3 under uniform arrival: shed
        // fractions approach (1/q)/Σ(1/q) = {0.18, 0.27, 0.55}
        let mut policy = ShedPolicy::new();
        policy.observe("a", 0.9, 0);
        policy.observe("b", 0.6, 0);
        policy.observe("c", 0.3, 0);

        for _ in 0..2000 {
            policy.should_shed("a");
            policy.should_shed("b");
            policy.should_shed("c");
        }

        let total = policy.total_shed() as f64;
        assert!(total > 0.0);
        let ratio = |id: &str| policy.shed_count(id) as f64 / total;
        assert!((ratio("a") - 0.18).abs() < 0.05, "a: {}", ratio("a"));
        assert!((ratio("b") - 0.27).abs() < 0.05, "b: {}", ratio("b"));
        assert!((ratio("c") - 0.55).abs() < 0.05, "c: {}", ratio("c"));
    }

    #[test]
    fn test_low_quality_sheds_more() {
        let mut policy = ShedPolicy::new();
        policy.observe("good", 0.95, 0);
        policy.observe("bad", 0.2, 0);
        for _ in 0..500 {
            policy.should_shed("good");
            policy.should_shed("bad");
        }
        assert!(policy.shed_count("bad") > policy.shed_count("good") * 2);
    }

    #[test]
    fn test_unknown_device_sheds() {
        let mut policy = ShedPolicy::new();
        assert!(policy.should_shed("stranger"));
    }

    #[test]
    fn test_aimd_decrease_on_breach() {
        let mut controller = AdmissionController::new();
        controller.update(1.5, 1.0);
        assert!((controller.rate() - 0.5).abs() < 1e-9);
        controller.update(1.5, 1.0);
        assert!((controller.rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_aimd_additive_recovery() {
        let mut controller = AdmissionController::new();
        controller.update(2.0, 1.0); // drop to 0.5
        controller.update(0.1, 1.0); // +0.05
        assert!((controller.rate() - 0.55).abs() < 1e-9);
        // Between headroom and SLA the rate holds
        controller.update(0.8, 1.0);
        assert!((controller.rate() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_aimd_rate_bounds() {
        let mut controller = AdmissionController::new();
        for _ in 0..100 {
            controller.update(5.0, 1.0);
        }
        assert!(controller.rate() >= 0.05);
        for _ in 0..100 {
            controller.update(0.0, 10.0);
        }
        assert!(controller.rate() <= 1.0);
    }

    #[test]
    fn test_admission_accumulator() {
        let mut controller = AdmissionController::new();
        controller.update(2.0, 1.0); // rate 0.5
        let mut acc = 0.0;
        let admitted = (0..100).filter(|_| controller.admit(&mut acc)).count();
        assert_eq!(admitted, 50);
    }
}
