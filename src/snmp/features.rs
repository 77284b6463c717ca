//! SNMP feature extraction.
//!
//! Folds raw samples into one fixed-schema feature vector per device per
//! sample window. The schema is versioned by a content hash carried on
//! every vector; the isolation forest refuses vectors whose hash does not
//! match the one its model was trained with.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::record::SnmpSample;
use crate::snmp::forest::ModelMetadata;

/// Ordered feature schema. The first eight are direct window aggregates;
/// the last two are cross-device and environmental aggregates.
pub const FEATURE_NAMES: &[&str] = &[
    "cpu_utilization_mean",
    "cpu_utilization_max",
    "memory_utilization_mean",
    "memory_utilization_max",
    "temperature_mean",
    "temperature_max",
    "interface_error_rate",
    "interface_utilization",
    "multi_device_correlation",
    "environmental_stress_score",
];

pub const NUM_FEATURES: usize = 10;

const SCHEMA_VERSION: &str = "fabricmon.snmp.v1";

/// Temperature at which the stress score saturates.
const TEMP_STRESS_CEIL_C: f64 = 80.0;
/// Stress level above which a device counts toward fleet correlation.
const STRESS_ELEVATED: f64 = 0.5;

/// Metric keys recognized on [`SnmpSample`], with their physical ranges.
const METRIC_RANGES: [(&str, f64, f64); 5] = [
    ("cpu_util", 0.0, 100.0),
    ("mem_util", 0.0, 100.0),
    ("temperature_c", -40.0, 120.0),
    ("if_error_rate", 0.0, 1.0),
    ("if_utilization", 0.0, 1.0),
];

/// Stable identifier of the feature schema above.
pub fn schema_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEMA_VERSION.as_bytes());
    for name in FEATURE_NAMES {
        hasher.update(b":");
        hasher.update(name.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// One fixed-schema feature vector for a (device, window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpFeatureVector {
    /// Window end, epoch ms.
    pub ts: i64,
    pub device: String,
    pub values: Vec<f64>,
    pub schema_hash: String,
}

impl SnmpFeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|idx| self.values.get(idx).copied())
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub window_seconds: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self { window_seconds: 60 }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractorStats {
    pub samples_ingested: u64,
    pub malformed_samples: u64,
    pub late_samples: u64,
    pub vectors_emitted: u64,
    pub snmp_imputations: u64,
    pub clamped_values: u64,
}

/// Running aggregate for one metric inside one window.
#[derive(Debug, Clone, Copy, Default)]
struct MetricAgg {
    sum: f64,
    max: f64,
    count: u64,
}

impl MetricAgg {
    fn observe(&mut self, value: f64) {
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn maximum(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

#[derive(Debug, Default)]
struct DeviceWindow {
    window_start: i64,
    metrics: HashMap<&'static str, MetricAgg>,
}

pub struct SnmpFeatureExtractor {
    window_ms: i64,
    windows: HashMap<String, DeviceWindow>,
    /// Last environmental stress score per device, feeding the fleet
    /// correlation feature.
    fleet_stress: HashMap<String, f64>,
    /// Per-feature training means used to impute missing metrics.
    imputation_means: Vec<f64>,
    stats: ExtractorStats,
}

impl SnmpFeatureExtractor {
    /// Build an extractor; imputation means come from the model metadata
    /// when a model is loaded, and default to zero otherwise.
    pub fn new(config: &ExtractorConfig, metadata: Option<&ModelMetadata>) -> Self {
        let imputation_means = metadata
            .map(|m| m.feature_means.clone())
            .unwrap_or_else(|| vec![0.0; NUM_FEATURES]);
        Self {
            window_ms: config.window_seconds as i64 * 1000,
            windows: HashMap::new(),
            fleet_stress: HashMap::new(),
            imputation_means,
            stats: ExtractorStats::default(),
        }
    }

    fn window_of(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.window_ms)
    }

    /// Ingest one sample. Returns the previous window's vector when this
    /// sample opens a new window for the device.
    pub fn ingest(&mut self, sample: &SnmpSample) -> Option<SnmpFeatureVector> {
        if !sample.is_well_formed() {
            self.stats.malformed_samples += 1;
            return None;
        }
        self.stats.samples_ingested += 1;

        let window_start = self.window_of(sample.ts);
        let mut closed = None;
        let window = self.windows.entry(sample.device.clone()).or_insert_with(|| {
            DeviceWindow { window_start, ..Default::default() }
        });
        if window_start > window.window_start {
            let finished = std::mem::replace(
                window,
                DeviceWindow { window_start, ..Default::default() },
            );
            closed = Some((sample.device.clone(), finished));
        } else if window_start < window.window_start {
            // Sample for an already-closed window.
            self.stats.late_samples += 1;
            return None;
        }

        let mut clamped = 0u64;
        {
            let window = self.windows.get_mut(&sample.device).expect("inserted above");
            for (key, lo, hi) in METRIC_RANGES {
                let Some(&raw) = sample.metrics.get(key) else { continue };
                if !raw.is_finite() {
                    clamped += 1;
                    continue;
                }
                let value = raw.clamp(lo, hi);
                if value != raw {
                    clamped += 1;
                }
                window.metrics.entry(key).or_default().observe(value);
            }
        }
        self.stats.clamped_values += clamped;

        closed.map(|(device, window)| self.finish_window(&device, window))
    }

    /// Close any window whose end has passed `now_ms`.
    pub fn flush(&mut self, now_ms: i64) -> Vec<SnmpFeatureVector> {
        let mut due: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| w.window_start + self.window_ms <= now_ms)
            .map(|(device, _)| device.clone())
            .collect();
        due.sort();
        due.into_iter()
            .map(|device| {
                let window = self.windows.remove(&device).expect("listed above");
                self.finish_window(&device, window)
            })
            .collect()
    }

    fn finish_window(&mut self, device: &str, window: DeviceWindow) -> SnmpFeatureVector {
        let agg = |key: &str| window.metrics.get(key).copied().unwrap_or_default();
        let cpu = agg("cpu_util");
        let mem = agg("mem_util");
        let temp = agg("temperature_c");
        let errors = agg("if_error_rate");
        let utilization = agg("if_utilization");

        let stress = match (temp.maximum(), cpu.maximum()) {
            (Some(t), Some(c)) => {
                0.5 * (t / TEMP_STRESS_CEIL_C).clamp(0.0, 1.0) + 0.5 * (c / 100.0).clamp(0.0, 1.0)
            }
            (Some(t), None) => (t / TEMP_STRESS_CEIL_C).clamp(0.0, 1.0),
            (None, Some(c)) => (c / 100.0).clamp(0.0, 1.0),
            (None, None) => 0.0,
        };
        let peers_elevated = self
            .fleet_stress
            .iter()
            .filter(|(other, _)| other.as_str() != device)
            .filter(|(_, s)| **s >= STRESS_ELEVATED)
            .count();
        let peer_total = self
            .fleet_stress
            .keys()
            .filter(|other| other.as_str() != device)
            .count();
        let correlation = if peer_total == 0 {
            0.0
        } else {
            peers_elevated as f64 / peer_total as f64
        };
        self.fleet_stress.insert(device.to_string(), stress);

        let raw: [Option<f64>; NUM_FEATURES] = [
            cpu.mean(),
            cpu.maximum(),
            mem.mean(),
            mem.maximum(),
            temp.mean(),
            temp.maximum(),
            errors.mean(),
            utilization.mean(),
            Some(correlation),
            Some(stress),
        ];
        let values: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(idx, v)| match v {
                Some(v) => *v,
                None => {
                    self.stats.snmp_imputations += 1;
                    self.imputation_means.get(idx).copied().unwrap_or(0.0)
                }
            })
            .collect();

        self.stats.vectors_emitted += 1;
        SnmpFeatureVector {
            ts: window.window_start + self.window_ms,
            device: device.to_string(),
            values,
            schema_hash: schema_hash(),
        }
    }

    pub fn stats(&self) -> &ExtractorStats {
        &self.stats
    }
}
